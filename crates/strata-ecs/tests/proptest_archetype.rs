//! Property tests for archetype storage.
//!
//! Random sequences of row additions, removals and batch transfers are
//! replayed against a plain `Vec` model; after every step the packing and
//! content of the chunked storage must agree with the model.

use std::cell::Cell;
use std::sync::Arc;

use proptest::prelude::*;
use strata_ecs::prelude::*;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Tag(u64);

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Wide([u64; 3]);

thread_local! {
    static LIVE: Cell<isize> = const { Cell::new(0) };
}

/// Counts live instances so leaks and double drops both show up.
#[derive(Debug)]
struct Counted(u64);

impl Default for Counted {
    fn default() -> Self {
        LIVE.with(|live| live.set(live.get() + 1));
        Counted(0)
    }
}

impl Drop for Counted {
    fn drop(&mut self) {
        LIVE.with(|live| live.set(live.get() - 1));
    }
}

fn live() -> isize {
    LIVE.with(|live| live.get())
}

const TAG: ComponentTypeId = ComponentTypeId(0);
const WIDE: ComponentTypeId = ComponentTypeId(1);
const COUNTED: ComponentTypeId = ComponentTypeId(2);

fn config(chunk_bytes: usize) -> StoreConfig {
    StoreConfig {
        chunk_bytes,
        max_entities_per_chunk: 64,
        debug_fill: Some(strata_ecs::config::DEBUG_FILL_BYTE),
    }
}

fn archetype(
    id: u32,
    types: &[ComponentTypeId],
    allocator: Arc<dyn ChunkAllocator>,
    chunk_bytes: usize,
) -> Archetype {
    let infos = types
        .iter()
        .map(|&ty| match ty {
            TAG => ComponentRuntimeInfo::of::<Tag>(TAG),
            WIDE => ComponentRuntimeInfo::of::<Wide>(WIDE),
            _ => ComponentRuntimeInfo::of::<Counted>(COUNTED),
        })
        .collect();
    Archetype::new(ArchetypeId(id), infos, allocator, config(chunk_bytes))
}

/// Storage shape: every chunk but the last is full, and there is no empty
/// chunk.
fn assert_packed(arch: &Archetype) {
    let epc = arch.entities_per_chunk();
    let lens: Vec<usize> = arch.chunks().map(|chunk| chunk.len()).collect();
    assert_eq!(lens.len(), arch.chunk_count());
    assert_eq!(arch.chunk_count(), arch.size().div_ceil(epc));
    if let Some((last, full)) = lens.split_last() {
        assert!(full.iter().all(|&len| len == epc), "{lens:?} (epc {epc})");
        assert!(*last >= 1 && *last <= epc);
    }
    assert_eq!(lens.iter().sum::<usize>(), arch.size());
}

fn assert_matches_model(arch: &Archetype, model: &[u64]) {
    assert_eq!(arch.size(), model.len());
    for (row, tag) in model.iter().enumerate() {
        assert_eq!(arch.get::<Tag>(row, TAG), Some(&Tag(*tag)), "row {row}");
    }
}

#[derive(Debug, Clone)]
enum Op {
    Add(usize),
    Remove(usize),
    Transfer(Vec<usize>),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1..20usize).prop_map(Op::Add),
        (0..200usize).prop_map(Op::Remove),
        prop::collection::vec(0..200usize, 1..8).prop_map(Op::Transfer),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(512))]

    #[test]
    fn random_ops_keep_storage_packed(
        chunk_bytes in prop::sample::select(vec![32usize, 100, 256, 4096]),
        ops in prop::collection::vec(op_strategy(), 1..60),
    ) {
        let live_before = live();
        {
            let allocator: Arc<dyn ChunkAllocator> = Arc::new(SystemAllocator);
            let mut source = archetype(0, &[TAG, WIDE, COUNTED], allocator.clone(), chunk_bytes);
            let mut target = archetype(1, &[TAG, COUNTED], allocator, chunk_bytes);
            let mut model: Vec<u64> = Vec::new();
            let mut target_model: Vec<u64> = Vec::new();
            let mut next_tag = 0u64;

            for op in ops {
                match op {
                    Op::Add(n) => {
                        let rows = source.add_entities(n).unwrap();
                        prop_assert_eq!(rows.clone(), model.len()..model.len() + n);
                        for row in rows {
                            *source.get_mut::<Tag>(row, TAG).unwrap() = Tag(next_tag);
                            model.push(next_tag);
                            next_tag += 1;
                        }
                    }
                    Op::Remove(pick) => {
                        if model.is_empty() {
                            continue;
                        }
                        let index = pick % model.len();
                        let mut data = EntityData::new(source.id(), index);
                        let relocation = source.remove_entity(&mut data);
                        prop_assert!(!data.is_valid());

                        let last = model.len() - 1;
                        model.swap_remove(index);
                        let expected = (index != last).then_some(Relocation { from: last, to: index });
                        prop_assert_eq!(relocation, expected);
                    }
                    Op::Transfer(picks) => {
                        if model.is_empty() {
                            continue;
                        }
                        let mut rows: Vec<usize> = picks.iter().map(|p| p % model.len()).collect();
                        rows.sort_unstable();
                        rows.dedup();
                        let tags: Vec<u64> = rows.iter().map(|&row| model[row]).collect();

                        let mut batch: Vec<EntityData> =
                            rows.iter().map(|&row| EntityData::new(source.id(), row)).collect();
                        let start = target.size();
                        let relocations = source.transfer_to(&mut target, &mut batch).unwrap();

                        for (position, data) in batch.iter().enumerate() {
                            prop_assert_eq!(*data, EntityData::new(target.id(), start + position));
                        }
                        target_model.extend(&tags);

                        // Replay the reported swap-removals on the model.
                        let mut replay = model.clone();
                        let mut expected = Vec::new();
                        for &row in rows.iter().rev() {
                            let last = replay.len() - 1;
                            if row != last {
                                expected.push(Relocation { from: last, to: row });
                            }
                            replay.swap_remove(row);
                        }
                        prop_assert_eq!(relocations, expected);
                        model = replay;
                    }
                }

                assert_packed(&source);
                assert_packed(&target);
                assert_matches_model(&source, &model);
                assert_matches_model(&target, &target_model);
                prop_assert_eq!(live() - live_before, (model.len() + target_model.len()) as isize);
            }
        }
        prop_assert_eq!(live(), live_before);
    }

    #[test]
    fn add_then_remove_all_releases_every_chunk(
        count in 1..300usize,
        seed in any::<u64>(),
    ) {
        let counting = Arc::new(CountingAllocator::new(SystemAllocator));
        let mut arch = archetype(0, &[TAG, COUNTED], counting.clone(), 200);
        arch.add_entities(count).unwrap();
        prop_assert_eq!(counting.live_blocks(), count.div_ceil(arch.entities_per_chunk()));

        let mut state = seed;
        while !arch.is_empty() {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let index = (state >> 33) as usize % arch.size();
            let mut data = EntityData::new(arch.id(), index);
            arch.remove_entity(&mut data);
            assert_packed(&arch);
            prop_assert_eq!(counting.live_blocks(), arch.chunk_count());
        }
        prop_assert_eq!(arch.chunk_count(), 0);
        prop_assert_eq!(counting.live_blocks(), 0);
    }
}

#[test]
fn chunk_pool_recycles_blocks_between_archetypes() {
    let probe = archetype(9, &[TAG, WIDE], Arc::new(SystemAllocator), 512);
    let layout = std::alloc::Layout::from_size_align(probe.chunk_byte_size(), 8).unwrap();
    drop(probe);

    let backing = Arc::new(CountingAllocator::new(SystemAllocator));
    let pool = Arc::new(ChunkPool::new(backing.clone(), layout, 16));
    {
        let mut arch = archetype(0, &[TAG, WIDE], pool.clone(), 512);
        arch.add_entities(arch.entities_per_chunk() * 3).unwrap();
        assert_eq!(backing.total_allocations(), 3);
    }
    assert_eq!(pool.free_blocks(), 3);

    let mut again = archetype(1, &[TAG, WIDE], pool.clone(), 512);
    again.add_entities(again.entities_per_chunk() * 2).unwrap();
    assert_eq!(backing.total_allocations(), 3);
    assert_eq!(pool.free_blocks(), 1);
}
