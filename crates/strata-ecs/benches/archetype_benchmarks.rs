//! Archetype storage benchmarks.
//!
//! - Batch row allocation at several batch sizes.
//! - Swap-removal of every row in a deterministic random order.
//! - Migration of entities between archetypes through the world.
//! - Column iteration over all chunks of a populated archetype.
//!
//! Set `RUST_LOG=strata_ecs=debug` to see chunk and archetype events.
//!
//! Run with: `cargo bench --bench archetype_benchmarks`

use std::sync::{Arc, Once};

use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_pcg::Pcg64;

use strata_ecs::prelude::*;

// ---------------------------------------------------------------------------
// Benchmark component types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Position {
    x: f64,
    y: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Velocity {
    dx: f64,
    dy: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Health(u32);

const POSITION: ComponentTypeId = ComponentTypeId(0);
const VELOCITY: ComponentTypeId = ComponentTypeId(1);
const HEALTH: ComponentTypeId = ComponentTypeId(2);

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

static TRACING: Once = Once::new();

fn init_tracing() {
    TRACING.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .init();
    });
}

fn bench_config() -> StoreConfig {
    StoreConfig {
        debug_fill: None,
        ..StoreConfig::default()
    }
}

fn moving_archetype(id: u32) -> Archetype {
    Archetype::new(
        ArchetypeId(id),
        vec![
            ComponentRuntimeInfo::of::<Position>(POSITION),
            ComponentRuntimeInfo::of::<Velocity>(VELOCITY),
            ComponentRuntimeInfo::of::<Health>(HEALTH),
        ],
        Arc::new(SystemAllocator),
        bench_config(),
    )
}

fn populated(count: usize) -> Archetype {
    let mut arch = moving_archetype(0);
    arch.add_entities(count).expect("allocation failed");
    arch
}

// ---------------------------------------------------------------------------
// Benchmarks
// ---------------------------------------------------------------------------

fn bench_add_entities(c: &mut Criterion) {
    init_tracing();
    let mut group = c.benchmark_group("add_entities");
    for count in [100usize, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter_batched(
                || moving_archetype(0),
                |mut arch| {
                    black_box(arch.add_entities(count).expect("allocation failed"));
                    arch
                },
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

fn bench_remove_random_order(c: &mut Criterion) {
    init_tracing();
    const COUNT: usize = 10_000;
    let mut rng = Pcg64::seed_from_u64(0x5eed);

    c.bench_function("remove_10k_random_order", |b| {
        b.iter_batched(
            || {
                // Each step removes a uniformly chosen live row.
                let mut picks: Vec<usize> = (0..COUNT).collect();
                picks.shuffle(&mut rng);
                let picks: Vec<usize> = picks
                    .iter()
                    .enumerate()
                    .map(|(step, pick)| pick % (COUNT - step))
                    .collect();
                (populated(COUNT), picks)
            },
            |(mut arch, picks)| {
                for index in picks {
                    let mut data = EntityData::new(arch.id(), index);
                    black_box(arch.remove_entity(&mut data));
                }
                arch
            },
            BatchSize::LargeInput,
        );
    });
}

fn bench_world_migration(c: &mut Criterion) {
    init_tracing();
    const COUNT: usize = 1_000;

    c.bench_function("world_insert_remove_1k", |b| {
        b.iter_batched(
            || {
                let mut world = World::with_allocator(Arc::new(SystemAllocator), bench_config())
                    .expect("valid config");
                let pos = world.register_component::<Position>("position");
                world.register_component::<Velocity>("velocity");
                let entities = world.spawn_batch(&[pos], COUNT).expect("allocation failed");
                (world, entities)
            },
            |(mut world, entities)| {
                for &e in &entities {
                    world
                        .insert_component(e, Velocity { dx: 1.0, dy: 0.5 })
                        .expect("insert failed");
                }
                for &e in &entities {
                    world.remove_component::<Velocity>(e).expect("remove failed");
                }
                world
            },
            BatchSize::SmallInput,
        );
    });
}

fn bench_column_iteration(c: &mut Criterion) {
    init_tracing();
    let mut arch = populated(100_000);
    let mut group = c.benchmark_group("column_iteration_100k");

    group.bench_function("read_positions", |b| {
        b.iter(|| {
            let mut sum = 0.0;
            for chunk in arch.chunks() {
                if let Some(column) = chunk.column::<Position>(POSITION) {
                    sum += column.iter().map(|p| p.x + p.y).sum::<f64>();
                }
            }
            black_box(sum)
        });
    });

    group.bench_function("integrate_velocity", |b| {
        b.iter(|| {
            for column in arch.column_slices_mut::<Position>(POSITION) {
                for p in column {
                    p.x += 0.016;
                    p.y -= 0.016;
                }
            }
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_add_entities,
    bench_remove_random_order,
    bench_world_migration,
    bench_column_iteration,
);
criterion_main!(benches);
