//! Chunked archetype storage.
//!
//! An [`Archetype`] stores every entity that has exactly the same set of
//! component types. Rows are packed into fixed-size chunks obtained from a
//! [`ChunkAllocator`]; inside a chunk each component type owns one
//! contiguous column (struct-of-arrays), and columns appear in ascending
//! [`ComponentTypeId`] order.
//!
//! Packing invariant: every chunk except the last holds exactly
//! `entities_per_chunk` live rows, and the last holds between one and
//! `entities_per_chunk`. A chunk whose final row is removed is released
//! immediately, so an empty archetype owns no chunks. Logical row `i` lives
//! in chunk `i / entities_per_chunk` at slot `i % entities_per_chunk`.
//!
//! # Safety
//!
//! Component data is stored as raw bytes and manipulated through the
//! function tables in [`ComponentRuntimeInfo`]. Every raw access goes through
//! [`Archetype::split_index`] and the column offsets computed by
//! [`Archetype::sort_component_infos`], which keep addresses inside the
//! chunk and aligned for the column's type. Pointers handed out by
//! [`Archetype::index_ptr`] or [`ChunkView::column_ptr`] are invalidated by
//! the next structural change.

use std::alloc::Layout;
use std::fmt;
use std::ops::Range;
use std::ptr::{self, NonNull};
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::allocator::ChunkAllocator;
use crate::component::{ComponentRuntimeInfo, ComponentTypeId};
use crate::config::StoreConfig;
use crate::entity::EntityData;
use crate::StoreError;

// ---------------------------------------------------------------------------
// ArchetypeId / Relocation
// ---------------------------------------------------------------------------

/// Identifies an archetype within its registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArchetypeId(pub u32);

/// A row move caused by swap-removal: the entity previously at row `from`
/// (the last row) now lives at row `to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    pub from: usize,
    pub to: usize,
}

// ---------------------------------------------------------------------------
// Archetype
// ---------------------------------------------------------------------------

/// Chunked columnar storage for one fixed set of component types.
pub struct Archetype {
    id: ArchetypeId,
    component_count: usize,
    /// Sorted by `type_id` once finalized; immutable afterwards.
    component_infos: Vec<ComponentRuntimeInfo>,
    finalized: bool,
    chunk_data: Vec<NonNull<u8>>,
    /// Blocks set aside by [`Archetype::reserve`], used before the allocator.
    spare_chunks: Vec<NonNull<u8>>,
    entities_per_chunk: usize,
    /// Live rows in the last chunk only.
    last_chunk_size: usize,
    chunk_byte_size: usize,
    chunk_layout: Layout,
    allocator: Arc<dyn ChunkAllocator>,
    config: StoreConfig,
}

// Chunks hold only components built through `ComponentRuntimeInfo::of`,
// which requires `Send + Sync`.
unsafe impl Send for Archetype {}
unsafe impl Sync for Archetype {}

impl Archetype {
    /// Create an archetype with room for `component_count` component infos.
    ///
    /// The infos must be supplied with [`push_component_info`] and the layout
    /// finalized with [`sort_component_infos`] before any row is added.
    ///
    /// [`push_component_info`]: Self::push_component_info
    /// [`sort_component_infos`]: Self::sort_component_infos
    pub fn with_capacity(
        id: ArchetypeId,
        component_count: usize,
        allocator: Arc<dyn ChunkAllocator>,
        config: StoreConfig,
    ) -> Self {
        Self {
            id,
            component_count,
            component_infos: Vec::with_capacity(component_count),
            finalized: false,
            chunk_data: Vec::new(),
            spare_chunks: Vec::new(),
            entities_per_chunk: 0,
            last_chunk_size: 0,
            chunk_byte_size: 0,
            chunk_layout: Layout::new::<u8>(),
            allocator,
            config,
        }
    }

    /// Create an archetype from a complete set of infos and finalize its
    /// layout.
    pub fn new(
        id: ArchetypeId,
        infos: Vec<ComponentRuntimeInfo>,
        allocator: Arc<dyn ChunkAllocator>,
        config: StoreConfig,
    ) -> Self {
        let mut archetype = Self::with_capacity(id, infos.len(), allocator, config);
        for info in infos {
            archetype.push_component_info(info);
        }
        archetype.sort_component_infos();
        archetype
    }

    /// Add one entry to the info table.
    ///
    /// # Panics
    ///
    /// Panics if the layout is already finalized or the table is full.
    pub fn push_component_info(&mut self, info: ComponentRuntimeInfo) {
        assert!(
            !self.finalized,
            "archetype {:?}: cannot add component infos after the layout is finalized",
            self.id
        );
        assert!(
            self.component_infos.len() < self.component_count,
            "archetype {:?}: info table already holds {} components",
            self.id,
            self.component_count
        );
        self.component_infos.push(info);
    }

    /// Sort the info table by type id and assign every column its chunk
    /// offset. Fixes `entities_per_chunk` and the chunk byte size for the
    /// lifetime of the archetype.
    ///
    /// # Panics
    ///
    /// Panics when called twice, when the info table is incomplete, or when
    /// a type id appears twice.
    pub fn sort_component_infos(&mut self) {
        assert!(
            !self.finalized,
            "archetype {:?}: component layout is already finalized",
            self.id
        );
        assert_eq!(
            self.component_infos.len(),
            self.component_count,
            "archetype {:?}: info table is incomplete",
            self.id
        );

        self.component_infos.sort_by_key(|info| info.type_id);
        if let Some(pair) = self
            .component_infos
            .windows(2)
            .find(|pair| pair[0].type_id == pair[1].type_id)
        {
            panic!(
                "archetype {:?}: duplicate component type {:?}",
                self.id, pair[0].type_id
            );
        }

        let row_stride: usize = self
            .component_infos
            .iter()
            .map(|info| info.component_size)
            .sum();
        let max_rows = self.config.max_entities_per_chunk.max(1);
        let mut per_chunk = if row_stride == 0 {
            max_rows
        } else {
            (self.config.chunk_bytes / row_stride).clamp(1, max_rows)
        };
        while per_chunk > 1
            && columns_byte_size(&self.component_infos, per_chunk) > self.config.chunk_bytes
        {
            per_chunk -= 1;
        }

        let mut byte_size = 0;
        for info in &mut self.component_infos {
            byte_size = align_up(byte_size, info.component_align);
            info.chunk_offset = byte_size;
            byte_size += info.component_size * per_chunk;
        }
        let align = self
            .component_infos
            .iter()
            .map(|info| info.component_align)
            .max()
            .unwrap_or(1);

        self.entities_per_chunk = per_chunk;
        self.chunk_byte_size = byte_size;
        self.chunk_layout =
            Layout::from_size_align(byte_size, align).expect("chunk layout overflow");
        self.finalized = true;

        debug!(
            archetype = self.id.0,
            components = self.component_count,
            entities_per_chunk = per_chunk,
            chunk_bytes = byte_size,
            "archetype layout finalized"
        );
    }

    // -- accessors ----------------------------------------------------------

    #[inline]
    pub fn id(&self) -> ArchetypeId {
        self.id
    }

    /// Number of live entities.
    #[inline]
    pub fn size(&self) -> usize {
        match self.chunk_data.len() {
            0 => 0,
            chunks => (chunks - 1) * self.entities_per_chunk + self.last_chunk_size,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.chunk_data.is_empty()
    }

    #[inline]
    pub fn component_count(&self) -> usize {
        self.component_count
    }

    /// The info table; sorted by type id once the layout is finalized.
    #[inline]
    pub fn component_infos(&self) -> &[ComponentRuntimeInfo] {
        &self.component_infos
    }

    /// Sorted component type ids of this archetype.
    pub fn component_types(&self) -> impl Iterator<Item = ComponentTypeId> + '_ {
        self.component_infos.iter().map(|info| info.type_id)
    }

    #[inline]
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    #[inline]
    pub fn entities_per_chunk(&self) -> usize {
        self.entities_per_chunk
    }

    #[inline]
    pub fn chunk_count(&self) -> usize {
        self.chunk_data.len()
    }

    #[inline]
    pub fn chunk_byte_size(&self) -> usize {
        self.chunk_byte_size
    }

    /// Chunks set aside by [`reserve`](Self::reserve) and not yet in use.
    #[inline]
    pub fn reserved_chunks(&self) -> usize {
        self.spare_chunks.len()
    }

    /// Live rows in chunk `chunk_index` (zero past the last chunk).
    pub fn chunk_len(&self, chunk_index: usize) -> usize {
        let chunks = self.chunk_data.len();
        if chunk_index + 1 == chunks {
            self.last_chunk_size
        } else if chunk_index < chunks {
            self.entities_per_chunk
        } else {
            0
        }
    }

    /// Runtime info of one stored component type.
    pub fn component_info(&self, type_id: ComponentTypeId) -> Option<&ComponentRuntimeInfo> {
        self.component_infos
            .binary_search_by_key(&type_id, |info| info.type_id)
            .ok()
            .map(|idx| &self.component_infos[idx])
    }

    pub fn has_component(&self, type_id: ComponentTypeId) -> bool {
        self.component_info(type_id).is_some()
    }

    /// Whether this archetype stores exactly the given component set.
    ///
    /// # Panics
    ///
    /// Panics if `type_ids` is not sorted ascending or the layout is not
    /// finalized.
    pub fn matches_type_indexes(&self, type_ids: &[ComponentTypeId]) -> bool {
        self.assert_finalized();
        assert!(
            type_ids.windows(2).all(|pair| pair[0] <= pair[1]),
            "type ids must be sorted ascending: {:?}",
            type_ids
        );
        type_ids.len() == self.component_count
            && self
                .component_infos
                .iter()
                .zip(type_ids)
                .all(|(info, id)| info.type_id == *id)
    }

    // -- structural changes -------------------------------------------------

    /// Add one default-constructed row and return its index.
    pub fn add_entity(&mut self) -> Result<usize, StoreError> {
        self.add_entities(1).map(|rows| rows.start)
    }

    /// Add `count` default-constructed rows.
    ///
    /// Returns the indices of the new rows, which continue from the previous
    /// size. On allocation failure nothing is added.
    pub fn add_entities(&mut self, count: usize) -> Result<Range<usize>, StoreError> {
        self.assert_finalized();
        let start = self.size();
        if count == 0 {
            return Ok(start..start);
        }

        let columns = self.component_infos.len();
        let mut pending = PendingRows::reserve(self, count, vec![false; columns])?;
        for _ in 0..count {
            let (chunk, slot) = pending.next_slot();
            for column in 0..columns {
                let info = pending.archetype.component_infos[column];
                unsafe { info.create_indexed(chunk, slot, 1) };
                pending.columns_done += 1;
            }
            pending.finish_row();
        }
        pending.commit();
        Ok(start..start + count)
    }

    /// Set aside enough chunks that the next `additional` rows can be added
    /// or transferred in without calling the allocator.
    ///
    /// On failure the blocks obtained by this call are returned and the
    /// reservation is as it was.
    pub fn reserve(&mut self, additional: usize) -> Result<(), StoreError> {
        self.assert_finalized();
        let capacity = self.chunk_data.len() * self.entities_per_chunk;
        let needed = (self.size() + additional)
            .saturating_sub(capacity)
            .div_ceil(self.entities_per_chunk);
        let mut blocks = Vec::with_capacity(needed.saturating_sub(self.spare_chunks.len()));
        for _ in self.spare_chunks.len()..needed {
            match self.allocate_chunk() {
                Ok(block) => blocks.push(block),
                Err(err) => {
                    for block in blocks {
                        self.release_chunk(block);
                    }
                    return Err(err);
                }
            }
        }
        self.spare_chunks.extend(blocks);
        Ok(())
    }

    /// Remove the entity located by `data`, destroying its components.
    ///
    /// The last row is moved into the vacated slot; when that happens the
    /// move is returned so the caller can update the displaced entity's
    /// location. `data` is invalidated.
    ///
    /// # Panics
    ///
    /// Panics if `data` does not locate a live row of this archetype.
    pub fn remove_entity(&mut self, data: &mut EntityData) -> Option<Relocation> {
        self.assert_owns(data);
        let index = data.archetype_index;
        let (chunk_index, slot) = self.split_index(index);
        let chunk = self.chunk_data[chunk_index].as_ptr();
        for info in &self.component_infos {
            unsafe { info.destroy_indexed(chunk, slot, 1) };
        }
        let relocation = self.vacate_row(index);
        data.invalidate();
        relocation
    }

    /// Move a batch of entities into `destination`, which must store a subset
    /// of this archetype's component types.
    ///
    /// Shared components are moved; components the destination lacks are
    /// destroyed. Each entry of `entities` is rewritten to its new location
    /// (`destination`'s previous size plus its position in the batch). The
    /// returned relocations are the swap-removals performed on this
    /// archetype, in order.
    ///
    /// # Panics
    ///
    /// Panics if the destination has a component type this archetype lacks,
    /// or if any entry does not locate a distinct live row of this archetype.
    pub fn transfer_to(
        &mut self,
        destination: &mut Archetype,
        entities: &mut [EntityData],
    ) -> Result<Vec<Relocation>, StoreError> {
        if let Some(missing) = destination
            .component_infos
            .iter()
            .find(|info| !self.has_component(info.type_id))
        {
            panic!(
                "creating components on transfer is not supported: archetype {:?} has {} ({:?}), archetype {:?} does not",
                destination.id,
                missing.type_name(),
                missing.type_id,
                self.id
            );
        }
        self.transfer_with(destination, entities, |_, _| {
            unreachable!("every destination component is stored in the source")
        })
    }

    /// Like [`transfer_to`](Self::transfer_to), but component types that the
    /// destination has and this archetype lacks are supplied by `fill`.
    ///
    /// `fill` is called once per missing type and batch position with a
    /// [`ComponentSlot`] to write into. Slots left unwritten are
    /// default-constructed. If `fill` panics, both archetypes are left as
    /// they were before the call; a value written by the panicking call
    /// itself is leaked.
    pub fn transfer_with<F>(
        &mut self,
        destination: &mut Archetype,
        entities: &mut [EntityData],
        mut fill: F,
    ) -> Result<Vec<Relocation>, StoreError>
    where
        F: FnMut(usize, &mut ComponentSlot<'_>),
    {
        self.assert_finalized();
        destination.assert_finalized();
        for data in entities.iter() {
            self.assert_owns(data);
        }

        // Removing in descending row order means a swap-removal never
        // displaces a batch member that is still waiting to be removed.
        let mut removal_order: Vec<usize> = (0..entities.len()).collect();
        removal_order.sort_unstable_by(|&a, &b| {
            entities[b]
                .archetype_index
                .cmp(&entities[a].archetype_index)
        });
        if let Some(pair) = removal_order
            .windows(2)
            .find(|pair| entities[pair[0]].archetype_index == entities[pair[1]].archetype_index)
        {
            panic!(
                "archetype {:?}: row {} appears twice in one transfer",
                self.id, entities[pair[0]].archetype_index
            );
        }
        if entities.is_empty() {
            return Ok(Vec::new());
        }

        let start = destination.size();
        let shared: Vec<Option<ComponentRuntimeInfo>> = destination
            .component_infos
            .iter()
            .map(|info| self.component_info(info.type_id).copied())
            .collect();
        let borrowed = shared.iter().map(Option::is_some).collect();
        let mut pending = PendingRows::reserve(destination, entities.len(), borrowed)?;

        for (position, data) in entities.iter().enumerate() {
            let (src_chunk_index, src_slot) = self.split_index(data.archetype_index);
            let src_chunk = self.chunk_data[src_chunk_index].as_ptr();
            let (dst_chunk, dst_slot) = pending.next_slot();
            for (column, src_info) in shared.iter().enumerate() {
                let dst_info = pending.archetype.component_infos[column];
                match src_info {
                    Some(src_info) => unsafe {
                        dst_info.create_from_indexed(
                            dst_chunk,
                            dst_slot,
                            src_info.index_ptr(src_chunk, src_slot),
                        );
                    },
                    None => {
                        let mut slot = ComponentSlot {
                            info: &dst_info,
                            ptr: unsafe { dst_info.index_ptr(dst_chunk, dst_slot) },
                            filled: false,
                        };
                        fill(position, &mut slot);
                        if !slot.filled {
                            unsafe { dst_info.create_indexed(dst_chunk, dst_slot, 1) };
                        }
                    }
                }
                pending.columns_done += 1;
            }
            pending.finish_row();
        }
        pending.commit();

        for src_info in &self.component_infos {
            if destination.has_component(src_info.type_id) {
                continue;
            }
            for data in entities.iter() {
                let (chunk_index, slot) = self.split_index(data.archetype_index);
                let chunk = self.chunk_data[chunk_index].as_ptr();
                unsafe { src_info.destroy_indexed(chunk, slot, 1) };
            }
        }

        let mut relocations = Vec::new();
        for position in removal_order {
            let index = entities[position].archetype_index;
            relocations.extend(self.vacate_row(index));
            entities[position] = EntityData::new(destination.id, start + position);
        }

        trace!(
            from = self.id.0,
            to = destination.id.0,
            count = entities.len(),
            relocations = relocations.len(),
            "transferred entities"
        );
        Ok(relocations)
    }

    // -- component access ---------------------------------------------------

    /// Typed reference to a component of row `index`.
    ///
    /// # Panics
    ///
    /// Panics if `type_id` is stored here but is not a `T`.
    pub fn get<T: 'static>(&self, index: usize, type_id: ComponentTypeId) -> Option<&T> {
        let ptr = self.typed_ptr::<T>(index, type_id)?;
        Some(unsafe { &*(ptr as *const T) })
    }

    /// Typed mutable reference to a component of row `index`.
    ///
    /// # Panics
    ///
    /// Panics if `type_id` is stored here but is not a `T`.
    pub fn get_mut<T: 'static>(&mut self, index: usize, type_id: ComponentTypeId) -> Option<&mut T> {
        let ptr = self.typed_ptr::<T>(index, type_id)?;
        Some(unsafe { &mut *(ptr as *mut T) })
    }

    /// Raw address of one component of row `index`, valid until the next
    /// structural change.
    pub fn index_ptr(&self, index: usize, type_id: ComponentTypeId) -> Option<*mut u8> {
        if index >= self.size() {
            return None;
        }
        let info = self.component_info(type_id)?;
        let (chunk_index, slot) = self.split_index(index);
        Some(unsafe { info.index_ptr(self.chunk_data[chunk_index].as_ptr(), slot) })
    }

    /// One view per chunk, in row order.
    pub fn chunks(&self) -> impl Iterator<Item = ChunkView<'_>> + '_ {
        (0..self.chunk_data.len()).map(move |chunk_index| ChunkView {
            archetype: self,
            chunk_index,
            base: self.chunk_data[chunk_index].as_ptr(),
            len: self.chunk_len(chunk_index),
        })
    }

    /// The live part of one component column, one mutable slice per chunk.
    ///
    /// Yields nothing if the type is not stored here.
    pub fn column_slices_mut<T: 'static>(
        &mut self,
        type_id: ComponentTypeId,
    ) -> impl Iterator<Item = &mut [T]> + '_ {
        let info = self.typed_info::<T>(type_id).copied();
        let this: &Archetype = self;
        info.into_iter().flat_map(move |info| {
            (0..this.chunk_data.len()).map(move |chunk_index| unsafe {
                // Columns of distinct chunks never overlap, and `&mut self`
                // is held for as long as the slices live.
                std::slice::from_raw_parts_mut(
                    info.index_ptr(this.chunk_data[chunk_index].as_ptr(), 0) as *mut T,
                    this.chunk_len(chunk_index),
                )
            })
        })
    }

    // -- internals ----------------------------------------------------------

    /// `(chunk_index, slot)` of logical row `index`.
    #[inline]
    fn split_index(&self, index: usize) -> (usize, usize) {
        let chunk_index = index / self.entities_per_chunk;
        debug_assert!(chunk_index < self.chunk_data.len(), "row {index} out of bounds");
        (chunk_index, index % self.entities_per_chunk)
    }

    fn assert_finalized(&self) {
        assert!(
            self.finalized,
            "archetype {:?}: component layout is not finalized",
            self.id
        );
    }

    fn assert_owns(&self, data: &EntityData) {
        assert_eq!(
            data.archetype,
            Some(self.id),
            "entity location does not belong to archetype {:?}",
            self.id
        );
        assert!(
            data.archetype_index < self.size(),
            "archetype {:?}: row {} out of range (size {})",
            self.id,
            data.archetype_index,
            self.size()
        );
    }

    fn typed_info<T: 'static>(&self, type_id: ComponentTypeId) -> Option<&ComponentRuntimeInfo> {
        let info = self.component_info(type_id)?;
        assert!(
            info.is::<T>(),
            "component {:?} is a {}, not a {}",
            type_id,
            info.type_name(),
            std::any::type_name::<T>()
        );
        Some(info)
    }

    fn typed_ptr<T: 'static>(&self, index: usize, type_id: ComponentTypeId) -> Option<*mut u8> {
        if index >= self.size() {
            return None;
        }
        let info = self.typed_info::<T>(type_id)?;
        let (chunk_index, slot) = self.split_index(index);
        Some(unsafe { info.index_ptr(self.chunk_data[chunk_index].as_ptr(), slot) })
    }

    /// Make room for `additional` rows past the current size, taking every
    /// chunk up front (reserved ones first). Until the rows are committed,
    /// `size()` is meaningless; only [`PendingRows`] calls this. On failure
    /// nothing is kept.
    fn reserve_rows(&mut self, additional: usize) -> Result<(), StoreError> {
        let capacity = self.chunk_data.len() * self.entities_per_chunk;
        let needed = (self.size() + additional).saturating_sub(capacity);
        let new_chunks = needed.div_ceil(self.entities_per_chunk);

        let from_spare = new_chunks.min(self.spare_chunks.len());
        let mut blocks = self
            .spare_chunks
            .split_off(self.spare_chunks.len() - from_spare);
        blocks.reserve(new_chunks - from_spare);
        for _ in from_spare..new_chunks {
            match self.allocate_chunk() {
                Ok(block) => blocks.push(block),
                Err(err) => {
                    for block in blocks.drain(from_spare..) {
                        self.release_chunk(block);
                    }
                    self.spare_chunks.extend(blocks);
                    return Err(err);
                }
            }
        }
        self.chunk_data.extend(blocks);
        Ok(())
    }

    /// Set the row count after rows were constructed in reserved space.
    fn commit_rows(&mut self, size: usize) {
        debug_assert!(size > 0);
        let chunks = size.div_ceil(self.entities_per_chunk);
        debug_assert_eq!(chunks, self.chunk_data.len());
        self.last_chunk_size = size - (chunks - 1) * self.entities_per_chunk;
    }

    /// Fill row `index`, whose components are already dead or moved out,
    /// with the last row, then shrink by one.
    fn vacate_row(&mut self, index: usize) -> Option<Relocation> {
        let last = self.size() - 1;
        let relocation = if index != last {
            let (chunk_index, slot) = self.split_index(index);
            let dst_chunk = self.chunk_data[chunk_index].as_ptr();
            let src_chunk = self.chunk_data[self.chunk_data.len() - 1].as_ptr();
            let src_slot = self.last_chunk_size - 1;
            for info in &self.component_infos {
                unsafe { info.move_indexed(src_chunk, src_slot, dst_chunk, slot, 1) };
            }
            Some(Relocation {
                from: last,
                to: index,
            })
        } else {
            None
        };

        self.last_chunk_size -= 1;
        if self.last_chunk_size == 0 {
            if let Some(block) = self.chunk_data.pop() {
                self.release_chunk(block);
            }
            self.last_chunk_size = if self.chunk_data.is_empty() {
                0
            } else {
                self.entities_per_chunk
            };
        }
        relocation
    }

    fn allocate_chunk(&self) -> Result<NonNull<u8>, StoreError> {
        if self.chunk_byte_size == 0 {
            // Zero-width rows: an aligned dangling address stands in for the chunk.
            let dangling = self.chunk_layout.align() as *mut u8;
            return Ok(NonNull::new(dangling).unwrap_or(NonNull::dangling()));
        }
        let Some(block) = self.allocator.allocate(self.chunk_layout) else {
            warn!(
                archetype = self.id.0,
                bytes = self.chunk_byte_size,
                "chunk allocation failed"
            );
            return Err(StoreError::AllocationFailed {
                bytes: self.chunk_byte_size,
                align: self.chunk_layout.align(),
            });
        };
        if let Some(fill) = self.config.debug_fill {
            unsafe { ptr::write_bytes(block.as_ptr(), fill, self.chunk_byte_size) };
        }
        trace!(
            archetype = self.id.0,
            chunks = self.chunk_data.len() + 1,
            bytes = self.chunk_byte_size,
            "chunk allocated"
        );
        Ok(block)
    }

    fn release_chunk(&self, block: NonNull<u8>) {
        if self.chunk_byte_size == 0 {
            return;
        }
        unsafe { self.allocator.deallocate(block, self.chunk_layout) };
        trace!(
            archetype = self.id.0,
            chunks = self.chunk_data.len(),
            "chunk released"
        );
    }
}

impl Drop for Archetype {
    fn drop(&mut self) {
        for block in std::mem::take(&mut self.spare_chunks) {
            self.release_chunk(block);
        }
        let Some(last) = self.chunk_data.len().checked_sub(1) else {
            return;
        };
        for info in &self.component_infos {
            unsafe {
                info.destroy_indexed(self.chunk_data[last].as_ptr(), 0, self.last_chunk_size);
                for chunk in &self.chunk_data[..last] {
                    info.destroy_indexed(chunk.as_ptr(), 0, self.entities_per_chunk);
                }
            }
        }
        for block in std::mem::take(&mut self.chunk_data) {
            self.release_chunk(block);
        }
    }
}

impl fmt::Debug for Archetype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Archetype")
            .field("id", &self.id)
            .field("component_infos", &self.component_infos)
            .field("size", &self.size())
            .field("chunks", &self.chunk_data.len())
            .field("entities_per_chunk", &self.entities_per_chunk)
            .field("chunk_byte_size", &self.chunk_byte_size)
            .finish()
    }
}

fn align_up(offset: usize, align: usize) -> usize {
    offset.div_ceil(align) * align
}

/// Bytes needed for one chunk of `rows` rows with the columns in table order.
fn columns_byte_size(infos: &[ComponentRuntimeInfo], rows: usize) -> usize {
    infos.iter().fold(0, |size, info| {
        align_up(size, info.component_align) + info.component_size * rows
    })
}

// ---------------------------------------------------------------------------
// PendingRows
// ---------------------------------------------------------------------------

/// Rows being constructed past the committed size of an archetype.
///
/// Rows are built one at a time, column by column. Until [`commit`] runs,
/// dropping the guard (normally by unwinding out of a constructor or a
/// transfer `fill`) destroys exactly the slots constructed so far, hands
/// the reserved chunks back, and restores the previous size.
///
/// [`commit`]: PendingRows::commit
struct PendingRows<'a> {
    archetype: &'a mut Archetype,
    start: usize,
    chunks_before: usize,
    last_chunk_size_before: usize,
    rows_done: usize,
    /// Columns of row `start + rows_done` already constructed.
    columns_done: usize,
    /// Columns holding bitwise copies that another archetype still owns.
    borrowed: Vec<bool>,
    committed: bool,
}

impl<'a> PendingRows<'a> {
    fn reserve(
        archetype: &'a mut Archetype,
        additional: usize,
        borrowed: Vec<bool>,
    ) -> Result<Self, StoreError> {
        debug_assert_eq!(borrowed.len(), archetype.component_infos.len());
        let start = archetype.size();
        let chunks_before = archetype.chunk_data.len();
        let last_chunk_size_before = archetype.last_chunk_size;
        archetype.reserve_rows(additional)?;
        Ok(Self {
            archetype,
            start,
            chunks_before,
            last_chunk_size_before,
            rows_done: 0,
            columns_done: 0,
            borrowed,
            committed: false,
        })
    }

    /// Chunk base and slot of the row under construction.
    fn next_slot(&self) -> (*mut u8, usize) {
        let (chunk_index, slot) = self.archetype.split_index(self.start + self.rows_done);
        (self.archetype.chunk_data[chunk_index].as_ptr(), slot)
    }

    fn finish_row(&mut self) {
        debug_assert_eq!(self.columns_done, self.borrowed.len());
        self.rows_done += 1;
        self.columns_done = 0;
    }

    fn commit(mut self) {
        debug_assert_eq!(self.columns_done, 0);
        self.committed = true;
        if self.rows_done > 0 {
            self.archetype.commit_rows(self.start + self.rows_done);
        }
    }
}

impl Drop for PendingRows<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let archetype = &mut *self.archetype;
        let partial = (self.columns_done > 0).then_some(self.rows_done);
        for row in (0..self.rows_done).chain(partial) {
            let columns = if row < self.rows_done {
                archetype.component_infos.len()
            } else {
                self.columns_done
            };
            let (chunk_index, slot) = archetype.split_index(self.start + row);
            let chunk = archetype.chunk_data[chunk_index].as_ptr();
            for (info, borrowed) in archetype.component_infos[..columns]
                .iter()
                .zip(&self.borrowed)
            {
                if !borrowed {
                    unsafe { info.destroy_indexed(chunk, slot, 1) };
                }
            }
        }

        let reserved = archetype.chunk_data.split_off(self.chunks_before);
        for block in reserved {
            archetype.release_chunk(block);
        }
        archetype.last_chunk_size = self.last_chunk_size_before;
    }
}

// ---------------------------------------------------------------------------
// ComponentSlot
// ---------------------------------------------------------------------------

/// Uninitialized destination storage for one component during
/// [`Archetype::transfer_with`].
pub struct ComponentSlot<'a> {
    info: &'a ComponentRuntimeInfo,
    ptr: *mut u8,
    filled: bool,
}

impl ComponentSlot<'_> {
    #[inline]
    pub fn type_id(&self) -> ComponentTypeId {
        self.info.type_id
    }

    #[inline]
    pub fn info(&self) -> &ComponentRuntimeInfo {
        self.info
    }

    #[inline]
    pub fn is_filled(&self) -> bool {
        self.filled
    }

    /// Move `value` into the slot.
    ///
    /// # Panics
    ///
    /// Panics if `T` is not the slot's component type or the slot was
    /// already written.
    pub fn write<T: 'static>(&mut self, value: T) {
        assert!(
            self.info.is::<T>(),
            "slot for {} cannot hold a {}",
            self.info.type_name(),
            std::any::type_name::<T>()
        );
        assert!(!self.filled, "component slot written twice");
        unsafe { ptr::write(self.ptr as *mut T, value) };
        self.filled = true;
    }
}

// ---------------------------------------------------------------------------
// ChunkView
// ---------------------------------------------------------------------------

/// Read access to the live rows of one chunk.
#[derive(Clone, Copy)]
pub struct ChunkView<'a> {
    archetype: &'a Archetype,
    chunk_index: usize,
    base: *mut u8,
    len: usize,
}

impl<'a> ChunkView<'a> {
    #[inline]
    pub fn chunk_index(&self) -> usize {
        self.chunk_index
    }

    /// Logical index of the chunk's first row.
    #[inline]
    pub fn first_row(&self) -> usize {
        self.chunk_index * self.archetype.entities_per_chunk
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Typed slice of the live part of one column.
    ///
    /// # Panics
    ///
    /// Panics if `type_id` is stored but is not a `T`.
    pub fn column<T: 'static>(&self, type_id: ComponentTypeId) -> Option<&'a [T]> {
        let info = self.archetype.typed_info::<T>(type_id)?;
        Some(unsafe {
            std::slice::from_raw_parts(info.index_ptr(self.base, 0) as *const T, self.len)
        })
    }

    /// Raw start of one column in this chunk.
    pub fn column_ptr(&self, type_id: ComponentTypeId) -> Option<*mut u8> {
        let info = self.archetype.component_info(type_id)?;
        Some(unsafe { info.index_ptr(self.base, 0) })
    }
}

impl fmt::Debug for ChunkView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkView")
            .field("archetype", &self.archetype.id)
            .field("chunk_index", &self.chunk_index)
            .field("len", &self.len)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
