//! Component type registration and the type-erased runtime function table.
//!
//! Every component type stored in an archetype is described by a
//! [`ComponentRuntimeInfo`]: its ordinal [`ComponentTypeId`], its size and
//! alignment, the byte offset of its column inside a chunk, and the
//! construct/destroy function pointers the archetype dispatches through.
//! The [`ComponentRegistry`] hands out ids and builds these records.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::ptr;

// ---------------------------------------------------------------------------
// ComponentTypeId
// ---------------------------------------------------------------------------

/// Stable ordinal identifying a registered component type.
///
/// Archetypes keep their component tables sorted by this id, and the sorted
/// id list is the key used to find an archetype for a component set.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentTypeId(pub u32);

impl fmt::Debug for ComponentTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComponentTypeId({})", self.0)
    }
}

// ---------------------------------------------------------------------------
// ComponentRuntimeInfo
// ---------------------------------------------------------------------------

/// Layout metadata plus type-erased operations for one component type.
///
/// All indexed operations address a component column inside a chunk:
/// `chunk + chunk_offset + index * component_size`. `chunk_offset` is only
/// meaningful once the owning archetype has finalized its layout.
#[derive(Clone, Copy)]
pub struct ComponentRuntimeInfo {
    /// Ordinal of the component type.
    pub type_id: ComponentTypeId,
    /// `std::mem::size_of::<T>()`
    pub component_size: usize,
    /// `std::mem::align_of::<T>()`
    pub component_align: usize,
    /// Byte offset of this type's column within a chunk.
    pub chunk_offset: usize,
    rust_type: TypeId,
    type_name: &'static str,
    /// Default-construct `count` values starting at the given address.
    create_fn: unsafe fn(*mut u8, usize),
    /// Drop `count` values in place starting at the given address.
    destroy_fn: unsafe fn(*mut u8, usize),
}

impl ComponentRuntimeInfo {
    /// Build the runtime info for a concrete component type `T`.
    pub fn of<T>(type_id: ComponentTypeId) -> Self
    where
        T: Default + Send + Sync + 'static,
    {
        unsafe fn create_run<T: Default>(ptr: *mut u8, count: usize) {
            let ptr = ptr as *mut T;
            for i in 0..count {
                ptr::write(ptr.add(i), T::default());
            }
        }

        unsafe fn destroy_run<T>(ptr: *mut u8, count: usize) {
            ptr::drop_in_place(ptr::slice_from_raw_parts_mut(ptr as *mut T, count));
        }

        Self {
            type_id,
            component_size: std::mem::size_of::<T>(),
            component_align: std::mem::align_of::<T>(),
            chunk_offset: 0,
            rust_type: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            create_fn: create_run::<T>,
            destroy_fn: destroy_run::<T>,
        }
    }

    /// Whether this record describes the Rust type `T`.
    #[inline]
    pub fn is<T: 'static>(&self) -> bool {
        self.rust_type == TypeId::of::<T>()
    }

    /// Rust type name of the described component, for diagnostics.
    #[inline]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Raw address of slot `index` of this type's column in `chunk`.
    ///
    /// # Safety
    ///
    /// `chunk` must be a chunk of the archetype this info belongs to and
    /// `index` must be below that archetype's entities-per-chunk.
    #[inline]
    pub unsafe fn index_ptr(&self, chunk: *mut u8, index: usize) -> *mut u8 {
        chunk.add(self.chunk_offset + index * self.component_size)
    }

    /// Default-construct `count` values at slots `start..start + count`.
    ///
    /// # Safety
    ///
    /// The slots must be in bounds and hold no live value.
    pub unsafe fn create_indexed(&self, chunk: *mut u8, start: usize, count: usize) {
        (self.create_fn)(self.index_ptr(chunk, start), count);
    }

    /// Drop the `count` values at slots `start..start + count`.
    ///
    /// # Safety
    ///
    /// The slots must be in bounds and hold live values, which are dead
    /// afterwards.
    pub unsafe fn destroy_indexed(&self, chunk: *mut u8, start: usize, count: usize) {
        (self.destroy_fn)(self.index_ptr(chunk, start), count);
    }

    /// Move `count` values from `src_chunk[src_index..]` to
    /// `dst_chunk[dst_index..]`. The source slots are left logically
    /// uninitialized and must not be dropped.
    ///
    /// # Safety
    ///
    /// Source slots must hold live values, destination slots must be empty,
    /// and the two ranges must not overlap.
    pub unsafe fn move_indexed(
        &self,
        src_chunk: *mut u8,
        src_index: usize,
        dst_chunk: *mut u8,
        dst_index: usize,
        count: usize,
    ) {
        if self.component_size == 0 {
            return;
        }
        ptr::copy_nonoverlapping(
            self.index_ptr(src_chunk, src_index),
            self.index_ptr(dst_chunk, dst_index),
            self.component_size * count,
        );
    }

    /// Move one value from the raw address `source` into slot `index`.
    ///
    /// # Safety
    ///
    /// `source` must point to a live value of this component type, which is
    /// owned by the chunk afterwards. Slot `index` must be empty.
    pub unsafe fn create_from_indexed(&self, chunk: *mut u8, index: usize, source: *const u8) {
        if self.component_size == 0 {
            return;
        }
        ptr::copy_nonoverlapping(source, self.index_ptr(chunk, index), self.component_size);
    }
}

impl fmt::Debug for ComponentRuntimeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentRuntimeInfo")
            .field("type_id", &self.type_id)
            .field("type_name", &self.type_name)
            .field("component_size", &self.component_size)
            .field("component_align", &self.component_align)
            .field("chunk_offset", &self.chunk_offset)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ComponentRegistry
// ---------------------------------------------------------------------------

/// Registry mapping Rust types to [`ComponentTypeId`]s and their runtime info.
///
/// A type can only be registered once; subsequent registrations of the same
/// Rust `TypeId` return the existing [`ComponentTypeId`].
#[derive(Debug, Default)]
pub struct ComponentRegistry {
    by_type: HashMap<TypeId, ComponentTypeId>,
    by_name: HashMap<String, ComponentTypeId>,
    /// Indexed by `ComponentTypeId.0`.
    infos: Vec<ComponentRuntimeInfo>,
    names: Vec<String>,
}

impl ComponentRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component type under the given `name`.
    ///
    /// If the type has already been registered, the existing id is returned
    /// and `name` is ignored.
    ///
    /// # Panics
    ///
    /// Panics if `name` is already taken by a different type.
    pub fn register<T>(&mut self, name: &str) -> ComponentTypeId
    where
        T: Default + Send + Sync + 'static,
    {
        if let Some(&existing) = self.by_type.get(&TypeId::of::<T>()) {
            return existing;
        }
        if self.by_name.contains_key(name) {
            panic!(
                "component name '{}' is already registered for a different type",
                name
            );
        }

        let id = ComponentTypeId(self.infos.len() as u32);
        self.infos.push(ComponentRuntimeInfo::of::<T>(id));
        self.names.push(name.to_owned());
        self.by_type.insert(TypeId::of::<T>(), id);
        self.by_name.insert(name.to_owned(), id);
        id
    }

    /// Look up a component type by its Rust type.
    pub fn lookup<T: 'static>(&self) -> Option<ComponentTypeId> {
        self.by_type.get(&TypeId::of::<T>()).copied()
    }

    /// Look up a component type by its registered name.
    pub fn lookup_by_name(&self, name: &str) -> Option<ComponentTypeId> {
        self.by_name.get(name).copied()
    }

    /// Runtime info for a registered id (with `chunk_offset` still zero).
    pub fn get_info(&self, id: ComponentTypeId) -> Option<&ComponentRuntimeInfo> {
        self.infos.get(id.0 as usize)
    }

    /// Registered name of a component type.
    pub fn name(&self, id: ComponentTypeId) -> Option<&str> {
        self.names.get(id.0 as usize).map(String::as_str)
    }

    /// Total number of registered component types.
    pub fn len(&self) -> usize {
        self.infos.len()
    }

    /// Whether any component types have been registered.
    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    /// Names of all registered component types, sorted.
    pub fn registered_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.names.iter().map(String::as_str).collect();
        names.sort();
        names
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
