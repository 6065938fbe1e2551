//! The [`World`] is the registry on top of the archetype store. It owns the
//! entity allocator, the component registry, every archetype, and the
//! [`EntityData`] location of each live entity.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use crate::allocator::{ChunkAllocator, SystemAllocator};
use crate::archetype::{Archetype, ArchetypeId, Relocation};
use crate::component::{ComponentRegistry, ComponentTypeId};
use crate::config::StoreConfig;
use crate::entity::{EntityAllocator, EntityData, EntityId};
use crate::StoreError;

/// The top-level container: finds or creates archetypes by component set and
/// keeps entity locations in sync with every structural change.
pub struct World {
    entities: EntityAllocator,
    registry: ComponentRegistry,
    chunk_allocator: Arc<dyn ChunkAllocator>,
    config: StoreConfig,
    /// Indexed by `ArchetypeId.0`.
    archetypes: Vec<Archetype>,
    /// Row -> entity table, parallel to each archetype's rows.
    rows: Vec<Vec<EntityId>>,
    /// Indexed by `EntityId::index()`.
    locations: Vec<EntityData>,
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("entity_count", &self.entity_count())
            .field("archetype_count", &self.archetypes.len())
            .field("config", &self.config)
            .finish()
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

impl World {
    /// A world backed by the global heap with the default configuration.
    pub fn new() -> Self {
        Self::build(Arc::new(SystemAllocator), StoreConfig::default())
    }

    /// A world whose archetypes take their chunks from `allocator`.
    pub fn with_allocator(
        allocator: Arc<dyn ChunkAllocator>,
        config: StoreConfig,
    ) -> Result<Self, StoreError> {
        config.validate()?;
        Ok(Self::build(allocator, config))
    }

    fn build(chunk_allocator: Arc<dyn ChunkAllocator>, config: StoreConfig) -> Self {
        Self {
            entities: EntityAllocator::new(),
            registry: ComponentRegistry::new(),
            chunk_allocator,
            config,
            archetypes: Vec::new(),
            rows: Vec::new(),
            locations: Vec::new(),
        }
    }

    /// Read-only access to the component registry.
    pub fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Register a component type.
    pub fn register_component<T>(&mut self, name: &str) -> ComponentTypeId
    where
        T: Default + Send + Sync + 'static,
    {
        self.registry.register::<T>(name)
    }

    // -- archetype management -----------------------------------------------

    /// The archetype storing exactly `sorted_ids`, if one exists.
    ///
    /// # Panics
    ///
    /// Panics if `sorted_ids` is not sorted ascending.
    pub fn find_archetype(&self, sorted_ids: &[ComponentTypeId]) -> Option<ArchetypeId> {
        self.archetypes
            .iter()
            .find(|archetype| archetype.matches_type_indexes(sorted_ids))
            .map(Archetype::id)
    }

    /// Find or create the archetype for a component set given in any order.
    pub fn archetype_for(
        &mut self,
        type_ids: &[ComponentTypeId],
    ) -> Result<ArchetypeId, StoreError> {
        let mut sorted = type_ids.to_vec();
        sorted.sort();
        sorted.dedup();
        if let Some(id) = self.find_archetype(&sorted) {
            return Ok(id);
        }

        let infos = sorted
            .iter()
            .map(|type_id| {
                self.registry
                    .get_info(*type_id)
                    .copied()
                    .ok_or_else(|| StoreError::UnknownComponent {
                        name: format!("{type_id:?}"),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let id = ArchetypeId(self.archetypes.len() as u32);
        let archetype = Archetype::new(
            id,
            infos,
            self.chunk_allocator.clone(),
            self.config.clone(),
        );
        debug!(
            archetype = id.0,
            components = ?sorted,
            entities_per_chunk = archetype.entities_per_chunk(),
            "archetype created"
        );
        self.archetypes.push(archetype);
        self.rows.push(Vec::new());
        Ok(id)
    }

    pub fn archetype(&self, id: ArchetypeId) -> Option<&Archetype> {
        self.archetypes.get(id.0 as usize)
    }

    pub fn archetypes(&self) -> impl Iterator<Item = &Archetype> {
        self.archetypes.iter()
    }

    /// Entities of an archetype in row order.
    pub fn entities_in(&self, id: ArchetypeId) -> &[EntityId] {
        self.rows.get(id.0 as usize).map_or(&[], Vec::as_slice)
    }

    pub fn archetype_count(&self) -> usize {
        self.archetypes.len()
    }

    // -- entity lifecycle ---------------------------------------------------

    /// Spawn one entity with default-constructed components of `type_ids`.
    pub fn spawn(&mut self, type_ids: &[ComponentTypeId]) -> Result<EntityId, StoreError> {
        let mut spawned = self.spawn_batch(type_ids, 1)?;
        Ok(spawned.remove(0))
    }

    /// Spawn `count` entities sharing one component set.
    pub fn spawn_batch(
        &mut self,
        type_ids: &[ComponentTypeId],
        count: usize,
    ) -> Result<Vec<EntityId>, StoreError> {
        let archetype_id = self.archetype_for(type_ids)?;
        let rows = self.archetypes[archetype_id.0 as usize].add_entities(count)?;

        let mut spawned = Vec::with_capacity(count);
        for row in rows {
            let entity = self.entities.allocate();
            self.set_location(entity, EntityData::new(archetype_id, row));
            self.rows[archetype_id.0 as usize].push(entity);
            spawned.push(entity);
        }
        Ok(spawned)
    }

    /// Spawn a new entity with a single component.
    pub fn spawn_with<T>(&mut self, component: T) -> Result<EntityId, StoreError>
    where
        T: Default + Send + Sync + 'static,
    {
        let type_id = self.component_type_id::<T>()?;
        let entity = self.spawn(&[type_id])?;
        if let Some(slot) = self.get_component_mut::<T>(entity) {
            *slot = component;
        }
        Ok(entity)
    }

    /// Despawn an entity, destroying its components and recycling the ID.
    pub fn despawn(&mut self, entity: EntityId) -> Result<(), StoreError> {
        let mut data = self.live_location(entity)?;
        let archetype_id = data.archetype.ok_or(StoreError::StaleEntity { entity })?;

        let relocation = self.archetypes[archetype_id.0 as usize].remove_entity(&mut data);
        self.apply_relocations(archetype_id, relocation);
        self.set_location(entity, data);
        self.entities.deallocate(entity);
        Ok(())
    }

    // -- component access ---------------------------------------------------

    pub fn get_component<T: 'static>(&self, entity: EntityId) -> Option<&T> {
        let data = self.live_location(entity).ok()?;
        let type_id = self.registry.lookup::<T>()?;
        self.archetypes[data.archetype?.0 as usize].get::<T>(data.archetype_index, type_id)
    }

    pub fn get_component_mut<T: 'static>(&mut self, entity: EntityId) -> Option<&mut T> {
        let data = self.live_location(entity).ok()?;
        let type_id = self.registry.lookup::<T>()?;
        self.archetypes[data.archetype?.0 as usize].get_mut::<T>(data.archetype_index, type_id)
    }

    pub fn has_component<T: 'static>(&self, entity: EntityId) -> bool {
        let (Ok(data), Some(type_id)) = (self.live_location(entity), self.registry.lookup::<T>())
        else {
            return false;
        };
        data.archetype
            .is_some_and(|id| self.archetypes[id.0 as usize].has_component(type_id))
    }

    /// Insert a component on an entity. An existing value is overwritten in
    /// place; otherwise the entity migrates to the archetype that also
    /// stores `T`.
    pub fn insert_component<T>(&mut self, entity: EntityId, value: T) -> Result<(), StoreError>
    where
        T: Default + Send + Sync + 'static,
    {
        let type_id = self.component_type_id::<T>()?;
        let data = self.live_location(entity)?;
        let source = data.archetype.ok_or(StoreError::StaleEntity { entity })?;

        if let Some(slot) =
            self.archetypes[source.0 as usize].get_mut::<T>(data.archetype_index, type_id)
        {
            *slot = value;
            return Ok(());
        }

        let mut types: Vec<_> = self.archetypes[source.0 as usize].component_types().collect();
        types.push(type_id);
        let destination = self.archetype_for(&types)?;

        let mut value = Some(value);
        self.migrate(&[entity], source, destination, |src, dst, batch| {
            src.transfer_with(dst, batch, |_, slot| {
                if let Some(value) = value.take() {
                    slot.write(value);
                }
            })
        })
    }

    /// Remove a component type from an entity, migrating it to the archetype
    /// without that type. A no-op if the entity lacks the component.
    pub fn remove_component<T>(&mut self, entity: EntityId) -> Result<(), StoreError>
    where
        T: Default + Send + Sync + 'static,
    {
        let type_id = self.component_type_id::<T>()?;
        let data = self.live_location(entity)?;
        let source = data.archetype.ok_or(StoreError::StaleEntity { entity })?;
        if !self.archetypes[source.0 as usize].has_component(type_id) {
            return Ok(());
        }

        let types: Vec<_> = self.archetypes[source.0 as usize]
            .component_types()
            .filter(|id| *id != type_id)
            .collect();
        let destination = self.archetype_for(&types)?;
        self.migrate(&[entity], source, destination, Archetype::transfer_to)
    }

    /// Move a set of entities into `destination`, keeping the components it
    /// stores and dropping the rest. Entities already there, and repeats of
    /// an entity, are left alone.
    ///
    /// Room for the whole set is reserved in `destination` first, so on
    /// `AllocationFailed` no entity has moved.
    ///
    /// # Panics
    ///
    /// Panics, before moving anything, if `destination` stores a component
    /// type that one of the entities lacks.
    pub fn transfer_entities(
        &mut self,
        entities: &[EntityId],
        destination: ArchetypeId,
    ) -> Result<(), StoreError> {
        assert!(
            (destination.0 as usize) < self.archetypes.len(),
            "unknown archetype {destination:?}"
        );
        let mut seen = HashSet::with_capacity(entities.len());
        let mut groups: Vec<(ArchetypeId, Vec<EntityId>)> = Vec::new();
        for &entity in entities {
            let data = self.live_location(entity)?;
            let source = data.archetype.ok_or(StoreError::StaleEntity { entity })?;
            if source == destination || !seen.insert(entity) {
                continue;
            }
            match groups.iter_mut().find(|(id, _)| *id == source) {
                Some((_, group)) => group.push(entity),
                None => groups.push((source, vec![entity])),
            }
        }

        let target = &self.archetypes[destination.0 as usize];
        for (source, _) in &groups {
            let source_archetype = &self.archetypes[source.0 as usize];
            if let Some(missing) = target
                .component_types()
                .find(|id| !source_archetype.has_component(*id))
            {
                panic!(
                    "creating components on transfer is not supported: archetype {destination:?} has {missing:?}, archetype {source:?} does not"
                );
            }
        }

        let moving = groups.iter().map(|(_, group)| group.len()).sum();
        self.archetypes[destination.0 as usize].reserve(moving)?;
        for (source, group) in groups {
            self.migrate(&group, source, destination, Archetype::transfer_to)?;
        }
        Ok(())
    }

    /// Total number of alive entities.
    pub fn entity_count(&self) -> usize {
        self.entities.alive_count()
    }

    pub fn is_alive(&self, entity: EntityId) -> bool {
        self.entities.is_alive(entity)
    }

    /// Where a live entity is stored.
    pub fn location(&self, entity: EntityId) -> Option<EntityData> {
        self.live_location(entity).ok()
    }

    // -- internals ----------------------------------------------------------

    fn component_type_id<T: 'static>(&self) -> Result<ComponentTypeId, StoreError> {
        self.registry
            .lookup::<T>()
            .ok_or_else(|| StoreError::UnknownComponent {
                name: std::any::type_name::<T>().to_owned(),
            })
    }

    fn live_location(&self, entity: EntityId) -> Result<EntityData, StoreError> {
        if !self.entities.is_alive(entity) {
            return Err(StoreError::StaleEntity { entity });
        }
        Ok(self.locations[entity.index() as usize])
    }

    fn set_location(&mut self, entity: EntityId, data: EntityData) {
        let idx = entity.index() as usize;
        if idx >= self.locations.len() {
            self.locations.resize(idx + 1, EntityData::default());
        }
        self.locations[idx] = data;
    }

    /// Replay swap-removals on the row table of `archetype_id`, then trim it
    /// to the archetype's size.
    fn apply_relocations(
        &mut self,
        archetype_id: ArchetypeId,
        relocations: impl IntoIterator<Item = Relocation>,
    ) {
        let rows = &mut self.rows[archetype_id.0 as usize];
        for Relocation { from, to } in relocations {
            let moved = rows[from];
            rows[to] = moved;
            self.locations[moved.index() as usize].archetype_index = to;
        }
        rows.truncate(self.archetypes[archetype_id.0 as usize].size());
    }

    /// Run `transfer` on `entities` (all stored in `source`) and record the
    /// resulting locations.
    fn migrate<F>(
        &mut self,
        entities: &[EntityId],
        source: ArchetypeId,
        destination: ArchetypeId,
        transfer: F,
    ) -> Result<(), StoreError>
    where
        F: FnOnce(
            &mut Archetype,
            &mut Archetype,
            &mut [EntityData],
        ) -> Result<Vec<Relocation>, StoreError>,
    {
        let mut batch: Vec<EntityData> = entities
            .iter()
            .map(|entity| self.locations[entity.index() as usize])
            .collect();

        let (src, dst) = self.pair_mut(source, destination);
        let relocations = transfer(src, dst, &mut batch)?;

        self.apply_relocations(source, relocations);
        for (&entity, data) in entities.iter().zip(batch) {
            self.rows[destination.0 as usize].push(entity);
            self.set_location(entity, data);
        }
        Ok(())
    }

    fn pair_mut(&mut self, a: ArchetypeId, b: ArchetypeId) -> (&mut Archetype, &mut Archetype) {
        let (a, b) = (a.0 as usize, b.0 as usize);
        assert_ne!(a, b, "an archetype cannot transfer into itself");
        if a < b {
            let (low, high) = self.archetypes.split_at_mut(b);
            (&mut low[a], &mut high[0])
        } else {
            let (low, high) = self.archetypes.split_at_mut(a);
            (&mut high[0], &mut low[b])
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
