//! The registry: entity ids, array ownership, component routing.
//!
//! A [`Registry`] owns one sectors array per component type — or per
//! co-located group registered up front with [`Registry::register_array`] —
//! plus the run-length range set that allocates entity ids. Component
//! operations route to the owning array; bulk operations (entity
//! destruction, the maintenance pass) broadcast across arrays.
//!
//! Thread safety: the array table and the entity set each sit behind their
//! own shared/unique lock; everything per-array is delegated to the
//! arrays' internal discipline. Entity ids are reused after destruction —
//! do not cache them across destruction boundaries without revalidating.

use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::{Arc, RwLock};

use warren_core::{ComponentTypeId, EntityId, Ranges, RegistryError};
use warren_memory::config::StorageConfig;
use warren_memory::layout::Component;
use warren_storage::{PinSectors, PinnedSector, SectorsArray};

use crate::metrics::{ArrayMetrics, RegistryMetrics};
use crate::type_map::TypeRegistry;
use crate::view::{ComponentGroup, ComponentQuery, View};

/// RAII pin exposing a typed component reference.
///
/// Wraps a sector pin; the component stays valid and unaliased by writers
/// until the handle drops.
pub struct PinnedComponent<T: Component> {
    _pin: PinnedSector,
    ptr: NonNull<T>,
}

// SAFETY: the pin keeps the pointed-at component stable; T is Sync by the
// Component bound.
unsafe impl<T: Component> Send for PinnedComponent<T> {}
unsafe impl<T: Component> Sync for PinnedComponent<T> {}

impl<T: Component> Deref for PinnedComponent<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: constructed from a live member; the pin blocks
        // relocation, destruction, and overwrite for self's lifetime.
        unsafe { self.ptr.as_ref() }
    }
}

/// Mapping from component type ids to arrays.
#[derive(Default)]
struct ArrayTable {
    /// Every distinct array, in registration order.
    list: Vec<Arc<SectorsArray>>,
    /// `ComponentTypeId` index → position in `list`.
    by_type: Vec<Option<usize>>,
}

impl ArrayTable {
    fn array_of(&self, type_id: ComponentTypeId) -> Option<&Arc<SectorsArray>> {
        self.by_type
            .get(type_id.index())
            .copied()
            .flatten()
            .map(|i| &self.list[i])
    }
}

/// Central coordinator owning component arrays and entity ids.
pub struct Registry {
    types: TypeRegistry,
    arrays: RwLock<ArrayTable>,
    entities: RwLock<Ranges>,
    config: StorageConfig,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Create an empty registry with the default storage configuration.
    pub fn new() -> Self {
        Self::with_config(StorageConfig::default())
    }

    /// Create an empty registry; arrays it creates use `config`.
    ///
    /// # Panics
    ///
    /// Panics when the configuration fails validation.
    pub fn with_config(config: StorageConfig) -> Self {
        config.validate().expect("invalid storage configuration");
        Self {
            types: TypeRegistry::new(),
            arrays: RwLock::new(ArrayTable::default()),
            entities: RwLock::new(Ranges::new()),
            config,
        }
    }

    /// Registry-local type id for `T`, assigned on first reference.
    pub fn component_type_id<T: Component>(&self) -> ComponentTypeId {
        self.types.id_of::<T>()
    }

    // ==================== Entities ====================

    /// Allocate a new entity id.
    pub fn take_entity(&self) -> EntityId {
        self.entities.write().unwrap().take()
    }

    /// Whether the registry currently owns `id`.
    pub fn contains(&self, id: EntityId) -> bool {
        self.entities.read().unwrap().contains(id)
    }

    /// Snapshot of every live entity id, ascending.
    pub fn all_entities(&self) -> Vec<EntityId> {
        self.entities.read().unwrap().get_all()
    }

    /// Number of live entities.
    pub fn entity_count(&self) -> usize {
        self.entities.read().unwrap().id_count()
    }

    /// Destroy an entity and every component it has.
    ///
    /// Returns whether the entity was owned. Waits per array until the
    /// sector is changeable; destroyed slots stay mapped and are swept by
    /// the next defragmentation.
    pub fn destroy_entity(&self, id: EntityId) -> bool {
        {
            let mut entities = self.entities.write().unwrap();
            if !entities.contains(id) {
                return false;
            }
            entities.erase(id);
        }
        for array in self.snapshot_arrays() {
            array.destroy_sector(id);
        }
        true
    }

    /// Destroy a batch of entities and all their components.
    ///
    /// Each array handles the batch under a single lock acquisition with
    /// the ids sorted and clamped to its sparse capacity.
    pub fn destroy_entities(&self, ids: &[EntityId]) {
        if ids.is_empty() {
            return;
        }
        for array in self.snapshot_arrays() {
            array.destroy_sectors(ids);
        }
        let mut entities = self.entities.write().unwrap();
        for &id in ids {
            entities.erase(id);
        }
    }

    // ==================== Arrays ====================

    /// Register one sectors array co-locating the tuple's component types.
    ///
    /// All listed types must be unregistered, or all already co-located in
    /// the same array (then this is a no-op apart from the reserve).
    /// Partial overlap is rejected. Call before the first implicit use of
    /// any listed type; `capacity` pre-allocates that many sectors.
    pub fn register_array<G: ComponentGroup>(&self, capacity: u32) -> Result<(), RegistryError> {
        let type_ids = G::component_type_ids(self);
        let type_names = G::type_names();

        let mut table = self.arrays.write().unwrap();

        let positions: Vec<Option<usize>> = type_ids
            .iter()
            .map(|tid| table.by_type.get(tid.index()).copied().flatten())
            .collect();

        if positions.iter().all(Option::is_some) {
            let first = positions[0];
            if positions.iter().any(|p| *p != first) {
                return Err(RegistryError::PartialGroupOverlap {
                    type_name: type_names[0],
                });
            }
            // Whole group already registered together.
            let array = Arc::clone(&table.list[first.unwrap()]);
            drop(table);
            if capacity > 0 {
                array.reserve(capacity as usize);
            }
            return Ok(());
        }

        if let Some(i) = positions.iter().position(Option::is_some) {
            return Err(RegistryError::PartialGroupOverlap {
                type_name: type_names[i],
            });
        }

        let layout = G::build_layout()?;
        let array = Arc::new(
            SectorsArray::new(Arc::new(layout), self.config)
                .expect("registry configuration validated at construction"),
        );
        if capacity > 0 {
            array.reserve(capacity as usize);
        }

        let slot = table.list.len();
        table.list.push(Arc::clone(&array));
        let max_index = type_ids.iter().map(|t| t.index()).max().unwrap_or(0);
        if table.by_type.len() <= max_index {
            table.by_type.resize(max_index + 1, None);
        }
        for tid in &type_ids {
            table.by_type[tid.index()] = Some(slot);
        }
        Ok(())
    }

    /// The array storing `T`, registering a single-type array on first use.
    pub fn array_for<T: Component>(&self) -> Arc<SectorsArray> {
        let type_id = self.types.id_of::<T>();
        {
            let table = self.arrays.read().unwrap();
            if let Some(array) = table.array_of(type_id) {
                return Arc::clone(array);
            }
        }

        // First use: implicit single-type registration. A concurrent racer
        // may have won; register_array treats that as a no-op.
        let _ = self.register_array::<(T,)>(0);
        let table = self.arrays.read().unwrap();
        Arc::clone(table.array_of(type_id).expect("array registered above"))
    }

    /// The array storing `T`, if one has been registered.
    pub fn array_if_registered<T: Component>(&self) -> Option<Arc<SectorsArray>> {
        let type_id = self.types.get::<T>()?;
        self.arrays.read().unwrap().array_of(type_id).cloned()
    }

    // ==================== Components ====================

    /// Add or overwrite component `T` for an entity.
    pub fn add_component<T: Component>(&self, id: EntityId, value: T) {
        self.array_for::<T>().insert(id, value);
    }

    /// Bulk-add components under a single writer-lock acquisition.
    pub fn add_components<T: Component>(&self, items: impl IntoIterator<Item = (EntityId, T)>) {
        self.array_for::<T>().insert_batch(items);
    }

    /// Destroy component `T` for an entity; returns whether it was live.
    pub fn destroy_component<T: Component>(&self, id: EntityId) -> bool {
        match self.array_if_registered::<T>() {
            Some(array) => array.destroy_member::<T>(id),
            None => false,
        }
    }

    /// Destroy component `T` for a batch of entities.
    pub fn destroy_components<T: Component>(&self, ids: &[EntityId]) {
        if let Some(array) = self.array_if_registered::<T>() {
            array.destroy_members::<T>(ids);
        }
    }

    /// Whether an entity has a live component `T`.
    pub fn has_component<T: Component>(&self, id: EntityId) -> bool {
        match self.array_if_registered::<T>() {
            Some(array) => array.has_member::<T>(id),
            None => false,
        }
    }

    /// Pin component `T` of an entity; `None` when absent.
    pub fn pin_component<T: Component>(&self, id: EntityId) -> Option<PinnedComponent<T>> {
        let array = self.array_for::<T>();
        let pin = array.pin_sector(id);
        let ptr = NonNull::from(pin.member::<T>()?);
        Some(PinnedComponent { _pin: pin, ptr })
    }

    /// Clone component `T` of an entity out under a transient pin.
    pub fn get_component<T: Component>(&self, id: EntityId) -> Option<T> {
        self.array_if_registered::<T>()?.get_cloned::<T>(id)
    }

    // ==================== Views ====================

    /// A view over the query tuple's component types.
    pub fn view<Q: ComponentQuery>(&self) -> View<'_, Q> {
        View::new(self, None)
    }

    /// A view bounded to the given entity id ranges.
    pub fn view_ranged<Q: ComponentQuery>(&self, ranges: Ranges) -> View<'_, Q> {
        View::new(self, Some(ranges))
    }

    /// Pin the query's components per entity and invoke `f` for each
    /// entity that has all of them.
    pub fn for_each_pinned<Q: ComponentQuery>(
        &self,
        ids: &[EntityId],
        mut f: impl FnMut(EntityId, Q::Strict<'_>),
    ) {
        if ids.is_empty() {
            return;
        }
        let arrays = Q::ensure_arrays(self);
        let type_ids = Q::type_ids();

        for &id in ids {
            let pins: smallvec::SmallVec<[PinnedSector; 4]> =
                arrays.iter().map(|a| a.pin_sector(id)).collect();

            let mut ptrs: smallvec::SmallVec<[Option<NonNull<u8>>; 4]> =
                smallvec::SmallVec::new();
            for (i, pin) in pins.iter().enumerate() {
                let member = arrays[i]
                    .layout()
                    .member_by_type_id(type_ids[i])
                    .expect("array resolved for this component type");
                let ptr = pin.data_ptr().and_then(|data| {
                    if pin.alive_bits() & member.alive_mask != 0 {
                        // SAFETY: offset from the array's layout.
                        NonNull::new(unsafe { data.as_ptr().add(member.offset as usize) })
                    } else {
                        None
                    }
                });
                ptrs.push(ptr);
            }

            if ptrs[0].is_none() {
                continue;
            }
            // SAFETY: pointers typed per the tuple order; the pins keep
            // them valid and unaliased by writers within this iteration.
            let refs = unsafe { Q::refs_from(&ptrs) };
            if let Some(strict) = Q::strict(refs) {
                f(id, strict);
            }
        }
    }

    // ==================== Maintenance ====================

    /// Maintenance pass: process each array's deferred erases, optionally
    /// compacting arrays whose dead ratio exceeds their threshold.
    ///
    /// Call once per frame at a stable synchronization point.
    pub fn update(&self, with_defragment: bool) {
        for array in self.snapshot_arrays() {
            array.process_pending_erases(with_defragment);
        }
    }

    /// Compact every array unconditionally.
    pub fn defragment(&self) {
        for array in self.snapshot_arrays() {
            array.defragment();
        }
    }

    /// Pre-allocate sector capacity for `T`'s array.
    pub fn reserve<T: Component>(&self, capacity: usize) {
        self.array_for::<T>().reserve(capacity);
    }

    /// Destroy all components and entities, retaining capacity.
    pub fn clear(&self) {
        for array in self.snapshot_arrays() {
            array.clear();
        }
        self.entities.write().unwrap().clear();
    }

    /// Release unused tail capacity in every array.
    pub fn shrink_to_fit(&self) {
        for array in self.snapshot_arrays() {
            array.shrink_to_fit();
        }
    }

    /// Point-in-time occupancy of the registry and its arrays.
    pub fn metrics(&self) -> RegistryMetrics {
        let arrays = self.snapshot_arrays();
        RegistryMetrics {
            entities: self.entity_count(),
            arrays: arrays
                .iter()
                .map(|a| ArrayMetrics {
                    size: a.size(),
                    capacity: a.capacity(),
                    dead_slots: a.defragment_size(),
                    pending_erases: a.pending_erase_len(),
                    sparse_capacity: a.sparse_capacity(),
                })
                .collect(),
        }
    }

    /// Clone the array list so per-array work runs without the table lock.
    fn snapshot_arrays(&self) -> Vec<Arc<SectorsArray>> {
        self.arrays.read().unwrap().list.clone()
    }
}
