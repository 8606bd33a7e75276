//! Typed views over one primary component and optional secondaries.
//!
//! A [`View`] over `(T0, T1, …)` iterates the sectors array of the primary
//! type `T0`, yielding `(EntityId, &T0, Option<&T1>, …)`. Types co-located
//! with the primary read straight off the primary sector pointer; types in
//! other arrays resolve per step through a lock-free sparse lookup.
//!
//! # Snapshot and pin discipline
//!
//! At construction the view pins the primary's back sector (or, for a
//! ranged view, a watermark at the highest requested id) and the back
//! sector of every distinct secondary array. Those pins block relocation,
//! destruction, and member overwrite of everything the view can reach, so
//! the shared references it yields stay valid for the view's lifetime.
//! Sectors inserted after construction sit above the pinned watermarks;
//! the view treats them as absent, consistent with snapshot iteration.
//!
//! Queries are tuples of 1 to 4 component types. The first type drives the
//! iteration order and is always present in yielded rows; the rest are
//! optional per row. [`View::each`] skips rows where any requested
//! component is missing.

use std::any::TypeId;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::Arc;

use smallvec::SmallVec;
use warren_core::{ComponentTypeId, EntityId, LayoutError, Ranges, SectorId};
use warren_memory::layout::{Component, SectorLayout, SectorLayoutBuilder};
use warren_storage::iter::{AliveIter, ArraySnapshot, RangedIter};
use warren_storage::{PinSectors, PinnedSector, SectorsArray};

use crate::registry::Registry;

/// Maximum number of component types in one query tuple.
pub const MAX_QUERY_ARITY: usize = 4;

/// A tuple of component types that can be co-located in one sector layout.
///
/// Implemented for tuples of arity 1 through [`MAX_QUERY_ARITY`].
pub trait ComponentGroup: 'static {
    /// Number of types in the tuple.
    const ARITY: usize;

    /// `TypeId` of each tuple element, in order.
    fn type_ids() -> SmallVec<[TypeId; MAX_QUERY_ARITY]>;

    /// Type name of each tuple element, for diagnostics.
    fn type_names() -> SmallVec<[&'static str; MAX_QUERY_ARITY]>;

    /// Build the sector layout co-locating the tuple's types.
    fn build_layout() -> Result<SectorLayout, LayoutError>;

    /// Registry-local component type id of each element (assigning on
    /// first reference).
    fn component_type_ids(registry: &Registry) -> SmallVec<[ComponentTypeId; MAX_QUERY_ARITY]>;
}

/// A [`ComponentGroup`] that can drive a view.
pub trait ComponentQuery: ComponentGroup {
    /// Row type yielded by iteration: primary reference plus optional
    /// secondaries.
    type Refs<'v>: Copy;

    /// Row type for [`View::each`]: every requested component present.
    type Strict<'v>: Copy;

    /// Resolve (lazily creating) the array of every tuple element.
    fn ensure_arrays(registry: &Registry) -> SmallVec<[Arc<SectorsArray>; MAX_QUERY_ARITY]>;

    /// Assemble a row from per-type member pointers.
    ///
    /// # Safety
    ///
    /// `ptrs[i]`, when `Some`, must point at a live, correctly typed value
    /// of the `i`-th tuple element that stays valid and unaliased by
    /// writers for `'v`. `ptrs[0]` must be `Some`.
    unsafe fn refs_from<'v>(ptrs: &[Option<NonNull<u8>>]) -> Self::Refs<'v>;

    /// Convert a row to its strict form; `None` when any component is
    /// missing.
    fn strict<'v>(refs: Self::Refs<'v>) -> Option<Self::Strict<'v>>;
}

macro_rules! impl_component_tuple {
    ($A:ident $(, $B:ident)* ; $($b_idx:tt),*) => {
        impl<$A: Component $(, $B: Component)*> ComponentGroup for ($A, $($B,)*) {
            const ARITY: usize = [0usize $(, $b_idx)*].len();

            fn type_ids() -> SmallVec<[TypeId; MAX_QUERY_ARITY]> {
                let mut ids = SmallVec::new();
                ids.push(TypeId::of::<$A>());
                $(ids.push(TypeId::of::<$B>());)*
                ids
            }

            fn type_names() -> SmallVec<[&'static str; MAX_QUERY_ARITY]> {
                let mut names = SmallVec::new();
                names.push(std::any::type_name::<$A>());
                $(names.push(std::any::type_name::<$B>());)*
                names
            }

            fn build_layout() -> Result<SectorLayout, LayoutError> {
                SectorLayoutBuilder::new()
                    .member::<$A>()
                    $(.member::<$B>())*
                    .build()
            }

            fn component_type_ids(
                registry: &Registry,
            ) -> SmallVec<[ComponentTypeId; MAX_QUERY_ARITY]> {
                let mut ids = SmallVec::new();
                ids.push(registry.component_type_id::<$A>());
                $(ids.push(registry.component_type_id::<$B>());)*
                ids
            }
        }

        impl<$A: Component $(, $B: Component)*> ComponentQuery for ($A, $($B,)*) {
            type Refs<'v> = (&'v $A, $(Option<&'v $B>,)*);
            type Strict<'v> = (&'v $A, $(&'v $B,)*);

            fn ensure_arrays(
                registry: &Registry,
            ) -> SmallVec<[Arc<SectorsArray>; MAX_QUERY_ARITY]> {
                let mut arrays = SmallVec::new();
                arrays.push(registry.array_for::<$A>());
                $(arrays.push(registry.array_for::<$B>());)*
                arrays
            }

            unsafe fn refs_from<'v>(ptrs: &[Option<NonNull<u8>>]) -> Self::Refs<'v> {
                // SAFETY: per the trait contract the pointers are typed,
                // live, and valid for 'v.
                unsafe {
                    (
                        &*(ptrs[0].expect("primary component pointer").as_ptr() as *const $A),
                        $(ptrs[$b_idx].map(|p| &*(p.as_ptr() as *const $B)),)*
                    )
                }
            }

            fn strict<'v>(refs: Self::Refs<'v>) -> Option<Self::Strict<'v>> {
                Some((refs.0, $(refs.$b_idx?,)*))
            }
        }
    };
}

impl_component_tuple!(A;);
impl_component_tuple!(A, B; 1);
impl_component_tuple!(A, B, C; 1, 2);
impl_component_tuple!(A, B, C, D; 1, 2, 3);

/// Per-type projection record resolved at view construction.
struct TypeAccess {
    alive_mask: u32,
    offset: u32,
    /// Index into the view's array list when the type is not co-located
    /// with the primary.
    secondary: Option<usize>,
    /// Highest id covered by the secondary array's pin; lookups above it
    /// read as absent.
    bound: Option<SectorId>,
}

/// Typed projection over one primary and optional secondary arrays.
pub struct View<'r, Q: ComponentQuery> {
    arrays: SmallVec<[Arc<SectorsArray>; MAX_QUERY_ARITY]>,
    access: SmallVec<[TypeAccess; MAX_QUERY_ARITY]>,
    /// Primary state captured at construction; every traversal replays it.
    snapshot: ArraySnapshot,
    /// Highest primary id the view's pin protects; `None` when the primary
    /// was empty at construction.
    primary_bound: Option<SectorId>,
    primary_mask: u32,
    ranges: Option<Ranges>,
    _pins: SmallVec<[PinnedSector; MAX_QUERY_ARITY]>,
    _registry: PhantomData<&'r Registry>,
    _query: PhantomData<fn() -> Q>,
}

impl<'r, Q: ComponentQuery> View<'r, Q> {
    pub(crate) fn new(registry: &'r Registry, ranges: Option<Ranges>) -> Self {
        let arrays = Q::ensure_arrays(registry);
        let type_ids = Q::type_ids();

        let mut pins: SmallVec<[PinnedSector; MAX_QUERY_ARITY]> = SmallVec::new();

        // Bound the primary iteration: a back pin in linear mode, a
        // watermark at the highest requested id in ranged mode. Sectors
        // that appear above the bound after this point are not protected,
        // so iteration clamps to it.
        let mut primary_bound = None;
        match &ranges {
            None => {
                let pin = arrays[0].pin_back_sector();
                if !pin.is_empty() {
                    primary_bound = Some(pin.id());
                    pins.push(pin);
                }
            }
            Some(r) => {
                if let Some(back) = r.back() {
                    primary_bound = Some(back.end);
                    pins.push(arrays[0].pin_watermark(back.end));
                }
            }
        }

        // Pin each distinct secondary array's back sector and record the
        // covered bound per type.
        let mut bounds: SmallVec<[Option<SectorId>; MAX_QUERY_ARITY]> =
            SmallVec::from_elem(None, arrays.len());
        for i in 1..arrays.len() {
            if Arc::ptr_eq(&arrays[i], &arrays[0]) {
                continue;
            }
            if let Some(j) = (1..i).find(|&j| Arc::ptr_eq(&arrays[i], &arrays[j])) {
                bounds[i] = bounds[j];
                continue;
            }
            let pin = arrays[i].pin_back_sector();
            if !pin.is_empty() {
                bounds[i] = Some(pin.id());
                pins.push(pin);
            }
        }

        let mut access: SmallVec<[TypeAccess; MAX_QUERY_ARITY]> = SmallVec::new();
        for (i, array) in arrays.iter().enumerate() {
            let member = array
                .layout()
                .member_by_type_id(type_ids[i])
                .expect("array resolved for this component type");
            access.push(TypeAccess {
                alive_mask: member.alive_mask,
                offset: member.offset,
                secondary: (!Arc::ptr_eq(array, &arrays[0])).then_some(i),
                bound: bounds[i],
            });
        }
        let primary_mask = access[0].alive_mask;

        // Captured after the pins are in place, so everything the snapshot
        // covers is protected for the view's lifetime.
        let snapshot = arrays[0].snapshot();

        Self {
            arrays,
            access,
            snapshot,
            primary_bound,
            primary_mask,
            ranges,
            _pins: pins,
            _registry: PhantomData,
            _query: PhantomData,
        }
    }

    /// Iterate the view's rows over the construction-time snapshot.
    pub fn iter(&self) -> ViewIter<'_, Q> {
        let inner = match &self.ranges {
            None => ViewCursor::Alive(self.snapshot.iter_alive_mask(self.primary_mask)),
            Some(r) => ViewCursor::Ranged(self.snapshot.iter_ranged(r)),
        };
        ViewIter { view: self, inner }
    }

    /// Whether the view yields no rows.
    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    /// Invoke `f` for each row where every requested component is present.
    pub fn each(&self, mut f: impl FnMut(EntityId, Q::Strict<'_>)) {
        for (id, refs) in self.iter() {
            if let Some(strict) = Q::strict(refs) {
                f(id, strict);
            }
        }
    }
}

impl<'r, 'v, Q: ComponentQuery> IntoIterator for &'v View<'r, Q> {
    type Item = (EntityId, Q::Refs<'v>);
    type IntoIter = ViewIter<'v, Q>;

    fn into_iter(self) -> ViewIter<'v, Q> {
        self.iter()
    }
}

/// Primary traversal flavor.
enum ViewCursor<'v> {
    Alive(AliveIter<'v>),
    Ranged(RangedIter<'v>),
}

/// Iterator over a view's rows.
pub struct ViewIter<'v, Q: ComponentQuery> {
    view: &'v View<'v, Q>,
    inner: ViewCursor<'v>,
}

impl<'v, Q: ComponentQuery> Iterator for ViewIter<'v, Q> {
    type Item = (EntityId, Q::Refs<'v>);

    fn next(&mut self) -> Option<Self::Item> {
        let bound = self.view.primary_bound?;
        loop {
            let slot = match &mut self.inner {
                ViewCursor::Alive(it) => it.next()?,
                ViewCursor::Ranged(it) => it.next()?,
            };
            // The pin protects ids up to the bound; anything above slipped
            // in between pinning and the snapshot and stays invisible.
            if slot.id > bound {
                return None;
            }
            // The alive iterator pre-filters; the ranged one does not.
            if slot.alive & self.view.primary_mask == 0 {
                continue;
            }

            let mut ptrs: SmallVec<[Option<NonNull<u8>>; MAX_QUERY_ARITY]> = SmallVec::new();
            for access in &self.view.access {
                let ptr = match access.secondary {
                    None => {
                        if slot.alive & access.alive_mask != 0 {
                            // SAFETY: offset from the primary's layout.
                            NonNull::new(unsafe { slot.data.add(access.offset as usize) })
                        } else {
                            None
                        }
                    }
                    Some(array_idx) => self.view.lookup_secondary(access, array_idx, slot.id),
                };
                ptrs.push(ptr);
            }

            // SAFETY: pointers were derived from the per-type layouts in
            // tuple order; the view's pins keep them valid and unaliased
            // by writers for 'v.
            return Some((slot.id, unsafe { Q::refs_from(&ptrs) }));
        }
    }
}

impl<'r, Q: ComponentQuery> View<'r, Q> {
    /// O(1) lock-free lookup of a secondary component's member pointer.
    fn lookup_secondary(
        &self,
        access: &TypeAccess,
        array_idx: usize,
        id: SectorId,
    ) -> Option<NonNull<u8>> {
        // Ids above the pinned bound are not covered by the view's
        // snapshot guarantee; treat them as absent.
        if access.bound.is_none_or(|bound| id > bound) {
            return None;
        }
        let (data, alive) = self.arrays[array_idx].slot_snapshot(id)?;
        if alive & access.alive_mask == 0 {
            return None;
        }
        // SAFETY: offset from the secondary array's layout.
        NonNull::new(unsafe { data.as_ptr().add(access.offset as usize) })
    }
}
