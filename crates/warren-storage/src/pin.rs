//! RAII pin handle over one sector.
//!
//! A [`PinnedSector`] increments the owning array's pin counter for its id
//! on construction and decrements on drop. For the handle's lifetime the
//! engine guarantees the sector is neither relocated nor destroyed, and —
//! because structural mutators wait until their target exceeds the highest
//! pinned id — no member at or below the pinned id is overwritten either.
//! That is what makes the shared references served by
//! [`PinnedSector::member`] sound.
//!
//! A *watermark* pin carries no data pointer; it exists purely to hold the
//! highest-pinned watermark at an id, which blocks structural mutation of
//! everything at or below it. Views use watermark pins to keep their
//! iteration bounds valid.

use std::ptr::NonNull;
use std::sync::Arc;

use warren_core::{SectorId, INVALID_ID};
use warren_memory::layout::Component;

use crate::array::SectorsArray;

/// RAII pin preventing relocation and destruction of one sector.
pub struct PinnedSector {
    owner: Option<Arc<SectorsArray>>,
    id: SectorId,
    data: *mut u8,
    alive: u32,
}

// SAFETY: the handle may travel between threads; pin/unpin are atomic and
// the data pointer targets chunk storage the pin keeps stable.
unsafe impl Send for PinnedSector {}
unsafe impl Sync for PinnedSector {}

impl PinnedSector {
    /// An empty handle holding no pin.
    pub fn empty() -> Self {
        Self {
            owner: None,
            id: INVALID_ID,
            data: std::ptr::null_mut(),
            alive: 0,
        }
    }

    /// Pin `id` in `owner`, capturing the sector data pointer and an
    /// alive-bits snapshot.
    pub(crate) fn new(owner: Arc<SectorsArray>, id: SectorId, data: *mut u8, alive: u32) -> Self {
        debug_assert_ne!(id, INVALID_ID);
        owner.pin_counters().pin(id);
        Self {
            owner: Some(owner),
            id,
            data,
            alive,
        }
    }

    /// Pin `id` purely as a watermark; the handle carries no data pointer.
    pub(crate) fn watermark(owner: Arc<SectorsArray>, id: SectorId) -> Self {
        debug_assert_ne!(id, INVALID_ID);
        owner.pin_counters().pin(id);
        Self {
            owner: Some(owner),
            id,
            data: std::ptr::null_mut(),
            alive: 0,
        }
    }

    /// The pinned id, or `INVALID_ID` for an empty handle.
    pub fn id(&self) -> SectorId {
        self.id
    }

    /// Alive bits captured when the pin was taken.
    pub fn alive_bits(&self) -> u32 {
        self.alive
    }

    /// The pinned sector's data pointer, if the handle carries one.
    pub fn data_ptr(&self) -> Option<NonNull<u8>> {
        NonNull::new(self.data)
    }

    /// Whether the handle carries a sector data pointer.
    pub fn has_data(&self) -> bool {
        !self.data.is_null()
    }

    /// Whether the handle holds no pin at all.
    pub fn is_empty(&self) -> bool {
        self.owner.is_none()
    }

    /// Shared reference to member `T` of the pinned sector.
    ///
    /// `None` when the handle is empty, the owning array's layout has no
    /// `T`, or the member was not alive when the pin was taken.
    pub fn member<T: Component>(&self) -> Option<&T> {
        let owner = self.owner.as_ref()?;
        let data = NonNull::new(self.data)?;
        let member = owner.layout().member_of::<T>()?;
        if self.alive & member.alive_mask == 0 {
            return None;
        }
        // SAFETY: the pin blocks relocation, destruction, and member
        // overwrite at this id for self's lifetime, so the reference stays
        // valid and unaliased by writers.
        Some(unsafe { &*(data.as_ptr().add(member.offset as usize) as *const T) })
    }

    /// Release the pin early; the handle becomes empty.
    pub fn release(&mut self) {
        if let Some(owner) = self.owner.take() {
            owner.pin_counters().unpin(self.id);
        }
        self.id = INVALID_ID;
        self.data = std::ptr::null_mut();
        self.alive = 0;
    }
}

impl Default for PinnedSector {
    fn default() -> Self {
        Self::empty()
    }
}

impl Drop for PinnedSector {
    fn drop(&mut self) {
        self.release();
    }
}
