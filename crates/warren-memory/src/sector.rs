//! Type-erased operations on raw sector memory.
//!
//! A sector is a fixed-size record: a [`SectorHeader`] followed by member
//! payloads at the offsets a [`SectorLayout`] assigns. The functions here
//! construct, destroy, clone, and relocate members and whole sectors given
//! nothing but a base pointer and the layout — the storage layer dispatches
//! them without knowing member types.
//!
//! All functions are `unsafe`: callers guarantee the pointers designate
//! sector-sized, layout-aligned memory owned by their allocator, and that
//! the header's alive bits truthfully describe which members are live.

use std::ptr::{self, NonNull};

use warren_core::SectorId;

use crate::layout::{MemberLayout, SectorLayout};

/// Header at byte offset 0 of every sector.
///
/// `alive` carries one bit per co-located member (bit `k` set ⇔ member `k`
/// is constructed and live); the sector itself is alive iff `alive != 0`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct SectorHeader {
    /// Sector id; equals the entity id owning this sector.
    pub id: SectorId,
    /// Per-member liveness bitfield.
    pub alive: u32,
}

impl SectorHeader {
    /// Whether any masked member is live.
    pub fn is_alive(&self, mask: u32) -> bool {
        self.alive & mask != 0
    }

    /// Whether any member at all is live.
    pub fn is_sector_alive(&self) -> bool {
        self.alive != 0
    }
}

/// Read the header of the sector at `sector`.
///
/// # Safety
///
/// `sector` must point at readable sector memory with an initialized header.
pub unsafe fn header(sector: *const u8) -> SectorHeader {
    // SAFETY: per the function contract.
    unsafe { (sector as *const SectorHeader).read() }
}

/// Mutable access to the header of the sector at `sector`.
///
/// # Safety
///
/// `sector` must point at writable sector memory; no concurrent access.
pub unsafe fn header_mut<'a>(sector: *mut u8) -> &'a mut SectorHeader {
    // SAFETY: per the function contract.
    unsafe { &mut *(sector as *mut SectorHeader) }
}

/// Pointer to a member payload at `offset` bytes from the sector base.
///
/// # Safety
///
/// `offset` must come from the sector's layout.
pub unsafe fn member_ptr(sector: *mut u8, offset: u32) -> *mut u8 {
    // SAFETY: offset stays within the sector per the layout.
    unsafe { sector.add(offset as usize) }
}

/// Typed member pointer, `None` unless the member's alive bit is set.
///
/// # Safety
///
/// `sector` must be a valid sector laid out with `member`'s layout, and `T`
/// must be the member's type.
pub unsafe fn member_checked<T>(sector: *mut u8, member: &MemberLayout) -> Option<NonNull<T>> {
    // SAFETY: header read per contract.
    let alive = unsafe { header(sector) }.alive;
    if alive & member.alive_mask == 0 {
        return None;
    }
    // SAFETY: offset from the layout.
    NonNull::new(unsafe { member_ptr(sector, member.offset) } as *mut T)
}

/// Construct `value` in place as the given member, replacing a live value.
///
/// Drops the previous value if the member was live, then writes the new one
/// and sets its alive bit.
///
/// # Safety
///
/// `sector` must be valid for `member`'s layout with a truthful header, and
/// `T` must be the member's type. No concurrent access to the sector.
pub unsafe fn emplace_member<T>(sector: *mut u8, member: &MemberLayout, value: T) -> *mut T {
    debug_assert_eq!(member.size as usize, std::mem::size_of::<T>());
    // SAFETY: per the function contract.
    unsafe {
        let slot = member_ptr(sector, member.offset) as *mut T;
        let hdr = header_mut(sector);
        if member.needs_drop && hdr.alive & member.alive_mask != 0 {
            ptr::drop_in_place(slot);
        }
        slot.write(value);
        hdr.alive |= member.alive_mask;
        slot
    }
}

/// Clone a member from `src` into `dst`, replacing a live destination value.
///
/// No-op when the source member is not live.
///
/// # Safety
///
/// Both sectors must be valid for `member`'s layout with truthful headers;
/// `src != dst`. No concurrent access to either sector.
pub unsafe fn clone_member_raw(src: *const u8, dst: *mut u8, member: &MemberLayout) {
    // SAFETY: per the function contract.
    unsafe {
        if header(src).alive & member.alive_mask == 0 {
            return;
        }
        destroy_member(dst, member);
        (member.ops.clone_raw)(
            member_ptr(src as *mut u8, member.offset),
            member_ptr(dst, member.offset),
        );
        header_mut(dst).alive |= member.alive_mask;
    }
}

/// Move a member from `src` into `dst`, replacing a live destination value.
///
/// The source member's alive bit clears; ownership transfers without running
/// drop on the source bytes. No-op when the source member is not live.
///
/// # Safety
///
/// Both sectors must be valid for `member`'s layout with truthful headers;
/// `src != dst`. No concurrent access to either sector.
pub unsafe fn move_member_raw(src: *mut u8, dst: *mut u8, member: &MemberLayout) {
    // SAFETY: per the function contract.
    unsafe {
        if header(src as *const u8).alive & member.alive_mask == 0 {
            return;
        }
        destroy_member(dst, member);
        (member.ops.move_raw)(
            member_ptr(src, member.offset),
            member_ptr(dst, member.offset),
        );
        header_mut(dst).alive |= member.alive_mask;
        header_mut(src).alive &= !member.alive_mask;
    }
}

/// Clone a whole sector: header plus every live member.
///
/// Destroys the destination's live members first.
///
/// # Safety
///
/// Both sectors must be valid for `layout` with truthful headers;
/// `src != dst`. No concurrent access to either sector.
pub unsafe fn clone_sector(src: *const u8, dst: *mut u8, layout: &SectorLayout) {
    // SAFETY: per the function contract.
    unsafe {
        destroy_sector(dst, layout);
        let src_hdr = header(src);
        *header_mut(dst) = SectorHeader {
            id: src_hdr.id,
            alive: 0,
        };
        for member in layout.iter() {
            if src_hdr.alive & member.alive_mask == 0 {
                continue;
            }
            (member.ops.clone_raw)(
                member_ptr(src as *mut u8, member.offset),
                member_ptr(dst, member.offset),
            );
            header_mut(dst).alive |= member.alive_mask;
        }
    }
}

/// Move a whole sector: destroy the destination's live members, relocate the
/// header and payload bitwise, and clear the source's alive bits.
///
/// Ownership of every live member transfers; no drop runs on source bytes.
///
/// # Safety
///
/// Both sectors must be valid for `layout` with truthful headers; the two
/// regions must not overlap. No concurrent access to either sector.
pub unsafe fn move_sector(src: *mut u8, dst: *mut u8, layout: &SectorLayout) {
    debug_assert!(src != dst);
    // SAFETY: per the function contract. Every Rust value relocates
    // bitwise, so one copy of the whole record moves header and all live
    // members at once.
    unsafe {
        destroy_sector(dst, layout);
        ptr::copy_nonoverlapping(src, dst, layout.size() as usize);
        header_mut(src).alive = 0;
    }
}

/// Drop every live member and zero the alive bits.
///
/// The drop loop is skipped wholesale for trivial layouts.
///
/// # Safety
///
/// `sector` must be valid for `layout` with a truthful header. No concurrent
/// access to the sector.
pub unsafe fn destroy_sector(sector: *mut u8, layout: &SectorLayout) {
    // SAFETY: per the function contract.
    unsafe {
        let hdr = header_mut(sector);
        if hdr.alive == 0 {
            return;
        }
        if !layout.is_trivial() {
            for member in layout.iter() {
                if member.needs_drop && hdr.alive & member.alive_mask != 0 {
                    (member.ops.drop_raw)(member_ptr(sector, member.offset));
                }
            }
        }
        hdr.alive = 0;
    }
}

/// Drop one member if live and clear its bit.
///
/// Returns whether the member was live.
///
/// # Safety
///
/// `sector` must be valid for `member`'s layout with a truthful header. No
/// concurrent access to the sector.
pub unsafe fn destroy_member(sector: *mut u8, member: &MemberLayout) -> bool {
    // SAFETY: per the function contract.
    unsafe {
        let hdr = header_mut(sector);
        if hdr.alive & member.alive_mask == 0 {
            return false;
        }
        if member.needs_drop {
            (member.ops.drop_raw)(member_ptr(sector, member.offset));
        }
        hdr.alive &= !member.alive_mask;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::SectorLayoutBuilder;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Component that counts its drops.
    #[derive(Clone)]
    struct Counted {
        value: u32,
        drops: Arc<AtomicUsize>,
    }

    impl Drop for Counted {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn layout() -> SectorLayout {
        SectorLayoutBuilder::new()
            .member::<u64>()
            .member::<Counted>()
            .build()
            .unwrap()
    }

    /// Zeroed, aligned buffer standing in for allocator-owned sector memory.
    fn sector_buf(layout: &SectorLayout) -> Vec<u64> {
        vec![0u64; (layout.size() as usize).div_ceil(8)]
    }

    #[test]
    fn emplace_sets_alive_bit_and_stores_value() {
        let layout = layout();
        let mut buf = sector_buf(&layout);
        let base = buf.as_mut_ptr() as *mut u8;
        let member = layout.member_of::<u64>().unwrap();

        unsafe {
            emplace_member(base, member, 99u64);
            let hdr = header(base);
            assert_eq!(hdr.alive, member.alive_mask);
            let ptr = member_checked::<u64>(base, member).unwrap();
            assert_eq!(*ptr.as_ref(), 99);
        }
    }

    #[test]
    fn member_checked_is_none_when_dead() {
        let layout = layout();
        let mut buf = sector_buf(&layout);
        let base = buf.as_mut_ptr() as *mut u8;
        let member = layout.member_of::<u64>().unwrap();
        unsafe {
            assert!(member_checked::<u64>(base, member).is_none());
        }
    }

    #[test]
    fn emplace_over_live_value_drops_it_once() {
        let layout = layout();
        let mut buf = sector_buf(&layout);
        let base = buf.as_mut_ptr() as *mut u8;
        let member = layout.member_of::<Counted>().unwrap();
        let drops = Arc::new(AtomicUsize::new(0));

        unsafe {
            emplace_member(
                base,
                member,
                Counted {
                    value: 1,
                    drops: Arc::clone(&drops),
                },
            );
            emplace_member(
                base,
                member,
                Counted {
                    value: 2,
                    drops: Arc::clone(&drops),
                },
            );
            assert_eq!(drops.load(Ordering::Relaxed), 1);
            assert_eq!(member_checked::<Counted>(base, member).unwrap().as_ref().value, 2);
            destroy_sector(base, &layout);
        }
        assert_eq!(drops.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn destroy_member_leaves_other_members_live() {
        let layout = layout();
        let mut buf = sector_buf(&layout);
        let base = buf.as_mut_ptr() as *mut u8;
        let ints = layout.member_of::<u64>().unwrap();
        let counted = layout.member_of::<Counted>().unwrap();
        let drops = Arc::new(AtomicUsize::new(0));

        unsafe {
            emplace_member(base, ints, 7u64);
            emplace_member(
                base,
                counted,
                Counted {
                    value: 1,
                    drops: Arc::clone(&drops),
                },
            );

            assert!(destroy_member(base, counted));
            assert_eq!(drops.load(Ordering::Relaxed), 1);
            assert!(!destroy_member(base, counted), "already dead");

            let hdr = header(base);
            assert!(hdr.is_alive(ints.alive_mask));
            assert!(!hdr.is_alive(counted.alive_mask));
            assert!(hdr.is_sector_alive());
        }
    }

    #[test]
    fn move_sector_transfers_ownership_without_dropping() {
        let layout = layout();
        let mut src_buf = sector_buf(&layout);
        let mut dst_buf = sector_buf(&layout);
        let src = src_buf.as_mut_ptr() as *mut u8;
        let dst = dst_buf.as_mut_ptr() as *mut u8;
        let counted = layout.member_of::<Counted>().unwrap();
        let drops = Arc::new(AtomicUsize::new(0));

        unsafe {
            header_mut(src).id = 5;
            emplace_member(
                src,
                counted,
                Counted {
                    value: 11,
                    drops: Arc::clone(&drops),
                },
            );

            move_sector(src, dst, &layout);
            assert_eq!(drops.load(Ordering::Relaxed), 0, "a move must not drop");
            assert_eq!(header(src).alive, 0);
            assert_eq!(header(dst).id, 5);
            assert_eq!(member_checked::<Counted>(dst, counted).unwrap().as_ref().value, 11);

            destroy_sector(dst, &layout);
        }
        assert_eq!(drops.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn clone_sector_copies_live_members_only() {
        let layout = layout();
        let mut src_buf = sector_buf(&layout);
        let mut dst_buf = sector_buf(&layout);
        let src = src_buf.as_mut_ptr() as *mut u8;
        let dst = dst_buf.as_mut_ptr() as *mut u8;
        let ints = layout.member_of::<u64>().unwrap();
        let counted = layout.member_of::<Counted>().unwrap();

        unsafe {
            header_mut(src).id = 3;
            emplace_member(src, ints, 21u64);

            clone_sector(src, dst, &layout);
            assert_eq!(header(dst).id, 3);
            assert_eq!(*member_checked::<u64>(dst, ints).unwrap().as_ref(), 21);
            assert!(member_checked::<Counted>(dst, counted).is_none());

            // Source unchanged.
            assert_eq!(*member_checked::<u64>(src, ints).unwrap().as_ref(), 21);
        }
    }

    #[test]
    fn move_member_clears_source_bit() {
        let layout = layout();
        let mut src_buf = sector_buf(&layout);
        let mut dst_buf = sector_buf(&layout);
        let src = src_buf.as_mut_ptr() as *mut u8;
        let dst = dst_buf.as_mut_ptr() as *mut u8;
        let ints = layout.member_of::<u64>().unwrap();

        unsafe {
            emplace_member(src, ints, 17u64);
            move_member_raw(src, dst, ints);
            assert!(member_checked::<u64>(src, ints).is_none());
            assert_eq!(*member_checked::<u64>(dst, ints).unwrap().as_ref(), 17);
        }
    }
}
