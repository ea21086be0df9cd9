//! Four-level page-table construction and walking.
//!
//! Tables are manipulated in software through the physical direct map, so
//! the same walkers serve the running kernel and the test harness. The
//! hardware only ever sees a root via the address-space switch.

use bitflags::bitflags;

use crate::error::KernelError;
use crate::mm::phys::{self, PAGE_SIZE};

bitflags! {
    /// Page-table entry flags. COW lives in an ignored bit; the hardware
    /// treats such a page as read-only and the fault handler resolves the
    /// write.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        const HUGE = 1 << 7;
        const GLOBAL = 1 << 8;
        const COW = 1 << 9;
        const NO_EXECUTE = 1 << 63;
    }
}

const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;
const ENTRIES: usize = 512;

/// Exclusive end of the user half of the canonical address space.
pub const USER_SPACE_END: u64 = 0x0000_8000_0000_0000;

/// PML4 slots covering the user half.
const USER_PML4_SLOTS: usize = 256;

#[inline]
fn table<'a>(pa: u64) -> &'a mut [u64; ENTRIES] {
    unsafe { &mut *(phys::phys_to_virt(pa) as *mut [u64; ENTRIES]) }
}

#[inline]
fn level_index(va: u64, level: usize) -> usize {
    ((va >> (12 + 9 * level)) & 0x1FF) as usize
}

#[inline]
fn entry_addr(entry: u64) -> u64 {
    entry & ADDR_MASK
}

/// Allocate a root for a user address space, sharing the kernel half with
/// `kernel_root` by aliasing its upper PML4 slots.
pub fn new_user_root(kernel_root: u64) -> Result<u64, KernelError> {
    let root = phys::alloc_frame()?;
    let src = table(kernel_root);
    let dst = table(root);
    for i in USER_PML4_SLOTS..ENTRIES {
        dst[i] = src[i];
    }
    Ok(root)
}

/// Map one 4 KiB page. Fails if `va` is already mapped.
pub fn map_page(root: u64, va: u64, pa: u64, flags: PteFlags) -> Result<(), KernelError> {
    if va % PAGE_SIZE as u64 != 0 || pa % PAGE_SIZE as u64 != 0 {
        return Err(KernelError::InvalidArgument);
    }
    let mut current = root;
    for level in (1..=3).rev() {
        let idx = level_index(va, level);
        let entry = table(current)[idx];
        if entry & PteFlags::PRESENT.bits() == 0 {
            let next = phys::alloc_frame()?;
            table(current)[idx] =
                next | (PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER).bits();
            current = next;
        } else {
            current = entry_addr(entry);
        }
    }
    let leaf = &mut table(current)[level_index(va, 0)];
    if *leaf & PteFlags::PRESENT.bits() != 0 {
        return Err(KernelError::InvalidArgument);
    }
    *leaf = pa | flags.bits();
    Ok(())
}

/// Remove a leaf mapping, returning its frame and flags. The caller owns
/// the frame-release decision.
pub fn unmap_page(root: u64, va: u64) -> Option<(u64, PteFlags)> {
    let mut current = root;
    for level in (1..=3).rev() {
        let entry = table(current)[level_index(va, level)];
        if entry & PteFlags::PRESENT.bits() == 0 {
            return None;
        }
        current = entry_addr(entry);
    }
    let leaf = &mut table(current)[level_index(va, 0)];
    if *leaf & PteFlags::PRESENT.bits() == 0 {
        return None;
    }
    let pa = entry_addr(*leaf);
    let flags = PteFlags::from_bits_truncate(*leaf);
    *leaf = 0;
    Some((pa, flags))
}

/// Resolve a virtual address to its frame and flags.
pub fn translate(root: u64, va: u64) -> Option<(u64, PteFlags)> {
    let mut current = root;
    for level in (1..=3).rev() {
        let entry = table(current)[level_index(va, level)];
        if entry & PteFlags::PRESENT.bits() == 0 {
            return None;
        }
        current = entry_addr(entry);
    }
    let leaf = table(current)[level_index(va, 0)];
    if leaf & PteFlags::PRESENT.bits() == 0 {
        return None;
    }
    Some((entry_addr(leaf), PteFlags::from_bits_truncate(leaf)))
}

/// Rewrite the flags of an existing leaf mapping.
pub fn protect_page(root: u64, va: u64, flags: PteFlags) -> Result<(), KernelError> {
    let mut current = root;
    for level in (1..=3).rev() {
        let entry = table(current)[level_index(va, level)];
        if entry & PteFlags::PRESENT.bits() == 0 {
            return Err(KernelError::NotFound);
        }
        current = entry_addr(entry);
    }
    let leaf = &mut table(current)[level_index(va, 0)];
    if *leaf & PteFlags::PRESENT.bits() == 0 {
        return Err(KernelError::NotFound);
    }
    *leaf = entry_addr(*leaf) | flags.bits();
    Ok(())
}

/// Clone the user half of `src_root` into `dst_root` for fork.
///
/// Pages inside one of `shared` (page-aligned start/end) ranges stay
/// genuinely shared: same frame, original flags, extra reference.
/// Everything else becomes copy-on-write in BOTH roots: writable cleared,
/// COW set, frame retained. The caller flushes the TLB afterwards because
/// the source root just lost write permissions.
pub fn clone_user_cow(
    src_root: u64,
    dst_root: u64,
    shared: &[(u64, u64)],
) -> Result<(), KernelError> {
    walk_user_leaves(src_root, &mut |va, leaf| {
        let pa = entry_addr(*leaf);
        let mut flags = PteFlags::from_bits_truncate(*leaf);
        let in_shared = shared.iter().any(|&(s, e)| va >= s && va < e);
        if !in_shared && flags.contains(PteFlags::WRITABLE) {
            flags.remove(PteFlags::WRITABLE);
            flags.insert(PteFlags::COW);
            *leaf = pa | flags.bits();
        }
        phys::retain_frame(pa);
        map_page(dst_root, va, pa, flags)?;
        Ok(())
    })
}

/// Tear down the user half of a root: release every leaf frame reference
/// and free the intermediate tables. The root frame itself survives.
pub fn free_user_half(root: u64) {
    let pml4 = table(root);
    for i4 in 0..USER_PML4_SLOTS {
        let e4 = pml4[i4];
        if e4 & PteFlags::PRESENT.bits() == 0 {
            continue;
        }
        let pdpt_pa = entry_addr(e4);
        let pdpt = table(pdpt_pa);
        for i3 in 0..ENTRIES {
            let e3 = pdpt[i3];
            if e3 & PteFlags::PRESENT.bits() == 0 {
                continue;
            }
            let pd_pa = entry_addr(e3);
            let pd = table(pd_pa);
            for i2 in 0..ENTRIES {
                let e2 = pd[i2];
                if e2 & PteFlags::PRESENT.bits() == 0 {
                    continue;
                }
                let pt_pa = entry_addr(e2);
                let pt = table(pt_pa);
                for leaf in pt.iter_mut() {
                    if *leaf & PteFlags::PRESENT.bits() != 0 {
                        phys::free_frame(entry_addr(*leaf));
                        *leaf = 0;
                    }
                }
                phys::free_frame(pt_pa);
                pd[i2] = 0;
            }
            phys::free_frame(pd_pa);
            pdpt[i3] = 0;
        }
        phys::free_frame(pdpt_pa);
        pml4[i4] = 0;
    }
}

fn walk_user_leaves(
    root: u64,
    f: &mut impl FnMut(u64, &mut u64) -> Result<(), KernelError>,
) -> Result<(), KernelError> {
    let pml4 = table(root);
    for i4 in 0..USER_PML4_SLOTS {
        let e4 = pml4[i4];
        if e4 & PteFlags::PRESENT.bits() == 0 {
            continue;
        }
        let pdpt = table(entry_addr(e4));
        for i3 in 0..ENTRIES {
            let e3 = pdpt[i3];
            if e3 & PteFlags::PRESENT.bits() == 0 {
                continue;
            }
            let pd = table(entry_addr(e3));
            for i2 in 0..ENTRIES {
                let e2 = pd[i2];
                if e2 & PteFlags::PRESENT.bits() == 0 {
                    continue;
                }
                let pt = table(entry_addr(e2));
                for i1 in 0..ENTRIES {
                    let leaf = &mut pt[i1];
                    if *leaf & PteFlags::PRESENT.bits() == 0 {
                        continue;
                    }
                    let va = ((i4 as u64) << 39)
                        | ((i3 as u64) << 30)
                        | ((i2 as u64) << 21)
                        | ((i1 as u64) << 12);
                    f(va, leaf)?;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_translate_unmap() {
        let _g = crate::test_support::kernel_lock();
        crate::test_support::reset_mm();
        let root = new_user_root(crate::mm::kernel_root()).unwrap();
        let frame = phys::alloc_frame().unwrap();
        let va = 0x4000_0000;
        map_page(root, va, frame, PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER)
            .unwrap();
        let (pa, flags) = translate(root, va).unwrap();
        assert_eq!(pa, frame);
        assert!(flags.contains(PteFlags::WRITABLE));
        assert!(translate(root, va + 0x1000).is_none());
        let (pa2, _) = unmap_page(root, va).unwrap();
        assert_eq!(pa2, frame);
        assert!(translate(root, va).is_none());
        phys::free_frame(frame);
    }

    #[test]
    fn double_map_rejected() {
        let _g = crate::test_support::kernel_lock();
        crate::test_support::reset_mm();
        let root = new_user_root(crate::mm::kernel_root()).unwrap();
        let frame = phys::alloc_frame().unwrap();
        let va = 0x4000_0000;
        map_page(root, va, frame, PteFlags::PRESENT | PteFlags::USER).unwrap();
        assert_eq!(
            map_page(root, va, frame, PteFlags::PRESENT | PteFlags::USER),
            Err(KernelError::InvalidArgument)
        );
    }

    #[test]
    fn cow_clone_clears_write_in_both_roots() {
        let _g = crate::test_support::kernel_lock();
        crate::test_support::reset_mm();
        let kroot = crate::mm::kernel_root();
        let src = new_user_root(kroot).unwrap();
        let dst = new_user_root(kroot).unwrap();
        let frame = phys::alloc_frame().unwrap();
        let va = 0x4000_0000;
        map_page(src, va, frame, PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER)
            .unwrap();
        clone_user_cow(src, dst, &[]).unwrap();

        let (spa, sflags) = translate(src, va).unwrap();
        let (dpa, dflags) = translate(dst, va).unwrap();
        assert_eq!(spa, dpa);
        assert!(!sflags.contains(PteFlags::WRITABLE) && sflags.contains(PteFlags::COW));
        assert!(!dflags.contains(PteFlags::WRITABLE) && dflags.contains(PteFlags::COW));
        assert_eq!(phys::frame_refcount(spa), 2);
    }

    #[test]
    fn shared_ranges_stay_writable() {
        let _g = crate::test_support::kernel_lock();
        crate::test_support::reset_mm();
        let kroot = crate::mm::kernel_root();
        let src = new_user_root(kroot).unwrap();
        let dst = new_user_root(kroot).unwrap();
        let frame = phys::alloc_frame().unwrap();
        let va = 0x5000_0000;
        map_page(src, va, frame, PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER)
            .unwrap();
        clone_user_cow(src, dst, &[(va, va + 0x1000)]).unwrap();

        let (_, sflags) = translate(src, va).unwrap();
        let (dpa, dflags) = translate(dst, va).unwrap();
        assert!(sflags.contains(PteFlags::WRITABLE));
        assert!(dflags.contains(PteFlags::WRITABLE));
        assert_eq!(dpa, frame);
        assert_eq!(phys::frame_refcount(frame), 2);
    }
}
