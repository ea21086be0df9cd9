//! Page-fault resolution.
//!
//! The only fault the runtime resolves itself is a write to a
//! copy-on-write page; everything else in the user half is a protection
//! error answered with SIGSEGV. Kernel-half faults indicate corruption.

use crate::error::KernelError;
use crate::mm::paging::{self, PteFlags};
use crate::mm::phys::{self, PAGE_SIZE};

/// Outcome of a user-mode page fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The mapping was fixed up; retry the faulting instruction.
    Resolved,
    /// Not resolvable; the task gets SIGSEGV.
    Violation,
}

/// Resolve a fault at `va` in the address space rooted at `root`.
/// `write` is the fault's write bit.
pub fn handle_user_fault(root: u64, va: u64, write: bool) -> FaultOutcome {
    if va >= paging::USER_SPACE_END {
        return FaultOutcome::Violation;
    }
    let page = va & !(PAGE_SIZE as u64 - 1);
    let Some((pa, flags)) = paging::translate(root, page) else {
        return FaultOutcome::Violation;
    };
    if write && flags.contains(PteFlags::COW) && !flags.contains(PteFlags::WRITABLE) {
        match resolve_cow(root, page, pa, flags) {
            Ok(()) => FaultOutcome::Resolved,
            Err(e) => {
                crate::error!("cow: resolution at {:#x} failed: {:?}", page, e);
                FaultOutcome::Violation
            }
        }
    } else {
        FaultOutcome::Violation
    }
}

/// Break the sharing of one COW page for a write.
///
/// Sole owner: restore the writable bit in place. Shared: allocate a new
/// frame, copy the contents, retarget the mapping and drop the old
/// reference. Either way the page ends writable and the stale read-only
/// translation is flushed.
fn resolve_cow(root: u64, page: u64, pa: u64, flags: PteFlags) -> Result<(), KernelError> {
    let mut new_flags = flags;
    new_flags.remove(PteFlags::COW);
    new_flags.insert(PteFlags::WRITABLE);

    if phys::frame_refcount(pa) == 1 {
        paging::protect_page(root, page, new_flags)?;
    } else {
        let copy = phys::alloc_frame()?;
        unsafe {
            core::ptr::copy_nonoverlapping(phys::phys_to_virt(pa), phys::phys_to_virt(copy), PAGE_SIZE);
        }
        paging::unmap_page(root, page).ok_or(KernelError::NotFound)?;
        paging::map_page(root, page, copy, new_flags)?;
        phys::free_frame(pa);
    }
    crate::arch::flush_tlb_page(page);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::paging::map_page;

    fn write_byte(pa: u64, offset: usize, value: u8) {
        unsafe { *phys::phys_to_virt(pa).add(offset) = value }
    }

    fn read_byte(pa: u64, offset: usize) -> u8 {
        unsafe { *phys::phys_to_virt(pa).add(offset) }
    }

    #[test]
    fn cow_write_diverges_copies() {
        let _g = crate::test_support::kernel_lock();
        crate::test_support::reset_mm();
        let kroot = crate::mm::kernel_root();
        let parent = paging::new_user_root(kroot).unwrap();
        let child = paging::new_user_root(kroot).unwrap();
        let va = 0x4000_0000;
        let frame = phys::alloc_frame().unwrap();
        write_byte(frame, 0, 0xAA);
        map_page(parent, va, frame, PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER)
            .unwrap();
        paging::clone_user_cow(parent, child, &[]).unwrap();

        // child writes: gets a private copy, parent untouched
        assert_eq!(handle_user_fault(child, va, true), FaultOutcome::Resolved);
        let (cpa, cflags) = paging::translate(child, va).unwrap();
        assert!(cflags.contains(PteFlags::WRITABLE));
        write_byte(cpa, 0, 0xBB);

        let (ppa, _) = paging::translate(parent, va).unwrap();
        assert_ne!(cpa, ppa);
        assert_eq!(read_byte(ppa, 0), 0xAA);
        assert_eq!(read_byte(cpa, 0), 0xBB);

        // parent is now sole owner; its write restores the bit in place
        assert_eq!(handle_user_fault(parent, va, true), FaultOutcome::Resolved);
        let (ppa2, pflags) = paging::translate(parent, va).unwrap();
        assert_eq!(ppa2, ppa);
        assert!(pflags.contains(PteFlags::WRITABLE));
    }

    #[test]
    fn unmapped_and_kernel_half_faults_are_violations() {
        let _g = crate::test_support::kernel_lock();
        crate::test_support::reset_mm();
        let root = paging::new_user_root(crate::mm::kernel_root()).unwrap();
        assert_eq!(handle_user_fault(root, 0x1234_5000, true), FaultOutcome::Violation);
        assert_eq!(
            handle_user_fault(root, 0xFFFF_8000_0000_0000, false),
            FaultOutcome::Violation
        );
    }

    #[test]
    fn read_only_mapping_write_is_violation() {
        let _g = crate::test_support::kernel_lock();
        crate::test_support::reset_mm();
        let root = paging::new_user_root(crate::mm::kernel_root()).unwrap();
        let frame = phys::alloc_frame().unwrap();
        let va = 0x4000_0000;
        map_page(root, va, frame, PteFlags::PRESENT | PteFlags::USER).unwrap();
        assert_eq!(handle_user_fault(root, va, true), FaultOutcome::Violation);
    }
}
