//! User-pointer validation and copy-in/copy-out.
//!
//! Every transfer walks the task's page tables through the physical
//! direct map, so nothing here ever dereferences a user address as a
//! kernel pointer. Validation rejects null, the kernel half, and ranges
//! that wrap the address space.

use alloc::string::String;
use alloc::vec::Vec;

use crate::error::{Errno, Result};
use crate::mm::fault::{handle_user_fault, FaultOutcome};
use crate::mm::paging::{self, PteFlags};
use crate::mm::{phys_to_virt, PAGE_SIZE, USER_SPACE_END};

/// Longest string a syscall will copy in (paths, argv elements).
pub const MAX_USER_STR: usize = 4096;

/// Bounds for argument vectors.
pub const MAX_ARG_COUNT: usize = 64;
pub const MAX_ARG_BYTES: usize = 32 * 1024;

/// Check that `[addr, addr+len)` lies inside the user half and does not
/// wrap. Zero-length ranges pass with any in-range address.
pub fn validate_user_range(addr: u64, len: u64) -> Result<()> {
    if addr == 0 {
        return Err(Errno::EFAULT);
    }
    let end = addr.checked_add(len).ok_or(Errno::EFAULT)?;
    if addr >= USER_SPACE_END || end > USER_SPACE_END {
        return Err(Errno::EFAULT);
    }
    Ok(())
}

fn page_of(va: u64) -> u64 {
    va & !(PAGE_SIZE as u64 - 1)
}

/// Translate one user page for reading.
fn resolve_read(root: u64, va: u64) -> Result<u64> {
    match paging::translate(root, page_of(va)) {
        Some((pa, flags)) if flags.contains(PteFlags::USER) => Ok(pa),
        _ => Err(Errno::EFAULT),
    }
}

/// Translate one user page for writing, breaking copy-on-write sharing
/// the same way a user-mode write fault would.
fn resolve_write(root: u64, va: u64) -> Result<u64> {
    let page = page_of(va);
    match paging::translate(root, page) {
        Some((pa, flags)) if flags.contains(PteFlags::USER) => {
            if flags.contains(PteFlags::WRITABLE) {
                Ok(pa)
            } else if flags.contains(PteFlags::COW) {
                match handle_user_fault(root, page, true) {
                    FaultOutcome::Resolved => match paging::translate(root, page) {
                        Some((pa, _)) => Ok(pa),
                        None => Err(Errno::EFAULT),
                    },
                    FaultOutcome::Violation => Err(Errno::EFAULT),
                }
            } else {
                Err(Errno::EFAULT)
            }
        }
        _ => Err(Errno::EFAULT),
    }
}

/// Copy `buf.len()` bytes from user `va` in the space rooted at `root`.
pub fn copy_from_user_root(root: u64, va: u64, buf: &mut [u8]) -> Result<()> {
    validate_user_range(va, buf.len() as u64)?;
    let mut copied = 0;
    while copied < buf.len() {
        let cur = va + copied as u64;
        let pa = resolve_read(root, cur)?;
        let page_off = (cur % PAGE_SIZE as u64) as usize;
        let chunk = (PAGE_SIZE - page_off).min(buf.len() - copied);
        unsafe {
            core::ptr::copy_nonoverlapping(
                phys_to_virt(pa).add(page_off),
                buf.as_mut_ptr().add(copied),
                chunk,
            );
        }
        copied += chunk;
    }
    Ok(())
}

/// Copy `data` out to user `va` in the space rooted at `root`.
pub fn copy_to_user_root(root: u64, va: u64, data: &[u8]) -> Result<()> {
    validate_user_range(va, data.len() as u64)?;
    let mut copied = 0;
    while copied < data.len() {
        let cur = va + copied as u64;
        let pa = resolve_write(root, cur)?;
        let page_off = (cur % PAGE_SIZE as u64) as usize;
        let chunk = (PAGE_SIZE - page_off).min(data.len() - copied);
        unsafe {
            core::ptr::copy_nonoverlapping(
                data.as_ptr().add(copied),
                phys_to_virt(pa).add(page_off),
                chunk,
            );
        }
        copied += chunk;
    }
    Ok(())
}

/// Copy a NUL-terminated string, bounded by `max` bytes.
pub fn copy_str_from_user(root: u64, va: u64, max: usize) -> Result<String> {
    validate_user_range(va, 1)?;
    let mut bytes = Vec::new();
    let mut cur = va;
    while bytes.len() < max {
        let mut byte = [0u8; 1];
        copy_from_user_root(root, cur, &mut byte)?;
        if byte[0] == 0 {
            return String::from_utf8(bytes).map_err(|_| Errno::EINVAL);
        }
        bytes.push(byte[0]);
        cur = cur.checked_add(1).ok_or(Errno::EFAULT)?;
    }
    Err(Errno::EINVAL)
}

/// Copy a NULL-terminated vector of string pointers, bounded in count and
/// total bytes.
pub fn copy_arg_vector(root: u64, vec_ptr: u64) -> Result<Vec<String>> {
    let mut args = Vec::new();
    if vec_ptr == 0 {
        return Ok(args);
    }
    let mut total = 0usize;
    for i in 0..=MAX_ARG_COUNT {
        if i == MAX_ARG_COUNT {
            return Err(Errno::EINVAL);
        }
        let slot = vec_ptr
            .checked_add(i as u64 * 8)
            .ok_or(Errno::EFAULT)?;
        let mut raw = [0u8; 8];
        copy_from_user_root(root, slot, &mut raw)?;
        let ptr = u64::from_le_bytes(raw);
        if ptr == 0 {
            break;
        }
        let arg = copy_str_from_user(root, ptr, MAX_USER_STR)?;
        total += arg.len() + 1;
        if total > MAX_ARG_BYTES {
            return Err(Errno::EINVAL);
        }
        args.push(arg);
    }
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::{AddressSpace, ProtFlags};

    fn space_with_page(va: u64) -> AddressSpace {
        let mut space = AddressSpace::new_user().unwrap();
        space
            .map_anon_page(va, ProtFlags::READ | ProtFlags::WRITE)
            .unwrap();
        space
    }

    #[test]
    fn validation_rejects_kernel_half_and_wrap() {
        assert!(validate_user_range(0, 8).is_err());
        assert!(validate_user_range(0xFFFF_8000_0000_0000, 8).is_err());
        assert!(validate_user_range(u64::MAX - 4, 16).is_err());
        assert!(validate_user_range(USER_SPACE_END - 8, 16).is_err());
        assert!(validate_user_range(0x1000, 4096).is_ok());
    }

    #[test]
    fn round_trip_through_page_tables() {
        let _g = crate::test_support::kernel_lock();
        crate::test_support::reset_mm();
        let va = 0x4000_0000;
        let space = space_with_page(va);
        copy_to_user_root(space.root(), va + 100, b"payload").unwrap();
        let mut buf = [0u8; 7];
        copy_from_user_root(space.root(), va + 100, &mut buf).unwrap();
        assert_eq!(&buf, b"payload");
    }

    #[test]
    fn crossing_page_boundary() {
        let _g = crate::test_support::kernel_lock();
        crate::test_support::reset_mm();
        let va = 0x4000_0000;
        let mut space = space_with_page(va);
        space
            .map_anon_page(va + PAGE_SIZE as u64, ProtFlags::READ | ProtFlags::WRITE)
            .unwrap();
        let off = va + PAGE_SIZE as u64 - 3;
        copy_to_user_root(space.root(), off, b"abcdef").unwrap();
        let mut buf = [0u8; 6];
        copy_from_user_root(space.root(), off, &mut buf).unwrap();
        assert_eq!(&buf, b"abcdef");
    }

    #[test]
    fn unmapped_page_is_efault() {
        let _g = crate::test_support::kernel_lock();
        crate::test_support::reset_mm();
        let space = AddressSpace::new_user().unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(
            copy_from_user_root(space.root(), 0x1234_0000, &mut buf).err(),
            Some(Errno::EFAULT)
        );
    }

    #[test]
    fn write_through_cow_page_diverges() {
        let _g = crate::test_support::kernel_lock();
        crate::test_support::reset_mm();
        let va = 0x4000_0000;
        let mut parent = space_with_page(va);
        copy_to_user_root(parent.root(), va, b"\xAA").unwrap();
        let child = parent.fork_clone().unwrap();
        // kernel-side write to the child's COW page must not leak into
        // the parent
        copy_to_user_root(child.root(), va, b"\xBB").unwrap();
        let mut p = [0u8; 1];
        let mut c = [0u8; 1];
        copy_from_user_root(parent.root(), va, &mut p).unwrap();
        copy_from_user_root(child.root(), va, &mut c).unwrap();
        assert_eq!(p[0], 0xAA);
        assert_eq!(c[0], 0xBB);
    }

    #[test]
    fn bounded_string_copy() {
        let _g = crate::test_support::kernel_lock();
        crate::test_support::reset_mm();
        let va = 0x4000_0000;
        let space = space_with_page(va);
        copy_to_user_root(space.root(), va, b"/bin/sh\0").unwrap();
        assert_eq!(copy_str_from_user(space.root(), va, 64).unwrap(), "/bin/sh");
        // no terminator within bounds
        copy_to_user_root(space.root(), va, &[b'x'; 16]).unwrap();
        assert!(copy_str_from_user(space.root(), va, 8).is_err());
    }
}
