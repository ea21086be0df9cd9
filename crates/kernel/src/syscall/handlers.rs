//! Syscall handlers.
//!
//! Each handler validates its user pointers and returns a `Result<u64>`;
//! the dispatcher negates errnos into the result register and never
//! wraps or translates beyond that.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use crate::error::{Errno, KernelError, Result};
use crate::ipc::Pipe;
use crate::mm::address_space::{page_align_up, MapFlags, MmapRegion, ProtFlags};
use crate::mm::{AddressSpace, PAGE_SIZE};
use crate::process::fd::{ConsoleEnd, FdEntry};
use crate::process::scheduler::{self, WakeReason};
use crate::process::signal::{self, Disposition, SigAction, Signal};
use crate::process::task::{Pid, Task};
use crate::process::{table, wait};
use crate::sync::IrqGuard;
use crate::syscall::uaccess::{
    copy_arg_vector, copy_from_user_root, copy_str_from_user, copy_to_user_root,
    validate_user_range, MAX_USER_STR,
};
use crate::vfs::{self, FileRef};

/// Longest single transfer serviced per read/write call; callers loop.
const IO_CHUNK: usize = 16 * 1024;

/// Disposition encodings in the userspace sigaction struct.
const SIG_DFL: u64 = 0;
const SIG_IGN: u64 = 1;

const SIG_BLOCK: u32 = 0;
const SIG_UNBLOCK: u32 = 1;
const SIG_SETMASK: u32 = 2;

fn with_current<R>(f: impl FnOnce(&mut Task) -> Result<R>) -> Result<R> {
    let _irq = IrqGuard::new();
    let mut guard = table::lock();
    let tasks = guard.as_mut().ok_or(Errno::ESRCH)?;
    let pid = scheduler::current_pid().ok_or(Errno::ESRCH)?;
    let task = tasks.get_mut(pid).ok_or(Errno::ESRCH)?;
    f(task)
}

fn current_root() -> Result<u64> {
    with_current(|task| Ok(task.effective_root()))
}

/// Owned handle for I/O outside the scheduler lock.
enum IoTarget {
    Console(ConsoleEnd),
    PipeRead(Arc<Pipe>),
    PipeWrite(Arc<Pipe>),
    File(FileRef),
}

fn io_target(fd: i32) -> Result<IoTarget> {
    with_current(|task| {
        Ok(match task.files.get(fd)? {
            FdEntry::Console(end) => IoTarget::Console(*end),
            FdEntry::PipeReader(pipe) => IoTarget::PipeRead(pipe.clone()),
            FdEntry::PipeWriter(pipe) => IoTarget::PipeWrite(pipe.clone()),
            FdEntry::File(file) => IoTarget::File(file.clone()),
        })
    })
}

pub fn sys_read(fd: i32, buf: u64, count: u64) -> Result<u64> {
    if count == 0 {
        return Ok(0);
    }
    validate_user_range(buf, count)?;
    let root = current_root()?;
    let chunk = (count as usize).min(IO_CHUNK);
    let mut bounce = vec![0u8; chunk];
    let n = match io_target(fd)? {
        IoTarget::Console(end) => {
            if !end.readable() {
                return Err(Errno::EBADF);
            }
            crate::console::read_bytes(&mut bounce)
        }
        IoTarget::PipeRead(pipe) => pipe.read(&mut bounce, false)?,
        IoTarget::PipeWrite(_) => return Err(Errno::EBADF),
        IoTarget::File(file) => file.read(&mut bounce)?,
    };
    copy_to_user_root(root, buf, &bounce[..n])?;
    Ok(n as u64)
}

pub fn sys_write(fd: i32, buf: u64, count: u64) -> Result<u64> {
    if count == 0 {
        return Ok(0);
    }
    validate_user_range(buf, count)?;
    let root = current_root()?;
    let chunk = (count as usize).min(IO_CHUNK);
    let mut bounce = vec![0u8; chunk];
    copy_from_user_root(root, buf, &mut bounce)?;
    let n = match io_target(fd)? {
        IoTarget::Console(end) => {
            if !end.writable() {
                return Err(Errno::EBADF);
            }
            crate::console::write_bytes(&bounce);
            bounce.len()
        }
        IoTarget::PipeRead(_) => return Err(Errno::EBADF),
        IoTarget::PipeWrite(pipe) => pipe.write(&bounce, false)?,
        IoTarget::File(file) => file.write(&bounce)?,
    };
    Ok(n as u64)
}

pub fn sys_open(path_ptr: u64, flags: u32, mode: u32) -> Result<u64> {
    if path_ptr == 0 {
        return Err(Errno::EINVAL);
    }
    let root = current_root()?;
    let path = copy_str_from_user(root, path_ptr, MAX_USER_STR)?;
    if path.is_empty() {
        return Err(Errno::EINVAL);
    }
    let file = vfs::open(&path, flags, mode)?;
    with_current(|task| task.files.alloc(FdEntry::File(file)).map(|fd| fd as u64))
}

pub fn sys_close(fd: i32) -> Result<u64> {
    with_current(|task| task.files.close(fd).map(|_| 0))
}

pub fn sys_lseek(fd: i32, offset: i64, whence: u32) -> Result<u64> {
    match io_target(fd)? {
        IoTarget::File(file) => file.lseek(offset, whence),
        _ => Err(Errno::ESPIPE),
    }
}

pub fn sys_dup(fd: i32) -> Result<u64> {
    with_current(|task| task.files.dup(fd).map(|fd| fd as u64))
}

pub fn sys_dup2(oldfd: i32, newfd: i32) -> Result<u64> {
    with_current(|task| task.files.dup2(oldfd, newfd).map(|fd| fd as u64))
}

pub fn sys_pipe(fds_ptr: u64) -> Result<u64> {
    validate_user_range(fds_ptr, 8)?;
    let root = current_root()?;
    let pipe = Arc::new(Pipe::new());
    let (rfd, wfd) = with_current(|task| {
        let rfd = task.files.alloc(FdEntry::PipeReader(pipe.clone()))?;
        let wfd = match task.files.alloc(FdEntry::PipeWriter(pipe.clone())) {
            Ok(fd) => fd,
            Err(e) => {
                let _ = task.files.close(rfd);
                return Err(e);
            }
        };
        Ok((rfd, wfd))
    })?;
    let mut out = [0u8; 8];
    out[..4].copy_from_slice(&rfd.to_le_bytes());
    out[4..].copy_from_slice(&wfd.to_le_bytes());
    if let Err(e) = copy_to_user_root(root, fds_ptr, &out) {
        let _ = with_current(|task| {
            let _ = task.files.close(rfd);
            let _ = task.files.close(wfd);
            Ok(0u64)
        });
        return Err(e);
    }
    Ok(0)
}

pub fn sys_brk(new_break: u64) -> Result<u64> {
    with_current(|task| match task.aspace.as_mut() {
        Some(aspace) => Ok(aspace.brk_to(new_break)),
        None => Ok(0),
    })
}

/// Unwinds a partially built mapping: pages mapped so far, the recorded
/// region, and the cursor all roll back together when the transaction is
/// dropped without being committed.
struct MapTransaction<'a> {
    aspace: &'a mut AddressSpace,
    base: u64,
    len: u64,
    mapped: u64,
    saved_cursor: u64,
    committed: bool,
}

impl<'a> MapTransaction<'a> {
    fn begin(aspace: &'a mut AddressSpace, region: MmapRegion) -> core::result::Result<Self, KernelError> {
        let saved_cursor = aspace.mmap_cursor;
        let (base, len) = (region.start, region.len);
        aspace.insert_region(region)?;
        Ok(Self {
            aspace,
            base,
            len,
            mapped: 0,
            saved_cursor,
            committed: false,
        })
    }

    fn map_next_page(&mut self, prot: ProtFlags) -> core::result::Result<(), KernelError> {
        let va = self.base + self.mapped * PAGE_SIZE as u64;
        self.aspace.map_anon_page(va, prot)?;
        self.mapped += 1;
        Ok(())
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl<'a> Drop for MapTransaction<'a> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        for i in 0..self.mapped {
            self.aspace.unmap_user_page(self.base + i * PAGE_SIZE as u64);
        }
        let _ = self.aspace.take_region(self.base, self.len);
        self.aspace.mmap_cursor = self.saved_cursor;
    }
}

pub fn sys_mmap(addr: u64, len: u64, prot: u32, flags: u32, fd: i32, offset: u64) -> Result<u64> {
    if len == 0 {
        return Err(Errno::EINVAL);
    }
    let prot = ProtFlags::from_bits_truncate(prot);
    let flags = MapFlags::from_bits_truncate(flags);
    let len = page_align_up(len);
    let anonymous = flags.contains(MapFlags::ANONYMOUS);
    if !anonymous && fd < 0 {
        return Err(Errno::EINVAL);
    }

    // File-backed mappings pre-populate at map time; grab the source
    // before taking the scheduler lock.
    let file = if anonymous {
        None
    } else {
        match io_target(fd).map_err(|_| Errno::EINVAL)? {
            IoTarget::File(file) => Some(file),
            _ => return Err(Errno::EINVAL),
        }
    };

    let _irq = IrqGuard::new();
    let mut guard = table::lock();
    let tasks = guard.as_mut().ok_or(Errno::EINVAL)?;
    let pid = scheduler::current_pid().ok_or(Errno::EINVAL)?;
    let task = tasks.get_mut(pid).ok_or(Errno::EINVAL)?;
    let aspace = task.aspace.as_mut().ok_or(Errno::EINVAL)?;

    let base = if flags.contains(MapFlags::FIXED) {
        if addr == 0 || addr % PAGE_SIZE as u64 != 0 {
            return Err(Errno::EINVAL);
        }
        addr
    } else {
        aspace.find_mmap_base(len).ok_or(Errno::ENOMEM)?
    };

    let region = MmapRegion {
        start: base,
        len,
        prot,
        flags,
        fd: if anonymous { -1 } else { fd },
        offset,
        used: true,
    };

    let mut tx = MapTransaction::begin(aspace, region).map_err(map_errno)?;
    for _ in 0..len / PAGE_SIZE as u64 {
        tx.map_next_page(prot).map_err(map_errno)?;
    }

    if let Some(file) = file {
        file.lseek(offset as i64, vfs::SEEK_SET)
            .map_err(|_| Errno::EINVAL)?;
        let mut filled = 0u64;
        let mut bounce = vec![0u8; PAGE_SIZE];
        while filled < len {
            let n = file.read(&mut bounce).map_err(|_| Errno::EINVAL)?;
            if n == 0 {
                break;
            }
            let n = n.min((len - filled) as usize);
            write_into_space(tx.aspace, base + filled, &bounce[..n])?;
            filled += n as u64;
        }
    }

    let fixed = flags.contains(MapFlags::FIXED);
    if !fixed {
        tx.aspace.mmap_cursor = base;
    }
    tx.commit();
    Ok(base)
}

/// Write into a freshly mapped range through its page tables, bypassing
/// protection (pre-population may target read-only mappings).
fn write_into_space(aspace: &AddressSpace, va: u64, data: &[u8]) -> Result<()> {
    let mut done = 0;
    while done < data.len() {
        let cur = va + done as u64;
        let (pa, _) = aspace.translate(cur & !(PAGE_SIZE as u64 - 1)).ok_or(Errno::EINVAL)?;
        let off = (cur % PAGE_SIZE as u64) as usize;
        let chunk = (PAGE_SIZE - off).min(data.len() - done);
        unsafe {
            core::ptr::copy_nonoverlapping(
                data.as_ptr().add(done),
                crate::mm::phys_to_virt(pa).add(off),
                chunk,
            );
        }
        done += chunk;
    }
    Ok(())
}

/// The mmap error surface is EINVAL or ENOMEM only.
fn map_errno(err: KernelError) -> Errno {
    match err {
        KernelError::OutOfMemory => Errno::ENOMEM,
        _ => Errno::EINVAL,
    }
}

pub fn sys_munmap(addr: u64, len: u64) -> Result<u64> {
    if len == 0 || addr % PAGE_SIZE as u64 != 0 {
        return Err(Errno::EINVAL);
    }
    with_current(|task| {
        let aspace = task.aspace.as_mut().ok_or(Errno::EINVAL)?;
        let region = aspace.take_region(addr, len).map_err(|_| Errno::EINVAL)?;
        for i in 0..region.len / PAGE_SIZE as u64 {
            aspace.unmap_user_page(region.start + i * PAGE_SIZE as u64);
        }
        Ok(0)
    })
}

pub fn sys_getpid() -> Result<u64> {
    scheduler::current_pid()
        .map(|pid| pid as u64)
        .ok_or(Errno::ESRCH)
}

pub fn sys_getppid() -> Result<u64> {
    with_current(|task| Ok(task.parent.unwrap_or(0) as u64))
}

pub fn sys_yield() -> Result<u64> {
    scheduler::yield_now();
    Ok(0)
}

pub fn sys_exit(code: i32) -> Result<u64> {
    wait::do_exit(code)
}

pub fn sys_wait4(select: i64, status_ptr: u64, options: i32) -> Result<u64> {
    if status_ptr != 0 {
        validate_user_range(status_ptr, 4)?;
    }
    let (child, status) = wait::do_wait4(select, options)?;
    if child != 0 && status_ptr != 0 {
        let root = current_root()?;
        copy_to_user_root(root, status_ptr, &status.to_le_bytes())?;
    }
    Ok(child as u64)
}

pub fn sys_execve(path_ptr: u64, argv_ptr: u64, envp_ptr: u64) -> Result<u64> {
    if path_ptr == 0 {
        return Err(Errno::EINVAL);
    }
    let root = current_root()?;
    let path = copy_str_from_user(root, path_ptr, MAX_USER_STR)?;
    if path.is_empty() {
        return Err(Errno::EINVAL);
    }
    let argv = copy_arg_vector(root, argv_ptr)?;
    let envp = copy_arg_vector(root, envp_ptr)?;
    crate::process::exec::do_execve(path, argv, envp)?;
    Ok(0)
}

pub fn sys_kill(pid: i64, signo: u32) -> Result<u64> {
    if pid <= 0 {
        // Process groups are outside this kernel's scope.
        return Err(Errno::EINVAL);
    }
    let target = pid as Pid;
    let _irq = IrqGuard::new();
    let mut guard = table::lock();
    let tasks = guard.as_mut().ok_or(Errno::ESRCH)?;
    if signo == 0 {
        return match tasks.get(target) {
            Some(t) if !t.has_exited => Ok(0),
            _ => Err(Errno::ESRCH),
        };
    }
    let sig = Signal::from_u32(signo).ok_or(Errno::EINVAL)?;
    let me = scheduler::current_pid().unwrap_or(0);
    signal::send_signal_locked(tasks, target, sig, me)?;
    Ok(0)
}

pub fn sys_sigaction(signo: u32, new_ptr: u64, old_ptr: u64) -> Result<u64> {
    let sig = Signal::from_u32(signo).ok_or(Errno::EINVAL)?;
    let root = current_root()?;
    with_current(|task| {
        if old_ptr != 0 {
            let old = task.signals.action(sig);
            let handler = match old.disposition {
                Disposition::Default => SIG_DFL,
                Disposition::Ignore => SIG_IGN,
                Disposition::Handler(addr) => addr,
            };
            let mut out = [0u8; 24];
            out[..8].copy_from_slice(&handler.to_le_bytes());
            out[8..16].copy_from_slice(&old.mask.to_le_bytes());
            out[16..].copy_from_slice(&(old.flags as u64).to_le_bytes());
            copy_to_user_root(root, old_ptr, &out)?;
        }
        if new_ptr != 0 {
            let mut raw = [0u8; 24];
            copy_from_user_root(root, new_ptr, &mut raw)?;
            let handler = u64::from_le_bytes(raw[..8].try_into().unwrap());
            let mask = u64::from_le_bytes(raw[8..16].try_into().unwrap());
            let flags = u64::from_le_bytes(raw[16..].try_into().unwrap()) as u32;
            let disposition = match handler {
                SIG_DFL => Disposition::Default,
                SIG_IGN => Disposition::Ignore,
                addr => Disposition::Handler(addr),
            };
            task.signals.set_action(
                sig,
                SigAction {
                    disposition,
                    mask,
                    flags,
                },
            )?;
        }
        Ok(0)
    })
}

pub fn sys_sigprocmask(how: u32, set_ptr: u64, old_ptr: u64) -> Result<u64> {
    let root = current_root()?;
    with_current(|task| {
        if old_ptr != 0 {
            copy_to_user_root(root, old_ptr, &task.signals.blocked_mask().to_le_bytes())?;
        }
        if set_ptr != 0 {
            let mut raw = [0u8; 8];
            copy_from_user_root(root, set_ptr, &mut raw)?;
            let set = u64::from_le_bytes(raw);
            let blocked = task.signals.blocked_mask();
            let new = match how {
                SIG_BLOCK => blocked | set,
                SIG_UNBLOCK => blocked & !set,
                SIG_SETMASK => set,
                _ => return Err(Errno::EINVAL),
            };
            task.signals.set_blocked_mask(new);
        }
        Ok(0)
    })
}

pub fn sys_nanosleep(req_ptr: u64, rem_ptr: u64) -> Result<u64> {
    if req_ptr == 0 {
        return Err(Errno::EINVAL);
    }
    let root = current_root()?;
    let mut raw = [0u8; 16];
    copy_from_user_root(root, req_ptr, &mut raw)?;
    let sec = i64::from_le_bytes(raw[..8].try_into().unwrap());
    let nsec = i64::from_le_bytes(raw[8..].try_into().unwrap());
    if sec < 0 || !(0..1_000_000_000).contains(&nsec) {
        return Err(Errno::EINVAL);
    }
    let hz = crate::config::tick_hz() as u64;
    let ticks = (sec as u64).saturating_mul(hz) + crate::time::ms_to_ticks(nsec as u64 / 1_000_000);
    if ticks == 0 {
        scheduler::yield_now();
        return Ok(0);
    }
    let pid = scheduler::current_pid().ok_or(Errno::ESRCH)?;
    let deadline = crate::time::ticks() + ticks;
    let channel = 0x534C_0000_0000usize + pid as usize;
    match scheduler::sleep_on(channel, Some(deadline)) {
        WakeReason::Signal => {
            if rem_ptr != 0 {
                let remaining = deadline.saturating_sub(crate::time::ticks());
                let mut out = [0u8; 16];
                out[..8].copy_from_slice(&((remaining / hz) as i64).to_le_bytes());
                out[8..].copy_from_slice(
                    &((remaining % hz * 1_000_000_000 / hz) as i64).to_le_bytes(),
                );
                let _ = copy_to_user_root(root, rem_ptr, &out);
            }
            Err(Errno::EINTR)
        }
        _ => Ok(0),
    }
}

pub fn sys_alarm(seconds: u32) -> Result<u64> {
    let hz = crate::config::tick_hz() as u64;
    let now = crate::time::ticks();
    with_current(|task| {
        let previous = task
            .signals
            .alarm_deadline
            .map(|d| (d.saturating_sub(now) + hz - 1) / hz)
            .unwrap_or(0);
        task.signals.alarm_deadline = if seconds == 0 {
            None
        } else {
            Some(now + seconds as u64 * hz)
        };
        Ok(previous)
    })
}
