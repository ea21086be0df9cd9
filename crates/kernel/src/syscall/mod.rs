//! System-call dispatch.
//!
//! The entry stub saves the user register block as a [`TrapFrame`] and
//! calls [`handle_syscall`]. The saved user context is stored in the task
//! (not a global) before dispatch, so signal delivery stays reentrant
//! across CPUs and interleaved syscalls; the context is written back into
//! the frame afterwards, which is also how execve and handler entry
//! redirect the return to user mode.

pub mod handlers;
pub mod uaccess;

use crate::error::Errno;
use crate::interrupts::TrapFrame;
use crate::process::signal::{self, Delivered};
use crate::process::{scheduler, table};
use crate::sync::IrqGuard;

/// Stable syscall numbers (x86_64 convention).
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallNumber {
    Read = 0,
    Write = 1,
    Open = 2,
    Close = 3,
    Lseek = 8,
    Mmap = 9,
    Munmap = 11,
    Brk = 12,
    RtSigaction = 13,
    RtSigprocmask = 14,
    RtSigreturn = 15,
    Pipe = 22,
    SchedYield = 24,
    Dup = 32,
    Dup2 = 33,
    Nanosleep = 35,
    Alarm = 37,
    Getpid = 39,
    Fork = 57,
    Execve = 59,
    Exit = 60,
    Wait4 = 61,
    Kill = 62,
    Getppid = 110,
    Invalid = u64::MAX,
}

impl From<u64> for SyscallNumber {
    fn from(num: u64) -> Self {
        match num {
            0 => SyscallNumber::Read,
            1 => SyscallNumber::Write,
            2 => SyscallNumber::Open,
            3 => SyscallNumber::Close,
            8 => SyscallNumber::Lseek,
            9 => SyscallNumber::Mmap,
            11 => SyscallNumber::Munmap,
            12 => SyscallNumber::Brk,
            13 => SyscallNumber::RtSigaction,
            14 => SyscallNumber::RtSigprocmask,
            15 => SyscallNumber::RtSigreturn,
            22 => SyscallNumber::Pipe,
            24 => SyscallNumber::SchedYield,
            32 => SyscallNumber::Dup,
            33 => SyscallNumber::Dup2,
            35 => SyscallNumber::Nanosleep,
            37 => SyscallNumber::Alarm,
            39 => SyscallNumber::Getpid,
            57 => SyscallNumber::Fork,
            59 => SyscallNumber::Execve,
            60 => SyscallNumber::Exit,
            61 => SyscallNumber::Wait4,
            62 => SyscallNumber::Kill,
            110 => SyscallNumber::Getppid,
            _ => SyscallNumber::Invalid,
        }
    }
}

/// Argument registers in ABI order.
#[derive(Debug, Clone, Copy)]
pub struct SyscallArgs {
    pub a0: u64,
    pub a1: u64,
    pub a2: u64,
    pub a3: u64,
    pub a4: u64,
    pub a5: u64,
}

impl SyscallArgs {
    fn from_frame(frame: &TrapFrame) -> Self {
        Self {
            a0: frame.rdi,
            a1: frame.rsi,
            a2: frame.rdx,
            a3: frame.r10,
            a4: frame.r8,
            a5: frame.r9,
        }
    }
}

fn dispatch(num: SyscallNumber, args: &SyscallArgs) -> i64 {
    use handlers::*;
    let result = match num {
        SyscallNumber::Read => sys_read(args.a0 as i32, args.a1, args.a2),
        SyscallNumber::Write => sys_write(args.a0 as i32, args.a1, args.a2),
        SyscallNumber::Open => sys_open(args.a0, args.a1 as u32, args.a2 as u32),
        SyscallNumber::Close => sys_close(args.a0 as i32),
        SyscallNumber::Lseek => sys_lseek(args.a0 as i32, args.a1 as i64, args.a2 as u32),
        SyscallNumber::Mmap => sys_mmap(
            args.a0,
            args.a1,
            args.a2 as u32,
            args.a3 as u32,
            args.a4 as i32,
            args.a5,
        ),
        SyscallNumber::Munmap => sys_munmap(args.a0, args.a1),
        SyscallNumber::Brk => sys_brk(args.a0),
        SyscallNumber::RtSigaction => sys_sigaction(args.a0 as u32, args.a1, args.a2),
        SyscallNumber::RtSigprocmask => sys_sigprocmask(args.a0 as u32, args.a1, args.a2),
        SyscallNumber::RtSigreturn => signal::sigreturn_current(args.a0),
        SyscallNumber::Pipe => sys_pipe(args.a0),
        SyscallNumber::SchedYield => sys_yield(),
        SyscallNumber::Dup => sys_dup(args.a0 as i32),
        SyscallNumber::Dup2 => sys_dup2(args.a0 as i32, args.a1 as i32),
        SyscallNumber::Nanosleep => sys_nanosleep(args.a0, args.a1),
        SyscallNumber::Alarm => sys_alarm(args.a0 as u32),
        SyscallNumber::Getpid => sys_getpid(),
        SyscallNumber::Fork => crate::process::fork::do_fork().map(|pid| pid as u64),
        SyscallNumber::Execve => sys_execve(args.a0, args.a1, args.a2),
        SyscallNumber::Exit => sys_exit(args.a0 as i32),
        SyscallNumber::Wait4 => sys_wait4(args.a0 as i64, args.a1, args.a2 as i32),
        SyscallNumber::Kill => sys_kill(args.a0 as i64, args.a1 as u32),
        SyscallNumber::Getppid => sys_getppid(),
        SyscallNumber::Invalid => Err(Errno::ENOSYS),
    };
    match result {
        Ok(v) => v as i64,
        Err(e) => e.as_i64(),
    }
}

/// Syscall entry point, called by the stub with the saved user frame.
pub extern "C" fn handle_syscall(frame: &mut TrapFrame) {
    // Per-task saved syscall context, stored before anything can sleep.
    {
        let _irq = IrqGuard::new();
        let mut guard = table::lock();
        if let (Some(tasks), Some(pid)) = (guard.as_mut(), scheduler::current_pid()) {
            if let Some(task) = tasks.get_mut(pid) {
                task.uctx = frame.user_context();
            }
        }
    }

    let num = SyscallNumber::from(frame.rax);
    let args = SyscallArgs::from_frame(frame);
    let result = dispatch(num, &args);

    // Commit the result into the saved context, then the context into the
    // frame; execve and sigreturn have rewritten rip/rsp by now.
    {
        let _irq = IrqGuard::new();
        let mut guard = table::lock();
        if let (Some(tasks), Some(pid)) = (guard.as_mut(), scheduler::current_pid()) {
            if let Some(task) = tasks.get_mut(pid) {
                task.uctx.rax = result as u64;
                frame.apply_user_context(&task.uctx);
            }
        }
    }

    // Signal delivery on the way back to user mode.
    loop {
        match signal::deliver_pending_current() {
            Delivered::None => break,
            Delivered::Handler { signo, frame: sigframe } => {
                let _irq = IrqGuard::new();
                let guard = table::lock();
                if let Some(task) = guard
                    .as_ref()
                    .and_then(|t| scheduler::current_pid().and_then(|p| t.get(p)))
                {
                    frame.apply_user_context(&task.uctx);
                }
                frame.rdi = signo as u64;
                frame.rsi = sigframe;
                break;
            }
            Delivered::Terminated | Delivered::Stopped => {
                // A terminated task never comes back; a stopped one
                // resumes here after SIGCONT and re-checks for more.
                scheduler::schedule();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn number_mapping_is_stable() {
        assert_eq!(SyscallNumber::from(0), SyscallNumber::Read);
        assert_eq!(SyscallNumber::from(57), SyscallNumber::Fork);
        assert_eq!(SyscallNumber::from(61), SyscallNumber::Wait4);
        assert_eq!(SyscallNumber::from(999), SyscallNumber::Invalid);
    }

    #[test]
    fn unknown_syscall_is_enosys() {
        let _g = crate::test_support::kernel_lock();
        crate::test_support::reset_kernel();
        let args = SyscallArgs {
            a0: 0,
            a1: 0,
            a2: 0,
            a3: 0,
            a4: 0,
            a5: 0,
        };
        assert_eq!(dispatch(SyscallNumber::Invalid, &args), -38);
    }
}
