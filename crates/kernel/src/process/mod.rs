//! Process management: tasks, scheduling, lifecycle, signals.

pub mod exec;
pub mod fd;
pub mod fork;
pub mod scheduler;
pub mod signal;
pub mod table;
pub mod task;
pub mod wait;

pub use scheduler::current_pid;
pub use task::{Pid, Privilege, Task, TaskState, INIT_PID};

use crate::error::KernelError;
use crate::interrupts::TrapFrame;
use crate::mm::fault::FaultOutcome;
use crate::sync::IrqGuard;

/// Bring up the process subsystem on the boot processor: task table plus
/// the bootstrap task (id 0) adopting the boot context.
pub fn init() -> Result<(), KernelError> {
    table::init_table();
    let _irq = IrqGuard::new();
    let mut guard = table::lock();
    let tasks = guard.as_mut().ok_or(KernelError::NotInitialized)?;
    scheduler::adopt_bootstrap(tasks)
}

/// Page-fault interrupt tail. Copy-on-write writes are resolved in place;
/// anything else from user mode raises SIGSEGV, anything else from kernel
/// mode is fatal.
pub fn handle_page_fault_interrupt(frame: &mut TrapFrame) {
    let addr = crate::arch::fault_address();
    let write = frame.error_code & 0x2 != 0;
    let from_user = frame.error_code & 0x4 != 0;

    let root = {
        let _irq = IrqGuard::new();
        let guard = table::lock();
        guard
            .as_ref()
            .and_then(|tasks| current_pid().and_then(|pid| tasks.get(pid)))
            .map(|task| task.effective_root())
            .unwrap_or_else(crate::mm::kernel_root)
    };

    match crate::mm::fault::handle_user_fault(root, addr, write) {
        FaultOutcome::Resolved => {}
        FaultOutcome::Violation if from_user => {
            crate::warn!(
                "fault: SIGSEGV at {:#x} (write={}) rip={:#x}",
                addr,
                write,
                frame.rip
            );
            {
                let _irq = IrqGuard::new();
                let mut guard = table::lock();
                if let (Some(tasks), Some(pid)) = (guard.as_mut(), current_pid()) {
                    if let Some(task) = tasks.get_mut(pid) {
                        // Delivery rewrites the context the stub irets on.
                        task.uctx = frame.user_context();
                    }
                    let _ =
                        signal::send_signal_locked(tasks, pid, signal::Signal::SIGSEGV, pid);
                }
            }
            match signal::deliver_pending_current() {
                signal::Delivered::Terminated | signal::Delivered::Stopped => {
                    scheduler::schedule();
                }
                signal::Delivered::Handler { signo, frame: sigframe } => {
                    let _irq = IrqGuard::new();
                    let guard = table::lock();
                    if let Some(task) = guard
                        .as_ref()
                        .and_then(|t| current_pid().and_then(|p| t.get(p)))
                    {
                        frame.apply_user_context(&task.uctx);
                    }
                    frame.rdi = signo as u64;
                    frame.rsi = sigframe;
                }
                signal::Delivered::None => {}
            }
        }
        FaultOutcome::Violation => {
            crate::error!(
                "fault: kernel access to {:#x} (write={}) rip={:#x}",
                addr,
                write,
                frame.rip
            );
            crate::panic::fatal_invariant("unresolvable kernel-mode page fault");
        }
    }
}

/// Bootstrap housekeeping: reap adopted orphans, then give the CPU away.
/// The scheduler routes the CPU here at least once per bootstrap-yield
/// interval, so a CPU-bound user task cannot starve the reaper.
pub fn bootstrap_housekeeping_loop() -> ! {
    loop {
        let reaped = wait::reap_zombies(INIT_PID);
        if reaped > 0 {
            crate::debug!("init: reaped {} orphan(s)", reaped);
        }
        scheduler::yield_now();
        crate::arch::halt();
    }
}
