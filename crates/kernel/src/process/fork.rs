//! Fork: duplicate the current user task with a copy-on-write address
//! space and an independent kernel stack whose first scheduling returns
//! to user mode with result 0.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Errno, Result};
use crate::process::scheduler;
use crate::process::table;
use crate::process::task::{KernelStack, Pid, Task};
use crate::sync::IrqGuard;

static TOTAL_FORKS: AtomicU64 = AtomicU64::new(0);
static FAILED_FORKS: AtomicU64 = AtomicU64::new(0);

/// Fork the current task. Returns the child pid to the caller (the
/// parent); the child's first scheduling resumes at the parent's syscall
/// return site with result register 0, by way of the fork trampoline
/// frame built here.
pub fn do_fork() -> Result<Pid> {
    let child_pid = table::alloc_pid().map_err(|e| {
        FAILED_FORKS.fetch_add(1, Ordering::Relaxed);
        Errno::from(e)
    })?;
    let kstack = KernelStack::new().map_err(Errno::from)?;

    let _irq = IrqGuard::new();
    let mut guard = table::lock();
    let tasks = guard.as_mut().ok_or(Errno::ESRCH)?;
    let parent_pid = scheduler::current_pid().ok_or(Errno::ESRCH)?;

    // Snapshot everything the child inherits. The address-space clone
    // turns the parent's private pages copy-on-write in both roots and
    // carves out the explicitly shared regions.
    let (child_aspace, files, signals, uctx, name, user_stack_top) = {
        let parent = tasks.get_mut(parent_pid).ok_or(Errno::ESRCH)?;
        let aspace = parent.aspace.as_mut().ok_or(Errno::EINVAL)?;
        let child_aspace = aspace.fork_clone().map_err(|e| {
            FAILED_FORKS.fetch_add(1, Ordering::Relaxed);
            Errno::from(e)
        })?;
        (
            child_aspace,
            parent.files.duplicate_all(),
            parent.signals.clone(),
            parent.uctx,
            parent.name.clone(),
            parent.user_stack_top,
        )
    };

    // Other CPUs may still hold writable translations for pages that
    // just went read-only.
    if crate::smp::smp_active() {
        crate::smp::ipi::tlb_shootdown_all();
    }

    let child = Task::new_fork_child(
        child_pid,
        name,
        child_aspace,
        kstack,
        files,
        signals,
        uctx,
        user_stack_top,
    );
    let target_cpu = scheduler::pick_target_cpu();
    let pid = scheduler::publish_linked_task(tasks, child, parent_pid, target_cpu)?;

    TOTAL_FORKS.fetch_add(1, Ordering::Relaxed);
    crate::debug!("fork: pid {} -> child {} on cpu {}", parent_pid, pid, target_cpu);
    Ok(pid)
}

#[derive(Debug, Clone, Copy)]
pub struct ForkStats {
    pub total: u64,
    pub failed: u64,
}

pub fn stats() -> ForkStats {
    ForkStats {
        total: TOTAL_FORKS.load(Ordering::Relaxed),
        failed: FAILED_FORKS.load(Ordering::Relaxed),
    }
}
