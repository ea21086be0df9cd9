//! Exit, wait, and zombie reaping.
//!
//! A task's zombie flip happens under the scheduler lock with interrupts
//! disabled, together with the reparenting of its children; the parent's
//! wakeup follows inside the same critical section. A waiter that saw
//! blocked-to-ready therefore observes `has_exited == true` once it
//! reacquires the lock.

use crate::error::{Errno, Result};
use crate::process::scheduler;
use crate::process::signal::Signal;
use crate::process::table::{self, TaskTable};
use crate::process::task::{Pid, TaskState, INIT_PID};
use crate::sync::IrqGuard;

pub const WNOHANG: i32 = 1;

/// Maximum zombies collected per reap pass, so the sibling list is never
/// mutated while being traversed.
const REAP_BATCH: usize = 16;

/// Channel a parent blocks on while waiting for a child to exit.
pub(crate) fn wait_channel(parent: Pid) -> usize {
    0x5741_0000_0000usize + parent as usize
}

/// Conventional wait-status encoding: exit code shifted by 8, or the
/// terminating signal in the low seven bits.
pub fn encode_status(exit_code: i32, exit_signal: u8) -> i32 {
    if exit_signal != 0 {
        (exit_signal & 0x7f) as i32
    } else {
        (exit_code & 0xff) << 8
    }
}

/// The exit protocol, shared by voluntary exit and signal termination.
/// Caller holds the scheduler lock with interrupts disabled.
///
/// Closes every descriptor slot by variant, moves the children under
/// init, flips the task to zombie (invalidating its saved stack pointer),
/// drops it from its ready queue, and wakes the parent.
pub(crate) fn exit_task_locked(tasks: &mut TaskTable, pid: Pid, code: i32, signal: u8) {
    if pid == INIT_PID {
        crate::panic::fatal_invariant("init task exited");
    }
    let Some(task) = tasks.get_mut(pid) else {
        return;
    };
    if task.has_exited {
        return;
    }

    task.files.close_all();
    let was_running = task.state == TaskState::Running;
    let home_cpu = task.cpu;
    let parent = task.parent;
    task.mark_exited(code, signal);

    if let Some(area) = crate::smp::percpu::get(home_cpu as usize) {
        area.run_queue.lock().remove(pid);
    }

    tasks.reparent_children_to_init(pid);

    if let Some(parent_pid) = parent {
        scheduler::wake_channel_locked(tasks, wait_channel(parent_pid));
        let _ = crate::process::signal::send_signal_locked(
            tasks,
            parent_pid,
            Signal::SIGCHLD,
            pid,
        );
    }

    // A victim running on another CPU keeps executing kernel code until
    // its next scheduler entry; nudge that CPU.
    if was_running {
        if let Some(area) = crate::smp::percpu::get(home_cpu as usize) {
            area.set_need_resched(true);
        }
        if crate::smp::smp_active() && home_cpu as usize != crate::smp::percpu::this_cpu_id() {
            crate::smp::ipi::send_reschedule(home_cpu as usize);
        }
    }

    crate::debug!("process: pid {} exited (code {}, sig {})", pid, code, signal);
}

/// Voluntary exit of the current task. Does not return.
pub fn do_exit(code: i32) -> ! {
    {
        let _irq = IrqGuard::new();
        let mut guard = table::lock();
        if let (Some(tasks), Some(pid)) = (guard.as_mut(), scheduler::current_pid()) {
            exit_task_locked(tasks, pid, code, 0);
        }
    }
    scheduler::schedule();
    // A zombie is never picked again; reaching here means the scheduler
    // resumed a task with an invalidated stack pointer.
    crate::panic::fatal_invariant("exited task was rescheduled");
}

/// Exit hook for kernel-task bodies that return.
#[no_mangle]
pub extern "C" fn ferrite_kernel_task_exit() -> ! {
    do_exit(0);
}

/// Destroy a reapable zombie: unlink from the tree, drop the table entry.
/// The box drop releases the address space, kernel stack, and task
/// structure; descriptors were closed at exit time.
fn destroy_zombie(tasks: &mut TaskTable, parent: Pid, zombie: Pid) {
    if let Some(area) = crate::smp::percpu::get(
        tasks.get(zombie).map(|t| t.cpu).unwrap_or(0) as usize,
    ) {
        area.run_queue.lock().remove(zombie);
    }
    tasks.unlink_child(parent, zombie);
    tasks.remove(zombie);
}

/// waitpid semantics for the wait4 syscall. Returns the reaped child's pid
/// and encoded status, or (0, 0) for WNOHANG with no match.
pub fn do_wait4(select: i64, options: i32) -> Result<(Pid, i32)> {
    if select != -1 && select <= 0 {
        return Err(Errno::EINVAL);
    }
    loop {
        {
            let _irq = IrqGuard::new();
            let mut guard = table::lock();
            let tasks = guard.as_mut().ok_or(Errno::ECHILD)?;
            scheduler::drain_pending_wakes_locked(tasks);
            let me = scheduler::current_pid().ok_or(Errno::ECHILD)?;
            let children = tasks.children_of(me);
            if children.is_empty() {
                return Err(Errno::ECHILD);
            }
            if select > 0 && !children.contains(&(select as Pid)) {
                return Err(Errno::ECHILD);
            }

            let reapable = children.into_iter().find(|&c| {
                (select == -1 || c == select as Pid)
                    && tasks.get(c).map(|t| t.is_reapable()).unwrap_or(false)
            });
            if let Some(child) = reapable {
                let (code, signal) = {
                    let t = tasks.get(child).unwrap();
                    (t.exit_code, t.exit_signal)
                };
                destroy_zombie(tasks, me, child);
                return Ok((child, encode_status(code, signal)));
            }

            if options & WNOHANG != 0 {
                return Ok((0, 0));
            }
            // Block inside the same critical section as the check: a
            // child exiting after the scan but before the switch finds us
            // already blocked and wakes us.
            if !scheduler::block_current_locked(tasks, me, wait_channel(me), None) {
                return Err(Errno::EINTR);
            }
        }
        match scheduler::finish_sleep(None) {
            scheduler::WakeReason::Signal => return Err(Errno::EINTR),
            _ => {}
        }
    }
}

/// Collect and destroy up to [`REAP_BATCH`] zombie children of `parent`.
/// Init calls this periodically for adopted orphans. Returns the number
/// reaped.
pub fn reap_zombies(parent: Pid) -> usize {
    let _irq = IrqGuard::new();
    let mut guard = table::lock();
    let Some(tasks) = guard.as_mut() else {
        return 0;
    };
    // Buffer the victims first: destroying mutates the sibling list.
    let mut victims: heapless::Vec<Pid, REAP_BATCH> = heapless::Vec::new();
    for child in tasks.children_of(parent) {
        if victims.is_full() {
            break;
        }
        if tasks.get(child).map(|t| t.is_reapable()).unwrap_or(false) {
            let _ = victims.push(child);
        }
    }
    let count = victims.len();
    for zombie in victims {
        destroy_zombie(tasks, parent, zombie);
    }
    count
}
