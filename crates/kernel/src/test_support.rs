//! Shared fixtures for the unit tests.
//!
//! Kernel state is global (task table, frame allocator, per-CPU areas),
//! so tests that touch it serialize on [`kernel_lock`] and rebuild the
//! world with the reset helpers.

use std::sync::{Mutex, MutexGuard, OnceLock};

use crate::mm::AddressSpace;
use crate::process::scheduler;
use crate::process::table;
use crate::process::task::{Pid, Task, TaskState};
use crate::smp::percpu::{self, PerCpu};

/// Serializes tests that touch global kernel state.
pub fn kernel_lock() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let lock = LOCK.get_or_init(|| Mutex::new(()));
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Fresh physical arena (8 MiB) plus a fresh kernel root.
pub fn reset_mm() {
    crate::mm::phys::test_reset(2048);
    let root = crate::mm::phys::alloc_frame().expect("kernel root");
    crate::mm::set_kernel_root(root);
}

/// Fresh per-CPU areas for `cpus` CPUs; CPU 0 installed on this thread.
pub fn reset_percpu(cpus: usize) {
    percpu::test_reset_areas();
    for cpu in 0..cpus {
        PerCpu::allocate(cpu, cpu as u32);
    }
    unsafe { PerCpu::install(0) };
}

/// Full kernel reset: config defaults, tick 0, arena, one CPU, task table
/// with the bootstrap task current, idle tasks.
pub fn reset_kernel() {
    reset_kernel_smp(1);
}

/// Like [`reset_kernel`] with several CPUs' areas allocated.
pub fn reset_kernel_smp(cpus: usize) {
    crate::config::apply(&crate::config::KernelConfig::default());
    crate::time::test_set_ticks(0);
    crate::smp::test_clear_smp_active();
    crate::vfs::test_clear_open_hook();
    crate::process::exec::test_clear_loader();
    reset_mm();
    reset_percpu(cpus);
    table::test_reset();
    {
        let mut guard = table::lock();
        let tasks = guard.as_mut().unwrap();
        scheduler::adopt_bootstrap(tasks).unwrap();
    }
    scheduler::create_idle_tasks().unwrap();
}

/// Create a user task with a mapped stack, published on `cpu` and linked
/// under `parent`.
pub fn spawn_user(name: &str, parent: Pid, cpu: u32) -> Pid {
    let pid = table::alloc_pid().unwrap();
    let aspace = AddressSpace::new_user().unwrap();
    let task = Task::new_user(pid, name, 0x40_0000, aspace).unwrap();
    let mut guard = table::lock();
    let tasks = guard.as_mut().unwrap();
    scheduler::publish_linked_task(tasks, task, parent, cpu).unwrap()
}

/// Make `pid` the running current task of CPU 0, demoting the previous
/// current task to ready (as a real switch would).
pub fn set_current(pid: Pid) {
    let mut guard = table::lock();
    let tasks = guard.as_mut().unwrap();
    if let Some(prev) = scheduler::current_pid() {
        if prev != pid {
            if let Some(task) = tasks.get_mut(prev) {
                if task.state == TaskState::Running {
                    task.state = TaskState::Ready;
                    if task.saved_sp == 0 {
                        // a real switch-out would have saved it
                        task.saved_sp = crate::arch::SIMULATED_SAVED_SP;
                    }
                    scheduler::enqueue_locked(tasks, prev);
                }
            }
        }
    }
    if let Some(task) = tasks.get_mut(pid) {
        task.state = TaskState::Running;
        let cpu = task.cpu as usize;
        if let Some(area) = percpu::get(cpu) {
            area.run_queue.lock().remove(pid);
        }
    }
    drop(guard);
    scheduler::set_current_pid(Some(pid));
    if let Some(area) = percpu::get(0) {
        area.set_current_pid(Some(pid));
    }
}

/// Exit a task the way the exit syscall would, without diverging.
pub fn exit_task(pid: Pid, code: i32) {
    let mut guard = table::lock();
    if let Some(tasks) = guard.as_mut() {
        crate::process::wait::exit_task_locked(tasks, pid, code, 0);
    }
}

/// Write one byte into a task's address space at `va`.
pub fn poke_user(pid: Pid, va: u64, byte: u8) {
    let root = {
        let guard = table::lock();
        guard.as_ref().unwrap().get(pid).unwrap().effective_root()
    };
    crate::syscall::uaccess::copy_to_user_root(root, va, &[byte]).unwrap();
}

/// Read one byte from a task's address space at `va`.
pub fn peek_user(pid: Pid, va: u64) -> u8 {
    let root = {
        let guard = table::lock();
        guard.as_ref().unwrap().get(pid).unwrap().effective_root()
    };
    let mut buf = [0u8; 1];
    crate::syscall::uaccess::copy_from_user_root(root, va, &mut buf).unwrap();
    buf[0]
}
