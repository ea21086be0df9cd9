//! Scheduler core: round-robin selection, voluntary yield, timer
//! preemption, sleep/wake, and the address-space switch ordering.
//!
//! Locking: the global scheduler lock (the task table) is taken with
//! interrupts disabled and released before the context-switch assembly
//! runs. Ready tasks are queued and picked only on their home CPU, so a
//! task's saved stack pointer is always written (by the switch that
//! descheduled it) before any pick can hand it out again; cross-CPU code
//! never resumes a task, it only enqueues and sends a reschedule IPI.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::arch;
use crate::config;
use crate::error::KernelError;
use crate::interrupts::TrapFrame;
use crate::process::table::{self, TaskTable};
use crate::process::task::{Pid, Task, TaskState, INIT_PID};
use crate::smp::percpu::{self, PerCpu, NO_TASK};
use crate::sync::IrqGuard;

/// Pre-SMP stand-in for the boot processor's current-task pointer.
static BOOT_CURRENT: AtomicU32 = AtomicU32::new(NO_TASK);

/// Why a sleeper came back from [`sleep_on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// A `wake_channel` on the channel we slept on.
    Channel,
    /// The deadline tick arrived first.
    Timeout,
    /// A deliverable signal pended; the caller reports EINTR.
    Signal,
}

/// Current task of this CPU. Reads the per-CPU area once SMP is active,
/// the boot global before that.
pub fn current_pid() -> Option<Pid> {
    if crate::smp::smp_active() {
        percpu::this_cpu().current_pid()
    } else {
        match BOOT_CURRENT.load(Ordering::Acquire) {
            NO_TASK => None,
            pid => Some(pid),
        }
    }
}

pub(crate) fn set_current_pid(pid: Option<Pid>) {
    if crate::smp::smp_active() {
        percpu::this_cpu().set_current_pid(pid);
    } else {
        BOOT_CURRENT.store(pid.unwrap_or(NO_TASK), Ordering::Release);
        // keep the boot area coherent if it already exists
        if let Some(area) = percpu::get(0) {
            area.set_current_pid(pid);
        }
    }
}

/// Hand CPU-local state over to the per-CPU areas and flip the
/// process-wide SMP flag; `current_pid` reads per-CPU from here on.
pub fn enable_smp() {
    let boot = percpu::get(0).expect("boot per-CPU area missing");
    boot.set_current_pid(match BOOT_CURRENT.load(Ordering::Acquire) {
        NO_TASK => None,
        pid => Some(pid),
    });
    crate::smp::set_smp_active();
    crate::info!("sched: SMP active, {} cpu(s)", crate::smp::num_cpus());
}

/// Register the bootstrap task (id 0) as the boot CPU's current task.
pub fn adopt_bootstrap(table: &mut TaskTable) -> Result<(), KernelError> {
    table.insert(Task::new_bootstrap())?;
    set_current_pid(Some(INIT_PID));
    Ok(())
}

/// Create one idle task per allocated per-CPU area. Idle tasks are never
/// enqueued; pick-next falls back to them.
pub fn create_idle_tasks() -> Result<(), KernelError> {
    let _irq = IrqGuard::new();
    let mut guard = table::lock();
    let tasks = guard.as_mut().ok_or(KernelError::NotInitialized)?;
    let mut result = Ok(());
    percpu::for_each(|area| {
        if result.is_err() || area.idle_pid().is_some() {
            return;
        }
        result = (|| {
            let pid = table::alloc_pid()?;
            let mut idle = Task::new_kernel(pid, "idle", idle_task_body, area.cpu_id as usize)?;
            idle.cpu = area.cpu_id;
            idle.state = TaskState::Ready;
            tasks.insert(idle)?;
            area.set_idle_pid(pid);
            Ok(())
        })();
    });
    result
}

extern "C" fn idle_task_body(_cpu: usize) {
    idle_loop();
}

/// Idle: halt until an interrupt, then offer the CPU back.
pub fn idle_loop() -> ! {
    loop {
        arch::enable_interrupts();
        arch::halt();
        let cpu = percpu::this_cpu();
        if cpu.need_resched() && cpu.preempt_count() == 0 {
            schedule();
        }
    }
}

/// Least-loaded online CPU with an allocated area; home for new tasks.
pub fn pick_target_cpu() -> u32 {
    let mut best = 0u32;
    let mut best_len = usize::MAX;
    percpu::for_each(|area| {
        if !crate::smp::is_cpu_online(area.cpu_id as usize) && area.cpu_id != 0 {
            return;
        }
        let len = area.run_queue.lock().len();
        if len < best_len {
            best_len = len;
            best = area.cpu_id;
        }
    });
    best
}

/// Put a ready task on its home CPU's queue. Caller holds the scheduler
/// lock; the task must already be in the `Ready` state.
pub(crate) fn enqueue_locked(tasks: &TaskTable, pid: Pid) {
    let Some(task) = tasks.get(pid) else {
        crate::error!("sched: enqueue of unknown pid {}", pid);
        return;
    };
    debug_assert_eq!(task.state, TaskState::Ready);
    if task.has_exited {
        crate::error!("sched: refusing to enqueue exited pid {}", pid);
        return;
    }
    let Some(area) = percpu::get(task.cpu as usize) else {
        crate::error!("sched: pid {} homed on missing cpu {}", pid, task.cpu);
        return;
    };
    let mut rq = area.run_queue.lock();
    if !rq.contains(pid) {
        rq.push(pid);
    }
}

/// Insert a fresh task into the table and queue it on `cpu`.
pub fn publish_task(mut task: Task, cpu: u32) -> Result<Pid, KernelError> {
    let _irq = IrqGuard::new();
    let mut guard = table::lock();
    let tasks = guard.as_mut().ok_or(KernelError::NotInitialized)?;
    task.cpu = cpu;
    task.state = TaskState::Ready;
    let pid = task.pid;
    tasks.insert(task)?;
    enqueue_locked(tasks, pid);
    if crate::smp::smp_active() && cpu as usize != percpu::this_cpu_id() {
        crate::smp::ipi::send_reschedule(cpu as usize);
    }
    Ok(pid)
}

/// Insert a freshly created child into the table under an already-held
/// scheduler lock, link it into the parent's child list, and queue it.
pub(crate) fn publish_linked_task(
    tasks: &mut TaskTable,
    mut task: Task,
    parent: Pid,
    cpu: u32,
) -> core::result::Result<Pid, crate::error::Errno> {
    task.cpu = cpu;
    task.state = TaskState::Ready;
    let pid = task.pid;
    tasks.insert(task).map_err(crate::error::Errno::from)?;
    tasks.link_child(parent, pid);
    enqueue_locked(tasks, pid);
    if crate::smp::smp_active() && cpu as usize != percpu::this_cpu_id() {
        crate::smp::ipi::send_reschedule(cpu as usize);
    }
    Ok(pid)
}

/// Spawn a kernel task on the least-loaded CPU.
pub fn spawn_kernel_task(
    name: &str,
    entry: arch::KernelTaskEntry,
    arg: usize,
) -> Result<Pid, KernelError> {
    let pid = table::alloc_pid()?;
    let task = Task::new_kernel(pid, name, entry, arg)?;
    publish_task(task, pick_target_cpu())
}

/// Everything the switch needs after the lock is gone.
struct SwitchArgs {
    prev_sp_slot: *mut u64,
    next_sp: u64,
    next_root: u64,
    next_kstack_top: Option<u64>,
}

/// Pick the next task for this CPU. Returns `None` to keep the current
/// task. Must run under the scheduler lock.
fn pick_next(tasks: &mut TaskTable, cpu: &'static PerCpu, prev: Option<Pid>) -> Option<Pid> {
    let bootstrap_due =
        cpu.bootstrap_yields.load(Ordering::Relaxed) >= config::bootstrap_yield_interval();
    let prev_runnable = prev
        .and_then(|p| tasks.get(p))
        .map(|t| t.is_runnable())
        .unwrap_or(false);

    let mut chosen: Option<Pid> = None;
    let mut bootstrap_ready = false;
    {
        let rq = cpu.run_queue.lock();
        for &pid in rq.iter() {
            let Some(task) = tasks.get(pid) else {
                continue;
            };
            // Defensive: an exited task on a run queue is an invariant
            // violation; never return it.
            if task.has_exited {
                crate::error!("sched: zombie pid {} found on cpu {} queue", pid, cpu.cpu_id);
                continue;
            }
            if task.state != TaskState::Ready {
                continue;
            }
            if pid == INIT_PID {
                // Bootstrap is a fallback, never a preference: the whole
                // ready set is walked for a non-bootstrap task first.
                bootstrap_ready = true;
                continue;
            }
            chosen = Some(pid);
            break;
        }
    }

    // Selection order: the first non-bootstrap ready task in insertion
    // order; if none anywhere in the queue, bootstrap when its interval
    // is due; then the current task while it stays runnable; a ready
    // bootstrap over idle; idle last.
    let selected = chosen
        .or(if bootstrap_ready && bootstrap_due {
            Some(INIT_PID)
        } else {
            None
        })
        .or(if prev_runnable { prev } else { None })
        .or(if bootstrap_ready { Some(INIT_PID) } else { None })
        .or_else(|| cpu.idle_pid());

    match selected {
        Some(pid) => {
            // A picked task leaves the ready queue (also when "picked"
            // task is the queued current one we decide to keep).
            cpu.run_queue.lock().remove(pid);
            if Some(pid) == prev {
                None
            } else {
                Some(pid)
            }
        }
        None => {
            // Not even idle exists: the CPU has nothing it could ever run.
            crate::panic::fatal_invariant("pick-next found no runnable task and no idle");
        }
    }
}

/// Commit the switch decision under the lock and build the argument block
/// for the assembly. `prev`'s state has been set by the caller; a
/// still-`Ready` prev goes back on its queue (unless it is an idle task,
/// which is never queued).
fn prepare_switch(
    tasks: &mut TaskTable,
    cpu: &'static PerCpu,
    prev_pid: Pid,
    next_pid: Pid,
) -> SwitchArgs {
    if tasks
        .get(prev_pid)
        .map(|t| t.state == TaskState::Running)
        .unwrap_or(false)
    {
        // Callers set the outgoing state first; running here means a
        // voluntary switch without disposition, treat as yield.
        tasks.get_mut(prev_pid).unwrap().state = TaskState::Ready;
    }
    if tasks
        .get(prev_pid)
        .map(|t| t.state == TaskState::Ready)
        .unwrap_or(false)
        && Some(prev_pid) != cpu.idle_pid()
    {
        enqueue_locked(tasks, prev_pid);
    }

    let next = tasks.get_mut(next_pid).expect("picked task vanished");
    if next.saved_sp == 0 {
        crate::panic::fatal_invariant("null saved stack pointer on runnable task");
    }
    next.state = TaskState::Running;
    next.slice_remaining = config::time_slice_ticks();
    next.need_resched = false;
    next.preempt_frame = 0;
    let next_sp = next.saved_sp;
    let next_root = next.effective_root();
    let next_kstack_top = next.kernel_stack_top();

    if next_pid == INIT_PID {
        cpu.bootstrap_yields.store(0, Ordering::Relaxed);
    }
    cpu.set_current_pid(Some(next_pid));
    set_current_pid(Some(next_pid));
    cpu.set_need_resched(false);
    cpu.counters.context_switches.fetch_add(1, Ordering::Relaxed);

    let prev = tasks.get_mut(prev_pid).expect("previous task vanished");
    SwitchArgs {
        prev_sp_slot: &mut prev.saved_sp as *mut u64,
        next_sp,
        next_root,
        next_kstack_top,
    }
}

/// The address-space switch (strict order) followed by the context switch.
/// Runs with interrupts disabled and no locks held.
fn do_switch(cpu: &'static PerCpu, args: SwitchArgs) {
    // 1. The next user-to-kernel transition must land on next's stack.
    if let Some(top) = args.next_kstack_top {
        cpu.set_tss_rsp0(top);
        // 2. CPU-local cache of the same value.
        cpu.set_kernel_stack_top(top);
    }
    // 3. Root load only when it actually changes.
    if cpu.active_root() != args.next_root {
        unsafe { arch::load_root(args.next_root) };
        cpu.set_active_root(args.next_root);
    }
    unsafe { arch::context_switch(args.prev_sp_slot, args.next_sp) };
}

/// Voluntary scheduler entry. The caller has already set the outgoing
/// task's state (ready, blocked, stopped, or zombie).
pub fn schedule() {
    let _irq = IrqGuard::new();
    let cpu = percpu::this_cpu();
    cpu.bootstrap_yields.fetch_add(1, Ordering::Relaxed);

    let mut guard = table::lock();
    let Some(tasks) = guard.as_mut() else {
        return;
    };
    drain_pending_wakes_locked(tasks);
    let Some(prev_pid) = current_pid() else {
        return;
    };
    let Some(next_pid) = pick_next(tasks, cpu, Some(prev_pid)) else {
        // Keeping the current task: the slice is reset only on a real
        // switch, but a yielding task goes back to running.
        if let Some(task) = tasks.get_mut(prev_pid) {
            if task.state == TaskState::Ready {
                task.state = TaskState::Running;
            }
            task.need_resched = false;
        }
        cpu.set_need_resched(false);
        return;
    };
    let args = prepare_switch(tasks, cpu, prev_pid, next_pid);
    drop(guard);
    do_switch(cpu, args);
}

/// Voluntary yield: current goes back to ready, someone else may run.
pub fn yield_now() {
    {
        let _irq = IrqGuard::new();
        let mut guard = table::lock();
        if let Some(tasks) = guard.as_mut() {
            if let Some(pid) = current_pid() {
                if let Some(task) = tasks.get_mut(pid) {
                    if task.state == TaskState::Running {
                        task.state = TaskState::Ready;
                    }
                }
            }
        }
    }
    schedule();
}

/// Timer-driven preemption, called at the tail of the timer interrupt
/// with the interrupt-saved register block. Skips silently when the
/// scheduler lock is contended; the task is preempted on a later tick.
pub fn preempt(frame: &mut TrapFrame) {
    let cpu = percpu::this_cpu();
    let Some(mut guard) = table::try_lock() else {
        return;
    };
    let Some(tasks) = guard.as_mut() else {
        return;
    };
    drain_pending_wakes_locked(tasks);
    let Some(prev_pid) = current_pid() else {
        return;
    };

    if let Some(prev) = tasks.get_mut(prev_pid) {
        prev.preempt_frame = frame as *mut TrapFrame as u64;
        // Preemption does not block the task.
        if prev.state == TaskState::Running {
            prev.state = TaskState::Ready;
        }
    }

    let Some(next_pid) = pick_next(tasks, cpu, Some(prev_pid)) else {
        if let Some(prev) = tasks.get_mut(prev_pid) {
            if prev.state == TaskState::Ready {
                prev.state = TaskState::Running;
            }
            prev.need_resched = false;
            prev.preempt_frame = 0;
        }
        cpu.set_need_resched(false);
        return;
    };

    let args = prepare_switch(tasks, cpu, prev_pid, next_pid);
    cpu.counters.preemptions.fetch_add(1, Ordering::Relaxed);
    drop(guard);
    do_switch(cpu, args);

    // Back on the CPU: control falls through to the interrupt return,
    // which irets on the frame saved above. The frame field is cleared
    // when this task is switched in (prepare_switch), so nothing stale
    // survives here.
}

/// Transition the current task to blocked on `channel`. Caller holds the
/// scheduler lock. Returns false (and leaves the task runnable) when a
/// deliverable signal is already pending: the caller reports EINTR
/// instead of sleeping.
pub(crate) fn block_current_locked(
    tasks: &mut TaskTable,
    pid: Pid,
    channel: usize,
    deadline: Option<u64>,
) -> bool {
    let Some(task) = tasks.get_mut(pid) else {
        return false;
    };
    if task.signals.has_deliverable() {
        return false;
    }
    task.state = TaskState::Blocked;
    task.wait_channel = Some(channel);
    task.wakeup_tick = deadline;
    true
}

/// First half of a sleep: mark the current task blocked. The caller may
/// still hold the lock protecting its wait condition (a pipe's lock, say)
/// across this call, then release that lock, then call [`finish_sleep`].
/// A wake between the two halves just flips the task back to ready, so
/// the wakeup is never lost.
pub fn prepare_sleep(channel: usize, deadline: Option<u64>) -> bool {
    let _irq = IrqGuard::new();
    let mut guard = table::lock();
    let Some(tasks) = guard.as_mut() else {
        return false;
    };
    let Some(pid) = current_pid() else {
        return false;
    };
    block_current_locked(tasks, pid, channel, deadline)
}

/// Second half of a sleep: give up the CPU and classify the wakeup.
pub fn finish_sleep(deadline: Option<u64>) -> WakeReason {
    schedule();

    let _irq = IrqGuard::new();
    let mut guard = table::lock();
    let reason = (|| {
        let tasks = guard.as_mut()?;
        let pid = current_pid()?;
        let task = tasks.get_mut(pid)?;
        task.wait_channel = None;
        task.wakeup_tick = None;
        if task.signals.has_deliverable() {
            return Some(WakeReason::Signal);
        }
        if let Some(d) = deadline {
            if crate::time::ticks() >= d {
                return Some(WakeReason::Timeout);
            }
        }
        Some(WakeReason::Channel)
    })();
    reason.unwrap_or(WakeReason::Channel)
}

/// Block the current task on `channel` until a wake, an optional
/// deadline, or a deliverable signal.
pub fn sleep_on(channel: usize, deadline: Option<u64>) -> WakeReason {
    if !prepare_sleep(channel, deadline) {
        return WakeReason::Signal;
    }
    finish_sleep(deadline)
}

/// Make a blocked task ready again (waker side). Caller holds the lock.
pub(crate) fn wake_task_locked(tasks: &mut TaskTable, pid: Pid) {
    let Some(task) = tasks.get_mut(pid) else {
        return;
    };
    if task.state != TaskState::Blocked {
        return;
    }
    task.state = TaskState::Ready;
    task.wait_channel = None;
    let home = task.cpu as usize;
    enqueue_locked(tasks, pid);
    if crate::smp::smp_active() && home != percpu::this_cpu_id() {
        crate::smp::ipi::send_reschedule(home);
    }
}

/// Channels whose wake arrived while the scheduler lock was held (a pipe
/// end released from an exit or close path). Drained at every scheduler
/// entry and tick, so a deferred wake lands within one tick.
static PENDING_WAKES: spin::Mutex<alloc::vec::Vec<usize>> = spin::Mutex::new(alloc::vec::Vec::new());

/// Wake every task blocked on `channel`. Safe to call with or without the
/// scheduler lock held: contended wakes are queued instead of deadlocking
/// on re-acquisition.
pub fn wake_channel(channel: usize) {
    let _irq = IrqGuard::new();
    match table::try_lock() {
        Some(mut guard) => {
            if let Some(tasks) = guard.as_mut() {
                drain_pending_wakes_locked(tasks);
                wake_channel_locked(tasks, channel);
            }
        }
        None => {
            PENDING_WAKES.lock().push(channel);
        }
    }
}

/// Deliver wakes that arrived while the lock was contended. Caller holds
/// the scheduler lock.
pub(crate) fn drain_pending_wakes_locked(tasks: &mut TaskTable) {
    loop {
        let Some(channel) = PENDING_WAKES.lock().pop() else {
            return;
        };
        wake_channel_locked(tasks, channel);
    }
}

pub(crate) fn wake_channel_locked(tasks: &mut TaskTable, channel: usize) {
    let mut to_wake: alloc::vec::Vec<Pid> = alloc::vec::Vec::new();
    tasks.for_each_mut(|task| {
        if task.state == TaskState::Blocked && task.wait_channel == Some(channel) {
            to_wake.push(task.pid);
        }
    });
    for pid in to_wake {
        wake_task_locked(tasks, pid);
    }
}

/// Bounded per-tick scheduler work: expire sleepers, charge the running
/// task's slice, drive the signal timers. Never switches tasks.
pub fn on_tick(now: u64) {
    let _irq = IrqGuard::new();
    let mut guard = table::lock();
    let Some(tasks) = guard.as_mut() else {
        return;
    };
    drain_pending_wakes_locked(tasks);

    // Sleep expiry sweep.
    let mut expired: alloc::vec::Vec<Pid> = alloc::vec::Vec::new();
    tasks.for_each_mut(|task| {
        if task.state == TaskState::Blocked {
            if let Some(deadline) = task.wakeup_tick {
                if now >= deadline {
                    expired.push(task.pid);
                }
            }
        }
    });
    for pid in expired {
        wake_task_locked(tasks, pid);
    }

    // Time-slice accounting for this CPU's current task.
    charge_current_locked(tasks);

    // Alarm and interval timers.
    crate::process::signal::timer_sweep_locked(tasks, now);
}

fn charge_current_locked(tasks: &mut TaskTable) {
    let cpu = percpu::this_cpu();
    if let Some(pid) = current_pid() {
        if let Some(task) = tasks.get_mut(pid) {
            if task.state == TaskState::Running {
                task.slice_remaining = task.slice_remaining.saturating_sub(1);
                if task.slice_remaining == 0 && task.is_runnable() {
                    task.need_resched = true;
                    cpu.set_need_resched(true);
                }
            }
        }
    }
}

/// Per-AP tick work: the global counter belongs to the boot CPU, but each
/// CPU charges its own running task.
pub fn charge_slice_local() {
    let _irq = IrqGuard::new();
    let mut guard = table::lock();
    let Some(tasks) = guard.as_mut() else {
        return;
    };
    drain_pending_wakes_locked(tasks);
    charge_current_locked(tasks);
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerStats {
    pub cpu_id: usize,
    pub current: Option<Pid>,
    pub runqueue_len: usize,
    pub context_switches: u64,
    pub preemptions: u64,
    pub timer_ticks: u64,
}

pub fn stats() -> SchedulerStats {
    let cpu = percpu::this_cpu();
    SchedulerStats {
        cpu_id: cpu.cpu_id as usize,
        current: cpu.current_pid(),
        runqueue_len: cpu.run_queue.lock().len(),
        context_switches: cpu.counters.context_switches.load(Ordering::Relaxed),
        preemptions: cpu.counters.preemptions.load(Ordering::Relaxed),
        timer_ticks: cpu.counters.timer_ticks.load(Ordering::Relaxed),
    }
}
