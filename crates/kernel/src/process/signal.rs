//! Signal subsystem: per-task masks, dispositions, delivery, and the
//! tick-driven alarm/interval timers.
//!
//! Kill and stop are not maskable and not catchable. Everything else goes
//! through the disposition table: ignore, default action, or a user
//! handler entered by rewriting the saved user context on the way back to
//! user mode and unwound again by sigreturn.

use alloc::collections::VecDeque;

use crate::arch::UserContext;
use crate::error::{Errno, Result};
use crate::process::table::TaskTable;
use crate::process::task::{Pid, TaskState};

pub const NSIG: usize = 32;

/// Signal numbers (POSIX standard)
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    SIGHUP = 1,
    SIGINT = 2,
    SIGQUIT = 3,
    SIGILL = 4,
    SIGTRAP = 5,
    SIGABRT = 6,
    SIGBUS = 7,
    SIGFPE = 8,
    SIGKILL = 9,
    SIGUSR1 = 10,
    SIGSEGV = 11,
    SIGUSR2 = 12,
    SIGPIPE = 13,
    SIGALRM = 14,
    SIGTERM = 15,
    SIGCHLD = 17,
    SIGCONT = 18,
    SIGSTOP = 19,
    SIGTSTP = 20,
    SIGTTIN = 21,
    SIGTTOU = 22,
}

impl Signal {
    pub fn from_u32(signo: u32) -> Option<Self> {
        match signo {
            1 => Some(Signal::SIGHUP),
            2 => Some(Signal::SIGINT),
            3 => Some(Signal::SIGQUIT),
            4 => Some(Signal::SIGILL),
            5 => Some(Signal::SIGTRAP),
            6 => Some(Signal::SIGABRT),
            7 => Some(Signal::SIGBUS),
            8 => Some(Signal::SIGFPE),
            9 => Some(Signal::SIGKILL),
            10 => Some(Signal::SIGUSR1),
            11 => Some(Signal::SIGSEGV),
            12 => Some(Signal::SIGUSR2),
            13 => Some(Signal::SIGPIPE),
            14 => Some(Signal::SIGALRM),
            15 => Some(Signal::SIGTERM),
            17 => Some(Signal::SIGCHLD),
            18 => Some(Signal::SIGCONT),
            19 => Some(Signal::SIGSTOP),
            20 => Some(Signal::SIGTSTP),
            21 => Some(Signal::SIGTTIN),
            22 => Some(Signal::SIGTTOU),
            _ => None,
        }
    }

    pub fn to_u32(self) -> u32 {
        self as u32
    }

    /// SIGKILL and SIGSTOP can be neither caught, blocked, nor ignored.
    pub fn is_catchable(self) -> bool {
        !matches!(self, Signal::SIGKILL | Signal::SIGSTOP)
    }

    pub fn default_action(self) -> DefaultAction {
        match self {
            Signal::SIGCHLD => DefaultAction::Ignore,
            Signal::SIGCONT => DefaultAction::Continue,
            Signal::SIGSTOP | Signal::SIGTSTP | Signal::SIGTTIN | Signal::SIGTTOU => {
                DefaultAction::Stop
            }
            Signal::SIGQUIT
            | Signal::SIGILL
            | Signal::SIGTRAP
            | Signal::SIGABRT
            | Signal::SIGBUS
            | Signal::SIGFPE
            | Signal::SIGSEGV => DefaultAction::Core,
            _ => DefaultAction::Terminate,
        }
    }
}

/// Default-action classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultAction {
    Terminate,
    /// Terminates too; there is no dumper behind it, but waiters can tell.
    Core,
    Stop,
    Continue,
    Ignore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Default,
    Ignore,
    /// User handler entry point.
    Handler(u64),
}

#[derive(Debug, Clone, Copy)]
pub struct SigAction {
    pub disposition: Disposition,
    /// Additional signals blocked while the handler runs.
    pub mask: u64,
    pub flags: u32,
}

impl Default for SigAction {
    fn default() -> Self {
        Self {
            disposition: Disposition::Default,
            mask: 0,
            flags: 0,
        }
    }
}

/// Queued-signal information.
#[derive(Debug, Clone, Copy)]
pub struct SigInfo {
    pub signo: u32,
    pub sender: Pid,
}

fn bit(sig: Signal) -> u64 {
    1u64 << (sig.to_u32() - 1)
}

/// Per-task signal state.
#[derive(Clone)]
pub struct SignalState {
    pending: u64,
    blocked: u64,
    actions: [SigAction; NSIG],
    /// Info entries for queued signals, oldest first.
    queue: VecDeque<SigInfo>,
    /// Alarm deadline in ticks.
    pub alarm_deadline: Option<u64>,
    /// Interval timer: next deadline and re-arm period (0 = one-shot).
    pub itimer_deadline: Option<u64>,
    pub itimer_period: u64,
}

impl SignalState {
    pub fn new() -> Self {
        Self {
            pending: 0,
            blocked: 0,
            actions: [SigAction::default(); NSIG],
            queue: VecDeque::new(),
            alarm_deadline: None,
            itimer_deadline: None,
            itimer_period: 0,
        }
    }

    pub fn pending_mask(&self) -> u64 {
        self.pending
    }

    pub fn blocked_mask(&self) -> u64 {
        self.blocked
    }

    pub fn set_blocked_mask(&mut self, mask: u64) {
        // kill/stop stay unmaskable
        self.blocked = mask & !(bit(Signal::SIGKILL) | bit(Signal::SIGSTOP));
    }

    pub fn set_pending(&mut self, sig: Signal, sender: Pid) {
        self.pending |= bit(sig);
        if self.queue.len() < NSIG {
            self.queue.push_back(SigInfo {
                signo: sig.to_u32(),
                sender,
            });
        }
    }

    pub fn clear_pending(&mut self, sig: Signal) {
        self.pending &= !bit(sig);
        self.queue.retain(|info| info.signo != sig.to_u32());
    }

    pub fn is_pending(&self, sig: Signal) -> bool {
        self.pending & bit(sig) != 0
    }

    /// Any pending, non-blocked signal? This is the signal-aware wakeup
    /// predicate the scheduler consults.
    pub fn has_deliverable(&self) -> bool {
        self.pending & !self.blocked != 0
    }

    /// Lowest-numbered deliverable signal.
    pub fn next_deliverable(&self) -> Option<Signal> {
        let deliverable = self.pending & !self.blocked;
        if deliverable == 0 {
            return None;
        }
        Signal::from_u32(deliverable.trailing_zeros() + 1)
    }

    pub fn action(&self, sig: Signal) -> SigAction {
        self.actions[(sig.to_u32() - 1) as usize]
    }

    pub fn set_action(&mut self, sig: Signal, action: SigAction) -> Result<()> {
        if !sig.is_catchable() && !matches!(action.disposition, Disposition::Default) {
            return Err(Errno::EINVAL);
        }
        self.actions[(sig.to_u32() - 1) as usize] = action;
        Ok(())
    }

    /// Handler entry: block the handler mask plus the signal itself.
    fn enter_handler(&mut self, sig: Signal, action: &SigAction) {
        self.blocked |= action.mask | bit(sig);
        self.blocked &= !(bit(Signal::SIGKILL) | bit(Signal::SIGSTOP));
    }
}

impl Default for SignalState {
    fn default() -> Self {
        Self::new()
    }
}

/// Signal frame pushed to the user stack on handler entry; sigreturn
/// restores from it. Nested handlers stay consistent because the blocked
/// mask travels in the frame.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SigFrame {
    pub uctx: UserContext,
    pub blocked: u64,
    pub signo: u64,
}

/// System V red zone below the user stack pointer.
const REDZONE: u64 = 128;

/// What the return-to-user path has to do after a delivery check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivered {
    /// Nothing pending.
    None,
    /// Saved context was rewritten to enter a handler.
    Handler { signo: u32, frame: u64 },
    /// The task terminated; the caller must schedule away.
    Terminated,
    /// The task stopped; the caller must schedule away.
    Stopped,
}

/// Send `sig` to `pid`. Caller holds the scheduler lock.
pub fn send_signal_locked(tasks: &mut TaskTable, pid: Pid, sig: Signal, sender: Pid) -> Result<()> {
    let task = tasks.get_mut(pid).ok_or(Errno::ESRCH)?;
    if task.has_exited {
        return Err(Errno::ESRCH);
    }

    match sig {
        // Unmaskable, uncatchable: terminate now.
        Signal::SIGKILL => {
            terminate_locked(tasks, pid, sig);
            Ok(())
        }
        // Unmaskable, uncatchable: stop now.
        Signal::SIGSTOP => {
            stop_locked(tasks, pid);
            Ok(())
        }
        Signal::SIGCONT => {
            continue_locked(tasks, pid, sender);
            Ok(())
        }
        _ => {
            let action = task.signals.action(sig);
            match action.disposition {
                Disposition::Ignore => Ok(()),
                Disposition::Handler(_) => {
                    task.signals.set_pending(sig, sender);
                    crate::process::scheduler::wake_task_locked(tasks, pid);
                    Ok(())
                }
                Disposition::Default => match sig.default_action() {
                    DefaultAction::Ignore => Ok(()),
                    DefaultAction::Continue => {
                        continue_locked(tasks, pid, sender);
                        Ok(())
                    }
                    DefaultAction::Stop => {
                        stop_locked(tasks, pid);
                        Ok(())
                    }
                    DefaultAction::Terminate | DefaultAction::Core => {
                        // Mark pending so a blocked sleeper wakes with
                        // EINTR; the termination is enacted on its way
                        // back to user mode, or right here if it is not
                        // running anywhere.
                        task.signals.set_pending(sig, sender);
                        if task.state == TaskState::Running {
                            task.need_resched = true;
                            nudge_cpu(task.cpu);
                        } else {
                            terminate_locked(tasks, pid, sig);
                        }
                        Ok(())
                    }
                },
            }
        }
    }
}

fn nudge_cpu(cpu: u32) {
    if crate::smp::smp_active() && cpu as usize != crate::smp::percpu::this_cpu_id() {
        crate::smp::ipi::send_reschedule(cpu as usize);
    } else if let Some(area) = crate::smp::percpu::get(cpu as usize) {
        area.set_need_resched(true);
    }
}

/// Default-terminate: exit code 128 + signo, terminating signal recorded.
pub(crate) fn terminate_locked(tasks: &mut TaskTable, pid: Pid, sig: Signal) {
    let signo = sig.to_u32();
    crate::process::wait::exit_task_locked(tasks, pid, 128 + signo as i32, signo as u8);
}

fn stop_locked(tasks: &mut TaskTable, pid: Pid) {
    let Some(task) = tasks.get_mut(pid) else {
        return;
    };
    match task.state {
        TaskState::Zombie => {}
        TaskState::Stopped => {}
        state => {
            task.state = TaskState::Stopped;
            task.wait_channel = None;
            task.wakeup_tick = None;
            let cpu = task.cpu;
            if state == TaskState::Ready {
                if let Some(area) = crate::smp::percpu::get(cpu as usize) {
                    area.run_queue.lock().remove(pid);
                }
            }
            if state == TaskState::Running {
                task.need_resched = true;
                nudge_cpu(cpu);
            }
        }
    }
}

fn continue_locked(tasks: &mut TaskTable, pid: Pid, sender: Pid) {
    let Some(task) = tasks.get_mut(pid) else {
        return;
    };
    if task.state != TaskState::Stopped {
        return;
    }
    task.signals.set_pending(Signal::SIGCONT, sender);
    task.state = TaskState::Ready;
    let cpu = task.cpu;
    crate::process::scheduler::enqueue_locked(tasks, pid);
    nudge_cpu(cpu);
}

/// Deliver one pending signal to the current task on the kernel-to-user
/// path. Rewrites the saved user context for handler dispositions.
pub fn deliver_pending_current() -> Delivered {
    let _irq = crate::sync::IrqGuard::new();
    let mut guard = crate::process::table::lock();
    let Some(tasks) = guard.as_mut() else {
        return Delivered::None;
    };
    let Some(pid) = crate::process::scheduler::current_pid() else {
        return Delivered::None;
    };
    let (sig, action, root, frame) = {
        let Some(task) = tasks.get_mut(pid) else {
            return Delivered::None;
        };
        if task.has_exited {
            return Delivered::Terminated;
        }
        let Some(sig) = task.signals.next_deliverable() else {
            return Delivered::None;
        };
        task.signals.clear_pending(sig);
        let action = task.signals.action(sig);
        let frame = SigFrame {
            uctx: task.uctx,
            blocked: task.signals.blocked_mask(),
            signo: sig.to_u32() as u64,
        };
        (sig, action, task.effective_root(), frame)
    };

    match action.disposition {
        Disposition::Ignore => Delivered::None,
        Disposition::Handler(entry) if sig.is_catchable() => {
            let size = core::mem::size_of::<SigFrame>() as u64;
            let sp = (frame.uctx.rsp.saturating_sub(REDZONE + size)) & !0xF;
            let bytes = unsafe {
                core::slice::from_raw_parts(&frame as *const SigFrame as *const u8, size as usize)
            };
            if crate::syscall::uaccess::copy_to_user_root(root, sp, bytes).is_err() {
                // Unwritable user stack: the handler cannot run.
                crate::warn!("signal: sigframe push failed for pid {}, killing", pid);
                terminate_locked(tasks, pid, Signal::SIGSEGV);
                return Delivered::Terminated;
            }
            let task = tasks.get_mut(pid).expect("delivery target vanished");
            task.signals.enter_handler(sig, &action);
            task.uctx.rip = entry;
            task.uctx.rsp = sp;
            Delivered::Handler {
                signo: sig.to_u32(),
                frame: sp,
            }
        }
        // Uncatchable or default disposition reached delivery.
        _ => match sig.default_action() {
            DefaultAction::Ignore | DefaultAction::Continue => Delivered::None,
            DefaultAction::Stop => {
                stop_locked(tasks, pid);
                Delivered::Stopped
            }
            DefaultAction::Terminate | DefaultAction::Core => {
                terminate_locked(tasks, pid, sig);
                Delivered::Terminated
            }
        },
    }
}

/// sigreturn: restore the context and blocked mask saved in the frame the
/// handler was entered with. Returns the restored result register.
pub fn sigreturn_current(frame_ptr: u64) -> Result<u64> {
    let _irq = crate::sync::IrqGuard::new();
    let mut guard = crate::process::table::lock();
    let tasks = guard.as_mut().ok_or(Errno::EINVAL)?;
    let pid = crate::process::scheduler::current_pid().ok_or(Errno::EINVAL)?;
    let task = tasks.get_mut(pid).ok_or(Errno::ESRCH)?;

    let root = task.effective_root();
    let mut frame = SigFrame {
        uctx: UserContext::default(),
        blocked: 0,
        signo: 0,
    };
    let size = core::mem::size_of::<SigFrame>();
    let bytes = unsafe {
        core::slice::from_raw_parts_mut(&mut frame as *mut SigFrame as *mut u8, size)
    };
    crate::syscall::uaccess::copy_from_user_root(root, frame_ptr, bytes)?;

    task.uctx = frame.uctx;
    task.signals.set_blocked_mask(frame.blocked);
    Ok(frame.uctx.rax)
}

/// Tick-driven timer sweep over every task: post SIGALRM for expired
/// alarms and interval timers, re-arm periodic ones. Caller holds the
/// scheduler lock.
pub fn timer_sweep_locked(tasks: &mut TaskTable, now: u64) {
    let mut fired: alloc::vec::Vec<Pid> = alloc::vec::Vec::new();
    tasks.for_each_mut(|task| {
        if task.has_exited {
            return;
        }
        let mut fire = false;
        if let Some(deadline) = task.signals.alarm_deadline {
            if now >= deadline {
                task.signals.alarm_deadline = None;
                fire = true;
            }
        }
        if let Some(deadline) = task.signals.itimer_deadline {
            if now >= deadline {
                task.signals.itimer_deadline = if task.signals.itimer_period > 0 {
                    Some(now + task.signals.itimer_period)
                } else {
                    None
                };
                fire = true;
            }
        }
        if fire {
            fired.push(task.pid);
        }
    });
    for pid in fired {
        let _ = send_signal_locked(tasks, pid, Signal::SIGALRM, pid);
    }
}
