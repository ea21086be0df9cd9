//! Task structure and creation paths.
//!
//! A task is one schedulable thread of control. When it is not running,
//! its only live kernel-mode register state is the saved stack pointer;
//! everything else sits in the frames the context switch and the
//! trampolines pop.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec;

use crate::arch::{self, UserContext};
use crate::config::KERNEL_STACK_SIZE;
use crate::error::KernelError;
use crate::mm::AddressSpace;
use crate::process::fd::FdTable;
use crate::process::signal::SignalState;

pub type Pid = u32;

/// Pid of the bootstrap/init task: reparent target for orphans.
pub const INIT_PID: Pid = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// On some CPU's run queue, waiting for the CPU.
    Ready,
    /// The current task of exactly one CPU.
    Running,
    /// Waiting on a channel, a deadline, or both.
    Blocked,
    /// Stopped by a stop-class signal; runnable again on continue.
    Stopped,
    /// Exited but not yet reaped.
    Zombie,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    /// Shares the kernel address space.
    Kernel,
    /// Owns a private address space.
    User,
}

/// Owning kernel stack allocation with an aligned top.
pub struct KernelStack {
    mem: Box<[u8]>,
}

impl KernelStack {
    pub fn new() -> Result<Self, KernelError> {
        let mem = vec![0u8; KERNEL_STACK_SIZE].into_boxed_slice();
        Ok(Self { mem })
    }

    /// 16-byte aligned top of the stack.
    pub fn top(&self) -> u64 {
        (self.mem.as_ptr() as u64 + self.mem.len() as u64) & !0xF
    }
}

impl core::fmt::Debug for KernelStack {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("KernelStack")
            .field("top", &self.top())
            .finish()
    }
}

/// Main task structure
pub struct Task {
    pub pid: Pid,
    pub name: String,
    pub privilege: Privilege,
    pub state: TaskState,

    // Process tree: owning child edge, back-reference parent edge.
    pub parent: Option<Pid>,
    pub first_child: Option<Pid>,
    pub next_sibling: Option<Pid>,

    // Scheduling. `saved_sp == 0` means "may not be resumed".
    pub saved_sp: u64,
    pub slice_remaining: u32,
    pub need_resched: bool,
    /// Address of the interrupt frame while preempted from an interrupt.
    pub preempt_frame: u64,
    pub wakeup_tick: Option<u64>,
    pub wait_channel: Option<usize>,
    /// Home CPU; ready tasks are queued and picked only there.
    pub cpu: u32,

    // Address space; `None` means the kernel root.
    pub aspace: Option<AddressSpace>,
    pub kstack: Option<KernelStack>,
    pub user_stack_top: u64,

    // Exit protocol.
    pub exit_code: i32,
    /// Terminating signal, 0 for a voluntary exit.
    pub exit_signal: u8,
    pub has_exited: bool,
    pub is_fork_child: bool,

    pub files: FdTable,
    pub signals: SignalState,
    /// Saved user context from the last syscall entry; rewritten by signal
    /// delivery, restored by sigreturn.
    pub uctx: UserContext,
}

impl Task {
    fn blank(pid: Pid, name: String, privilege: Privilege) -> Self {
        Self {
            pid,
            name,
            privilege,
            state: TaskState::Ready,
            parent: None,
            first_child: None,
            next_sibling: None,
            saved_sp: 0,
            slice_remaining: crate::config::time_slice_ticks(),
            need_resched: false,
            preempt_frame: 0,
            wakeup_tick: None,
            wait_channel: None,
            cpu: 0,
            aspace: None,
            kstack: None,
            user_stack_top: 0,
            exit_code: 0,
            exit_signal: 0,
            has_exited: false,
            is_fork_child: false,
            files: FdTable::new(),
            signals: SignalState::new(),
            uctx: UserContext::default(),
        }
    }

    /// The boot processor's initial context, task id 0. Runs on the boot
    /// stack, so it has no owned kernel stack; its saved stack pointer is
    /// written by its first switch away.
    pub fn new_bootstrap() -> Self {
        let mut task = Self::blank(INIT_PID, String::from("init"), Privilege::Kernel);
        task.state = TaskState::Running;
        task
    }

    /// Kernel task from a fresh stack (creation path 1): a synthetic
    /// callee-saved frame of zeros below the kernel-task trampoline.
    pub fn new_kernel(
        pid: Pid,
        name: &str,
        entry: arch::KernelTaskEntry,
        arg: usize,
    ) -> Result<Self, KernelError> {
        let kstack = KernelStack::new()?;
        let mut task = Self::blank(pid, String::from(name), Privilege::Kernel);
        task.saved_sp = unsafe { arch::build_kernel_task_frame(kstack.top(), entry, arg) };
        task.kstack = Some(kstack);
        Ok(task)
    }

    /// User task from a loaded image (creation path 2): an iret frame to
    /// `entry` on the image's stack, entered through the user-mode
    /// trampoline on first schedule.
    pub fn new_user(
        pid: Pid,
        name: &str,
        entry: u64,
        mut aspace: AddressSpace,
    ) -> Result<Self, KernelError> {
        let kstack = KernelStack::new()?;
        aspace.map_initial_stack()?;
        let user_stack_top = aspace.stack_top;
        let mut task = Self::blank(pid, String::from(name), Privilege::User);
        task.saved_sp = unsafe { arch::build_user_task_frame(kstack.top(), entry, user_stack_top) };
        task.kstack = Some(kstack);
        task.user_stack_top = user_stack_top;
        task.aspace = Some(aspace);
        Ok(task)
    }

    /// Fork child (creation path 3): inherited state with fresh identity,
    /// and a kernel stack framed so its first scheduling irets to the
    /// parent's syscall return site with the parent's user callee-saved
    /// registers and result 0.
    #[allow(clippy::too_many_arguments)]
    pub fn new_fork_child(
        pid: Pid,
        name: String,
        aspace: crate::mm::AddressSpace,
        kstack: KernelStack,
        files: FdTable,
        signals: SignalState,
        uctx: UserContext,
        user_stack_top: u64,
    ) -> Self {
        let mut task = Self::blank(pid, name, Privilege::User);
        task.saved_sp = unsafe { arch::build_fork_child_frame(kstack.top(), &uctx) };
        task.kstack = Some(kstack);
        task.aspace = Some(aspace);
        task.files = files;
        task.signals = signals;
        task.uctx = uctx;
        task.user_stack_top = user_stack_top;
        task.is_fork_child = true;
        task
    }

    /// Page-table root this task runs on.
    pub fn effective_root(&self) -> u64 {
        self.aspace
            .as_ref()
            .map(|a| a.root())
            .unwrap_or_else(crate::mm::kernel_root)
    }

    /// Kernel-stack top for TSS.RSP0, if this task owns a stack.
    pub fn kernel_stack_top(&self) -> Option<u64> {
        self.kstack.as_ref().map(|k| k.top())
    }

    pub fn is_runnable(&self) -> bool {
        !self.has_exited && matches!(self.state, TaskState::Ready | TaskState::Running)
    }

    /// Flip to zombie. The saved stack pointer is invalidated so the task
    /// can never be resumed.
    pub fn mark_exited(&mut self, code: i32, signal: u8) {
        self.exit_code = code;
        self.exit_signal = signal;
        self.has_exited = true;
        self.state = TaskState::Zombie;
        self.saved_sp = 0;
        self.wait_channel = None;
        self.wakeup_tick = None;
    }

    pub fn is_zombie(&self) -> bool {
        self.state == TaskState::Zombie
    }

    /// Reapable: zombie with the exit protocol completed.
    pub fn is_reapable(&self) -> bool {
        self.is_zombie() && self.has_exited
    }
}

impl core::fmt::Debug for Task {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Task")
            .field("pid", &self.pid)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("parent", &self.parent)
            .field("cpu", &self.cpu)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_task_has_switchable_frame() {
        let _g = crate::test_support::kernel_lock();
        crate::test_support::reset_mm();
        extern "C" fn body(_: usize) {}
        let task = Task::new_kernel(7, "worker", body, 0).unwrap();
        assert_ne!(task.saved_sp, 0);
        let top = task.kernel_stack_top().unwrap();
        assert!(task.saved_sp < top);
        assert_eq!(task.privilege, Privilege::Kernel);
        assert!(task.aspace.is_none());
    }

    #[test]
    fn exit_invalidates_saved_sp() {
        let _g = crate::test_support::kernel_lock();
        crate::test_support::reset_mm();
        extern "C" fn body(_: usize) {}
        let mut task = Task::new_kernel(8, "doomed", body, 0).unwrap();
        task.mark_exited(3, 0);
        assert!(task.is_reapable());
        assert_eq!(task.saved_sp, 0);
        assert_eq!(task.exit_code, 3);
    }

    #[test]
    fn user_task_maps_stack_and_frames_iret() {
        let _g = crate::test_support::kernel_lock();
        crate::test_support::reset_mm();
        let aspace = AddressSpace::new_user().unwrap();
        let task = Task::new_user(9, "app", 0x40_0000, aspace).unwrap();
        assert_eq!(task.privilege, Privilege::User);
        let aspace = task.aspace.as_ref().unwrap();
        let top = task.user_stack_top;
        assert!(aspace.translate(top - crate::mm::PAGE_SIZE as u64).is_some());
        assert_ne!(task.saved_sp, 0);
    }
}
