//! Per-CPU areas.
//!
//! One page-aligned area per CPU, reachable in O(1) through the CPU-local
//! base register: the area's first field is its own address, so `gs:[0]`
//! yields the area pointer in one load. Fields touched from the hot paths
//! (preempt count) sit at compile-time known offsets and are updated with
//! a single GS-relative instruction.
//!
//! Until [`crate::process::scheduler::enable_smp`] flips the process-wide
//! flag, the boot processor's area (slot 0) stands in for any CPU that has
//! not installed its base register yet.

use core::cell::UnsafeCell;
use core::mem::offset_of;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, Ordering};

use alloc::boxed::Box;
use alloc::collections::VecDeque;

use crate::arch;
use crate::config::MAX_CPUS;
use crate::process::Pid;
use crate::sync::SpinLock;

/// Sentinel for "no task".
pub const NO_TASK: u32 = u32::MAX;

/// x86_64 task-state segment. Only RSP0 is written at runtime; the rest is
/// fixed by the bring-up code that loads TR.
#[repr(C, packed(4))]
pub struct Tss {
    reserved0: u32,
    rsp: [u64; 3],
    reserved1: u64,
    ist: [u64; 7],
    reserved2: u64,
    reserved3: u16,
    iomap_base: u16,
}

impl Tss {
    const fn new() -> Self {
        Self {
            reserved0: 0,
            rsp: [0; 3],
            reserved1: 0,
            ist: [0; 7],
            reserved2: 0,
            reserved3: 0,
            iomap_base: core::mem::size_of::<Tss>() as u16,
        }
    }
}

/// Per-CPU ready queue: a FIFO of pids protected by the per-CPU run-queue
/// lock. A task appears in at most one queue, and only while ready.
pub struct RunQueue {
    queue: VecDeque<Pid>,
}

impl RunQueue {
    const fn new() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }

    pub fn push(&mut self, pid: Pid) {
        self.queue.push_back(pid);
    }

    pub fn pop(&mut self) -> Option<Pid> {
        self.queue.pop_front()
    }

    pub fn remove(&mut self, pid: Pid) {
        self.queue.retain(|&p| p != pid);
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.queue.contains(&pid)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Pid> {
        self.queue.iter()
    }
}

/// Per-CPU counters.
#[derive(Debug, Default)]
pub struct CpuCounters {
    pub context_switches: AtomicU64,
    pub preemptions: AtomicU64,
    pub timer_ticks: AtomicU64,
    pub ipis: AtomicU64,
}

#[repr(C, align(4096))]
pub struct PerCpu {
    /// Must stay the first field: `gs:[0]` reads it.
    self_ptr: AtomicU64,
    pub cpu_id: u32,
    pub apic_id: u32,
    /// Preemption counter; > 0 defers timer preemption. GS-relative
    /// add/sub only, hence the cell.
    preempt_count: UnsafeCell<u32>,
    /// Nested-interrupt depth.
    irq_depth: AtomicU32,
    current: AtomicU32,
    idle: AtomicU32,
    need_resched: AtomicBool,
    /// Voluntary yields since the bootstrap task last ran here.
    pub bootstrap_yields: AtomicU32,
    kernel_stack_top: AtomicU64,
    active_root: AtomicU64,
    pub run_queue: SpinLock<RunQueue>,
    pub counters: CpuCounters,
    tss: UnsafeCell<Tss>,
}

// Safety: cross-CPU access goes through atomics and the run-queue lock;
// preempt_count and the TSS are only touched by the owning CPU.
unsafe impl Sync for PerCpu {}

const PREEMPT_OFFSET: usize = offset_of!(PerCpu, preempt_count);

/// Registry of allocated areas, indexed by cpu id.
static AREAS: [AtomicPtr<PerCpu>; MAX_CPUS] = [const { AtomicPtr::new(core::ptr::null_mut()) }; MAX_CPUS];

impl PerCpu {
    /// Allocate and register the area for `cpu_id`. Page-aligned by type.
    pub fn allocate(cpu_id: usize, apic_id: u32) -> &'static PerCpu {
        assert!(cpu_id < MAX_CPUS, "cpu id out of range");
        let area = Box::leak(Box::new(PerCpu {
            self_ptr: AtomicU64::new(0),
            cpu_id: cpu_id as u32,
            apic_id,
            preempt_count: UnsafeCell::new(0),
            irq_depth: AtomicU32::new(0),
            current: AtomicU32::new(NO_TASK),
            idle: AtomicU32::new(NO_TASK),
            need_resched: AtomicBool::new(false),
            bootstrap_yields: AtomicU32::new(0),
            kernel_stack_top: AtomicU64::new(0),
            active_root: AtomicU64::new(0),
            run_queue: SpinLock::new(RunQueue::new()),
            counters: CpuCounters::default(),
            tss: UnsafeCell::new(Tss::new()),
        }));
        area.self_ptr.store(area as *const PerCpu as u64, Ordering::Release);
        AREAS[cpu_id].store(area as *mut PerCpu, Ordering::Release);
        area
    }

    /// Point this CPU's base register at its area.
    ///
    /// # Safety
    /// Must run on the CPU the area belongs to, exactly once per CPU.
    pub unsafe fn install(cpu_id: usize) {
        let area = get(cpu_id).expect("per-CPU area not allocated");
        arch::install_percpu_base(area as *const PerCpu as u64);
    }

    pub fn current_pid(&self) -> Option<Pid> {
        match self.current.load(Ordering::Acquire) {
            NO_TASK => None,
            pid => Some(pid),
        }
    }

    pub fn set_current_pid(&self, pid: Option<Pid>) {
        self.current.store(pid.unwrap_or(NO_TASK), Ordering::Release);
    }

    pub fn idle_pid(&self) -> Option<Pid> {
        match self.idle.load(Ordering::Acquire) {
            NO_TASK => None,
            pid => Some(pid),
        }
    }

    pub fn set_idle_pid(&self, pid: Pid) {
        self.idle.store(pid, Ordering::Release);
    }

    pub fn need_resched(&self) -> bool {
        self.need_resched.load(Ordering::Acquire)
    }

    pub fn set_need_resched(&self, value: bool) {
        self.need_resched.store(value, Ordering::Release);
    }

    pub fn kernel_stack_top(&self) -> u64 {
        self.kernel_stack_top.load(Ordering::Acquire)
    }

    /// CPU-local cache of the running task's kernel-stack top, updated by
    /// the address-space switch before any user instruction runs.
    pub fn set_kernel_stack_top(&self, top: u64) {
        self.kernel_stack_top.store(top, Ordering::Release);
    }

    pub fn active_root(&self) -> u64 {
        self.active_root.load(Ordering::Acquire)
    }

    pub fn set_active_root(&self, root: u64) {
        self.active_root.store(root, Ordering::Release);
    }

    /// Write the next task's kernel-stack top into TSS.RSP0, so the next
    /// user-to-kernel transition lands on that stack. RSP0 sits at offset
    /// 4, so the access is unaligned by the TSS layout itself.
    pub fn set_tss_rsp0(&self, top: u64) {
        unsafe {
            let tss = self.tss.get();
            core::ptr::addr_of_mut!((*tss).rsp[0]).write_unaligned(top);
        }
    }

    pub fn tss_rsp0(&self) -> u64 {
        unsafe {
            let tss = self.tss.get();
            core::ptr::addr_of!((*tss).rsp[0]).read_unaligned()
        }
    }

    /// Address handed to the bring-up code that loads TR.
    pub fn tss_ptr(&self) -> *mut Tss {
        self.tss.get()
    }

    pub fn preempt_count(&self) -> u32 {
        unsafe { core::ptr::read_volatile(self.preempt_count.get()) }
    }

    pub fn irq_enter(&self) {
        self.irq_depth.fetch_add(1, Ordering::AcqRel);
    }

    pub fn irq_exit(&self) {
        self.irq_depth.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn irq_depth(&self) -> u32 {
        self.irq_depth.load(Ordering::Acquire)
    }
}

/// Area of a specific CPU, if allocated.
pub fn get(cpu_id: usize) -> Option<&'static PerCpu> {
    if cpu_id >= MAX_CPUS {
        return None;
    }
    let ptr = AREAS[cpu_id].load(Ordering::Acquire);
    if ptr.is_null() {
        None
    } else {
        Some(unsafe { &*ptr })
    }
}

/// Iterate over every allocated area.
pub fn for_each(mut f: impl FnMut(&'static PerCpu)) {
    for slot in AREAS.iter() {
        let ptr = slot.load(Ordering::Acquire);
        if !ptr.is_null() {
            f(unsafe { &*ptr });
        }
    }
}

/// This CPU's area: one GS-relative load once the base register is
/// installed, the boot processor's area as the pre-SMP fallback.
pub fn this_cpu() -> &'static PerCpu {
    let base = arch::percpu_base();
    if base != 0 {
        unsafe { &*(base as *const PerCpu) }
    } else {
        get(0).expect("boot per-CPU area not allocated")
    }
}

/// Id of the executing CPU; 0 before any area is installed.
pub fn this_cpu_id() -> usize {
    let base = arch::percpu_base();
    if base != 0 {
        unsafe { (*(base as *const PerCpu)).cpu_id as usize }
    } else {
        0
    }
}

/// Raise the preemption counter with one CPU-local instruction. No-op
/// until the base register is installed (single-threaded early boot).
#[inline]
pub fn preempt_disable() {
    if arch::percpu_base() != 0 {
        unsafe { arch::percpu_add32(PREEMPT_OFFSET, 1) };
    }
}

/// Lower the preemption counter. Deferred preemption is acted on by the
/// interrupt-return path, not here.
#[inline]
pub fn preempt_enable() {
    if arch::percpu_base() != 0 {
        unsafe { arch::percpu_sub32(PREEMPT_OFFSET, 1) };
    }
}

#[cfg(test)]
pub fn test_reset_areas() {
    for slot in AREAS.iter() {
        // Leak the old areas: raw pointers to them may still be recorded.
        slot.store(core::ptr::null_mut(), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_pointer_is_first_field() {
        assert_eq!(offset_of!(PerCpu, self_ptr), 0);
        assert_eq!(core::mem::align_of::<PerCpu>(), 4096);
    }

    #[test]
    fn install_makes_this_cpu_o1() {
        let _g = crate::test_support::kernel_lock();
        crate::test_support::reset_percpu(2);
        unsafe { PerCpu::install(1) };
        assert_eq!(this_cpu_id(), 1);
        assert_eq!(this_cpu().cpu_id, 1);
        unsafe { PerCpu::install(0) };
        assert_eq!(this_cpu_id(), 0);
    }

    #[test]
    fn preempt_count_tracks_disable_depth() {
        let _g = crate::test_support::kernel_lock();
        crate::test_support::reset_percpu(1);
        let cpu = this_cpu();
        let base = cpu.preempt_count();
        preempt_disable();
        preempt_disable();
        assert_eq!(cpu.preempt_count(), base + 2);
        preempt_enable();
        preempt_enable();
        assert_eq!(cpu.preempt_count(), base);
    }

    #[test]
    fn tss_rsp0_round_trips() {
        let _g = crate::test_support::kernel_lock();
        crate::test_support::reset_percpu(1);
        let cpu = this_cpu();
        cpu.set_tss_rsp0(0xFFFF_8000_1234_5000);
        assert_eq!(cpu.tss_rsp0(), 0xFFFF_8000_1234_5000);
    }
}
