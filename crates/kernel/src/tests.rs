//! End-to-end scenarios and cross-module invariants, driven through the
//! host arch shim and the simulated physical memory.

use proptest::prelude::*;

use crate::interrupts::TrapFrame;
use crate::mm::address_space::{MapFlags, ProtFlags};
use crate::process::scheduler::{self, WakeReason};
use crate::process::signal::{self, Disposition, SigAction, Signal};
use crate::process::table;
use crate::process::task::{Pid, TaskState, INIT_PID};
use crate::process::{fork, wait};
use crate::smp::percpu;
use crate::syscall::handlers;
use crate::test_support as fixture;

const PROT_RW: u32 = (ProtFlags::READ.bits() | ProtFlags::WRITE.bits()) as u32;
const MAP_PRIVATE_ANON: u32 = (MapFlags::PRIVATE.bits() | MapFlags::ANONYMOUS.bits()) as u32;
const MAP_SHARED_ANON: u32 = (MapFlags::SHARED.bits() | MapFlags::ANONYMOUS.bits()) as u32;

fn task_state(pid: Pid) -> Option<TaskState> {
    let guard = table::lock();
    guard.as_ref().unwrap().get(pid).map(|t| t.state)
}

fn on_queue(cpu: usize, pid: Pid) -> bool {
    percpu::get(cpu).unwrap().run_queue.lock().contains(pid)
}

// E1: fork, exit(42), waitpid returns the child id and 42 << 8.
#[test]
fn fork_exit_wait_round_trip() {
    let _g = fixture::kernel_lock();
    fixture::reset_kernel();
    let parent = fixture::spawn_user("parent", INIT_PID, 0);
    fixture::set_current(parent);

    let child = fork::do_fork().unwrap();
    assert!(child > 0 && child != parent);
    assert_eq!(task_state(child), Some(TaskState::Ready));

    fixture::exit_task(child, 42);
    assert_eq!(task_state(child), Some(TaskState::Zombie));

    let (reaped, status) = wait::do_wait4(-1, 0).unwrap();
    assert_eq!(reaped, child);
    assert_eq!(status, 10752);
    // at most one wait per child: nothing left to reap
    assert_eq!(wait::do_wait4(-1, 0).err(), Some(crate::error::Errno::ECHILD));
}

// E2: HELLO through a pipe across fork, EOF after the writer closes.
#[test]
fn pipe_through_fork() {
    let _g = fixture::kernel_lock();
    fixture::reset_kernel();
    let parent = fixture::spawn_user("parent", INIT_PID, 0);
    fixture::set_current(parent);

    let scratch = handlers::sys_mmap(0, 4096, PROT_RW, MAP_PRIVATE_ANON, -1, 0).unwrap();
    handlers::sys_pipe(scratch).unwrap();
    let read_raw = [
        fixture::peek_user(parent, scratch),
        fixture::peek_user(parent, scratch + 1),
        fixture::peek_user(parent, scratch + 2),
        fixture::peek_user(parent, scratch + 3),
    ];
    let rfd = i32::from_le_bytes(read_raw);
    let wfd = {
        let raw = [
            fixture::peek_user(parent, scratch + 4),
            fixture::peek_user(parent, scratch + 5),
            fixture::peek_user(parent, scratch + 6),
            fixture::peek_user(parent, scratch + 7),
        ];
        i32::from_le_bytes(raw)
    };

    let child = fork::do_fork().unwrap();

    // child: close the read end, write HELLO, exit 0
    fixture::set_current(child);
    handlers::sys_close(rfd).unwrap();
    let msg = scratch + 64;
    for (i, b) in b"HELLO".iter().enumerate() {
        fixture::poke_user(child, msg + i as u64, *b);
    }
    assert_eq!(handlers::sys_write(wfd, msg, 5).unwrap(), 5);
    fixture::exit_task(child, 0);

    // parent: close the write end, read 5 bytes, then see EOF
    fixture::set_current(parent);
    handlers::sys_close(wfd).unwrap();
    let dst = scratch + 128;
    assert_eq!(handlers::sys_read(rfd, dst, 5).unwrap(), 5);
    let got: alloc::vec::Vec<u8> = (0..5).map(|i| fixture::peek_user(parent, dst + i)).collect();
    assert_eq!(&got, b"HELLO");
    assert_eq!(handlers::sys_read(rfd, dst, 5).unwrap(), 0);
}

// E3: copy-on-write divergence after fork.
#[test]
fn cow_divergence_after_fork() {
    let _g = fixture::kernel_lock();
    fixture::reset_kernel();
    let parent = fixture::spawn_user("parent", INIT_PID, 0);
    fixture::set_current(parent);

    let a = handlers::sys_mmap(0, 4096, PROT_RW, MAP_PRIVATE_ANON, -1, 0).unwrap();
    fixture::poke_user(parent, a, 0xAA);

    let child = fork::do_fork().unwrap();
    assert_eq!(fixture::peek_user(child, a), 0xAA);

    fixture::poke_user(child, a, 0xBB);
    assert_eq!(fixture::peek_user(parent, a), 0xAA);
    assert_eq!(fixture::peek_user(child, a), 0xBB);
}

// Fork address semantics for MAP_SHARED: both sides see both writes.
#[test]
fn shared_mapping_stays_shared_across_fork() {
    let _g = fixture::kernel_lock();
    fixture::reset_kernel();
    let parent = fixture::spawn_user("parent", INIT_PID, 0);
    fixture::set_current(parent);

    let a = handlers::sys_mmap(0, 4096, PROT_RW, MAP_SHARED_ANON, -1, 0).unwrap();
    let child = fork::do_fork().unwrap();

    fixture::poke_user(parent, a, 0x11);
    assert_eq!(fixture::peek_user(child, a), 0x11);
    fixture::poke_user(child, a + 7, 0x22);
    assert_eq!(fixture::peek_user(parent, a + 7), 0x22);
}

// E4: kill(9) terminates; waitpid reports signal 9 in the low bits.
#[test]
fn kill_terminates_and_wait_reports_signal() {
    let _g = fixture::kernel_lock();
    fixture::reset_kernel();
    let parent = fixture::spawn_user("parent", INIT_PID, 0);
    fixture::set_current(parent);
    let child = fork::do_fork().unwrap();

    handlers::sys_kill(child as i64, 9).unwrap();
    assert_eq!(task_state(child), Some(TaskState::Zombie));
    {
        let guard = table::lock();
        let t = guard.as_ref().unwrap().get(child).unwrap();
        assert_eq!(t.exit_code, 128 + 9);
        assert!(!on_queue(0, child));
    }

    let (reaped, status) = wait::do_wait4(child as i64, 0).unwrap();
    assert_eq!(reaped, child);
    assert_eq!(status & 0x7f, 9);
}

// E5: two CPU-bound tasks share one CPU fairly under timer preemption.
#[test]
fn round_robin_progress_under_preemption() {
    let _g = fixture::kernel_lock();
    fixture::reset_kernel();
    let a = fixture::spawn_user("a", INIT_PID, 0);
    let b = fixture::spawn_user("b", INIT_PID, 0);
    fixture::set_current(a);

    let slice = crate::config::time_slice_ticks() as u64;
    let mut ran = std::collections::HashMap::new();
    let mut frame = TrapFrame::default();
    for _ in 0..4 * slice {
        let cur = scheduler::current_pid().unwrap();
        *ran.entry(cur).or_insert(0u64) += 1;
        crate::time::on_tick();
        let cpu = percpu::this_cpu();
        if cpu.need_resched() && cpu.preempt_count() == 0 {
            scheduler::preempt(&mut frame);
        }
    }
    let floor = slice - 1;
    assert!(*ran.get(&a).unwrap_or(&0) >= floor, "task a starved: {:?}", ran);
    assert!(*ran.get(&b).unwrap_or(&0) >= floor, "task b starved: {:?}", ran);
}

// E6: WNOHANG with a live child returns 0 immediately.
#[test]
fn wait_wnohang_returns_zero() {
    let _g = fixture::kernel_lock();
    fixture::reset_kernel();
    let parent = fixture::spawn_user("parent", INIT_PID, 0);
    fixture::set_current(parent);
    let child = fork::do_fork().unwrap();
    assert!(child > 0);

    let (pid, status) = wait::do_wait4(-1, wait::WNOHANG).unwrap();
    assert_eq!((pid, status), (0, 0));
}

// Property 3: a zombie planted on a run queue is never picked.
#[test]
fn zombies_are_never_scheduled() {
    let _g = fixture::kernel_lock();
    fixture::reset_kernel();
    let runner = fixture::spawn_user("runner", INIT_PID, 0);
    let doomed = fixture::spawn_user("doomed", INIT_PID, 0);
    fixture::set_current(runner);
    fixture::exit_task(doomed, 1);
    // force the invariant violation
    percpu::get(0).unwrap().run_queue.lock().push(doomed);

    scheduler::yield_now();
    assert_ne!(scheduler::current_pid(), Some(doomed));
}

// Property 4: orphans land under init exactly once.
#[test]
fn orphans_are_adopted_by_init() {
    let _g = fixture::kernel_lock();
    fixture::reset_kernel();
    let parent = fixture::spawn_user("parent", INIT_PID, 0);
    fixture::set_current(parent);
    let c1 = fork::do_fork().unwrap();
    let c2 = fork::do_fork().unwrap();

    fixture::exit_task(parent, 0);

    let guard = table::lock();
    let tasks = guard.as_ref().unwrap();
    for c in [c1, c2] {
        assert_eq!(tasks.get(c).unwrap().parent, Some(INIT_PID));
        let count = tasks
            .children_of(INIT_PID)
            .iter()
            .filter(|&&p| p == c)
            .count();
        assert_eq!(count, 1);
    }
}

// A parent blocked in wait is woken by the child's exit (the §5 ordering:
// blocked→ready implies has_exited is observable).
#[test]
fn child_exit_wakes_waiting_parent() {
    let _g = fixture::kernel_lock();
    fixture::reset_kernel();
    let parent = fixture::spawn_user("parent", INIT_PID, 0);
    fixture::set_current(parent);
    let child = fork::do_fork().unwrap();

    {
        let mut guard = table::lock();
        let tasks = guard.as_mut().unwrap();
        assert!(scheduler::block_current_locked(
            tasks,
            parent,
            crate::process::wait::wait_channel(parent),
            None
        ));
    }
    assert_eq!(task_state(parent), Some(TaskState::Blocked));

    fixture::exit_task(child, 7);
    assert_eq!(task_state(parent), Some(TaskState::Ready));
    {
        let guard = table::lock();
        assert!(guard.as_ref().unwrap().get(child).unwrap().has_exited);
    }
    fixture::set_current(parent);
    let (reaped, status) = wait::do_wait4(-1, 0).unwrap();
    assert_eq!((reaped, status), (child, 7 << 8));
}

// Property 7: handler entry + sigreturn restore context and mask bitwise.
#[test]
fn signal_delivery_round_trip() {
    let _g = fixture::kernel_lock();
    fixture::reset_kernel();
    let task = fixture::spawn_user("victim", INIT_PID, 0);
    fixture::set_current(task);

    let original = crate::arch::UserContext {
        rip: 0x40_1000,
        rsp: crate::mm::address_space::USER_STACK_TOP - 256,
        rflags: crate::arch::USER_RFLAGS,
        rax: 0x1234,
        rbx: 1,
        rbp: 2,
        r12: 3,
        r13: 4,
        r14: 5,
        r15: 6,
    };
    let original_blocked;
    {
        let mut guard = table::lock();
        let t = guard.as_mut().unwrap().get_mut(task).unwrap();
        t.uctx = original;
        t.signals.set_blocked_mask(1 << (Signal::SIGUSR2.to_u32() - 1));
        original_blocked = t.signals.blocked_mask();
        t.signals
            .set_action(
                Signal::SIGUSR1,
                SigAction {
                    disposition: Disposition::Handler(0x50_0000),
                    mask: 0,
                    flags: 0,
                },
            )
            .unwrap();
        let tasks = guard.as_mut().unwrap();
        signal::send_signal_locked(tasks, task, Signal::SIGUSR1, INIT_PID).unwrap();
    }

    let delivered = signal::deliver_pending_current();
    let frame_addr = match delivered {
        signal::Delivered::Handler { signo, frame } => {
            assert_eq!(signo, Signal::SIGUSR1.to_u32());
            frame
        }
        other => panic!("expected handler delivery, got {:?}", other),
    };
    {
        let guard = table::lock();
        let t = guard.as_ref().unwrap().get(task).unwrap();
        assert_eq!(t.uctx.rip, 0x50_0000);
        assert_ne!(t.uctx, original);
    }

    let restored_rax = signal::sigreturn_current(frame_addr).unwrap();
    assert_eq!(restored_rax, 0x1234);
    let guard = table::lock();
    let t = guard.as_ref().unwrap().get(task).unwrap();
    assert_eq!(t.uctx, original);
    assert_eq!(t.signals.blocked_mask(), original_blocked);
}

// Signal-aware wakeup: a blocked task with a handler-disposition signal
// pending goes ready without a channel wake.
#[test]
fn pending_signal_wakes_blocked_task() {
    let _g = fixture::kernel_lock();
    fixture::reset_kernel();
    let sleeper = fixture::spawn_user("sleeper", INIT_PID, 0);
    {
        let mut guard = table::lock();
        let tasks = guard.as_mut().unwrap();
        tasks
            .get_mut(sleeper)
            .unwrap()
            .signals
            .set_action(
                Signal::SIGUSR1,
                SigAction {
                    disposition: Disposition::Handler(0x50_0000),
                    mask: 0,
                    flags: 0,
                },
            )
            .unwrap();
        let t = tasks.get_mut(sleeper).unwrap();
        t.state = TaskState::Blocked;
        t.wait_channel = Some(0xDEAD);
    }
    {
        let mut guard = table::lock();
        let tasks = guard.as_mut().unwrap();
        signal::send_signal_locked(tasks, sleeper, Signal::SIGUSR1, INIT_PID).unwrap();
    }
    assert_eq!(task_state(sleeper), Some(TaskState::Ready));
    assert!(on_queue(0, sleeper));
}

// Property 9: a sleeper with a deadline wakes at the first tick >= D.
#[test]
fn sleep_deadline_expires_on_tick() {
    let _g = fixture::kernel_lock();
    fixture::reset_kernel();
    let sleeper = fixture::spawn_user("sleeper", INIT_PID, 0);
    fixture::set_current(sleeper);
    crate::time::test_set_ticks(100);

    assert_eq!(scheduler::sleep_on(0xBEEF, Some(103)), WakeReason::Channel);
    assert_eq!(task_state(sleeper), Some(TaskState::Blocked));

    crate::time::test_set_ticks(102);
    scheduler::on_tick(102);
    assert_eq!(task_state(sleeper), Some(TaskState::Blocked));

    crate::time::test_set_ticks(103);
    scheduler::on_tick(103);
    assert_eq!(task_state(sleeper), Some(TaskState::Ready));
    assert!(on_queue(0, sleeper));
}

// Alarm timers post SIGALRM through the tick sweep (default terminates).
#[test]
fn alarm_fires_through_tick_sweep() {
    let _g = fixture::kernel_lock();
    fixture::reset_kernel();
    let task = fixture::spawn_user("alarmed", INIT_PID, 0);
    fixture::set_current(task);
    crate::time::test_set_ticks(0);
    handlers::sys_alarm(1).unwrap();

    let hz = crate::config::tick_hz() as u64;
    crate::time::test_set_ticks(hz);
    scheduler::on_tick(hz);

    // default SIGALRM action is terminate; the task was running, so it is
    // marked for termination on its next user return
    let guard = table::lock();
    let t = guard.as_ref().unwrap().get(task).unwrap();
    assert!(t.signals.is_pending(Signal::SIGALRM) || t.has_exited);
}

// Bootstrap fairness: after enough voluntary yields the bootstrap task
// gets the CPU even with another runnable user task.
#[test]
fn bootstrap_runs_after_yield_interval() {
    let _g = fixture::kernel_lock();
    fixture::reset_kernel();
    let worker = fixture::spawn_user("worker", INIT_PID, 0);
    fixture::set_current(worker);
    {
        let mut guard = table::lock();
        let tasks = guard.as_mut().unwrap();
        tasks.get_mut(INIT_PID).unwrap().state = TaskState::Ready;
        // bootstrap has no constructed frame in the test world
        tasks.get_mut(INIT_PID).unwrap().saved_sp = 0x1000;
        scheduler::enqueue_locked(tasks, INIT_PID);
    }
    let interval = crate::config::bootstrap_yield_interval();
    percpu::get(0)
        .unwrap()
        .bootstrap_yields
        .store(interval, core::sync::atomic::Ordering::Relaxed);

    scheduler::yield_now();
    assert_eq!(scheduler::current_pid(), Some(INIT_PID));
}

// A ready worker anywhere in the queue outranks a due bootstrap: the
// whole FIFO is scanned, bootstrap is only the no-other-candidate
// fallback.
#[test]
fn ready_worker_outranks_due_bootstrap() {
    let _g = fixture::kernel_lock();
    fixture::reset_kernel();
    let a = fixture::spawn_user("a", INIT_PID, 0);
    // Demotes the bootstrap task onto the queue ahead of anything
    // spawned afterwards.
    fixture::set_current(a);
    let b = fixture::spawn_user("b", INIT_PID, 0);
    let interval = crate::config::bootstrap_yield_interval();
    percpu::get(0)
        .unwrap()
        .bootstrap_yields
        .store(interval, core::sync::atomic::Ordering::Relaxed);

    // Queue order is [bootstrap, b]; the due bootstrap must still lose
    // to the ready worker behind it.
    assert!(on_queue(0, INIT_PID));
    scheduler::yield_now();
    assert_eq!(scheduler::current_pid(), Some(b));

    // Once no non-bootstrap task is ready, the due bootstrap runs.
    fixture::exit_task(a, 0);
    scheduler::yield_now();
    assert_eq!(scheduler::current_pid(), Some(INIT_PID));
}

// Exec failure leaves the caller intact with a mapped errno.
#[test]
fn exec_failure_preserves_caller() {
    let _g = fixture::kernel_lock();
    fixture::reset_kernel();
    let task = fixture::spawn_user("execer", INIT_PID, 0);
    fixture::set_current(task);
    crate::process::exec::register_loader(alloc::boxed::Box::new(|_req| {
        Err(crate::process::exec::ExecError::BadImage)
    }));

    let before = {
        let guard = table::lock();
        guard.as_ref().unwrap().get(task).unwrap().uctx
    };
    let err = crate::process::exec::do_execve(
        alloc::string::String::from("/bin/nope"),
        alloc::vec::Vec::new(),
        alloc::vec::Vec::new(),
    )
    .unwrap_err();
    assert_eq!(err, crate::error::Errno::ENOEXEC);
    let guard = table::lock();
    let t = guard.as_ref().unwrap().get(task).unwrap();
    assert_eq!(t.uctx, before);
    assert!(!t.has_exited);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    // Property 10: pointers outside the user half or wrapping fail
    // validation; in-range ones pass.
    #[test]
    fn user_pointer_validation(addr in any::<u64>(), len in 1u64..=65536) {
        use crate::syscall::uaccess::validate_user_range;
        let result = validate_user_range(addr, len);
        let wraps = addr.checked_add(len).is_none();
        let in_user = addr != 0
            && !wraps
            && addr < crate::mm::USER_SPACE_END
            && addr + len <= crate::mm::USER_SPACE_END;
        prop_assert_eq!(result.is_ok(), in_user);
    }

    // Property 8: the tick counter never decreases.
    #[test]
    fn tick_counter_is_monotonic(samples in prop::collection::vec(0u8..3, 1..40)) {
        let _g = fixture::kernel_lock();
        fixture::reset_kernel();
        let mut last = crate::time::ticks();
        for _ in samples {
            crate::time::on_tick();
            let now = crate::time::ticks();
            prop_assert!(now >= last);
            last = now;
        }
    }

    // Properties 1 and 2 over random scheduler histories: exactly one
    // running task per CPU (and it is the CPU's current), ready tasks are
    // queued exactly once, and nothing exited sits on a queue.
    #[test]
    fn scheduler_invariants_hold_over_random_histories(
        ops in prop::collection::vec(0u8..5, 1..60),
    ) {
        let _g = fixture::kernel_lock();
        fixture::reset_kernel();
        let mut live: alloc::vec::Vec<Pid> = alloc::vec::Vec::new();
        let mut frame = TrapFrame::default();
        let seed = fixture::spawn_user("seed", INIT_PID, 0);
        live.push(seed);
        fixture::set_current(seed);

        for (i, op) in ops.into_iter().enumerate() {
            match op {
                0 => {
                    let pid = fixture::spawn_user("w", INIT_PID, 0);
                    live.push(pid);
                }
                1 => {
                    scheduler::yield_now();
                }
                2 => {
                    crate::time::on_tick();
                    let cpu = percpu::this_cpu();
                    if cpu.need_resched() && cpu.preempt_count() == 0 {
                        scheduler::preempt(&mut frame);
                    }
                }
                3 => {
                    // exit a non-current live task
                    let cur = scheduler::current_pid();
                    if let Some(&victim) =
                        live.iter().find(|&&p| Some(p) != cur)
                    {
                        fixture::exit_task(victim, i as i32);
                        live.retain(|&p| p != victim);
                    }
                }
                _ => {
                    crate::time::on_tick();
                }
            }

            // Invariant 1: single runner, equal to current.
            let guard = table::lock();
            let tasks = guard.as_ref().unwrap();
            let mut running = 0;
            let mut states: alloc::vec::Vec<(Pid, TaskState, bool)> = alloc::vec::Vec::new();
            for pid in live.iter().chain([&INIT_PID]) {
                if let Some(t) = tasks.get(*pid) {
                    states.push((*pid, t.state, t.has_exited));
                    if t.state == TaskState::Running {
                        running += 1;
                        prop_assert_eq!(Some(*pid), scheduler::current_pid());
                    }
                }
            }
            let idle = percpu::get(0).unwrap().idle_pid();
            if scheduler::current_pid() != idle {
                prop_assert_eq!(running, 1, "states: {:?}", states);
            }

            // Invariant 2 and 3: queue membership matches readiness.
            let rq = percpu::get(0).unwrap().run_queue.lock();
            for (pid, state, exited) in &states {
                let queued = rq.contains(*pid);
                if queued {
                    prop_assert!(!exited, "exited task {} on queue", pid);
                    prop_assert_eq!(*state, TaskState::Ready);
                }
                if *state == TaskState::Ready && Some(*pid) != scheduler::current_pid() {
                    prop_assert!(queued, "ready task {} not queued", pid);
                }
            }
            let mut seen = alloc::vec::Vec::new();
            for pid in rq.iter() {
                prop_assert!(!seen.contains(pid), "pid {} queued twice", pid);
                seen.push(*pid);
            }
        }
    }
}
