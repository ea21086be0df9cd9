//! Task table and process tree.
//!
//! A pid-indexed arena of boxed tasks behind the global scheduler lock.
//! Cross-queue operations (fork publication, exit, wake-by-channel, signal
//! sweeps) traverse the arena; per-CPU run queues hold only pids. Tasks
//! stay at a stable heap address from insert to remove, which is what lets
//! the switch path write a task's saved stack pointer after dropping the
//! lock.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::Mutex;

use crate::config::MAX_TASKS;
use crate::error::KernelError;
use crate::process::task::{Pid, Task, INIT_PID};

/// Monotonic pid source; pid 0 is the bootstrap task.
static NEXT_PID: AtomicU32 = AtomicU32::new(1);

pub struct TaskTable {
    entries: Vec<Option<Box<Task>>>,
    count: usize,
}

impl TaskTable {
    pub fn new() -> Self {
        let mut entries = Vec::with_capacity(MAX_TASKS);
        entries.resize_with(MAX_TASKS, || None);
        Self { entries, count: 0 }
    }

    pub fn insert(&mut self, task: Task) -> Result<(), KernelError> {
        let idx = task.pid as usize;
        if idx >= MAX_TASKS {
            return Err(KernelError::InvalidArgument);
        }
        if self.entries[idx].is_some() {
            return Err(KernelError::Fatal("pid slot already occupied"));
        }
        self.entries[idx] = Some(Box::new(task));
        self.count += 1;
        Ok(())
    }

    pub fn get(&self, pid: Pid) -> Option<&Task> {
        self.entries.get(pid as usize)?.as_deref()
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Task> {
        self.entries.get_mut(pid as usize)?.as_deref_mut()
    }

    pub fn remove(&mut self, pid: Pid) -> Option<Box<Task>> {
        let slot = self.entries.get_mut(pid as usize)?;
        let task = slot.take();
        if task.is_some() {
            self.count -= 1;
        }
        task
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn for_each_mut(&mut self, mut f: impl FnMut(&mut Task)) {
        for slot in self.entries.iter_mut() {
            if let Some(task) = slot.as_deref_mut() {
                f(task);
            }
        }
    }

    /// Two tasks mutably at once (parent/child edits). Panics on equal or
    /// missing pids.
    pub fn get_pair_mut(&mut self, a: Pid, b: Pid) -> (&mut Task, &mut Task) {
        assert_ne!(a, b);
        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        let (left, right) = self.entries.split_at_mut(hi as usize);
        let lo_task = left[lo as usize].as_deref_mut().expect("task missing");
        let hi_task = right[0].as_deref_mut().expect("task missing");
        if a < b {
            (lo_task, hi_task)
        } else {
            (hi_task, lo_task)
        }
    }

    /// Link `child` at the head of `parent`'s child list.
    pub fn link_child(&mut self, parent: Pid, child: Pid) {
        let old_head = self.get(parent).and_then(|p| p.first_child);
        if let Some(c) = self.get_mut(child) {
            c.parent = Some(parent);
            c.next_sibling = old_head;
        }
        if let Some(p) = self.get_mut(parent) {
            p.first_child = Some(child);
        }
    }

    /// Unlink `child` from `parent`'s sibling chain.
    pub fn unlink_child(&mut self, parent: Pid, child: Pid) {
        let next = self.get(child).and_then(|c| c.next_sibling);
        let head = self.get(parent).and_then(|p| p.first_child);
        if head == Some(child) {
            if let Some(p) = self.get_mut(parent) {
                p.first_child = next;
            }
        } else {
            let mut cursor = head;
            while let Some(pid) = cursor {
                let sibling_next = self.get(pid).and_then(|t| t.next_sibling);
                if sibling_next == Some(child) {
                    if let Some(t) = self.get_mut(pid) {
                        t.next_sibling = next;
                    }
                    break;
                }
                cursor = sibling_next;
            }
        }
        if let Some(c) = self.get_mut(child) {
            c.parent = None;
            c.next_sibling = None;
        }
    }

    /// Children of `parent`, in list order.
    pub fn children_of(&self, parent: Pid) -> Vec<Pid> {
        let mut pids = Vec::new();
        let mut cursor = self.get(parent).and_then(|p| p.first_child);
        while let Some(pid) = cursor {
            pids.push(pid);
            cursor = self.get(pid).and_then(|t| t.next_sibling);
        }
        pids
    }

    /// Move every non-exited child of `dying` under init. Called with the
    /// dying task's zombie transition, inside the same critical section.
    pub fn reparent_children_to_init(&mut self, dying: Pid) {
        for child in self.children_of(dying) {
            self.unlink_child(dying, child);
            if dying != INIT_PID {
                self.link_child(INIT_PID, child);
            }
        }
    }
}

/// Global task table behind the scheduler lock. Acquire with interrupts
/// disabled on the local CPU; never hold across the context-switch
/// assembly.
static TASKS: Mutex<Option<TaskTable>> = Mutex::new(None);

pub fn init_table() {
    let mut table = TASKS.lock();
    if table.is_none() {
        *table = Some(TaskTable::new());
        crate::info!("process: task table initialized ({} slots)", MAX_TASKS);
    }
}

/// The scheduler lock. The guard derefs to `Option<TaskTable>`; boot code
/// must have called [`init_table`].
pub fn lock() -> spin::MutexGuard<'static, Option<TaskTable>> {
    TASKS.lock()
}

pub fn try_lock() -> Option<spin::MutexGuard<'static, Option<TaskTable>>> {
    TASKS.try_lock()
}

pub fn alloc_pid() -> Result<Pid, KernelError> {
    let pid = NEXT_PID.fetch_add(1, Ordering::AcqRel);
    if pid as usize >= MAX_TASKS {
        NEXT_PID.fetch_sub(1, Ordering::AcqRel);
        return Err(KernelError::OutOfMemory);
    }
    Ok(pid)
}

#[cfg(test)]
pub fn test_reset() {
    let mut table = TASKS.lock();
    *table = Some(TaskTable::new());
    NEXT_PID.store(1, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::task::Task;

    fn kernel_task(pid: Pid) -> Task {
        extern "C" fn body(_: usize) {}
        Task::new_kernel(pid, "t", body, 0).unwrap()
    }

    #[test]
    fn tree_links_and_unlinks() {
        let _g = crate::test_support::kernel_lock();
        test_reset();
        let mut guard = lock();
        let table = guard.as_mut().unwrap();
        table.insert(Task::new_bootstrap()).unwrap();
        for pid in [1, 2, 3] {
            table.insert(kernel_task(pid)).unwrap();
            table.link_child(0, pid);
        }
        assert_eq!(table.children_of(0), alloc::vec![3, 2, 1]);
        table.unlink_child(0, 2);
        assert_eq!(table.children_of(0), alloc::vec![3, 1]);
        assert_eq!(table.get(2).unwrap().parent, None);
    }

    #[test]
    fn reparent_moves_grandchildren_to_init() {
        let _g = crate::test_support::kernel_lock();
        test_reset();
        let mut guard = lock();
        let table = guard.as_mut().unwrap();
        table.insert(Task::new_bootstrap()).unwrap();
        table.insert(kernel_task(1)).unwrap();
        table.link_child(0, 1);
        for pid in [2, 3] {
            table.insert(kernel_task(pid)).unwrap();
            table.link_child(1, pid);
        }
        table.reparent_children_to_init(1);
        let init_children = table.children_of(0);
        assert!(init_children.contains(&2) && init_children.contains(&3));
        assert_eq!(table.get(2).unwrap().parent, Some(0));
        // linked exactly once
        assert_eq!(init_children.iter().filter(|&&p| p == 2).count(), 1);
        assert_eq!(table.children_of(1), alloc::vec![]);
    }

    #[test]
    fn pid_allocation_is_monotonic() {
        let _g = crate::test_support::kernel_lock();
        test_reset();
        let a = alloc_pid().unwrap();
        let b = alloc_pid().unwrap();
        assert!(b > a);
    }
}
