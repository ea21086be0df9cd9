//! Per-task file-descriptor table.
//!
//! A fixed-size table of tagged slots. The tag is what makes a console
//! marker or a pipe end distinguishable from a generic VFS file — the role
//! the original's magic header values played. The low three descriptors
//! are reserved for console I/O; duplicating them copies the marker.

use alloc::sync::Arc;

use crate::config::MAX_FDS;
use crate::error::{Errno, Result};
use crate::ipc::Pipe;
use crate::vfs::FileRef;

/// Console endpoint markers for fds 0/1/2 and their duplicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleEnd {
    Stdin,
    Stdout,
    Stderr,
}

impl ConsoleEnd {
    pub fn readable(self) -> bool {
        matches!(self, ConsoleEnd::Stdin)
    }

    pub fn writable(self) -> bool {
        matches!(self, ConsoleEnd::Stdout | ConsoleEnd::Stderr)
    }
}

/// One descriptor slot.
pub enum FdEntry {
    Console(ConsoleEnd),
    PipeReader(Arc<Pipe>),
    PipeWriter(Arc<Pipe>),
    File(FileRef),
}

impl FdEntry {
    /// Copy this entry for dup/dup2/fork, bumping the underlying
    /// reference counts per variant.
    pub fn duplicate(&self) -> FdEntry {
        match self {
            FdEntry::Console(end) => FdEntry::Console(*end),
            FdEntry::PipeReader(pipe) => {
                pipe.add_reader();
                FdEntry::PipeReader(pipe.clone())
            }
            FdEntry::PipeWriter(pipe) => {
                pipe.add_writer();
                FdEntry::PipeWriter(pipe.clone())
            }
            FdEntry::File(file) => {
                file.on_dup();
                FdEntry::File(file.clone())
            }
        }
    }

    /// Release the entry's reference: pipe ends drop their endpoint count,
    /// files get the VFS close notification, console markers just clear.
    pub fn release(self) {
        match self {
            FdEntry::Console(_) => {}
            FdEntry::PipeReader(pipe) => pipe.close_reader(),
            FdEntry::PipeWriter(pipe) => pipe.close_writer(),
            FdEntry::File(file) => file.on_close(),
        }
    }
}

impl core::fmt::Debug for FdEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            FdEntry::Console(end) => write!(f, "Console({:?})", end),
            FdEntry::PipeReader(_) => write!(f, "PipeReader"),
            FdEntry::PipeWriter(_) => write!(f, "PipeWriter"),
            FdEntry::File(_) => write!(f, "File"),
        }
    }
}

pub struct FdTable {
    slots: [Option<FdEntry>; MAX_FDS],
}

impl FdTable {
    /// Fresh table with the three console descriptors installed.
    pub fn new() -> Self {
        let mut slots: [Option<FdEntry>; MAX_FDS] = core::array::from_fn(|_| None);
        slots[0] = Some(FdEntry::Console(ConsoleEnd::Stdin));
        slots[1] = Some(FdEntry::Console(ConsoleEnd::Stdout));
        slots[2] = Some(FdEntry::Console(ConsoleEnd::Stderr));
        Self { slots }
    }

    fn index(fd: i32) -> Result<usize> {
        if fd < 0 || fd as usize >= MAX_FDS {
            return Err(Errno::EBADF);
        }
        Ok(fd as usize)
    }

    pub fn get(&self, fd: i32) -> Result<&FdEntry> {
        self.slots[Self::index(fd)?].as_ref().ok_or(Errno::EBADF)
    }

    /// Install `entry` in the lowest free slot. A full table releases the
    /// entry's reference before reporting EMFILE.
    pub fn alloc(&mut self, entry: FdEntry) -> Result<i32> {
        match self.slots.iter().position(|slot| slot.is_none()) {
            Some(i) => {
                self.slots[i] = Some(entry);
                Ok(i as i32)
            }
            None => {
                entry.release();
                Err(Errno::EMFILE)
            }
        }
    }

    /// Install `entry` at `fd`, releasing whatever was there (dup2).
    pub fn install_at(&mut self, fd: i32, entry: FdEntry) -> Result<()> {
        let idx = Self::index(fd)?;
        if let Some(old) = self.slots[idx].take() {
            old.release();
        }
        self.slots[idx] = Some(entry);
        Ok(())
    }

    pub fn close(&mut self, fd: i32) -> Result<()> {
        let idx = Self::index(fd)?;
        match self.slots[idx].take() {
            Some(entry) => {
                entry.release();
                Ok(())
            }
            None => Err(Errno::EBADF),
        }
    }

    /// dup: new descriptor for the same object, lowest free slot.
    pub fn dup(&mut self, oldfd: i32) -> Result<i32> {
        let copy = self.get(oldfd)?.duplicate();
        self.alloc(copy)
    }

    /// dup2: duplicate onto a chosen slot.
    pub fn dup2(&mut self, oldfd: i32, newfd: i32) -> Result<i32> {
        Self::index(newfd)?;
        if oldfd == newfd {
            self.get(oldfd)?;
            return Ok(newfd);
        }
        let copy = self.get(oldfd)?.duplicate();
        self.install_at(newfd, copy)?;
        Ok(newfd)
    }

    /// Entry-by-entry duplicate for fork.
    pub fn duplicate_all(&self) -> FdTable {
        let slots = core::array::from_fn(|i| self.slots[i].as_ref().map(|e| e.duplicate()));
        FdTable { slots }
    }

    /// Release every slot (exit path).
    pub fn close_all(&mut self) {
        for slot in self.slots.iter_mut() {
            if let Some(entry) = slot.take() {
                entry.release();
            }
        }
    }

    pub fn open_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for FdTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FdTable")
            .field("open", &self.open_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn console_markers_preinstalled() {
        let table = FdTable::new();
        assert!(matches!(table.get(0), Ok(FdEntry::Console(ConsoleEnd::Stdin))));
        assert!(matches!(table.get(1), Ok(FdEntry::Console(ConsoleEnd::Stdout))));
        assert!(matches!(table.get(2), Ok(FdEntry::Console(ConsoleEnd::Stderr))));
        assert_eq!(table.get(3).err(), Some(Errno::EBADF));
    }

    #[test]
    fn dup_of_console_installs_marker() {
        let mut table = FdTable::new();
        let fd = table.dup(1).unwrap();
        assert_eq!(fd, 3);
        assert!(matches!(table.get(fd), Ok(FdEntry::Console(ConsoleEnd::Stdout))));
    }

    #[test]
    fn dup_and_close_track_pipe_endpoints() {
        let _g = crate::test_support::kernel_lock();
        crate::test_support::reset_kernel();
        let mut table = FdTable::new();
        let pipe = Arc::new(Pipe::new());
        let rfd = table.alloc(FdEntry::PipeReader(pipe.clone())).unwrap();
        let _wfd = table.alloc(FdEntry::PipeWriter(pipe.clone())).unwrap();
        let dup_fd = table.dup(rfd).unwrap();
        assert_eq!(pipe.reader_count(), 2);
        table.close(rfd).unwrap();
        table.close(dup_fd).unwrap();
        assert_eq!(pipe.reader_count(), 0);
        assert_eq!(pipe.writer_count(), 1);
    }

    #[test]
    fn dup2_releases_target() {
        let _g = crate::test_support::kernel_lock();
        crate::test_support::reset_kernel();
        let mut table = FdTable::new();
        let pipe = Arc::new(Pipe::new());
        let wfd = table.alloc(FdEntry::PipeWriter(pipe.clone())).unwrap();
        // route stdout into the pipe
        table.dup2(wfd, 1).unwrap();
        assert_eq!(pipe.writer_count(), 2);
        assert!(matches!(table.get(1), Ok(FdEntry::PipeWriter(_))));
        // self-dup is a no-op
        assert_eq!(table.dup2(wfd, wfd).unwrap(), wfd);
        assert_eq!(pipe.writer_count(), 2);
    }

    #[test]
    fn close_all_releases_everything() {
        let _g = crate::test_support::kernel_lock();
        crate::test_support::reset_kernel();
        let mut table = FdTable::new();
        let pipe = Arc::new(Pipe::new());
        table.alloc(FdEntry::PipeReader(pipe.clone())).unwrap();
        table.alloc(FdEntry::PipeWriter(pipe.clone())).unwrap();
        table.close_all();
        assert_eq!(table.open_count(), 0);
        assert_eq!(pipe.reader_count(), 0);
        assert_eq!(pipe.writer_count(), 0);
    }
}
