//! Anonymous pipes.
//!
//! A fixed-capacity byte ring under the pipe's lock, with reader/writer
//! endpoint counts maintained by the fd layer. Readers see end-of-file
//! once every writer is gone; writers to a reader-less pipe get EPIPE.
//! Blocking sides sleep on the pipe's wait channels and are woken by the
//! opposite side or by a deliverable signal (EINTR).

use core::sync::atomic::{AtomicUsize, Ordering};

use heapless::Deque;

use crate::config::PIPE_CAPACITY;
use crate::error::{Errno, Result};
use crate::process::scheduler::{self, WakeReason};
use crate::sync::SpinLock;

struct PipeInner {
    buf: Deque<u8, PIPE_CAPACITY>,
}

pub struct Pipe {
    inner: SpinLock<PipeInner>,
    readers: AtomicUsize,
    writers: AtomicUsize,
}

impl Pipe {
    /// Fresh pipe with one reader and one writer endpoint.
    pub fn new() -> Self {
        Self {
            inner: SpinLock::new(PipeInner { buf: Deque::new() }),
            readers: AtomicUsize::new(1),
            writers: AtomicUsize::new(1),
        }
    }

    /// Channel identity for blocked readers.
    fn read_channel(&self) -> usize {
        self as *const Pipe as usize
    }

    /// Channel identity for blocked writers.
    fn write_channel(&self) -> usize {
        self as *const Pipe as usize + 1
    }

    pub fn add_reader(&self) {
        self.readers.fetch_add(1, Ordering::AcqRel);
    }

    pub fn add_writer(&self) {
        self.writers.fetch_add(1, Ordering::AcqRel);
    }

    pub fn reader_count(&self) -> usize {
        self.readers.load(Ordering::Acquire)
    }

    pub fn writer_count(&self) -> usize {
        self.writers.load(Ordering::Acquire)
    }

    /// Drop one reader endpoint; blocked writers get to observe EPIPE.
    pub fn close_reader(&self) {
        if self.readers.fetch_sub(1, Ordering::AcqRel) == 1 {
            scheduler::wake_channel(self.write_channel());
        }
    }

    /// Drop one writer endpoint; blocked readers get to observe EOF.
    pub fn close_writer(&self) {
        if self.writers.fetch_sub(1, Ordering::AcqRel) == 1 {
            scheduler::wake_channel(self.read_channel());
        }
    }

    /// Read up to `buf.len()` bytes. Returns 0 at end-of-file (no writers
    /// and an empty ring). Blocks unless `nonblock`, in which case an
    /// empty ring yields EAGAIN.
    pub fn read(&self, buf: &mut [u8], nonblock: bool) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            {
                let mut inner = self.inner.lock_irqsave();
                if !inner.buf.is_empty() {
                    let mut n = 0;
                    while n < buf.len() {
                        match inner.buf.pop_front() {
                            Some(b) => {
                                buf[n] = b;
                                n += 1;
                            }
                            None => break,
                        }
                    }
                    drop(inner);
                    scheduler::wake_channel(self.write_channel());
                    return Ok(n);
                }
                if self.writer_count() == 0 {
                    return Ok(0);
                }
                if nonblock {
                    return Err(Errno::EAGAIN);
                }
                // Block while still holding the ring lock, so a write
                // landing right now flips us back to ready instead of
                // being lost; the lock drops before the switch.
                if !scheduler::prepare_sleep(self.read_channel(), None) {
                    return Err(Errno::EINTR);
                }
            }
            match scheduler::finish_sleep(None) {
                WakeReason::Signal => return Err(Errno::EINTR),
                WakeReason::Channel | WakeReason::Timeout => {}
            }
        }
    }

    /// Write up to `data.len()` bytes. Blocks while the ring is full
    /// unless `nonblock` (EAGAIN). EPIPE once every reader is gone.
    pub fn write(&self, data: &[u8], nonblock: bool) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let mut written = 0;
        loop {
            if self.reader_count() == 0 {
                return if written > 0 { Ok(written) } else { Err(Errno::EPIPE) };
            }
            let progressed;
            {
                let mut inner = self.inner.lock_irqsave();
                let before = written;
                while written < data.len() {
                    if inner.buf.push_back(data[written]).is_err() {
                        break;
                    }
                    written += 1;
                }
                progressed = written > before;
                if written < data.len() && !nonblock {
                    if !scheduler::prepare_sleep(self.write_channel(), None) {
                        drop(inner);
                        if progressed {
                            scheduler::wake_channel(self.read_channel());
                        }
                        return if written > 0 { Ok(written) } else { Err(Errno::EINTR) };
                    }
                }
            }
            if progressed {
                scheduler::wake_channel(self.read_channel());
            }
            if written == data.len() {
                return Ok(written);
            }
            if nonblock {
                return if written > 0 { Ok(written) } else { Err(Errno::EAGAIN) };
            }
            match scheduler::finish_sleep(None) {
                WakeReason::Signal => {
                    return if written > 0 { Ok(written) } else { Err(Errno::EINTR) };
                }
                WakeReason::Channel | WakeReason::Timeout => {}
            }
        }
    }

    /// Bytes currently buffered.
    pub fn len(&self) -> usize {
        self.inner.lock_irqsave().buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Pipe {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_round_trip() {
        let _g = crate::test_support::kernel_lock();
        crate::test_support::reset_kernel();
        let pipe = Pipe::new();
        assert_eq!(pipe.write(b"HELLO", true).unwrap(), 5);
        let mut buf = [0u8; 16];
        assert_eq!(pipe.read(&mut buf, true).unwrap(), 5);
        assert_eq!(&buf[..5], b"HELLO");
    }

    #[test]
    fn eof_after_last_writer_closes() {
        let _g = crate::test_support::kernel_lock();
        crate::test_support::reset_kernel();
        let pipe = Pipe::new();
        pipe.write(b"X", true).unwrap();
        pipe.close_writer();
        let mut buf = [0u8; 4];
        assert_eq!(pipe.read(&mut buf, true).unwrap(), 1);
        // drained and no writers left: end of file, not EAGAIN
        assert_eq!(pipe.read(&mut buf, true).unwrap(), 0);
    }

    #[test]
    fn empty_pipe_would_block() {
        let _g = crate::test_support::kernel_lock();
        crate::test_support::reset_kernel();
        let pipe = Pipe::new();
        let mut buf = [0u8; 4];
        assert_eq!(pipe.read(&mut buf, true).err(), Some(Errno::EAGAIN));
    }

    #[test]
    fn writer_without_readers_gets_epipe() {
        let _g = crate::test_support::kernel_lock();
        crate::test_support::reset_kernel();
        let pipe = Pipe::new();
        pipe.close_reader();
        assert_eq!(pipe.write(b"x", true).err(), Some(Errno::EPIPE));
    }

    #[test]
    fn full_ring_reports_eagain_nonblocking() {
        let _g = crate::test_support::kernel_lock();
        crate::test_support::reset_kernel();
        let pipe = Pipe::new();
        let big = alloc::vec![0u8; PIPE_CAPACITY + 10];
        // Deque<_, N> holds N elements; the first write fills the ring.
        let n = pipe.write(&big, true).unwrap();
        assert_eq!(n, PIPE_CAPACITY);
        assert_eq!(pipe.write(b"y", true).err(), Some(Errno::EAGAIN));
    }
}
