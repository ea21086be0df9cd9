//! Boot console: the sink behind the log macros and the endpoint behind
//! the three reserved console file descriptors.
//!
//! On hardware the sink is the 16550 serial port. Under the test harness
//! output is captured in a buffer and input comes from a test-injected
//! queue, so console-descriptor reads and writes are observable.

use core::fmt::Write as _;
use core::sync::atomic::{AtomicBool, Ordering};

#[cfg(all(target_arch = "x86_64", not(test)))]
lazy_static::lazy_static! {
    static ref SERIAL: spin::Mutex<uart_16550::SerialPort> = {
        // COM1
        let mut port = unsafe { uart_16550::SerialPort::new(0x3F8) };
        port.init();
        spin::Mutex::new(port)
    };
}

#[cfg(test)]
static CAPTURE: spin::Mutex<alloc::vec::Vec<u8>> = spin::Mutex::new(alloc::vec::Vec::new());

#[cfg(test)]
static INPUT: spin::Mutex<alloc::collections::VecDeque<u8>> =
    spin::Mutex::new(alloc::collections::VecDeque::new());

/// Logging before this flips is dropped rather than touching an
/// uninitialized device.
static READY: AtomicBool = AtomicBool::new(!cfg!(all(target_arch = "x86_64", not(test))));

/// Install the serial sink. Called once by the boot processor.
pub fn init() {
    #[cfg(all(target_arch = "x86_64", not(test)))]
    lazy_static::initialize(&SERIAL);
    READY.store(true, Ordering::Release);
}

struct SinkWriter;

impl core::fmt::Write for SinkWriter {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        write_bytes(s.as_bytes());
        Ok(())
    }
}

pub fn write_fmt(args: core::fmt::Arguments) {
    let _ = SinkWriter.write_fmt(args);
}

/// Raw byte output to the sink. Console-descriptor writes land here too.
pub fn write_bytes(bytes: &[u8]) {
    if !READY.load(Ordering::Acquire) {
        return;
    }
    #[cfg(all(target_arch = "x86_64", not(test)))]
    {
        let mut port = SERIAL.lock();
        for &b in bytes {
            if b == b'\n' {
                port.send(b'\r');
            }
            port.send(b);
        }
    }
    #[cfg(test)]
    {
        CAPTURE.lock().extend_from_slice(bytes);
    }
    #[cfg(all(not(target_arch = "x86_64"), not(test)))]
    {
        let _ = bytes;
    }
}

/// Read up to `buf.len()` bytes from console input. Returns the number of
/// bytes delivered; 0 means no input is pending (the TTY layer is an
/// external collaborator, so there is no blocking here).
pub fn read_bytes(buf: &mut [u8]) -> usize {
    #[cfg(test)]
    {
        let mut input = INPUT.lock();
        let mut n = 0;
        while n < buf.len() {
            match input.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        n
    }
    #[cfg(not(test))]
    {
        let _ = buf;
        0
    }
}

#[cfg(test)]
pub fn test_take_output() -> alloc::vec::Vec<u8> {
    core::mem::take(&mut *CAPTURE.lock())
}

#[cfg(test)]
pub fn test_push_input(bytes: &[u8]) {
    INPUT.lock().extend(bytes.iter().copied());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_sees_written_bytes() {
        write_bytes(b"console-capture-probe");
        let out = test_take_output();
        assert!(out
            .windows(b"console-capture-probe".len())
            .any(|w| w == b"console-capture-probe"));
    }

    #[test]
    fn input_queue_drains() {
        test_push_input(b"ab");
        let mut buf = [0u8; 4];
        let mut got = alloc::vec::Vec::new();
        loop {
            let n = read_bytes(&mut buf);
            if n == 0 {
                break;
            }
            got.extend_from_slice(&buf[..n]);
        }
        assert!(got.windows(2).any(|w| w == b"ab") || got == b"ab");
    }
}
