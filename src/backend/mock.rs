use std::fs::File;
use std::io::{self, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::config::EdgeDetect;
use crate::error::EventError;
use crate::gpio::{PinDriver, ValueHandle};

/// Driver step that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockStep {
    Export,
    Direction,
    Edge,
    OpenValue,
    /// Reading the level through an open value handle.
    Read,
}

/// In-memory pin driver. A value handle is one end of a socket pair that always holds
/// at least the current level byte, so it is readable the moment it is added to a
/// poller, just like a sysfs `value` attribute. Every level change matching the
/// configured edge queues another byte and wakes edge-triggered waiters.
#[derive(Default)]
pub struct MockDriver {
    pins: Mutex<FxHashMap<u32, MockLine>>,
    failures: Arc<Mutex<FxHashSet<(u32, MockStep)>>>,
    live_handles: Arc<AtomicUsize>,
    input_guaranteed: bool,
}

#[derive(Default)]
struct MockLine {
    exported: bool,
    input: Option<bool>,
    edge: EdgeDetect,
    level: u8,
    writer: Option<File>,
    reads: Arc<AtomicUsize>,
}

impl MockDriver {
    /// A driver that behaves like a board with a pin translation table.
    pub fn with_input_guaranteed() -> Self {
        Self {
            input_guaranteed: true,
            ..Self::default()
        }
    }

    pub fn fail(&self, pin: u32, step: MockStep) {
        self.failures.lock().insert((pin, step));
    }

    pub fn clear_failures(&self) {
        self.failures.lock().clear();
    }

    fn check(&self, pin: u32, step: MockStep) -> Result<(), EventError> {
        if self.failures.lock().contains(&(pin, step)) {
            return Err(EventError::Io(format!("injected {step:?} failure on pin {pin}")));
        }
        Ok(())
    }

    /// Drives the line to `level` (0 or 1). Returns true if the change produced a
    /// notification under the configured edge mode.
    pub fn set_level(&self, pin: u32, level: u8) -> io::Result<bool> {
        let mut pins = self.pins.lock();
        let line = pins.entry(pin).or_default();
        let old = line.level;
        line.level = level;

        let fires = match (line.edge, old, level) {
            (EdgeDetect::Rising | EdgeDetect::Both, 0, 1) => true,
            (EdgeDetect::Falling | EdgeDetect::Both, 1, 0) => true,
            _ => false,
        };
        if !fires {
            return Ok(false);
        }
        let Some(writer) = line.writer.as_mut() else {
            return Ok(false);
        };
        match writer.write_all(&[b'0' + level]) {
            Ok(()) => Ok(true),
            // value handle already closed by a removal in progress
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                line.writer = None;
                Ok(false)
            }
            // a full buffer is still readable, so waiters are already notified
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(true),
            Err(e) => Err(e),
        }
    }

    /// Flips the line and returns the new level.
    pub fn toggle(&self, pin: u32) -> io::Result<u8> {
        let next = if self.level(pin) == 0 { 1 } else { 0 };
        self.set_level(pin, next)?;
        Ok(next)
    }

    /// Reads made through the value handle currently open for `pin`.
    pub fn reads(&self, pin: u32) -> usize {
        self.pins
            .lock()
            .get(&pin)
            .map(|l| l.reads.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Blocks until the open value handle of `pin` has been read `count` times, or
    /// `timeout` passes. Returns false on timeout.
    pub fn wait_reads(&self, pin: u32, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.reads(pin) >= count {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    pub fn level(&self, pin: u32) -> u8 {
        self.pins.lock().get(&pin).map(|l| l.level).unwrap_or(0)
    }

    pub fn is_exported(&self, pin: u32) -> bool {
        self.pins.lock().get(&pin).is_some_and(|l| l.exported)
    }

    pub fn edge(&self, pin: u32) -> EdgeDetect {
        self.pins.lock().get(&pin).map(|l| l.edge).unwrap_or_default()
    }

    pub fn is_input(&self, pin: u32) -> Option<bool> {
        self.pins.lock().get(&pin).and_then(|l| l.input)
    }

    /// Number of value handles currently open across all pins.
    pub fn open_handles(&self) -> usize {
        self.live_handles.load(Ordering::SeqCst)
    }
}

impl PinDriver for MockDriver {
    fn export(&self, pin: u32) -> Result<(), EventError> {
        self.check(pin, MockStep::Export)?;
        self.pins.lock().entry(pin).or_default().exported = true;
        Ok(())
    }

    fn unexport(&self, pin: u32) -> Result<(), EventError> {
        let mut pins = self.pins.lock();
        let line = pins
            .get_mut(&pin)
            .filter(|l| l.exported)
            .ok_or_else(|| EventError::Io(format!("gpio {pin} is not exported")))?;
        line.exported = false;
        line.input = None;
        line.writer = None;
        Ok(())
    }

    fn set_direction(&self, pin: u32, input: bool) -> Result<(), EventError> {
        self.check(pin, MockStep::Direction)?;
        self.pins.lock().entry(pin).or_default().input = Some(input);
        Ok(())
    }

    fn set_edge(&self, pin: u32, edge: EdgeDetect) -> Result<(), EventError> {
        self.check(pin, MockStep::Edge)?;
        self.pins.lock().entry(pin).or_default().edge = edge;
        Ok(())
    }

    fn open_value(&self, pin: u32) -> Result<Box<dyn ValueHandle>, EventError> {
        self.check(pin, MockStep::OpenValue)?;

        let mut fds = [0 as libc::c_int; 2];
        // SAFETY: socketpair fills the two-element array on success; checked below.
        let ret = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
                fds.as_mut_ptr(),
            )
        };
        if ret < 0 {
            return Err(EventError::Io(format!(
                "socketpair for gpio {pin}: {}",
                io::Error::last_os_error()
            )));
        }
        // SAFETY: both descriptors were just created and are owned by nobody else.
        let (reader, mut writer) =
            unsafe { (OwnedFd::from_raw_fd(fds[0]), File::from_raw_fd(fds[1])) };

        let mut pins = self.pins.lock();
        let line = pins.entry(pin).or_default();
        writer
            .write_all(&[b'0' + line.level])
            .map_err(|e| EventError::Io(format!("prime gpio {pin}: {e}")))?;
        line.writer = Some(writer);
        line.reads = Arc::new(AtomicUsize::new(0));

        self.live_handles.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockValue {
            pin,
            reader,
            failures: self.failures.clone(),
            reads: line.reads.clone(),
            live: self.live_handles.clone(),
        }))
    }

    fn input_guaranteed(&self) -> bool {
        self.input_guaranteed
    }
}

struct MockValue {
    pin: u32,
    reader: OwnedFd,
    failures: Arc<Mutex<FxHashSet<(u32, MockStep)>>>,
    reads: Arc<AtomicUsize>,
    live: Arc<AtomicUsize>,
}

impl MockValue {
    fn queued(&self) -> io::Result<usize> {
        let mut queued: libc::c_int = 0;
        // SAFETY: FIONREAD writes a single c_int through the provided pointer.
        let ret = unsafe {
            libc::ioctl(
                self.reader.as_raw_fd(),
                libc::FIONREAD,
                &mut queued as *mut libc::c_int,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(queued as usize)
    }
}

impl AsRawFd for MockValue {
    fn as_raw_fd(&self) -> RawFd {
        self.reader.as_raw_fd()
    }
}

impl ValueHandle for MockValue {
    /// Returns the newest level, discarding older ones but leaving the newest queued so
    /// the handle stays readable.
    fn read_level(&mut self) -> io::Result<u8> {
        if self.failures.lock().contains(&(self.pin, MockStep::Read)) {
            return Err(io::Error::other(format!(
                "injected Read failure on pin {}",
                self.pin
            )));
        }

        let fd = self.reader.as_raw_fd();
        let stale = self.queued()?.saturating_sub(1);
        if stale > 0 {
            let mut discard = vec![0u8; stale];
            // SAFETY: discard is valid writable storage for `stale` bytes.
            let n = unsafe {
                libc::recv(fd, discard.as_mut_ptr().cast::<libc::c_void>(), stale, 0)
            };
            if n < 0 {
                return Err(io::Error::last_os_error());
            }
        }

        let mut buf = [0u8; 1];
        // SAFETY: buf is valid writable storage for the single byte requested.
        let n = unsafe {
            libc::recv(fd, buf.as_mut_ptr().cast::<libc::c_void>(), 1, libc::MSG_PEEK)
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        if n == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(buf[0])
    }
}

impl Drop for MockValue {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}
