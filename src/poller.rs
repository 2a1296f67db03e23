use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

/// Edge-triggered epoll set. Every descriptor is registered for `EPOLLIN | EPOLLPRI |
/// EPOLLET`, so a value change on a sysfs attribute wakes a waiter once per change.
///
/// The epoll descriptor is closed when the poller is dropped.
pub struct Poller {
    epfd: OwnedFd,
}

const INTEREST: u32 = (libc::EPOLLIN | libc::EPOLLPRI | libc::EPOLLET) as u32;

impl Poller {
    pub fn new() -> io::Result<Self> {
        // SAFETY: epoll_create1 takes no pointers; the result is checked before use.
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fd is a freshly created descriptor owned by nobody else.
        let epfd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self { epfd })
    }

    pub fn add(&self, fd: RawFd, token: u64) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: INTEREST,
            u64: token,
        };
        // SAFETY: epfd is a valid epoll descriptor and event lives on the stack for the call.
        let ret = unsafe {
            libc::epoll_ctl(self.epfd.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut event)
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        // SAFETY: a null event is accepted for EPOLL_CTL_DEL since Linux 2.6.9.
        let ret = unsafe {
            libc::epoll_ctl(
                self.epfd.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Waits for one ready descriptor and returns its token, or `None` once `timeout`
    /// has elapsed. `EINTR` is retried with whatever time remains. A timeout too large
    /// to express as a deadline waits indefinitely.
    pub fn wait(&self, timeout: Option<Duration>) -> io::Result<Option<u64>> {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut event = libc::epoll_event { events: 0, u64: 0 };

        loop {
            let timeout_ms = match deadline {
                None => -1,
                Some(deadline) => remaining_ms(deadline),
            };

            // SAFETY: event is valid writable storage for exactly one epoll_event.
            let n = unsafe { libc::epoll_wait(self.epfd.as_raw_fd(), &mut event, 1, timeout_ms) };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            if n == 0 {
                // epoll rounds down to whole milliseconds; only give up at the deadline
                if deadline.is_some_and(|d| Instant::now() < d) {
                    continue;
                }
                return Ok(None);
            }
            return Ok(Some(event.u64));
        }
    }
}

fn remaining_ms(deadline: Instant) -> i32 {
    let remaining = deadline.saturating_duration_since(Instant::now());
    let ms = remaining.as_millis() + u128::from(remaining.subsec_nanos() % 1_000_000 != 0);
    i32::try_from(ms).unwrap_or(i32::MAX)
}

/// `eventfd` used to wake a thread blocked in [`Poller::wait`].
pub struct Waker {
    fd: OwnedFd,
}

impl Waker {
    pub fn new() -> io::Result<Self> {
        // SAFETY: eventfd takes no pointers; the result is checked before use.
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fd is a freshly created descriptor owned by nobody else.
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    pub fn wake(&self) -> io::Result<()> {
        let one: u64 = 1;
        // SAFETY: writes exactly the eight bytes of `one`, as eventfd requires.
        let ret = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                (&one as *const u64).cast::<libc::c_void>(),
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl AsRawFd for Waker {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn times_out_without_events() {
        let poller = Poller::new().unwrap();
        let start = Instant::now();
        assert_eq!(poller.wait(Some(Duration::from_millis(30))).unwrap(), None);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn reports_token_of_woken_descriptor() {
        let poller = Poller::new().unwrap();
        let waker = Waker::new().unwrap();
        poller.add(waker.as_raw_fd(), 42).unwrap();

        waker.wake().unwrap();
        assert_eq!(poller.wait(Some(Duration::from_secs(1))).unwrap(), Some(42));

        // edge triggered: nothing new happened, so no second report
        assert_eq!(poller.wait(Some(Duration::from_millis(10))).unwrap(), None);

        poller.delete(waker.as_raw_fd()).unwrap();
        waker.wake().unwrap();
        assert_eq!(poller.wait(Some(Duration::from_millis(10))).unwrap(), None);
    }

    #[test]
    fn huge_timeout_still_reports_ready_descriptor() {
        let poller = Poller::new().unwrap();
        let waker = Waker::new().unwrap();
        poller.add(waker.as_raw_fd(), 7).unwrap();
        waker.wake().unwrap();
        assert_eq!(poller.wait(Some(Duration::MAX)).unwrap(), Some(7));
    }

    #[test]
    fn deleting_unknown_descriptor_fails() {
        let poller = Poller::new().unwrap();
        let waker = Waker::new().unwrap();
        assert!(poller.delete(waker.as_raw_fd()).is_err());
    }
}
