use log::{debug, error};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crate::error::EventError;
use crate::gpio::{EventHandler, PinDriver, Shared};
use crate::poller::{Poller, Waker};

const WAKE_TOKEN: u64 = u64::MAX;

/// The background thread that watches every pin added with `add_edge_detection`,
/// together with the poller it waits on.
pub(crate) struct Worker {
    poller: Arc<Poller>,
    waker: Waker,
    stop: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub(crate) fn new() -> Result<Self, EventError> {
        let poller =
            Poller::new().map_err(|e| EventError::Multiplexer(format!("create poller: {e}")))?;
        let waker =
            Waker::new().map_err(|e| EventError::Multiplexer(format!("create waker: {e}")))?;
        poller
            .add(waker.as_raw_fd(), WAKE_TOKEN)
            .map_err(|e| EventError::Multiplexer(format!("register waker: {e}")))?;

        Ok(Self {
            poller: Arc::new(poller),
            waker,
            stop: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
        })
    }

    pub(crate) fn poller(&self) -> &Poller {
        &self.poller
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Starts the thread unless it is already running. A thread that stopped on an
    /// error is replaced. Called with the state lock held; a failing thread clears its
    /// running flag under the same lock, so a thread on its way out never counts.
    pub(crate) fn ensure_running<D: PinDriver + 'static>(
        &mut self,
        shared: &Arc<Shared<D>>,
    ) -> Result<(), EventError> {
        if self.is_running() {
            return Ok(());
        }
        if let Some(old) = self.handle.take() {
            let _ = old.join();
        }

        let shared = shared.clone();
        let poller = self.poller.clone();
        let stop = self.stop.clone();
        let running = RunningFlag::set(self.running.clone());

        let handle = thread::Builder::new()
            .name("gpio-edge-poll".into())
            .spawn(move || {
                poll_loop(&shared, &poller, &stop, &running);
            })
            .map_err(|e| EventError::Io(format!("spawn poll thread: {e}")))?;
        debug!("poll thread started");
        self.handle = Some(handle);
        Ok(())
    }

    /// Signals the thread to stop and joins it, unless called from the thread itself
    /// (a callback tearing everything down), which then exits once the callback returns.
    pub(crate) fn shutdown(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Err(e) = self.waker.wake() {
            error!("wake poll thread: {e}");
        }
        if let Some(handle) = self.handle.take()
            && handle.thread().id() != thread::current().id()
            && handle.join().is_err()
        {
            error!("poll thread panicked");
        }
        debug!("poll worker shut down");
    }
}

/// Clears the running flag however the thread exits, panicking callbacks included.
struct RunningFlag(Arc<AtomicBool>);

impl RunningFlag {
    fn set(flag: Arc<AtomicBool>) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }

    fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Drop for RunningFlag {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn poll_loop<D: PinDriver>(
    shared: &Shared<D>,
    poller: &Poller,
    stop: &AtomicBool,
    running: &RunningFlag,
) {
    while !stop.load(Ordering::SeqCst) {
        let token = match poller.wait(None) {
            Ok(Some(token)) => token,
            Ok(None) => continue,
            Err(e) => {
                let _state = shared.state.lock();
                running.clear();
                error!("poll thread stopped, wait failed: {e}");
                return;
            }
        };
        if token == WAKE_TOKEN {
            continue;
        }
        let now = shared.clock.now_us();

        match accept_notification(shared, token, now, running) {
            Ok(Some((pin, handlers))) => {
                for handler in handlers {
                    handler.on_edge(pin);
                }
            }
            Ok(None) => {}
            Err(e) => {
                error!("poll thread stopped: {e}");
                return;
            }
        }
    }
    debug!("poll thread exiting");
}

/// Reads the ready pin and runs it through the debounce rules. Returns the pin and
/// its handlers when the edge is accepted.
fn accept_notification<D: PinDriver>(
    shared: &Shared<D>,
    token: u64,
    now_us: u64,
    running: &RunningFlag,
) -> Result<Option<(u32, Vec<EventHandler>)>, EventError> {
    let mut state = shared.state.lock();
    let state = &mut *state;

    let Some(record) = state.pins.get_by_token_mut(token) else {
        debug!("dropped notification for a removed pin");
        return Ok(None);
    };
    let pin = record.pin;
    if let Err(e) = record.value_mut().read_level() {
        running.clear();
        return Err(EventError::Io(format!("read gpio {pin} value: {e}")));
    }

    if record.ignore_first {
        record.ignore_first = false;
        return Ok(None);
    }
    if !record.debounce.accept(now_us) {
        return Ok(None);
    }

    if let Err(e) = state.pending.set(pin) {
        running.clear();
        return Err(e);
    }
    Ok(Some((pin, state.callbacks.handlers(pin))))
}
