use log::{debug, warn};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::{DetectorConfig, EdgeDetect};
use crate::debounce::{Clock, SystemClock};
use crate::error::EventError;
use crate::poller::Poller;
use crate::registry::{CallbackRegistry, PendingEvents, PinRegistry};
use crate::worker::Worker;

/// Open `value` attribute of an exported pin.
pub trait ValueHandle: AsRawFd + Send {
    /// Rewinds and reads the one-byte level.
    fn read_level(&mut self) -> std::io::Result<u8>;
}

/// File-level access to the platform's GPIO interface.
pub trait PinDriver: Send + Sync {
    fn export(&self, pin: u32) -> Result<(), EventError>;
    fn unexport(&self, pin: u32) -> Result<(), EventError>;
    fn set_direction(&self, pin: u32, input: bool) -> Result<(), EventError>;
    fn set_edge(&self, pin: u32, edge: EdgeDetect) -> Result<(), EventError>;
    fn open_value(&self, pin: u32) -> Result<Box<dyn ValueHandle>, EventError>;

    /// True when pins are already inputs once exported, so the direction step is skipped.
    fn input_guaranteed(&self) -> bool {
        false
    }
}

/// Receives accepted edges. Runs on the polling thread: a handler that blocks holds up
/// delivery for every pin.
pub trait EdgeCallback: Send + Sync {
    fn on_edge(&self, pin: u32);
}

impl<F> EdgeCallback for F
where
    F: Fn(u32) + Send + Sync,
{
    fn on_edge(&self, pin: u32) {
        self(pin)
    }
}

pub type EventHandler = Arc<dyn EdgeCallback>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    EdgeDetected,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cleanup {
    Pin(u32),
    All,
}

pub(crate) struct State {
    pub(crate) pins: PinRegistry,
    pub(crate) callbacks: CallbackRegistry,
    pub(crate) pending: PendingEvents,
    pub(crate) worker: Option<Worker>,
}

pub(crate) struct Shared<D: PinDriver> {
    pub(crate) driver: D,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) state: Mutex<State>,
}

impl<D: PinDriver> Shared<D> {
    /// Unregisters and releases one pin. No-op for unknown pins.
    fn remove_pin(&self, state: &mut State, pin: u32) {
        let Some(record) = state.pins.take(pin) else {
            return;
        };
        debug!("remove edge detection on gpio {pin}");

        if record.thread_added
            && let Some(worker) = &state.worker
            && let Err(e) = worker.poller().delete(record.value().as_raw_fd())
        {
            warn!("remove gpio {pin} from poller: {e}");
        }
        state.callbacks.remove_all(pin);
        record.release(&self.driver);
        state.pending.clear(pin);
    }
}

/// Edge detection over a [`PinDriver`].
///
/// Pins added with [`add_edge_detection`](Self::add_edge_detection) are watched by one
/// background thread that marks [`poll_event_occurred`](Self::poll_event_occurred) and
/// runs callbacks. If that thread hits an unrecoverable read or wait error it stops and
/// no further asynchronous events are delivered until a pin is added again. Callers are
/// not told; the error is only logged.
///
/// [`wait_for_edge`](Self::wait_for_edge) blocks the calling thread instead and does not
/// need the background thread. The two models are exclusive per pin.
///
/// One lock guards all pin state. Setting up a new pin holds it for the whole export
/// and direction sequence, and the direction step retries for up to
/// `direction_retries * direction_retry_delay_ms` while permissions settle. Event
/// delivery for every other pin waits that long too, just as it waits on a slow
/// [`EdgeCallback`].
pub struct EdgeDetector<D: PinDriver + 'static> {
    shared: Arc<Shared<D>>,
}

impl<D: PinDriver + 'static> EdgeDetector<D> {
    pub fn new(driver: D, config: &DetectorConfig) -> Self {
        Self::with_clock(driver, config, Arc::new(SystemClock))
    }

    pub fn with_clock(driver: D, config: &DetectorConfig, clock: Arc<dyn Clock>) -> Self {
        let state = State {
            pins: PinRegistry::default(),
            callbacks: CallbackRegistry::default(),
            pending: PendingEvents::new(config.max_pins),
            worker: None,
        };
        Self {
            shared: Arc::new(Shared {
                driver,
                clock,
                state: Mutex::new(state),
            }),
        }
    }

    pub fn driver(&self) -> &D {
        &self.shared.driver
    }

    pub fn registered_pins(&self) -> Vec<u32> {
        self.shared.state.lock().pins.pins()
    }

    pub fn is_thread_running(&self) -> bool {
        self.shared
            .state
            .lock()
            .worker
            .as_ref()
            .is_some_and(Worker::is_running)
    }

    pub fn add_edge_detection(
        &self,
        pin: u32,
        edge: EdgeDetect,
        bounce_ms: Option<u32>,
    ) -> Result<(), EventError> {
        debug!("add edge detection gpio {pin}, edge {}, bounce {bounce_ms:?}", edge.as_str());
        let mut state = self.shared.state.lock();
        state.pending.check(pin)?;
        require_edge(pin, edge)?;

        let current = state.pins.edge_of(pin);
        if current == EdgeDetect::None {
            state.pins.create(&self.shared.driver, pin, edge, bounce_ms)?;
        } else if current == edge {
            let record = state
                .pins
                .get(pin)
                .ok_or_else(|| EventError::Io(format!("gpio {pin} vanished")))?;
            if (bounce_ms.is_some() && record.debounce.bounce_ms != bounce_ms)
                || record.thread_added
            {
                return Err(EventError::AlreadyAdded(format!(
                    "gpio {pin} already has edge detection"
                )));
            }
        } else {
            return Err(EventError::AlreadyAdded(format!(
                "gpio {pin} is registered for {} edges",
                current.as_str()
            )));
        }

        if let Err(e) = self.attach_to_worker(&mut state, pin) {
            self.shared.remove_pin(&mut state, pin);
            return Err(e);
        }
        Ok(())
    }

    fn attach_to_worker(&self, state: &mut State, pin: u32) -> Result<(), EventError> {
        if state.worker.is_none() {
            state.worker = Some(Worker::new()?);
        }
        let State { pins, worker, .. } = state;
        let worker = worker
            .as_mut()
            .ok_or_else(|| EventError::Multiplexer("poll worker missing".into()))?;
        let record = pins
            .get_mut(pin)
            .ok_or_else(|| EventError::Io(format!("gpio {pin} vanished")))?;

        worker
            .poller()
            .add(record.value().as_raw_fd(), record.token)
            .map_err(|e| EventError::Multiplexer(format!("register gpio {pin}: {e}")))?;
        record.thread_added = true;
        record.ignore_first = true;

        worker.ensure_running(&self.shared)
    }

    /// Stops watching `pin` and releases it. The background thread keeps running.
    pub fn remove_edge_detection(&self, pin: u32) {
        let mut state = self.shared.state.lock();
        self.shared.remove_pin(&mut state, pin);
    }

    /// True once per accepted edge since the last call.
    pub fn poll_event_occurred(&self, pin: u32) -> Result<bool, EventError> {
        self.shared.state.lock().pending.take(pin)
    }

    pub fn register_callback(&self, pin: u32, handler: EventHandler) -> Result<(), EventError> {
        let mut state = self.shared.state.lock();
        state.pending.check(pin)?;
        state.callbacks.add(pin, handler)
    }

    pub fn unregister_callbacks(&self, pin: u32) {
        self.shared.state.lock().callbacks.remove_all(pin);
    }

    /// Blocks until a debounced edge arrives on `pin` or `timeout` passes. `None` waits
    /// forever.
    pub fn wait_for_edge(
        &self,
        pin: u32,
        edge: EdgeDetect,
        bounce_ms: Option<u32>,
        timeout: Option<Duration>,
    ) -> Result<WaitOutcome, EventError> {
        debug!("wait for edge gpio {pin}, edge {}, timeout {timeout:?}", edge.as_str());
        let registration = self.register_blocking(pin, edge, bounce_ms)?;
        // a deadline past what `Instant` can represent is the same as no deadline
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut initial = true;

        loop {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            let ready = registration
                .poller
                .wait(remaining)
                .map_err(|e| EventError::Multiplexer(format!("wait on gpio {pin}: {e}")))?;
            let Some(token) = ready else {
                return Ok(WaitOutcome::TimedOut);
            };
            let now = self.shared.clock.now_us();

            let mut state = self.shared.state.lock();
            let record = state
                .pins
                .get_mut(pin)
                .filter(|r| r.token == registration.token)
                .ok_or_else(|| EventError::Io(format!("gpio {pin} removed while waiting")))?;
            if token != registration.token {
                return Err(EventError::Io(format!(
                    "unexpected notification while waiting on gpio {pin}"
                )));
            }
            record
                .value_mut()
                .read_level()
                .map_err(|e| EventError::Io(format!("read gpio {pin} value: {e}")))?;

            // the first notification reports the level at registration
            if initial {
                initial = false;
                continue;
            }
            if record.debounce.accept(now) {
                return Ok(WaitOutcome::EdgeDetected);
            }
        }
    }

    fn register_blocking(
        &self,
        pin: u32,
        edge: EdgeDetect,
        bounce_ms: Option<u32>,
    ) -> Result<BlockingRegistration<'_, D>, EventError> {
        let mut state = self.shared.state.lock();
        state.pending.check(pin)?;
        require_edge(pin, edge)?;
        if state.callbacks.exists(pin) {
            return Err(EventError::AlreadyRegistered(format!(
                "gpio {pin} has edge callbacks"
            )));
        }

        let current = state.pins.edge_of(pin);
        if current == EdgeDetect::None {
            state.pins.create(&self.shared.driver, pin, edge, bounce_ms)?;
        }
        let record = state
            .pins
            .get_mut(pin)
            .ok_or_else(|| EventError::Io(format!("gpio {pin} vanished")))?;
        if current == edge {
            if record.debounce.bounce_ms.is_some() && record.debounce.bounce_ms != bounce_ms {
                return Err(EventError::EdgeConflict(format!(
                    "gpio {pin} is registered with bounce {:?} ms",
                    record.debounce.bounce_ms
                )));
            }
        } else if current != EdgeDetect::None {
            record.reconfigure(&self.shared.driver, edge, bounce_ms)?;
        }

        let poller =
            Poller::new().map_err(|e| EventError::Multiplexer(format!("create poller: {e}")))?;
        let fd = record.value().as_raw_fd();
        poller
            .add(fd, record.token)
            .map_err(|e| EventError::Multiplexer(format!("register gpio {pin}: {e}")))?;

        Ok(BlockingRegistration {
            shared: &self.shared,
            poller,
            pin,
            token: record.token,
            fd,
        })
    }

    /// Removes one pin, or every pin. Once no pins remain the background thread is
    /// stopped and its poller closed. Repeating a cleanup is harmless.
    pub fn cleanup(&self, target: Cleanup) {
        let worker = {
            let mut state = self.shared.state.lock();
            match target {
                Cleanup::Pin(pin) => self.shared.remove_pin(&mut state, pin),
                Cleanup::All => {
                    for pin in state.pins.pins() {
                        self.shared.remove_pin(&mut state, pin);
                    }
                }
            }
            if state.pins.is_empty() {
                state.worker.take()
            } else {
                None
            }
        };

        // joined outside the lock: the thread may be waiting for it
        if let Some(worker) = worker {
            worker.shutdown();
        }
    }
}

impl<D: PinDriver + 'static> Drop for EdgeDetector<D> {
    fn drop(&mut self) {
        self.cleanup(Cleanup::All);
    }
}

fn require_edge(pin: u32, edge: EdgeDetect) -> Result<(), EventError> {
    if edge == EdgeDetect::None {
        return Err(EventError::InvalidEdge(format!(
            "gpio {pin} needs an edge other than none"
        )));
    }
    Ok(())
}

/// A pin's value handle registered with a private poller for one blocking wait.
/// Dropping it unregisters the handle and closes the poller.
struct BlockingRegistration<'a, D: PinDriver> {
    shared: &'a Shared<D>,
    poller: Poller,
    pin: u32,
    token: u64,
    fd: RawFd,
}

impl<D: PinDriver> Drop for BlockingRegistration<'_, D> {
    fn drop(&mut self) {
        let state = self.shared.state.lock();
        // a removed pin already took its handle out of every poller by closing it
        if state.pins.get(self.pin).is_some_and(|r| r.token == self.token)
            && let Err(e) = self.poller.delete(self.fd)
        {
            warn!("remove gpio {} from blocking poller: {e}", self.pin);
        }
    }
}
