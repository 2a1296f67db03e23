use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of edge timestamps, in microseconds.
pub trait Clock: Send + Sync {
    fn now_us(&self) -> u64;
}

/// Wall clock. It can step backwards, which is what the clock-backward rule in
/// [`should_accept`] guards against.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_us(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0)
    }
}

/// Manually driven clock.
#[derive(Debug, Default)]
pub struct MockClock {
    now_us: AtomicU64,
}

impl MockClock {
    pub fn new(now_us: u64) -> Self {
        Self {
            now_us: AtomicU64::new(now_us),
        }
    }

    pub fn set_ms(&self, now_ms: u64) {
        self.now_us.store(now_ms * 1000, Ordering::SeqCst);
    }

    pub fn set_us(&self, now_us: u64) {
        self.now_us.store(now_us, Ordering::SeqCst);
    }
}

impl Clock for MockClock {
    fn now_us(&self) -> u64 {
        self.now_us.load(Ordering::SeqCst)
    }
}

/// Decides whether an edge seen at `now_us` is far enough from the last accepted one.
///
/// A `last_accepted_us` in the future is accepted as well. That masks a wall clock
/// stepping backwards instead of reporting it; kept for compatibility with existing
/// pin-control callers.
pub fn should_accept(bounce_ms: Option<u32>, last_accepted_us: u64, now_us: u64) -> bool {
    match bounce_ms {
        None => true,
        Some(_) if last_accepted_us == 0 => true,
        Some(_) if last_accepted_us > now_us => true,
        Some(bounce) => now_us - last_accepted_us > u64::from(bounce) * 1000,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DebounceState {
    pub bounce_ms: Option<u32>,
    pub last_accepted_us: u64,
}

impl DebounceState {
    pub fn new(bounce_ms: Option<u32>) -> Self {
        Self {
            bounce_ms,
            last_accepted_us: 0,
        }
    }

    /// Runs the decision and records `now_us` when the edge is accepted.
    pub fn accept(&mut self, now_us: u64) -> bool {
        if should_accept(self.bounce_ms, self.last_accepted_us, now_us) {
            self.last_accepted_us = now_us;
            true
        } else {
            false
        }
    }
}
