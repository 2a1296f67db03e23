pub mod backend;
mod config;
mod debounce;
mod error;
mod gpio;
mod poller;
mod registry;
mod worker;

pub use config::{DaemonConfig, DetectorConfig, EdgeDetect, WatchConfig};
pub use debounce::{Clock, DebounceState, MockClock, SystemClock, should_accept};
pub use error::{EventError, ResultCode};
pub use gpio::{
    Cleanup, EdgeCallback, EdgeDetector, EventHandler, PinDriver, ValueHandle, WaitOutcome,
};

pub use backend::MockDriver;
pub use backend::mock::MockStep;
#[cfg(feature = "sysfs-gpio")]
pub use backend::SysfsDriver;
