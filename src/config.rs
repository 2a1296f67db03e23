use std::{fs, path::Path, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::EventError;

pub const DEFAULT_SYSFS_ROOT: &str = "/sys/class/gpio";
pub const DEFAULT_MAX_PINS: usize = 54;

#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum EdgeDetect {
    #[default]
    None,
    Rising,
    Falling,
    Both,
}

impl EdgeDetect {
    /// Token written to the pin's `edge` attribute.
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeDetect::None => "none",
            EdgeDetect::Rising => "rising",
            EdgeDetect::Falling => "falling",
            EdgeDetect::Both => "both",
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct DetectorConfig {
    pub sysfs_root: PathBuf,
    pub max_pins: usize,
    pub direction_retries: u32,
    pub direction_retry_delay_ms: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            sysfs_root: PathBuf::from(DEFAULT_SYSFS_ROOT),
            max_pins: DEFAULT_MAX_PINS,
            direction_retries: 100,
            direction_retry_delay_ms: 10,
        }
    }
}

impl DetectorConfig {
    pub fn direction_retry_delay(&self) -> Duration {
        Duration::from_millis(self.direction_retry_delay_ms)
    }

    fn validate(&self) -> Result<(), EventError> {
        if self.max_pins == 0 {
            return Err(EventError::Config("max_pins must be at least 1".into()));
        }
        if self.direction_retries == 0 {
            return Err(EventError::Config(
                "direction_retries must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct WatchConfig {
    pub pin: u32,
    pub edge: EdgeDetect,
    #[serde(default)]
    pub bounce_ms: Option<u32>,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, PartialEq)]
pub struct DaemonConfig {
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub watch: Vec<WatchConfig>,
}

impl DaemonConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, EventError> {
        let contents = fs::read_to_string(&path)
            .map_err(|e| EventError::Config(format!("Failed to read config: {e}")))?;
        Self::from_json(&contents)
    }

    pub fn from_json(contents: &str) -> Result<Self, EventError> {
        let config: Self = serde_json::from_str(contents)
            .map_err(|e| EventError::Config(format!("Invalid config json: {e}")))?;
        config.detector.validate()?;

        for watch in &config.watch {
            if watch.edge == EdgeDetect::None {
                return Err(EventError::Config(format!(
                    "watched pin {} needs an edge other than none",
                    watch.pin
                )));
            }
            if watch.pin as usize >= config.detector.max_pins {
                return Err(EventError::Config(format!(
                    "watched pin {} exceeds max_pins {}",
                    watch.pin, config.detector.max_pins
                )));
            }
        }
        Ok(config)
    }
}
