use log::{debug, warn};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::config::{DetectorConfig, EdgeDetect};
use crate::error::EventError;
use crate::gpio::{PinDriver, ValueHandle};

/// Maps a logical pin number onto the number the kernel knows it by.
pub type PinTranslation = Arc<dyn Fn(u32) -> u32 + Send + Sync>;

/// Driver for the legacy `/sys/class/gpio` interface.
pub struct SysfsDriver {
    root: PathBuf,
    translate: Option<PinTranslation>,
    direction_retries: u32,
    direction_retry_delay: Duration,
}

impl SysfsDriver {
    pub fn new(config: &DetectorConfig) -> Self {
        Self {
            root: config.sysfs_root.clone(),
            translate: None,
            direction_retries: config.direction_retries,
            direction_retry_delay: config.direction_retry_delay(),
        }
    }

    /// Installs a board pin mapping. Boards that need one configure their pins as
    /// inputs during translation, so [`PinDriver::input_guaranteed`] becomes true.
    pub fn with_translation(mut self, translate: PinTranslation) -> Self {
        self.translate = Some(translate);
        self
    }

    fn native(&self, pin: u32) -> u32 {
        match &self.translate {
            Some(translate) => {
                let native = translate(pin);
                debug!("translated gpio {pin} to {native}");
                native
            }
            None => pin,
        }
    }

    fn pin_dir(&self, native: u32) -> PathBuf {
        self.root.join(format!("gpio{native}"))
    }

    fn write_control(&self, name: &str, native: u32) -> Result<(), EventError> {
        let path = self.root.join(name);
        let mut file = OpenOptions::new()
            .write(true)
            .open(&path)
            .map_err(|e| EventError::Io(format!("open {}: {e}", path.display())))?;
        file.write_all(native.to_string().as_bytes())
            .map_err(|e| EventError::Io(format!("write {}: {e}", path.display())))
    }
}

fn write_attribute(path: &Path, value: &str) -> Result<(), EventError> {
    let mut file = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| EventError::Io(format!("open {}: {e}", path.display())))?;
    file.write_all(value.as_bytes())
        .map_err(|e| EventError::Io(format!("write {}: {e}", path.display())))
}

impl PinDriver for SysfsDriver {
    fn export(&self, pin: u32) -> Result<(), EventError> {
        let native = self.native(pin);
        if self.pin_dir(native).exists() {
            debug!("gpio {native} already exported");
            return Ok(());
        }
        self.write_control("export", native)
    }

    fn unexport(&self, pin: u32) -> Result<(), EventError> {
        let native = self.native(pin);
        self.write_control("unexport", native)
    }

    fn set_direction(&self, pin: u32, input: bool) -> Result<(), EventError> {
        let path = self.pin_dir(self.native(pin)).join("direction");

        // udev fixes up the attribute permissions some time after export
        let mut file = None;
        for _ in 0..self.direction_retries {
            match OpenOptions::new().write(true).open(&path) {
                Ok(f) => {
                    file = Some(f);
                    break;
                }
                Err(_) => thread::sleep(self.direction_retry_delay),
            }
        }
        let Some(mut file) = file else {
            warn!("open {} timed out", path.display());
            return Err(EventError::Io(format!(
                "open {}: timed out after {} attempts",
                path.display(),
                self.direction_retries
            )));
        };

        let value = if input { "in" } else { "out" };
        file.write_all(value.as_bytes())
            .map_err(|e| EventError::Io(format!("write {}: {e}", path.display())))
    }

    fn set_edge(&self, pin: u32, edge: EdgeDetect) -> Result<(), EventError> {
        let native = self.native(pin);
        debug!("set gpio {native} edge to {}", edge.as_str());
        write_attribute(&self.pin_dir(native).join("edge"), edge.as_str())
    }

    fn open_value(&self, pin: u32) -> Result<Box<dyn ValueHandle>, EventError> {
        let path = self.pin_dir(self.native(pin)).join("value");
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&path)
            .map_err(|e| EventError::Io(format!("open {}: {e}", path.display())))?;
        Ok(Box::new(SysfsValue { file }))
    }

    fn input_guaranteed(&self) -> bool {
        self.translate.is_some()
    }
}

struct SysfsValue {
    file: File,
}

impl AsRawFd for SysfsValue {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl ValueHandle for SysfsValue {
    fn read_level(&mut self) -> std::io::Result<u8> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut buf = [0u8; 1];
        self.file.read_exact(&mut buf)?;
        Ok(buf[0])
    }
}
