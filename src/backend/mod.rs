pub mod mock;
#[cfg(feature = "sysfs-gpio")]
pub mod sysfs;

pub use mock::MockDriver;
#[cfg(feature = "sysfs-gpio")]
pub use sysfs::SysfsDriver;
