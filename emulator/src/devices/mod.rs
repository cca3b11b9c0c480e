//! The peripheral devices, addressed through registers in the I/O page.

mod disk;
mod serial;

pub use self::disk::{ControlStatus, Disk, DiskError, ErrorReg};
pub use self::serial::{LineCsr, Serial};
