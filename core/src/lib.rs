pub mod device;
pub mod error;

pub use device::{BlockDevice, DeviceOptions, FileDevice, MemoryDevice, SliceDevice};
pub use error::{Anomaly, AnomalyKind, Result, X360Error};
