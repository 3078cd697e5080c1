// Readers for Xbox 360 storage: XTAF partitions, the STFS containers stored
// on them, and the profile records found inside those containers

pub mod detection;
pub mod families;
pub mod ops;
pub mod profile;
pub mod strings;
pub mod timestamps;

pub use detection::{detect_bytes, detect_device, FileKind};

pub use families::stfs::{ContainerHeader, ContainerMagic, ContentType, FileListing, StfsEntry, StfsTree};
pub use families::xtaf::{FileRecord, XtafEntry, XtafFileDevice, XtafGeometry, XtafOptions, XtafTree};

pub use ops::{DirectoryEntry, FileAttributes, FilesystemOps};

pub use profile::{decrypt_account, AccountInfo, Xdbf};
