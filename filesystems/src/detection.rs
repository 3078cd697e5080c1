// Format detection for Xbox 360 files and images
// Works from a short prefix plus the total length, the same information a
// directory walk has on hand for every file it meets

use log::trace;
use serde::Serialize;
use x360_core::{BlockDevice, Result};

use crate::families::{stfs, xtaf};

pub const PNG_SIGNATURE: &[u8; 8] = b"\x89PNG\r\n\x1a\n";
pub const XDBF_MAGIC: &[u8; 4] = b"XDBF";

/// Account records have no magic, only a fixed size
pub const ACCOUNT_SIZE: u64 = 404;

/// Bytes of prefix `detect_bytes` needs
pub const PREFIX_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FileKind {
    Png,
    Xdbf,
    Stfs,
    Account,
    Xtaf,
    Unknown,
}

impl FileKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileKind::Png => "PNG",
            FileKind::Xdbf => "XDBF",
            FileKind::Stfs => "STFS",
            FileKind::Account => "Account",
            FileKind::Xtaf => "XTAF",
            FileKind::Unknown => "Unknown",
        }
    }
}

impl std::fmt::Display for FileKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a file from its first bytes and its length
///
/// Checks run in a fixed order and the first match wins, so a 404-byte file
/// that happens to start with a magic is still reported by its magic.
pub fn detect_bytes(prefix: &[u8], total_len: u64) -> FileKind {
    if prefix.starts_with(PNG_SIGNATURE) {
        return FileKind::Png;
    }
    if prefix.starts_with(XDBF_MAGIC) {
        return FileKind::Xdbf;
    }
    if stfs::signatures().iter().any(|sig| sig.offset == 0 && sig.matches(prefix)) {
        return FileKind::Stfs;
    }
    if total_len == ACCOUNT_SIZE {
        return FileKind::Account;
    }
    if prefix.starts_with(xtaf::XTAF_MAGIC) {
        return FileKind::Xtaf;
    }
    FileKind::Unknown
}

/// Classify the contents of a device
///
/// Besides the prefix checks this looks for a data partition at its usual
/// offset on a whole-drive image.
pub fn detect_device<D: BlockDevice + ?Sized>(device: &D) -> Result<FileKind> {
    let prefix = device.read_at(0, PREFIX_LEN as u32)?;
    let kind = detect_bytes(&prefix, device.len());
    if kind != FileKind::Unknown {
        return Ok(kind);
    }

    for sig in xtaf::signatures().iter().filter(|sig| sig.offset > 0) {
        if device.len() <= sig.offset {
            continue;
        }
        trace!("Probing for XTAF at {:#x}", sig.offset);
        let data = device.read_at(sig.offset, sig.signature.len() as u32)?;
        if sig.matches(&data) {
            return Ok(FileKind::Xtaf);
        }
    }
    Ok(FileKind::Unknown)
}
