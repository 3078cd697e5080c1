// Filesystem Families Organization
// XTAF partitions and the STFS containers stored inside them

pub mod stfs;
pub mod xtaf;

/// Signature information for a filesystem family
#[derive(Debug, Clone)]
pub struct FamilySignature {
    /// Offset in the device where signature appears
    pub offset: u64,
    /// The signature bytes
    pub signature: Vec<u8>,
    /// Which variant this signature indicates
    pub variant_hint: Option<String>,
}

impl FamilySignature {
    /// True when `data`, read from `self.offset`, starts with the signature
    pub fn matches(&self, data: &[u8]) -> bool {
        data.starts_with(&self.signature)
    }
}
