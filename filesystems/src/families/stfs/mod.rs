// STFS Containers
// Saves, profiles and downloaded content, each stored as a single file on an
// XTAF partition

pub mod addressing;
pub mod header;
pub mod listing;
pub mod tree;

pub use addressing::{BlockAddresser, BlockHashRecord, BLOCK_SIZE};
pub use header::{table_size_shift, ContainerHeader, ContainerMagic, ContentType, HEADER_SIZE};
pub use listing::{parse_listings, FileListing};
pub use tree::{StfsEntry, StfsTree};

use super::FamilySignature;

pub fn signatures() -> Vec<FamilySignature> {
    [ContainerMagic::Con, ContainerMagic::Pirs, ContainerMagic::Live]
        .iter()
        .map(|magic| FamilySignature {
            offset: 0,
            signature: magic.as_str().as_bytes().to_vec(),
            variant_hint: Some(magic.as_str().trim_end().to_string()),
        })
        .collect()
}
