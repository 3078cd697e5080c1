// XTAF Filesystem
// The console's FAT derivative for hard drive and memory unit partitions

pub mod cluster_table;
pub mod directory;
pub mod tree;

pub use cluster_table::{ChainEnd, ClusterChain, ClusterTable};
pub use directory::{parse_records, DirectorySlot, FileRecord};
pub use tree::{
    Walk, XtafEntry, XtafFileDevice, XtafGeometry, XtafOptions, XtafTree, CLUSTER_SIZE,
    DATA_PARTITION_OFFSET, XTAF_MAGIC,
};

use super::FamilySignature;

/// Places an XTAF superblock is looked for
pub fn signatures() -> Vec<FamilySignature> {
    vec![
        FamilySignature {
            offset: 0,
            signature: XTAF_MAGIC.to_vec(),
            variant_hint: Some("partition image".to_string()),
        },
        FamilySignature {
            offset: DATA_PARTITION_OFFSET,
            signature: XTAF_MAGIC.to_vec(),
            variant_hint: Some("retail drive image".to_string()),
        },
    ]
}
