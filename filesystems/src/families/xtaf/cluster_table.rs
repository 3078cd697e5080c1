// XTAF cluster allocation table
// The whole FAT is held in memory as big-endian 32-bit cells since chain
// derivation does many random lookups per file

use byteorder::{BigEndian, ByteOrder};
use log::{debug, warn};
use x360_core::{BlockDevice, Result};

/// Size of one FAT cell in bytes
pub const FAT_ENTRY_SIZE: usize = 4;

/// Any cell whose low 28 bits are all set terminates a chain
pub const CHAIN_TERMINATOR: u32 = 0x0FFF_FFFF;

const ENTRY_MASK: u32 = 0x0FFF_FFFF;

/// Largest single device read used while loading the table
const LOAD_CHUNK: u64 = 0x10_0000;

/// Why a cluster chain stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainEnd {
    /// Start cluster was 0, the file owns no data
    Empty,
    /// Reached a terminator cell
    Terminator,
    /// The next lookup fell outside the table
    OutOfBounds { cluster: u32 },
    /// More hops than there are clusters, the chain loops
    HopLimit,
}

/// Ordered clusters of one file plus how the walk ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterChain {
    pub clusters: Vec<u32>,
    pub end: ChainEnd,
}

impl ClusterChain {
    /// True when the walk ended on something other than a terminator or an empty file
    pub fn is_inconsistent(&self) -> bool {
        matches!(self.end, ChainEnd::OutOfBounds { .. } | ChainEnd::HopLimit)
    }
}

/// In-memory copy of the FAT region
pub struct ClusterTable {
    data: Vec<u8>,
}

impl ClusterTable {
    /// Load `entries` cells starting at byte `fat_start` of the device
    pub fn load<D: BlockDevice + ?Sized>(device: &D, fat_start: u64, entries: u64) -> Result<Self> {
        let total = entries * FAT_ENTRY_SIZE as u64;
        let mut data = Vec::with_capacity(total as usize);

        let mut offset = 0u64;
        while offset < total {
            let want = (total - offset).min(LOAD_CHUNK) as u32;
            let chunk = device.read_at(fat_start + offset, want)?;
            let got = chunk.len() as u64;
            data.extend_from_slice(&chunk);
            if got < want as u64 {
                warn!(
                    "FAT region truncated by end of device: wanted {:#x} bytes, got {:#x}",
                    total,
                    offset + got
                );
                break;
            }
            offset += got;
        }

        // Drop any trailing partial cell
        data.truncate(data.len() / FAT_ENTRY_SIZE * FAT_ENTRY_SIZE);
        debug!("Loaded FAT: {} entries from {:#x}", data.len() / FAT_ENTRY_SIZE, fat_start);
        Ok(Self { data })
    }

    pub fn from_bytes(mut data: Vec<u8>) -> Self {
        data.truncate(data.len() / FAT_ENTRY_SIZE * FAT_ENTRY_SIZE);
        Self { data }
    }

    pub fn entry_count(&self) -> usize {
        self.data.len() / FAT_ENTRY_SIZE
    }

    /// Raw cell for `cluster`, `None` past the end of the table
    pub fn entry(&self, cluster: u32) -> Option<u32> {
        let offset = cluster as usize * FAT_ENTRY_SIZE;
        self.data
            .get(offset..offset + FAT_ENTRY_SIZE)
            .map(BigEndian::read_u32)
    }

    /// Follow the chain that starts at `start`
    ///
    /// The start cluster is always the first element. The walk stops at a
    /// terminator, at a lookup outside the table, or once it has taken more
    /// hops than the table has cells.
    pub fn chain(&self, start: u32) -> ClusterChain {
        if start == 0 {
            return ClusterChain {
                clusters: Vec::new(),
                end: ChainEnd::Empty,
            };
        }

        let max_hops = self.entry_count().max(1);
        let mut clusters = vec![start];
        let mut current = start;

        let end = loop {
            let next = match self.entry(current) {
                Some(next) => next,
                None => break ChainEnd::OutOfBounds { cluster: current },
            };
            if next & ENTRY_MASK == CHAIN_TERMINATOR {
                break ChainEnd::Terminator;
            }
            if clusters.len() >= max_hops {
                break ChainEnd::HopLimit;
            }
            clusters.push(next);
            current = next;
        };

        ClusterChain { clusters, end }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use x360_core::MemoryDevice;

    fn table(cells: &[u32]) -> ClusterTable {
        let mut data = Vec::new();
        for cell in cells {
            data.extend_from_slice(&cell.to_be_bytes());
        }
        ClusterTable::from_bytes(data)
    }

    #[test]
    fn test_cluster_chain_reading() {
        // 2 -> 3 -> 5 -> END
        let fat = table(&[0, 0, 3, 5, 0, 0xFFFF_FFFF, 0]);
        let chain = fat.chain(2);
        assert_eq!(chain.clusters, vec![2, 3, 5]);
        assert_eq!(chain.end, ChainEnd::Terminator);
        assert!(!chain.is_inconsistent());
    }

    #[test]
    fn test_terminator_ignores_high_nibble() {
        let fat = table(&[0, 0x0FFF_FFFF, 0xFFFF_FFFF, 0x7FFF_FFFF]);
        assert_eq!(fat.chain(1).clusters, vec![1]);
        assert_eq!(fat.chain(2).clusters, vec![2]);
        assert_eq!(fat.chain(3).clusters, vec![3]);
    }

    #[test]
    fn test_zero_start_is_empty() {
        let fat = table(&[0xFFFF_FFFF; 4]);
        let chain = fat.chain(0);
        assert!(chain.clusters.is_empty());
        assert_eq!(chain.end, ChainEnd::Empty);
        assert!(!chain.is_inconsistent());
    }

    #[test]
    fn test_out_of_bounds_keeps_partial_chain() {
        // 1 -> 2 -> 9, and 9 is past the table
        let fat = table(&[0, 2, 9, 0]);
        let chain = fat.chain(1);
        assert_eq!(chain.clusters, vec![1, 2, 9]);
        assert_eq!(chain.end, ChainEnd::OutOfBounds { cluster: 9 });
        assert!(chain.is_inconsistent());
    }

    #[test]
    fn test_cycle_hits_hop_limit() {
        // 1 -> 2 -> 3 -> 1 -> ...
        let fat = table(&[0, 2, 3, 1]);
        let chain = fat.chain(1);
        assert_eq!(chain.end, ChainEnd::HopLimit);
        assert_eq!(chain.clusters.len(), fat.entry_count());
    }

    #[test]
    fn test_load_from_device() {
        let mut image = vec![0u8; 0x1000];
        image.extend_from_slice(&0u32.to_be_bytes());
        image.extend_from_slice(&2u32.to_be_bytes());
        image.extend_from_slice(&0xFFFF_FFFFu32.to_be_bytes());
        let dev = MemoryDevice::new(image);

        // Asking for more cells than exist truncates instead of failing
        let fat = ClusterTable::load(&dev, 0x1000, 8).unwrap();
        assert_eq!(fat.entry_count(), 3);
        assert_eq!(fat.chain(1).clusters, vec![1, 2]);
    }
}
