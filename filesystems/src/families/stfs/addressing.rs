// STFS block addressing
// Data blocks are interleaved with hash-table blocks: a level 0 table ahead of
// every 0xAA data blocks and a level 1 table ahead of every 0x70E4. Tables are
// one block wide or, when the container keeps two redundant copies, two.

use byteorder::{BigEndian, ByteOrder};
use log::trace;
use serde::Serialize;
use x360_core::{BlockDevice, Result, X360Error};

use super::header::ContainerHeader;

pub const BLOCK_SIZE: u64 = 0x1000;

/// Offset of data block 0 when no tables are interleaved
pub const DATA_START: u64 = 0xC000;

pub const HASH_RECORD_SIZE: usize = 0x18;

/// Data blocks covered by one level 0 table
pub const BLOCKS_PER_TABLE: u32 = 0xAA;

/// Data blocks covered by one level 1 table
pub const BLOCKS_PER_L1_TABLE: u32 = 0x70E4;

/// Status values at or above this are allocated in the table that holds them
pub const ALLOCATED: u8 = 0x80;

/// One 24-byte hash table record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockHashRecord {
    /// Data block the record describes
    pub block: u32,
    pub hash: [u8; 20],
    pub info: u8,
    pub next_block: u32,
    /// 0 for the primary table, 1 for the secondary
    pub table: u32,
}

impl BlockHashRecord {
    pub fn parse(block: u32, table: u32, data: &[u8]) -> Result<Self> {
        X360Error::check_len("STFS hash record", data, HASH_RECORD_SIZE)?;
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&data[..20]);
        Ok(Self {
            block,
            hash,
            info: data[0x14],
            next_block: BigEndian::read_u24(&data[0x15..]),
            table,
        })
    }

    pub fn is_allocated(&self) -> bool {
        self.info >= ALLOCATED
    }
}

/// Block number arithmetic for one container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockAddresser {
    shift: u32,
}

impl BlockAddresser {
    pub fn new(shift: u32) -> Self {
        Self { shift }
    }

    pub fn from_header(header: &ContainerHeader) -> Self {
        Self::new(header.table_size_shift())
    }

    pub fn shift(&self) -> u32 {
        self.shift
    }

    /// Number of blocks one hash table occupies
    pub fn table_width(&self) -> u64 {
        1 << self.shift
    }

    /// Data block number to its block index counted from `DATA_START`
    pub fn fix_blocknum(&self, block: u32) -> u64 {
        let n = block as u64;
        let mut adjust = 0;
        if block >= BLOCKS_PER_TABLE {
            adjust += (n / BLOCKS_PER_TABLE as u64 + 1) << self.shift;
        }
        if block >= BLOCKS_PER_L1_TABLE {
            adjust += (n / BLOCKS_PER_L1_TABLE as u64 + 1) << self.shift;
        }
        n + adjust
    }

    /// Device offset of a data block
    pub fn data_offset(&self, block: u32) -> u64 {
        DATA_START + self.fix_blocknum(block) * BLOCK_SIZE
    }

    /// Index of the hash table block for `block`, counted from the first table
    pub fn hash_table_block(&self, block: u32, table: u32) -> u64 {
        let n = block as u64;
        let step = if self.shift == 0 { 0xAB } else { 0xAC };
        let mut index = n / BLOCKS_PER_TABLE as u64 * step;
        if block >= BLOCKS_PER_TABLE {
            index += (n / BLOCKS_PER_L1_TABLE as u64 + 1) << self.shift;
        }
        if block >= BLOCKS_PER_L1_TABLE {
            index += 1 << self.shift;
        }
        index + table as u64
    }

    /// Device offset of the first hash table, just ahead of the data
    pub fn first_table_offset(&self) -> u64 {
        DATA_START - self.table_width() * BLOCK_SIZE
    }

    /// Device offset of the record describing `block` in the given table copy
    pub fn hash_record_offset(&self, block: u32, table: u32) -> u64 {
        let record = (block % BLOCKS_PER_TABLE) as u64;
        self.first_table_offset()
            + self.hash_table_block(block, table) * BLOCK_SIZE
            + record * HASH_RECORD_SIZE as u64
    }

    /// Read the record for `block` from one table copy
    pub fn blockhash<D: BlockDevice + ?Sized>(&self, device: &D, block: u32, table: u32) -> Result<BlockHashRecord> {
        let offset = self.hash_record_offset(block, table);
        trace!("Hash record for block {} (table {}) at {:#x}", block, table, offset);
        let data = device.read_at(offset, HASH_RECORD_SIZE as u32)?;
        BlockHashRecord::parse(block, table, &data)
    }

    /// Read the authoritative record for `block`
    ///
    /// With paired tables, a primary record that isn't allocated defers to the
    /// secondary copy.
    pub fn resolve_blockhash<D: BlockDevice + ?Sized>(&self, device: &D, block: u32) -> Result<BlockHashRecord> {
        let primary = self.blockhash(device, block, 0)?;
        if self.shift > 0 && !primary.is_allocated() {
            return self.blockhash(device, block, 1);
        }
        Ok(primary)
    }
}
