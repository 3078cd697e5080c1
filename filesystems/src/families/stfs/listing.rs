// STFS file table records
// 64 bytes each: name (0x28), flags, block count (u24 LE), a copy of the
// block count, first block (u24 LE), parent slot (i16 BE), size (u32 BE) and
// two FAT date/time pairs

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use chrono::NaiveDateTime;
use serde::Serialize;
use x360_core::{Result, X360Error};

use crate::timestamps::fat_datetime;

pub const LISTING_SIZE: usize = 0x40;
pub const NAME_LEN: usize = 0x28;

const FLAG_DIRECTORY: u8 = 0x80;

/// Parent index of entries that live in the root
pub const ROOT_PARENT: i16 = -1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileListing {
    pub name: String,
    pub flags: u8,
    pub block_count: u32,
    pub first_block: u32,
    /// File table slot of the parent directory, -1 for the root
    pub parent_index: i16,
    pub size: u32,
    pub udate: u16,
    pub utime: u16,
    pub adate: u16,
    pub atime: u16,
}

impl FileListing {
    /// Decode one slot; an empty name means the slot is unused
    pub fn parse(data: &[u8]) -> Result<Option<Self>> {
        X360Error::check_len("STFS file listing", data, LISTING_SIZE)?;

        let name_field = &data[..NAME_LEN];
        let start = name_field.iter().position(|&b| b != 0).unwrap_or(NAME_LEN);
        let end = name_field.iter().rposition(|&b| b != 0).map_or(start, |p| p + 1);
        if start == end {
            return Ok(None);
        }

        Ok(Some(Self {
            name: name_field[start..end].iter().map(|&b| b as char).collect(),
            flags: data[0x28],
            block_count: LittleEndian::read_u24(&data[0x29..]),
            first_block: LittleEndian::read_u24(&data[0x2F..]),
            parent_index: BigEndian::read_i16(&data[0x32..]),
            size: BigEndian::read_u32(&data[0x34..]),
            udate: BigEndian::read_u16(&data[0x38..]),
            utime: BigEndian::read_u16(&data[0x3A..]),
            adate: BigEndian::read_u16(&data[0x3C..]),
            atime: BigEndian::read_u16(&data[0x3E..]),
        }))
    }

    pub fn is_directory(&self) -> bool {
        self.flags & FLAG_DIRECTORY != 0
    }

    pub fn modified(&self) -> Option<NaiveDateTime> {
        fat_datetime(self.udate, self.utime)
    }

    pub fn accessed(&self) -> Option<NaiveDateTime> {
        fat_datetime(self.adate, self.atime)
    }
}

/// Decode a whole file table, one element per 64-byte slot
///
/// Slot positions are kept, empty slots included, because parent indices
/// refer to them.
pub fn parse_listings(data: &[u8]) -> Vec<Option<FileListing>> {
    data.chunks_exact(LISTING_SIZE)
        .map(|slot| FileListing::parse(slot).ok().flatten())
        .collect()
}
