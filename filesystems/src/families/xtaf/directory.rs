// XTAF directory records
// A directory's data is a run of fixed 64-byte records, big-endian fields:
//   0x00 name length   0x01 attributes   0x02 name (42 bytes, 0x00/0xFF padded)
//   0x2C first cluster  0x30 size
//   0x34 cdate 0x36 ctime 0x38 adate 0x3A atime 0x3C mdate 0x3E mtime

use byteorder::{BigEndian, ByteOrder};
use chrono::NaiveDateTime;
use serde::Serialize;
use x360_core::{Result, X360Error};

use crate::timestamps::fat_datetime;

pub const RECORD_SIZE: usize = 64;
pub const MAX_NAME_LEN: usize = 42;

/// Name-length byte of a deleted entry
pub const DELETED_MARKER: u8 = 0xE5;

/// Prefix given to recovered names of deleted entries
pub const DELETED_NAME_PREFIX: char = '~';

/// One directory record, fields in host byte order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileRecord {
    pub name_len: u8,
    pub attributes: u8,
    pub name: String,
    pub cluster: u32,
    pub size: u32,
    pub cdate: u16,
    pub ctime: u16,
    pub adate: u16,
    pub atime: u16,
    pub mdate: u16,
    pub mtime: u16,
}

impl FileRecord {
    /// Size 0 marks a directory, the attribute bits are not consulted
    pub fn is_directory(&self) -> bool {
        self.size == 0
    }

    pub fn is_deleted(&self) -> bool {
        self.name_len == DELETED_MARKER
    }

    pub fn created(&self) -> Option<NaiveDateTime> {
        fat_datetime(self.cdate, self.ctime)
    }

    pub fn accessed(&self) -> Option<NaiveDateTime> {
        fat_datetime(self.adate, self.atime)
    }

    pub fn modified(&self) -> Option<NaiveDateTime> {
        fat_datetime(self.mdate, self.mtime)
    }
}

/// Outcome of decoding one 64-byte slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectorySlot {
    Entry(FileRecord),
    /// Name length 0, an unused slot; scanning continues past it
    Vacant,
    /// Name length above 42, nothing after this slot is a record
    End,
}

/// Decode a single slot
pub fn parse_slot(data: &[u8]) -> Result<DirectorySlot> {
    X360Error::check_len("XTAF directory record", data, RECORD_SIZE)?;

    let name_len = data[0];
    let name_field = &data[2..2 + MAX_NAME_LEN];
    let name = match name_len {
        DELETED_MARKER => format!("{}{}", DELETED_NAME_PREFIX, decode_name(name_field)),
        0 => return Ok(DirectorySlot::Vacant),
        n if n as usize > MAX_NAME_LEN => return Ok(DirectorySlot::End),
        _ => decode_name(name_field),
    };

    Ok(DirectorySlot::Entry(FileRecord {
        name_len,
        attributes: data[1],
        name,
        cluster: BigEndian::read_u32(&data[0x2C..]),
        size: BigEndian::read_u32(&data[0x30..]),
        cdate: BigEndian::read_u16(&data[0x34..]),
        ctime: BigEndian::read_u16(&data[0x36..]),
        adate: BigEndian::read_u16(&data[0x38..]),
        atime: BigEndian::read_u16(&data[0x3A..]),
        mdate: BigEndian::read_u16(&data[0x3C..]),
        mtime: BigEndian::read_u16(&data[0x3E..]),
    }))
}

/// Decode every record in a directory's raw data
///
/// Vacant slots are skipped and the scan stops at the first end slot. Bytes
/// after the last whole record are ignored.
pub fn parse_records(data: &[u8]) -> Vec<FileRecord> {
    let mut records = Vec::new();
    for chunk in data.chunks_exact(RECORD_SIZE) {
        match parse_slot(chunk) {
            Ok(DirectorySlot::Entry(record)) => records.push(record),
            Ok(DirectorySlot::Vacant) => continue,
            Ok(DirectorySlot::End) | Err(_) => break,
        }
    }
    records
}

/// The name field ignores the length byte; padding is trimmed from both ends
fn decode_name(field: &[u8]) -> String {
    let is_pad = |b: &u8| *b == 0x00 || *b == 0xFF;
    let start = field.iter().position(|b| !is_pad(b)).unwrap_or(field.len());
    let end = field.iter().rposition(|b| !is_pad(b)).map_or(start, |p| p + 1);
    field[start..end].iter().map(|&b| b as char).collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build one raw directory record
    pub(crate) fn record_bytes(name_len: u8, name: &str, cluster: u32, size: u32) -> Vec<u8> {
        let mut rec = vec![0xFFu8; RECORD_SIZE];
        rec[0] = name_len;
        rec[1] = 0;
        rec[2..2 + name.len()].copy_from_slice(name.as_bytes());
        rec[0x2C..0x30].copy_from_slice(&cluster.to_be_bytes());
        rec[0x30..0x34].copy_from_slice(&size.to_be_bytes());
        // 2005-11-22 10:20:30
        for off in [0x34, 0x38, 0x3C] {
            rec[off..off + 2].copy_from_slice(&0x3376u16.to_be_bytes());
            rec[off + 2..off + 4].copy_from_slice(&((10u16 << 11) | (20 << 5) | 15).to_be_bytes());
        }
        rec
    }

    #[test]
    fn test_parse_file_record() {
        let rec = record_bytes(8, "save.dat", 7, 1234);
        match parse_slot(&rec).unwrap() {
            DirectorySlot::Entry(r) => {
                assert_eq!(r.name, "save.dat");
                assert_eq!(r.cluster, 7);
                assert_eq!(r.size, 1234);
                assert!(!r.is_directory());
                assert!(!r.is_deleted());
                assert_eq!(r.modified().unwrap().to_string(), "2005-11-22 10:20:30");
            }
            other => panic!("unexpected slot: {:?}", other),
        }
    }

    #[test]
    fn test_zero_size_is_directory() {
        let rec = record_bytes(7, "Content", 3, 0);
        match parse_slot(&rec).unwrap() {
            DirectorySlot::Entry(r) => assert!(r.is_directory()),
            other => panic!("unexpected slot: {:?}", other),
        }
    }

    #[test]
    fn test_deleted_entry_name() {
        let rec = record_bytes(DELETED_MARKER, "gone.txt", 4, 10);
        match parse_slot(&rec).unwrap() {
            DirectorySlot::Entry(r) => {
                assert_eq!(r.name, "~gone.txt");
                assert!(r.is_deleted());
            }
            other => panic!("unexpected slot: {:?}", other),
        }
    }

    #[test]
    fn test_vacant_slot_does_not_terminate() {
        let mut data = record_bytes(1, "a", 2, 1);
        data.extend(vec![0u8; RECORD_SIZE]);
        data.extend(record_bytes(1, "b", 3, 1));
        let names: Vec<_> = parse_records(&data).into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_long_name_len_terminates() {
        let mut data = record_bytes(1, "a", 2, 1);
        data.extend(vec![0xFFu8; RECORD_SIZE]);
        data.extend(record_bytes(1, "b", 3, 1));
        let names: Vec<_> = parse_records(&data).into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["a"]);
    }

    #[test]
    fn test_last_record_in_buffer_is_parsed() {
        let mut data = record_bytes(1, "a", 2, 1);
        data.extend(record_bytes(1, "b", 3, 1));
        assert_eq!(parse_records(&data).len(), 2);
    }

    #[test]
    fn test_short_record_is_length_error() {
        let rec = record_bytes(1, "a", 2, 1);
        assert!(matches!(
            parse_slot(&rec[..40]),
            Err(X360Error::RecordLength { expected: 64, actual: 40, .. })
        ));
    }
}
