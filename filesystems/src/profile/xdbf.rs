// XDBF database files (GPDs)
// A 0x18-byte header, a table of 0x12-byte entries, a free-space table of
// 8-byte entries, then the payloads. Every integer follows the byte order
// announced by the magic; text is always UTF-16BE.

use std::collections::BTreeMap;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use chrono::NaiveDateTime;
use log::{debug, warn};
use serde::Serialize;
use x360_core::{Anomaly, AnomalyKind, Result, X360Error};

use crate::strings::{utf16_be, utf16_be_terminated};
use crate::timestamps::filetime_to_datetime;

pub const HEADER_SIZE: usize = 0x18;
pub const ENTRY_SIZE: usize = 0x12;
const FREE_ENTRY_SIZE: usize = 8;

const ACHIEVEMENT_MAGIC: u32 = 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Namespace {
    Achievement,
    Image,
    Setting,
    Title,
    String,
    AchievementSecurity,
}

impl Namespace {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::Achievement),
            2 => Some(Self::Image),
            3 => Some(Self::Setting),
            4 => Some(Self::Title),
            5 => Some(Self::String),
            6 => Some(Self::AchievementSecurity),
            _ => None,
        }
    }
}

/// One row of the entry table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct XdbfEntry {
    pub namespace: u16,
    pub id: u64,
    /// Relative to the end of the free-space table
    pub offset: u32,
    pub length: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Achievement {
    pub id: u32,
    pub image_id: u32,
    pub gamerscore: u32,
    pub flags: u32,
    /// Windows FILETIME
    pub unlock_time: i64,
    pub name: String,
    pub locked_description: String,
    pub unlocked_description: String,
}

impl Achievement {
    fn parse<B: ByteOrder>(data: &[u8]) -> Result<Self> {
        X360Error::check_len("GPD achievement", data, ACHIEVEMENT_MAGIC as usize + 1)?;
        let magic = B::read_u32(data);
        if magic != ACHIEVEMENT_MAGIC {
            return Err(X360Error::FormatMismatch(format!("achievement struct size {}", magic)));
        }
        let (name, next) = utf16_be_terminated(data, 28);
        let (locked_description, next) = utf16_be_terminated(data, next);
        let (unlocked_description, _) = utf16_be_terminated(data, next);
        Ok(Self {
            id: B::read_u32(&data[4..]),
            image_id: B::read_u32(&data[8..]),
            gamerscore: B::read_u32(&data[12..]),
            flags: B::read_u32(&data[16..]),
            unlock_time: B::read_i64(&data[20..]),
            name,
            locked_description,
            unlocked_description,
        })
    }

    /// `None` for achievements never unlocked
    pub fn unlocked_at(&self) -> Option<NaiveDateTime> {
        filetime_to_datetime(self.unlock_time)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Title {
    pub title_id: u32,
    pub achievement_count: i32,
    pub achievements_unlocked: i32,
    pub gamerscore_total: i32,
    pub gamerscore_unlocked: i32,
    pub unknown1: i64,
    pub unknown2: i32,
    /// Windows FILETIME
    pub last_played: i64,
    pub name: String,
}

impl Title {
    fn parse<B: ByteOrder>(data: &[u8]) -> Result<Self> {
        X360Error::check_len("GPD title", data, 41)?;
        Ok(Self {
            title_id: B::read_u32(data),
            achievement_count: B::read_i32(&data[4..]),
            achievements_unlocked: B::read_i32(&data[8..]),
            gamerscore_total: B::read_i32(&data[12..]),
            gamerscore_unlocked: B::read_i32(&data[16..]),
            unknown1: B::read_i64(&data[20..]),
            unknown2: B::read_i32(&data[28..]),
            last_played: B::read_i64(&data[32..]),
            name: utf16_be_terminated(data, 40).0,
        })
    }

    pub fn last_played_at(&self) -> Option<NaiveDateTime> {
        filetime_to_datetime(self.last_played)
    }
}

/// Typed value of a setting, selected by its content id
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SettingValue {
    Context(u32),
    Integer(u32),
    Long(u64),
    Double(f64),
    String(String),
    Float(f32),
    Binary(Vec<u8>),
    Timestamp(u64),
    Null(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Setting {
    pub setting_id: u32,
    pub content_id: u8,
    pub value: SettingValue,
}

impl Setting {
    fn parse<B: ByteOrder>(data: &[u8]) -> Result<Self> {
        X360Error::check_len("GPD setting", data, 21)?;
        let content_id = data[8];
        let value = match content_id {
            0 => SettingValue::Context(B::read_u32(&data[16..])),
            1 => SettingValue::Integer(B::read_u32(&data[16..])),
            2 => SettingValue::Long(B::read_u64(wide_value(data)?)),
            3 => SettingValue::Double(B::read_f64(wide_value(data)?)),
            4 => SettingValue::String(utf16_be(sized_value::<B>(data)?)),
            5 => SettingValue::Float(B::read_f32(&data[16..])),
            6 => SettingValue::Binary(sized_value::<B>(data)?.to_vec()),
            7 => SettingValue::Timestamp(B::read_u64(wide_value(data)?)),
            _ => SettingValue::Null(data[9..17].to_vec()),
        };

        Ok(Self {
            setting_id: B::read_u32(data),
            content_id,
            value,
        })
    }
}

/// The 8-byte value field of a setting
fn wide_value(data: &[u8]) -> Result<&[u8]> {
    X360Error::check_len("GPD setting value", data, 24)?;
    Ok(&data[16..24])
}

/// A length-prefixed value: u32 length at 16, bytes from 24, clipped to the payload
fn sized_value<B: ByteOrder>(data: &[u8]) -> Result<&[u8]> {
    X360Error::check_len("GPD setting value", data, 24)?;
    let length = B::read_u32(&data[16..]) as usize;
    Ok(&data[24..24usize.saturating_add(length).min(data.len())])
}

/// A parsed GPD
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Xdbf {
    pub big_endian: bool,
    pub version: u32,
    pub table_len: u32,
    pub entry_count: u32,
    pub free_len: u32,
    pub free_count: u32,
    pub entries: Vec<XdbfEntry>,
    pub achievements: BTreeMap<u64, Achievement>,
    pub titles: BTreeMap<u64, Title>,
    pub settings: BTreeMap<u64, Setting>,
    #[serde(skip)]
    pub images: BTreeMap<u64, Vec<u8>>,
    #[serde(skip)]
    pub strings: BTreeMap<u64, Vec<u8>>,
    pub anomalies: Vec<Anomaly>,
}

impl Xdbf {
    pub fn parse(data: &[u8]) -> Result<Self> {
        match data.get(..4) {
            Some(b"XDBF") => Self::parse_with::<BigEndian>(data, true),
            Some(b"FBDX") => Self::parse_with::<LittleEndian>(data, false),
            _ => Err(X360Error::FormatMismatch("XDBF magic not found".to_string())),
        }
    }

    /// Byte offset that entry offsets are relative to
    pub fn global_offset(&self) -> u64 {
        HEADER_SIZE as u64 + self.table_len as u64 * ENTRY_SIZE as u64 + self.free_len as u64 * FREE_ENTRY_SIZE as u64
    }

    /// A string entry decoded
    pub fn string(&self, id: u64) -> Option<String> {
        self.strings.get(&id).map(|raw| utf16_be(raw))
    }

    /// Sum of unlocked gamerscore over all titles
    pub fn gamerscore(&self) -> i64 {
        self.titles.values().map(|t| t.gamerscore_unlocked as i64).sum()
    }

    fn parse_with<B: ByteOrder>(data: &[u8], big_endian: bool) -> Result<Self> {
        X360Error::check_len("XDBF header", data, HEADER_SIZE)?;
        let mut xdbf = Self {
            big_endian,
            version: B::read_u32(&data[4..]),
            table_len: B::read_u32(&data[8..]),
            entry_count: B::read_u32(&data[12..]),
            free_len: B::read_u32(&data[16..]),
            free_count: B::read_u32(&data[20..]),
            entries: Vec::new(),
            achievements: BTreeMap::new(),
            titles: BTreeMap::new(),
            settings: BTreeMap::new(),
            images: BTreeMap::new(),
            strings: BTreeMap::new(),
            anomalies: Vec::new(),
        };
        let global_offset = xdbf.global_offset();

        for index in 0..xdbf.entry_count as usize {
            let start = HEADER_SIZE + index * ENTRY_SIZE;
            let Some(raw) = data.get(start..start + ENTRY_SIZE) else {
                xdbf.record(Anomaly::new(
                    AnomalyKind::RecordLength,
                    format!("entry {}", index),
                    format!("entry table ends at {:#x}", data.len()),
                ));
                break;
            };
            let entry = XdbfEntry {
                namespace: B::read_u16(raw),
                id: B::read_u64(&raw[2..]),
                offset: B::read_u32(&raw[10..]),
                length: B::read_u32(&raw[14..]),
            };
            if let Err(e) = xdbf.load_payload::<B>(data, global_offset, &entry) {
                xdbf.record(Anomaly::from_error(format!("entry {} ({:#x})", index, entry.id), &e));
            }
            xdbf.entries.push(entry);
        }

        debug!(
            "XDBF: {} entries, {} achievements, {} titles, {} settings",
            xdbf.entries.len(),
            xdbf.achievements.len(),
            xdbf.titles.len(),
            xdbf.settings.len()
        );
        Ok(xdbf)
    }

    fn load_payload<B: ByteOrder>(&mut self, data: &[u8], global_offset: u64, entry: &XdbfEntry) -> Result<()> {
        let Some(namespace) = Namespace::from_u16(entry.namespace) else {
            return Ok(());
        };
        if entry.length == 0 {
            return Ok(());
        }

        let start = global_offset + entry.offset as u64;
        let end = start + entry.length as u64;
        if end > data.len() as u64 {
            return Err(X360Error::RecordLength {
                what: "XDBF payload",
                expected: end as usize,
                actual: data.len(),
            });
        }
        let payload = &data[start as usize..end as usize];

        match namespace {
            Namespace::Achievement => {
                self.achievements.insert(entry.id, Achievement::parse::<B>(payload)?);
            }
            Namespace::Title => {
                self.titles.insert(entry.id, Title::parse::<B>(payload)?);
            }
            Namespace::Setting => {
                self.settings.insert(entry.id, Setting::parse::<B>(payload)?);
            }
            Namespace::Image => {
                self.images.insert(entry.id, payload.to_vec());
            }
            Namespace::String => {
                self.strings.insert(entry.id, payload.to_vec());
            }
            Namespace::AchievementSecurity => {}
        }
        Ok(())
    }

    fn record(&mut self, anomaly: Anomaly) {
        warn!("{}", anomaly);
        self.anomalies.push(anomaly);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    fn utf16(s: &str) -> Vec<u8> {
        let mut out: Vec<u8> = s.encode_utf16().flat_map(|u| u.to_be_bytes()).collect();
        out.extend_from_slice(&[0, 0]);
        out
    }

    /// Build a big-endian GPD from (namespace, id, payload) triples
    pub(crate) fn build_gpd(entries: &[(u16, u64, Vec<u8>)]) -> Vec<u8> {
        let table_len = entries.len() as u32;
        let mut data = b"XDBF".to_vec();
        for field in [0x10000u32, table_len, entries.len() as u32, 0, 0] {
            data.extend_from_slice(&field.to_be_bytes());
        }
        let mut offset = 0u32;
        for (ns, id, payload) in entries {
            data.extend_from_slice(&ns.to_be_bytes());
            data.extend_from_slice(&id.to_be_bytes());
            data.extend_from_slice(&offset.to_be_bytes());
            data.extend_from_slice(&(payload.len() as u32).to_be_bytes());
            offset += payload.len() as u32;
        }
        for (_, _, payload) in entries {
            data.extend_from_slice(payload);
        }
        data
    }

    pub(crate) fn achievement_payload(id: u32, gamerscore: u32, name: &str) -> Vec<u8> {
        let mut p = Vec::new();
        for field in [28u32, id, 7, gamerscore, 0x0002_0000] {
            p.extend_from_slice(&field.to_be_bytes());
        }
        // 2009-02-13 23:31:30 UTC
        p.extend_from_slice(&128_790_414_900_000_000i64.to_be_bytes());
        p.extend(utf16(name));
        p.extend(utf16("Do the thing"));
        p.extend(utf16("Did the thing"));
        p
    }

    pub(crate) fn title_payload(title_id: u32, name: &str) -> Vec<u8> {
        let mut p = Vec::new();
        p.extend_from_slice(&title_id.to_be_bytes());
        for field in [50i32, 12, 1000, 250] {
            p.extend_from_slice(&field.to_be_bytes());
        }
        p.extend_from_slice(&0i64.to_be_bytes());
        p.extend_from_slice(&0i32.to_be_bytes());
        p.extend_from_slice(&0i64.to_be_bytes());
        p.extend(utf16(name));
        p
    }

    fn setting_payload(setting_id: u32, content_id: u8, value: &[u8]) -> Vec<u8> {
        let mut p = vec![0u8; 16];
        p[..4].copy_from_slice(&setting_id.to_be_bytes());
        p[8] = content_id;
        p.extend_from_slice(value);
        p
    }

    #[test]
    fn test_parse_entries() {
        let gpd = build_gpd(&[
            (1, 0x1, achievement_payload(1, 20, "First Blood")),
            (4, 0x4D5307E6, title_payload(0x4D5307E6, "Halo 3")),
            (5, 0x10, utf16("hello")),
            (2, 0x20, b"\x89PNG\r\n\x1a\n".to_vec()),
        ]);
        let xdbf = Xdbf::parse(&gpd).unwrap();
        assert!(xdbf.big_endian);
        assert_eq!(xdbf.entries.len(), 4);
        assert!(xdbf.anomalies.is_empty());

        let ach = &xdbf.achievements[&1];
        assert_eq!(ach.name, "First Blood");
        assert_eq!(ach.locked_description, "Do the thing");
        assert_eq!(ach.unlocked_description, "Did the thing");
        assert_eq!(ach.gamerscore, 20);
        assert_eq!(ach.unlocked_at().unwrap().to_string(), "2009-02-13 23:31:30");

        let title = &xdbf.titles[&0x4D5307E6];
        assert_eq!(title.name, "Halo 3");
        assert_eq!(title.achievements_unlocked, 12);
        assert_eq!(xdbf.gamerscore(), 250);

        assert_eq!(xdbf.string(0x10).as_deref(), Some("hello"));
        assert_eq!(xdbf.images[&0x20].len(), 8);
    }

    #[test]
    fn test_setting_values() {
        let mut text = 14u32.to_be_bytes().to_vec();
        text.extend_from_slice(&[0; 4]);
        text.extend(utf16("Bungie"));
        let gpd = build_gpd(&[
            (3, 1, setting_payload(0x10040001, 1, &[0, 0, 0, 42, 0, 0, 0, 0])),
            (3, 2, setting_payload(0x402C0011, 4, &text)),
            (3, 3, setting_payload(0x10040002, 3, &1.5f64.to_be_bytes())),
        ]);
        let xdbf = Xdbf::parse(&gpd).unwrap();
        assert_eq!(xdbf.settings[&1].value, SettingValue::Integer(42));
        assert_eq!(xdbf.settings[&2].value, SettingValue::String("Bungie".to_string()));
        assert_eq!(xdbf.settings[&3].value, SettingValue::Double(1.5));
    }

    #[test]
    fn test_little_endian_magic() {
        let mut data = b"FBDX".to_vec();
        for field in [0x10000u32, 1, 0, 0, 0] {
            data.extend_from_slice(&field.to_le_bytes());
        }
        let xdbf = Xdbf::parse(&data).unwrap();
        assert!(!xdbf.big_endian);
        assert_eq!(xdbf.table_len, 1);
        assert_eq!(xdbf.global_offset(), 0x18 + 0x12);
    }

    #[test]
    fn test_bad_payloads_become_anomalies() {
        let mut gpd = build_gpd(&[
            (4, 1, vec![0u8; 10]),
            (1, 2, achievement_payload(2, 5, "ok")),
        ]);
        // Point the second entry far past the end of the file
        let second = HEADER_SIZE + ENTRY_SIZE + 10;
        gpd[second..second + 4].copy_from_slice(&0x10000u32.to_be_bytes());

        let xdbf = Xdbf::parse(&gpd).unwrap();
        assert_eq!(xdbf.entries.len(), 2);
        assert!(xdbf.titles.is_empty());
        assert!(xdbf.achievements.is_empty());
        assert_eq!(xdbf.anomalies.len(), 2);
        assert!(xdbf.anomalies.iter().all(|a| a.kind == AnomalyKind::RecordLength));
    }

    #[test]
    fn test_bad_magic() {
        assert!(matches!(Xdbf::parse(b"GPD!...."), Err(X360Error::FormatMismatch(_))));
    }
}
