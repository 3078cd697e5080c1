// Byte-level builders for synthetic XTAF partitions and STFS containers
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};

use x360_core::{BlockDevice, MemoryDevice, Result};

pub const CLUSTER: usize = 0x4000;
pub const BLOCK: usize = 0x1000;
pub const FAT_END: u32 = 0xFFFF_FFFF;

/// Packed FAT date/time for 2010-06-15 12:34:56
pub const DATE: u16 = ((2010 - 1980) << 9) | (6 << 5) | 15;
pub const TIME: u16 = (12 << 11) | (34 << 5) | 28;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// An XTAF partition starting at offset 0
///
/// With `clusters` data clusters the FAT fits in one 0x1000 page, so the
/// root directory (cluster 1) sits at 0x2000.
pub struct XtafImage {
    pub data: Vec<u8>,
}

impl XtafImage {
    pub fn new(clusters: usize) -> Self {
        let mut data = vec![0u8; 0x2000 + clusters * CLUSTER];
        data[..4].copy_from_slice(b"XTAF");
        Self { data }
    }

    pub fn fat(&mut self, cluster: u32, next: u32) -> &mut Self {
        let off = 0x1000 + cluster as usize * 4;
        self.data[off..off + 4].copy_from_slice(&next.to_be_bytes());
        self
    }

    /// Link `clusters` into one chain ending in a terminator
    pub fn chain(&mut self, clusters: &[u32]) -> &mut Self {
        for pair in clusters.windows(2) {
            self.fat(pair[0], pair[1]);
        }
        if let Some(&last) = clusters.last() {
            self.fat(last, FAT_END);
        }
        self
    }

    pub fn cluster(&mut self, cluster: u32) -> &mut [u8] {
        let off = 0x2000 + (cluster as usize - 1) * CLUSTER;
        &mut self.data[off..off + CLUSTER]
    }

    /// Write a raw 64-byte record into a directory cluster
    pub fn raw_record(&mut self, dir_cluster: u32, slot: usize, record: &[u8]) -> &mut Self {
        self.cluster(dir_cluster)[slot * 64..(slot + 1) * 64].copy_from_slice(record);
        self
    }

    pub fn record(&mut self, dir_cluster: u32, slot: usize, name: &str, cluster: u32, size: u32) -> &mut Self {
        let record = xtaf_record(name.len() as u8, name, cluster, size);
        self.raw_record(dir_cluster, slot, &record)
    }

    /// Spread `content` over `clusters` in order and chain them
    pub fn file(&mut self, clusters: &[u32], content: &[u8]) -> &mut Self {
        for (cluster, chunk) in clusters.iter().zip(content.chunks(CLUSTER)) {
            self.cluster(*cluster)[..chunk.len()].copy_from_slice(chunk);
        }
        self.chain(clusters)
    }

    pub fn device(&self) -> MemoryDevice {
        MemoryDevice::new(self.data.clone())
    }
}

pub fn xtaf_record(name_len: u8, name: &str, cluster: u32, size: u32) -> Vec<u8> {
    let mut rec = vec![0xFFu8; 64];
    rec[0] = name_len;
    rec[1] = 0;
    rec[2..2 + name.len()].copy_from_slice(name.as_bytes());
    rec[0x2C..0x30].copy_from_slice(&cluster.to_be_bytes());
    rec[0x30..0x34].copy_from_slice(&size.to_be_bytes());
    for pair in rec[0x34..0x40].chunks_exact_mut(4) {
        pair[..2].copy_from_slice(&DATE.to_be_bytes());
        pair[2..].copy_from_slice(&TIME.to_be_bytes());
    }
    rec
}

/// An STFS container with its file table in block 0
pub struct StfsContainer {
    pub data: Vec<u8>,
    /// 0 for single hash tables, 1 for paired ones
    pub shift: u32,
}

impl StfsContainer {
    /// `entry_id` 0xAD0E gives single tables, 0x9000 paired ones
    pub fn new(magic: &[u8; 4], entry_id: u32, blocks: u32) -> Self {
        let shift = if entry_id == 0xAD0E { 0 } else { 1 };
        let mut data = vec![0u8; 0x971A];
        data[..4].copy_from_slice(magic);
        data[0x340..0x344].copy_from_slice(&entry_id.to_be_bytes());
        data[0x37C..0x37E].copy_from_slice(&1u16.to_le_bytes());
        data[0x395..0x399].copy_from_slice(&blocks.to_be_bytes());
        // Display name, first locale
        let name: Vec<u8> = "Test Save".encode_utf16().flat_map(|u| u.to_be_bytes()).collect();
        data[0x411..0x411 + name.len()].copy_from_slice(&name);
        data.resize(0xC000 + blocks as usize * BLOCK, 0);
        Self { data, shift }
    }

    /// Data block `n`, valid for containers under 0xAA blocks
    pub fn block(&mut self, n: u32) -> &mut [u8] {
        let off = 0xC000 + n as usize * BLOCK;
        &mut self.data[off..off + BLOCK]
    }

    /// Set the hash record of block `n` in table copy `table`
    pub fn link(&mut self, n: u32, table: u32, next: u32, info: u8) -> &mut Self {
        let first_table = 0xC000 - (BLOCK << self.shift);
        let off = first_table + table as usize * BLOCK + n as usize * 0x18;
        self.data[off + 0x14] = info;
        self.data[off + 0x15..off + 0x18].copy_from_slice(&next.to_be_bytes()[1..]);
        self
    }

    /// Chain `blocks` in the primary table
    pub fn chain(&mut self, blocks: &[u32]) -> &mut Self {
        for pair in blocks.windows(2) {
            self.link(pair[0], 0, pair[1], 0x80);
        }
        if let Some(&last) = blocks.last() {
            self.link(last, 0, 0, 0x80);
        }
        self
    }

    pub fn listing(&mut self, slot: usize, name: &str, directory: bool, first_block: u32, parent: i16, size: u32) -> &mut Self {
        let blocks = (size as usize).div_ceil(BLOCK) as u32;
        let mut rec = vec![0u8; 0x40];
        rec[..name.len()].copy_from_slice(name.as_bytes());
        rec[0x28] = name.len() as u8 | if directory { 0x80 } else { 0 };
        rec[0x29..0x2C].copy_from_slice(&blocks.to_le_bytes()[..3]);
        rec[0x2C..0x2F].copy_from_slice(&blocks.to_le_bytes()[..3]);
        rec[0x2F..0x32].copy_from_slice(&first_block.to_le_bytes()[..3]);
        rec[0x32..0x34].copy_from_slice(&parent.to_be_bytes());
        rec[0x34..0x38].copy_from_slice(&size.to_be_bytes());
        rec[0x38..0x3A].copy_from_slice(&DATE.to_be_bytes());
        rec[0x3A..0x3C].copy_from_slice(&TIME.to_be_bytes());
        self.block(0)[slot * 0x40..(slot + 1) * 0x40].copy_from_slice(&rec);
        self
    }

    /// Store `content` across `blocks` in order and chain them
    pub fn file(&mut self, blocks: &[u32], content: &[u8]) -> &mut Self {
        for (block, chunk) in blocks.iter().zip(content.chunks(BLOCK)) {
            self.block(*block)[..chunk.len()].copy_from_slice(chunk);
        }
        self.chain(blocks)
    }

    pub fn device(&self) -> MemoryDevice {
        MemoryDevice::new(self.data.clone())
    }
}

/// A device that counts the reads passed through to it
pub struct CountingDevice<D: BlockDevice> {
    pub inner: D,
    reads: AtomicUsize,
}

impl<D: BlockDevice> CountingDevice<D> {
    pub fn new(inner: D) -> Self {
        Self {
            inner,
            reads: AtomicUsize::new(0),
        }
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

impl<D: BlockDevice> BlockDevice for CountingDevice<D> {
    fn read_at(&self, offset: u64, length: u32) -> Result<Vec<u8>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.read_at(offset, length)
    }

    fn len(&self) -> u64 {
        self.inner.len()
    }
}

/// Deterministic, non-repeating-per-block file content
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i.wrapping_mul(31) ^ (i >> 12)) as u8).collect()
}

/// A minimal big-endian GPD with one title and one achievement
pub fn sample_gpd() -> Vec<u8> {
    fn utf16z(s: &str) -> Vec<u8> {
        let mut out: Vec<u8> = s.encode_utf16().flat_map(|u| u.to_be_bytes()).collect();
        out.extend_from_slice(&[0, 0]);
        out
    }

    let mut achievement = Vec::new();
    for field in [28u32, 1, 1, 10, 0] {
        achievement.extend_from_slice(&field.to_be_bytes());
    }
    achievement.extend_from_slice(&0i64.to_be_bytes());
    achievement.extend(utf16z("Welcome"));
    achievement.extend(utf16z("Start the game"));
    achievement.extend(utf16z("Started the game"));

    let mut title = Vec::new();
    title.extend_from_slice(&0x4D530064u32.to_be_bytes());
    for field in [1i32, 0, 10, 0] {
        title.extend_from_slice(&field.to_be_bytes());
    }
    title.extend_from_slice(&[0u8; 20]);
    title.extend(utf16z("Test Title"));

    let payloads = [(1u16, 1u64, achievement), (4u16, 0x4D530064u64, title)];
    let mut data = b"XDBF".to_vec();
    for field in [0x10000u32, 2, 2, 0, 0] {
        data.extend_from_slice(&field.to_be_bytes());
    }
    let mut offset = 0u32;
    for (namespace, id, payload) in &payloads {
        data.extend_from_slice(&namespace.to_be_bytes());
        data.extend_from_slice(&id.to_be_bytes());
        data.extend_from_slice(&offset.to_be_bytes());
        data.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        offset += payload.len() as u32;
    }
    for (_, _, payload) in &payloads {
        data.extend_from_slice(payload);
    }
    data
}

/// Places `inner` at `offset` on an otherwise zero-filled device, without
/// allocating the gap
pub struct PlacedDevice<D: BlockDevice> {
    inner: D,
    offset: u64,
}

impl<D: BlockDevice> PlacedDevice<D> {
    pub fn new(inner: D, offset: u64) -> Self {
        Self { inner, offset }
    }
}

impl<D: BlockDevice> BlockDevice for PlacedDevice<D> {
    fn read_at(&self, offset: u64, length: u32) -> Result<Vec<u8>> {
        let end = offset.saturating_add(length as u64).min(self.len());
        if offset >= end {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        if offset < self.offset {
            out.resize((self.offset.min(end) - offset) as usize, 0);
        }
        if end > self.offset {
            let start = offset.max(self.offset);
            out.extend(self.inner.read_at(start - self.offset, (end - start) as u32)?);
        }
        Ok(out)
    }

    fn len(&self) -> u64 {
        self.offset + self.inner.len()
    }
}
