// STFS container tree
// The file table is read in full at open and every listing gets its full
// path from its chain of parent slots. File data is found by following the
// next-block pointers kept in the hash tables.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::{debug, info, trace, warn};
use serde::Serialize;
use sha1::{Digest, Sha1};
use x360_core::{Anomaly, AnomalyKind, BlockDevice, Result, X360Error};

use super::addressing::{BlockAddresser, BLOCK_SIZE};
use super::header::ContainerHeader;
use super::listing::{parse_listings, FileListing, ROOT_PARENT};
use crate::ops::{normalize_path, DirectoryEntry, FileAttributes, FilesystemOps};

/// A file or directory in the container
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StfsEntry {
    pub path: String,
    /// File table slot, `None` for the root
    pub slot: Option<usize>,
    pub listing: Option<FileListing>,
}

impl StfsEntry {
    pub fn name(&self) -> &str {
        self.listing.as_ref().map_or("", |l| l.name.as_str())
    }

    pub fn is_directory(&self) -> bool {
        self.listing.as_ref().map_or(true, |l| l.is_directory())
    }

    pub fn size(&self) -> u64 {
        self.listing.as_ref().map_or(0, |l| l.size as u64)
    }

    pub fn attributes(&self) -> FileAttributes {
        match &self.listing {
            Some(listing) => FileAttributes {
                size: listing.size as u64,
                is_directory: listing.is_directory(),
                created: None,
                modified: listing.modified(),
                accessed: listing.accessed(),
            },
            None => FileAttributes::directory(),
        }
    }
}

/// An opened STFS container
pub struct StfsTree<D: BlockDevice> {
    device: D,
    header: ContainerHeader,
    addresser: BlockAddresser,
    /// One element per file table slot
    listings: Vec<Option<FileListing>>,
    paths: HashMap<String, usize>,
    /// Child slots of each directory path, in slot order
    children: HashMap<String, Vec<usize>>,
    anomalies: Mutex<Vec<Anomaly>>,
}

impl<D: BlockDevice> StfsTree<D> {
    /// Parse the header and file table of the container on `device`
    pub fn open(device: D) -> Result<Self> {
        let header = ContainerHeader::read_from(&device)?;
        let addresser = BlockAddresser::from_header(&header);
        info!(
            "STFS {} container: title {:08X}, {} allocated blocks, hash table shift {}",
            header.magic.as_str(),
            header.title_id,
            header.volume.allocated_count,
            addresser.shift()
        );

        let mut tree = Self {
            device,
            header,
            addresser,
            listings: Vec::new(),
            paths: HashMap::new(),
            children: HashMap::new(),
            anomalies: Mutex::new(Vec::new()),
        };

        let table_len = tree.header.volume.filetable_blockcount as u64 * BLOCK_SIZE;
        let table = tree.read_chain(tree.header.volume.filetable_blocknumber, 0, table_len)?;
        if (table.len() as u64) < table_len {
            tree.record(Anomaly::new(
                AnomalyKind::ChainInconsistency,
                "file table",
                format!("chain ended after {:#x} of {:#x} bytes", table.len(), table_len),
            ));
        }
        tree.listings = parse_listings(&table);
        tree.build_paths();
        debug!("File table: {} slots, {} paths", tree.listings.len(), tree.paths.len());
        Ok(tree)
    }

    pub fn header(&self) -> &ContainerHeader {
        &self.header
    }

    pub fn addresser(&self) -> &BlockAddresser {
        &self.addresser
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn anomalies(&self) -> Vec<Anomaly> {
        self.lock_anomalies().clone()
    }

    /// Every reconstructed path, in file table order
    pub fn paths(&self) -> Vec<String> {
        let mut slots: Vec<(&usize, &String)> = self.paths.iter().map(|(p, s)| (s, p)).collect();
        slots.sort();
        slots.into_iter().map(|(_, p)| p.clone()).collect()
    }

    pub fn get(&self, path: &str) -> Option<StfsEntry> {
        let path = normalize_path(path);
        if path == "/" {
            return Some(StfsEntry {
                path,
                slot: None,
                listing: None,
            });
        }
        let slot = *self.paths.get(&path)?;
        Some(self.entry(path, slot))
    }

    pub fn stat(&self, path: &str) -> Result<StfsEntry> {
        self.get(path).ok_or_else(|| X360Error::NotFound(path.to_string()))
    }

    pub fn list(&self, path: &str) -> Result<Vec<StfsEntry>> {
        let entry = self.stat(path)?;
        if !entry.is_directory() {
            return Err(X360Error::NotADirectory(path.to_string()));
        }
        Ok(self
            .children
            .get(&entry.path)
            .map(|slots| {
                slots
                    .iter()
                    .map(|&slot| self.entry(self.path_of(&entry.path, slot), slot))
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Breadth-first list of every path at or below `path`
    pub fn walk(&self, path: &str) -> Result<Vec<String>> {
        let root = self.stat(path)?;
        let mut out = Vec::new();
        let mut queue = VecDeque::from([root.path]);
        while let Some(current) = queue.pop_front() {
            if let Some(slots) = self.children.get(&current) {
                queue.extend(slots.iter().map(|&slot| self.path_of(&current, slot)));
            }
            out.push(current);
        }
        Ok(out)
    }

    /// Read from a file, at most `length` bytes (to the end of the file when `None`)
    pub fn read(&self, path: &str, offset: u64, length: Option<u64>) -> Result<Vec<u8>> {
        let entry = self.stat(path)?;
        let listing = match entry.listing {
            Some(listing) if !listing.is_directory() => listing,
            _ => return Err(X360Error::IsADirectory(path.to_string())),
        };

        let size = listing.size as u64;
        if offset >= size {
            return Ok(Vec::new());
        }
        let length = length.map_or(size - offset, |l| l.min(size - offset));
        if listing.first_block == 0 {
            self.record_no_data(entry.path, &listing);
            return Ok(Vec::new());
        }
        let data = self.read_chain(listing.first_block, offset, length)?;
        if (data.len() as u64) < length {
            self.record(Anomaly::new(
                AnomalyKind::ChainInconsistency,
                entry.path,
                format!("block chain ended after {:#x} of {:#x} bytes", data.len(), length),
            ));
        }
        Ok(data)
    }

    pub fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        self.read(path, 0, None)
    }

    /// Whole contents of a listing, bounded by its declared size
    pub fn read_listing(&self, listing: &FileListing) -> Result<Vec<u8>> {
        if listing.first_block == 0 {
            if listing.size > 0 {
                self.record_no_data(listing.name.clone(), listing);
            }
            return Ok(Vec::new());
        }
        self.read_chain(listing.first_block, 0, listing.size as u64)
    }

    /// Block 0 starts the file table, never a file's data
    fn record_no_data(&self, location: String, listing: &FileListing) {
        self.record(Anomaly::new(
            AnomalyKind::ChainInconsistency,
            location,
            format!("{:#x} bytes declared but the first block is 0", listing.size),
        ));
    }

    /// Follow a block chain from `first_block`, returning `length` bytes from `offset`
    ///
    /// Block 0 is accepted here so the file table can be read; file reads
    /// go through [`read`](Self::read) or [`read_listing`](Self::read_listing).
    /// The chain ends at a zero or out-of-range next pointer, or at a record
    /// that is unallocated in every table copy.
    pub fn read_chain(&self, first_block: u32, offset: u64, length: u64) -> Result<Vec<u8>> {
        let allocated = self.header.volume.allocated_count;
        let mut out = Vec::new();
        if length == 0 || first_block >= allocated {
            return Ok(out);
        }

        let end = offset + length;
        let mut block = first_block;
        let mut position = 0u64;
        let mut hops = 0u32;

        loop {
            let block_end = position + BLOCK_SIZE;
            if block_end > offset {
                let skip = offset.saturating_sub(position);
                let take = block_end.min(end) - position - skip;
                let physical = self.addresser.data_offset(block) + skip;
                trace!("Reading block {} ({:#x} bytes at {:#x})", block, take, physical);

                let chunk = self.device.read_at(physical, take as u32)?;
                let short = (chunk.len() as u64) < take;
                out.extend_from_slice(&chunk);
                if short || block_end >= end {
                    break;
                }
            }

            let record = self.addresser.resolve_blockhash(&self.device, block)?;
            hops += 1;
            if !record.is_allocated() || record.next_block == 0 || record.next_block >= allocated {
                break;
            }
            if hops >= allocated {
                warn!("Block chain from {} exceeds {} allocated blocks", first_block, allocated);
                break;
            }
            block = record.next_block;
            position = block_end;
        }
        Ok(out)
    }

    /// Compare a data block's SHA1 against its hash record
    pub fn verify_block(&self, block: u32) -> Result<bool> {
        let data = self.device.read_at(self.addresser.data_offset(block), BLOCK_SIZE as u32)?;
        let record = self.addresser.resolve_blockhash(&self.device, block)?;
        let digest = Sha1::digest(&data);
        Ok(digest.as_slice() == record.hash)
    }

    fn entry(&self, path: String, slot: usize) -> StfsEntry {
        StfsEntry {
            path,
            slot: Some(slot),
            listing: self.listings.get(slot).cloned().flatten(),
        }
    }

    fn path_of(&self, parent: &str, slot: usize) -> String {
        let name = self.listings[slot].as_ref().map_or("", |l| l.name.as_str());
        crate::ops::join_path(parent, name)
    }

    fn lock_anomalies(&self) -> MutexGuard<'_, Vec<Anomaly>> {
        self.anomalies.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, anomaly: Anomaly) {
        warn!("{}", anomaly);
        self.lock_anomalies().push(anomaly);
    }

    fn build_paths(&mut self) {
        let mut resolved: Vec<(usize, String)> = Vec::new();
        for slot in 0..self.listings.len() {
            if self.listings[slot].is_none() {
                continue;
            }
            match self.reconstruct_path(slot) {
                Ok(path) => resolved.push((slot, path)),
                Err(detail) => self.record(Anomaly::new(
                    AnomalyKind::ChainInconsistency,
                    format!("file table slot {}", slot),
                    detail,
                )),
            }
        }

        for (slot, path) in &resolved {
            if let Some(previous) = self.paths.insert(path.clone(), *slot) {
                self.record(Anomaly::new(
                    AnomalyKind::ChainInconsistency,
                    path.as_str(),
                    format!("slot {} replaces slot {} with the same path", slot, previous),
                ));
            }
        }

        for (slot, path) in resolved {
            if self.paths.get(&path) != Some(&slot) {
                continue;
            }
            let parent = match path.rfind('/') {
                Some(0) | None => "/".to_string(),
                Some(i) => path[..i].to_string(),
            };
            self.children.entry(parent).or_default().push(slot);
        }
    }

    /// Walk parent links up to the root
    ///
    /// A parent index outside the table, pointing at an empty slot or at a
    /// file, or looping back onto the chain already walked is an error for
    /// this slot only.
    fn reconstruct_path(&self, slot: usize) -> std::result::Result<String, String> {
        let mut visited = HashSet::from([slot]);
        let mut components = Vec::new();
        let mut current = slot;

        loop {
            let listing = match self.listings.get(current) {
                Some(Some(listing)) => listing,
                _ => return Err(format!("parent index {} is out of bounds", current)),
            };
            if current != slot && !listing.is_directory() {
                return Err(format!("parent slot {} is a file, not a directory", current));
            }
            components.push(listing.name.as_str());
            let parent = listing.parent_index;
            if parent == ROOT_PARENT {
                break;
            }
            if parent < 0 {
                return Err(format!("parent index {} is out of bounds", parent));
            }
            current = parent as usize;
            if !visited.insert(current) {
                return Err(format!("parent chain loops back to slot {}", current));
            }
        }

        components.reverse();
        Ok(format!("/{}", components.join("/")))
    }
}

impl<D: BlockDevice> FilesystemOps for StfsTree<D> {
    fn filesystem_type(&self) -> &str {
        "stfs"
    }

    fn stat(&self, path: &str) -> Result<FileAttributes> {
        Ok(Self::stat(self, path)?.attributes())
    }

    fn readdir(&self, path: &str) -> Result<Vec<DirectoryEntry>> {
        Ok(self
            .list(path)?
            .into_iter()
            .map(|entry| DirectoryEntry {
                name: entry.name().to_string(),
                attributes: entry.attributes(),
            })
            .collect())
    }

    fn read(&self, path: &str, offset: u64, size: u32) -> Result<Vec<u8>> {
        Self::read(self, path, offset, Some(size as u64))
    }

    fn walk(&self, path: &str) -> Result<Vec<String>> {
        Self::walk(self, path)
    }
}
