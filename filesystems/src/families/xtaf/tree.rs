// XTAF partition tree
// Locates the partition, keeps the FAT in memory and materialises directories
// one level at a time as lookups and walks pass through them

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::{debug, info, trace, warn};
use serde::Serialize;
use x360_core::{Anomaly, AnomalyKind, BlockDevice, Result, X360Error};

use super::cluster_table::{ChainEnd, ClusterChain, ClusterTable};
use super::directory::{parse_records, FileRecord, DELETED_NAME_PREFIX};
use crate::ops::{join_path, normalize_path, path_components, DirectoryEntry, FileAttributes, FilesystemOps};

pub const XTAF_MAGIC: &[u8; 4] = b"XTAF";

/// Bytes per cluster
pub const CLUSTER_SIZE: u64 = 0x4000;
const CLUSTER_SHIFT: u32 = 14;

/// Where the data partition sits on a retail drive image
pub const DATA_PARTITION_OFFSET: u64 = 0x1_30EB_0000;

/// The root directory is always this single cluster and has no FAT record
pub const ROOT_CLUSTER: u32 = 1;

const FAT_OFFSET: u64 = 0x1000;

pub type NodeId = usize;
const ROOT_ID: NodeId = 0;

/// How to open a partition
#[derive(Debug, Clone, Copy, Default)]
pub struct XtafOptions {
    /// Partition start, skipping magic-based detection
    pub partition_offset: Option<u64>,
    /// Expand every directory at open instead of on demand
    pub precache: bool,
}

/// Byte layout of a partition, all offsets absolute on the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct XtafGeometry {
    pub start: u64,
    pub fat_start: u64,
    pub root_region_start: u64,
    pub fat_entries: u64,
    /// Length of the data region
    pub size: u64,
}

impl XtafGeometry {
    /// Find the partition on `device`
    ///
    /// Without an explicit offset the partition starts at 0 when the device
    /// begins with the magic, otherwise at the retail data partition offset.
    /// The magic must be present wherever the partition ends up.
    pub fn locate<D: BlockDevice + ?Sized>(device: &D, partition_offset: Option<u64>) -> Result<Self> {
        let start = match partition_offset {
            Some(offset) => offset,
            None if has_magic(device, 0)? => 0,
            None => {
                debug!("No XTAF magic at 0, trying {:#x}", DATA_PARTITION_OFFSET);
                DATA_PARTITION_OFFSET
            }
        };

        if !has_magic(device, start)? {
            return Err(X360Error::FormatMismatch(format!("no XTAF magic at {:#x}", start)));
        }
        Ok(Self::from_bounds(start, device.len()))
    }

    /// Geometry of a partition spanning `[start, end)`
    ///
    /// The FAT grows with the partition; the root region follows it, aligned
    /// to a multiple of 0x1000 bytes.
    pub fn from_bounds(start: u64, end: u64) -> Self {
        let fat_start = start + FAT_OFFSET;
        let fat_len = ((end.saturating_sub(start) >> 12) + 0xFFF) & !0xFFF;
        let root_region_start = fat_start + fat_len;
        let size = end.saturating_sub(root_region_start);
        Self {
            start,
            fat_start,
            root_region_start,
            fat_entries: size >> CLUSTER_SHIFT,
            size,
        }
    }

    /// Device offset of the first byte of `cluster`
    pub fn cluster_offset(&self, cluster: u32) -> u64 {
        self.root_region_start + ((cluster as u64).saturating_sub(1) << CLUSTER_SHIFT)
    }
}

fn has_magic<D: BlockDevice + ?Sized>(device: &D, offset: u64) -> Result<bool> {
    Ok(device.read_at(offset, 4)?.as_slice() == XTAF_MAGIC)
}

#[derive(Debug)]
enum NodeKind {
    File,
    Directory { children: Vec<NodeId>, expanded: bool },
}

#[derive(Debug)]
struct Node {
    path: String,
    name: String,
    /// `None` only for the root
    record: Option<FileRecord>,
    parent: Option<NodeId>,
    kind: NodeKind,
    /// Derived from the FAT on first use, then reused
    clusters: Option<Vec<u32>>,
}

impl Node {
    fn root() -> Self {
        Self {
            path: "/".to_string(),
            name: String::new(),
            record: None,
            parent: None,
            kind: NodeKind::Directory {
                children: Vec::new(),
                expanded: false,
            },
            clusters: Some(vec![ROOT_CLUSTER]),
        }
    }

    fn from_record(path: String, record: FileRecord, parent: NodeId) -> Self {
        let kind = if record.is_directory() {
            NodeKind::Directory {
                children: Vec::new(),
                expanded: false,
            }
        } else {
            NodeKind::File
        };
        Self {
            path,
            name: record.name.clone(),
            record: Some(record),
            parent: Some(parent),
            kind,
            clusters: None,
        }
    }

    fn is_directory(&self) -> bool {
        matches!(self.kind, NodeKind::Directory { .. })
    }

    fn size(&self) -> u64 {
        self.record.as_ref().map_or(0, |r| r.size as u64)
    }

    fn start_cluster(&self) -> u32 {
        self.record.as_ref().map_or(ROOT_CLUSTER, |r| r.cluster)
    }

    fn entry(&self, id: NodeId) -> XtafEntry {
        XtafEntry {
            id,
            path: self.path.clone(),
            name: self.name.clone(),
            is_directory: self.is_directory(),
            record: self.record.clone(),
        }
    }
}

/// Everything learned about the partition so far, scoped to one tree
#[derive(Debug)]
struct TreeState {
    nodes: Vec<Node>,
    paths: HashMap<String, NodeId>,
    anomalies: Vec<Anomaly>,
}

impl TreeState {
    fn new() -> Self {
        let mut paths = HashMap::new();
        paths.insert("/".to_string(), ROOT_ID);
        Self {
            nodes: vec![Node::root()],
            paths,
            anomalies: Vec::new(),
        }
    }

    fn record(&mut self, anomaly: Anomaly) {
        warn!("{}", anomaly);
        self.anomalies.push(anomaly);
    }
}

/// A snapshot of one file or directory in the tree
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct XtafEntry {
    /// Stable for the life of the tree
    pub id: NodeId,
    pub path: String,
    pub name: String,
    pub is_directory: bool,
    pub record: Option<FileRecord>,
}

impl XtafEntry {
    pub fn size(&self) -> u64 {
        self.record.as_ref().map_or(0, |r| r.size as u64)
    }

    pub fn attributes(&self) -> FileAttributes {
        match &self.record {
            Some(record) => FileAttributes {
                size: record.size as u64,
                is_directory: self.is_directory,
                created: record.created(),
                modified: record.modified(),
                accessed: record.accessed(),
            },
            None => FileAttributes::directory(),
        }
    }
}

/// A lazily expanded XTAF partition
pub struct XtafTree<D: BlockDevice> {
    device: D,
    geometry: XtafGeometry,
    table: ClusterTable,
    state: Mutex<TreeState>,
}

impl<D: BlockDevice> XtafTree<D> {
    pub fn open(device: D) -> Result<Self> {
        Self::open_with(device, XtafOptions::default())
    }

    /// Locate the partition, load its FAT and expand the root directory
    pub fn open_with(device: D, options: XtafOptions) -> Result<Self> {
        let geometry = XtafGeometry::locate(&device, options.partition_offset)?;
        info!(
            "XTAF partition at {:#x}: FAT at {:#x}, root at {:#x}, {} clusters",
            geometry.start, geometry.fat_start, geometry.root_region_start, geometry.fat_entries
        );

        let table = ClusterTable::load(&device, geometry.fat_start, geometry.fat_entries)?;
        let tree = Self {
            device,
            geometry,
            table,
            state: Mutex::new(TreeState::new()),
        };

        {
            let mut state = tree.lock();
            tree.expand(&mut state, ROOT_ID);
        }

        if options.precache {
            let count = tree.walk("/")?.count();
            info!("Precached {} paths", count);
        }
        Ok(tree)
    }

    pub fn geometry(&self) -> &XtafGeometry {
        &self.geometry
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn root(&self) -> XtafEntry {
        self.lock().nodes[ROOT_ID].entry(ROOT_ID)
    }

    /// Look up a path, expanding directories along the way
    ///
    /// A directory at the end of the path is expanded before it is returned.
    /// Missing components give `None`.
    pub fn get(&self, path: &str) -> Option<XtafEntry> {
        let mut state = self.lock();
        let id = self.resolve(&mut state, path)?;
        Some(state.nodes[id].entry(id))
    }

    pub fn stat(&self, path: &str) -> Result<XtafEntry> {
        self.get(path).ok_or_else(|| X360Error::NotFound(path.to_string()))
    }

    /// Children of a directory, in on-disk order
    pub fn list(&self, path: &str) -> Result<Vec<XtafEntry>> {
        let mut state = self.lock();
        let id = self
            .resolve(&mut state, path)
            .ok_or_else(|| X360Error::NotFound(path.to_string()))?;
        match &state.nodes[id].kind {
            NodeKind::Directory { children, .. } => Ok(children
                .iter()
                .map(|&child| state.nodes[child].entry(child))
                .collect()),
            NodeKind::File => Err(X360Error::NotADirectory(path.to_string())),
        }
    }

    /// Read from a file, at most `length` bytes (to the end of the file when `None`)
    ///
    /// Reads never extend past the recorded file size, so slack space in the
    /// last cluster is not returned.
    pub fn read(&self, path: &str, offset: u64, length: Option<u64>) -> Result<Vec<u8>> {
        let mut state = self.lock();
        let id = self
            .resolve(&mut state, path)
            .ok_or_else(|| X360Error::NotFound(path.to_string()))?;
        if state.nodes[id].is_directory() {
            return Err(X360Error::IsADirectory(path.to_string()));
        }

        let size = state.nodes[id].size();
        if offset >= size {
            return Ok(Vec::new());
        }
        let available = size - offset;
        let length = length.map_or(available, |l| l.min(available));

        let clusters = self.node_clusters(&mut state, id);
        drop(state);
        self.read_chain(&clusters, offset, length)
    }

    pub fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        self.read(path, 0, None)
    }

    /// Cluster chain for a record, without caching or anomaly tracking
    pub fn clusters_for(&self, record: &FileRecord) -> ClusterChain {
        self.table.chain(record.cluster)
    }

    /// Read `length` bytes starting `offset` bytes into a cluster list
    ///
    /// Stops early when the list runs out or the device comes up short.
    pub fn read_chain(&self, clusters: &[u32], offset: u64, length: u64) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(length.min(clusters.len() as u64 * CLUSTER_SIZE) as usize);
        let mut index = (offset / CLUSTER_SIZE) as usize;
        let mut intra = offset % CLUSTER_SIZE;
        let mut remaining = length;

        while remaining > 0 {
            let Some(&cluster) = clusters.get(index) else {
                break;
            };
            let take = (CLUSTER_SIZE - intra).min(remaining);
            let physical = self.geometry.cluster_offset(cluster) + intra;
            trace!("Reading cluster {} ({:#x} bytes at {:#x})", cluster, take, physical);

            let chunk = self.device.read_at(physical, take as u32)?;
            let got = chunk.len() as u64;
            out.extend_from_slice(&chunk);
            remaining -= got;
            if got < take {
                debug!("Short read at cluster {}: {:#x} of {:#x} bytes", cluster, got, take);
                break;
            }

            index += 1;
            intra = 0;
        }
        Ok(out)
    }

    /// Breadth-first walk of every path at or below `path`
    ///
    /// Each directory is expanded when it is dequeued. A file path yields only
    /// itself. Calling `walk` again starts over.
    pub fn walk(&self, path: &str) -> Result<Walk<'_, D>> {
        let mut state = self.lock();
        let id = self
            .resolve(&mut state, path)
            .ok_or_else(|| X360Error::NotFound(path.to_string()))?;
        Ok(Walk {
            tree: self,
            queue: VecDeque::from([id]),
        })
    }

    /// Every anomaly recorded so far
    pub fn anomalies(&self) -> Vec<Anomaly> {
        self.lock().anomalies.clone()
    }

    /// A file as a block device of its own, for parsing nested containers
    pub fn open_file(&self, path: &str) -> Result<XtafFileDevice<'_, D>> {
        let mut state = self.lock();
        let id = self
            .resolve(&mut state, path)
            .ok_or_else(|| X360Error::NotFound(path.to_string()))?;
        if state.nodes[id].is_directory() {
            return Err(X360Error::IsADirectory(path.to_string()));
        }
        let size = state.nodes[id].size();
        let clusters = self.node_clusters(&mut state, id);
        Ok(XtafFileDevice {
            tree: self,
            clusters,
            size,
        })
    }

    fn lock(&self) -> MutexGuard<'_, TreeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn resolve(&self, state: &mut TreeState, path: &str) -> Option<NodeId> {
        let path = normalize_path(path);
        let id = match state.paths.get(&path) {
            Some(&id) => id,
            None => {
                let mut current = ROOT_ID;
                for component in path_components(&path) {
                    if !state.nodes[current].is_directory() {
                        return None;
                    }
                    self.expand(state, current);
                    let child_path = join_path(&state.nodes[current].path, component);
                    current = *state.paths.get(&child_path)?;
                }
                current
            }
        };

        if state.nodes[id].is_directory() {
            self.expand(state, id);
        }
        Some(id)
    }

    /// Read one directory's records and add them as children; no-op once done
    fn expand(&self, state: &mut TreeState, id: NodeId) {
        match &state.nodes[id].kind {
            NodeKind::Directory { expanded: false, .. } => {}
            _ => return,
        }

        let clusters = self.node_clusters(state, id);
        let dir_path = state.nodes[id].path.clone();
        let data = match self.read_chain(&clusters, 0, clusters.len() as u64 * CLUSTER_SIZE) {
            Ok(data) => data,
            Err(e) => {
                state.record(Anomaly::from_error(dir_path.as_str(), &e));
                Vec::new()
            }
        };

        // Start clusters of this directory and everything above it
        let mut ancestors = HashSet::new();
        let mut cursor = Some(id);
        while let Some(node) = cursor {
            ancestors.insert(state.nodes[node].start_cluster());
            cursor = state.nodes[node].parent;
        }

        let mut children = Vec::new();
        for record in parse_records(&data) {
            if record.name.is_empty() || record.name.contains('/') {
                debug!("Skipping unusable name {:?} in {}", record.name, dir_path);
                continue;
            }
            let child_path = join_path(&dir_path, &record.name);
            let child_id = state.nodes.len();
            let cycle = record.is_directory() && ancestors.contains(&record.cluster);
            let deleted = record.is_deleted();
            let cluster = record.cluster;
            state.nodes.push(Node::from_record(child_path.clone(), record, id));
            if cycle {
                // Left as an empty directory so the walk below it ends here
                state.nodes[child_id].kind = NodeKind::Directory {
                    children: Vec::new(),
                    expanded: true,
                };
                if deleted {
                    debug!("Not expanding {}: stale cluster {} of an ancestor", child_path, cluster);
                } else {
                    state.record(Anomaly::new(
                        AnomalyKind::ChainInconsistency,
                        child_path.as_str(),
                        format!("directory cluster {} is already open above it", cluster),
                    ));
                }
            }
            if let Some(previous) = state.paths.insert(child_path, child_id) {
                children.retain(|&c| c != previous);
            }
            children.push(child_id);
        }
        debug!("Expanded {}: {} entries", dir_path, children.len());

        state.nodes[id].kind = NodeKind::Directory {
            children,
            expanded: true,
        };
    }

    /// Cached cluster list of a node, deriving it from the FAT the first time
    fn node_clusters(&self, state: &mut TreeState, id: NodeId) -> Vec<u32> {
        if let Some(clusters) = &state.nodes[id].clusters {
            return clusters.clone();
        }

        let (path, record) = {
            let node = &state.nodes[id];
            (node.path.clone(), node.record.clone())
        };
        let clusters = match record {
            None => vec![ROOT_CLUSTER],
            Some(record) => {
                let chain = self.clusters_for(&record);
                let held = chain.clusters.len() as u64 * CLUSTER_SIZE;
                let detail = match chain.end {
                    _ if record.name.starts_with(DELETED_NAME_PREFIX) => None,
                    ChainEnd::OutOfBounds { cluster } => Some(format!(
                        "cluster {} is outside the {}-entry FAT",
                        cluster,
                        self.table.entry_count()
                    )),
                    ChainEnd::HopLimit => Some(format!("chain from cluster {} does not terminate", record.cluster)),
                    _ if held < record.size as u64 => Some(format!(
                        "chain ended after {} clusters, {:#x} of {:#x} bytes",
                        chain.clusters.len(),
                        held,
                        record.size
                    )),
                    _ => None,
                };
                if let Some(detail) = detail {
                    state.record(Anomaly::new(AnomalyKind::ChainInconsistency, path.as_str(), detail));
                }
                debug!("{}: {} clusters", path, chain.clusters.len());
                chain.clusters
            }
        };

        state.nodes[id].clusters = Some(clusters.clone());
        clusters
    }
}

/// Breadth-first path iterator returned by [`XtafTree::walk`]
pub struct Walk<'a, D: BlockDevice> {
    tree: &'a XtafTree<D>,
    queue: VecDeque<NodeId>,
}

impl<'a, D: BlockDevice> Iterator for Walk<'a, D> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        let id = self.queue.pop_front()?;
        let mut state = self.tree.lock();
        self.tree.expand(&mut state, id);
        if let NodeKind::Directory { children, .. } = &state.nodes[id].kind {
            self.queue.extend(children.iter().copied());
        }
        Some(state.nodes[id].path.clone())
    }
}

/// One file of a partition viewed as a device, offsets mapped through its clusters
pub struct XtafFileDevice<'a, D: BlockDevice> {
    tree: &'a XtafTree<D>,
    clusters: Vec<u32>,
    size: u64,
}

impl<'a, D: BlockDevice> BlockDevice for XtafFileDevice<'a, D> {
    fn read_at(&self, offset: u64, length: u32) -> Result<Vec<u8>> {
        if offset >= self.size {
            return Ok(Vec::new());
        }
        let length = (self.size - offset).min(length as u64);
        self.tree.read_chain(&self.clusters, offset, length)
    }

    fn len(&self) -> u64 {
        self.size
    }
}

impl<D: BlockDevice> FilesystemOps for XtafTree<D> {
    fn filesystem_type(&self) -> &str {
        "xtaf"
    }

    fn stat(&self, path: &str) -> Result<FileAttributes> {
        Ok(Self::stat(self, path)?.attributes())
    }

    fn readdir(&self, path: &str) -> Result<Vec<DirectoryEntry>> {
        Ok(self
            .list(path)?
            .into_iter()
            .map(|entry| DirectoryEntry {
                attributes: entry.attributes(),
                name: entry.name,
            })
            .collect())
    }

    fn read(&self, path: &str, offset: u64, size: u32) -> Result<Vec<u8>> {
        Self::read(self, path, offset, Some(size as u64))
    }

    fn walk(&self, path: &str) -> Result<Vec<String>> {
        Ok(Self::walk(self, path)?.collect())
    }
}
