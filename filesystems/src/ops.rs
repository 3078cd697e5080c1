// Shared read/list contract for the XTAF and STFS engines
// Callers (reports, profile decoding, the CLI) work against this trait so they
// don't care whether a path lives on a partition or inside a container

use chrono::NaiveDateTime;
use serde::Serialize;
use x360_core::Result;

/// File attributes returned by stat operations
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileAttributes {
    pub size: u64,
    pub is_directory: bool,
    pub created: Option<NaiveDateTime>,
    pub modified: Option<NaiveDateTime>,
    pub accessed: Option<NaiveDateTime>,
}

impl FileAttributes {
    pub fn directory() -> Self {
        Self {
            size: 0,
            is_directory: true,
            created: None,
            modified: None,
            accessed: None,
        }
    }
}

/// Directory entry returned by readdir operations
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DirectoryEntry {
    pub name: String,
    pub attributes: FileAttributes,
}

/// Read-only operations both trees provide
///
/// Paths are absolute and `/`-separated, the root is `/`.
pub trait FilesystemOps {
    /// Filesystem type name ("xtaf", "stfs")
    fn filesystem_type(&self) -> &str;

    /// Get file/directory attributes
    fn stat(&self, path: &str) -> Result<FileAttributes>;

    /// List directory contents
    fn readdir(&self, path: &str) -> Result<Vec<DirectoryEntry>>;

    /// Read up to `size` bytes of a file starting at `offset`
    fn read(&self, path: &str, offset: u64, size: u32) -> Result<Vec<u8>>;

    /// Every path at or below `path`, breadth first
    fn walk(&self, path: &str) -> Result<Vec<String>>;
}

/// Split an absolute path into its components, ignoring empty ones
pub(crate) fn path_components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty())
}

/// Normalise a path to `/a/b` form ("/" for the root)
pub(crate) fn normalize_path(path: &str) -> String {
    let mut out = String::new();
    for component in path_components(path) {
        out.push('/');
        out.push_str(component);
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

/// Join a directory path and a child name
pub(crate) fn join_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}
