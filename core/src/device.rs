// Random-access byte sources that the XTAF and STFS engines read from
// Every engine read goes through BlockDevice::read_at, so images, buffers and
// nested files inside other filesystems can all be parsed the same way

use crate::error::{Result, X360Error};
use log::{debug, trace};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

/// A random-access, read-only byte source
///
/// `read_at` returns fewer bytes than requested only when the read runs past
/// the end of the device, and an empty vector when `offset` is at or beyond it.
pub trait BlockDevice: Send + Sync {
    fn read_at(&self, offset: u64, length: u32) -> Result<Vec<u8>>;

    /// Total length of the device in bytes
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<D: BlockDevice + ?Sized> BlockDevice for &D {
    fn read_at(&self, offset: u64, length: u32) -> Result<Vec<u8>> {
        (**self).read_at(offset, length)
    }

    fn len(&self) -> u64 {
        (**self).len()
    }
}

impl<D: BlockDevice + ?Sized> BlockDevice for Box<D> {
    fn read_at(&self, offset: u64, length: u32) -> Result<Vec<u8>> {
        (**self).read_at(offset, length)
    }

    fn len(&self) -> u64 {
        (**self).len()
    }
}

impl<D: BlockDevice + ?Sized> BlockDevice for Arc<D> {
    fn read_at(&self, offset: u64, length: u32) -> Result<Vec<u8>> {
        (**self).read_at(offset, length)
    }

    fn len(&self) -> u64 {
        (**self).len()
    }
}

/// Options for opening an image file
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceOptions {
    /// Serialize every physical read behind a mutex, for callers sharing one
    /// device across threads
    pub threadsafe: bool,
}

/// A device backed by an image file, read with positional reads
pub struct FileDevice {
    path: PathBuf,
    file: File,
    size: u64,
    lock: Option<Mutex<()>>,
}

impl FileDevice {
    /// Open an image file read-only
    pub fn open(path: impl AsRef<Path>, options: DeviceOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let size = file.metadata()?.len();
        debug!("Opened image {:?} ({} bytes, threadsafe={})", path, size, options.threadsafe);

        Ok(Self {
            path,
            file,
            size,
            lock: options.threadsafe.then(|| Mutex::new(())),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_into(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = positional_read(&self.file, &mut buf[filled..], offset + filled as u64)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }
}

#[cfg(unix)]
fn positional_read(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

#[cfg(windows)]
fn positional_read(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}

impl BlockDevice for FileDevice {
    fn read_at(&self, offset: u64, length: u32) -> Result<Vec<u8>> {
        let available = self.size.saturating_sub(offset).min(length as u64) as usize;
        let mut buf = vec![0u8; available];
        if available == 0 {
            return Ok(buf);
        }

        trace!("Reading {} bytes at {:#x} from {:?}", available, offset, self.path);
        let read = match &self.lock {
            Some(lock) => {
                let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
                self.read_into(offset, &mut buf)
            }
            None => self.read_into(offset, &mut buf),
        }
        .map_err(X360Error::Io)?;

        buf.truncate(read);
        Ok(buf)
    }

    fn len(&self) -> u64 {
        self.size
    }
}

/// A device over an in-memory buffer
#[derive(Debug, Clone, Default)]
pub struct MemoryDevice {
    data: Vec<u8>,
}

impl MemoryDevice {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

impl BlockDevice for MemoryDevice {
    fn read_at(&self, offset: u64, length: u32) -> Result<Vec<u8>> {
        let len = self.data.len() as u64;
        let start = offset.min(len) as usize;
        let end = offset.saturating_add(length as u64).min(len) as usize;
        Ok(self.data[start..end].to_vec())
    }

    fn len(&self) -> u64 {
        self.data.len() as u64
    }
}

/// A contiguous window `[start, start + len)` of another device
pub struct SliceDevice<D: BlockDevice> {
    inner: D,
    start: u64,
    len: u64,
}

impl<D: BlockDevice> SliceDevice<D> {
    /// The window is clipped to the end of the inner device
    pub fn new(inner: D, start: u64, len: u64) -> Self {
        let len = len.min(inner.len().saturating_sub(start));
        Self { inner, start, len }
    }

    pub fn start(&self) -> u64 {
        self.start
    }
}

impl<D: BlockDevice> BlockDevice for SliceDevice<D> {
    fn read_at(&self, offset: u64, length: u32) -> Result<Vec<u8>> {
        if offset >= self.len {
            return Ok(Vec::new());
        }
        let length = (self.len - offset).min(length as u64) as u32;
        self.inner.read_at(self.start + offset, length)
    }

    fn len(&self) -> u64 {
        self.len
    }
}
