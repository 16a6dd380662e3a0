use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

use memmap2::{Mmap, MmapOptions};
use parking_lot::Mutex;

/// Bulk storage a resource's streaming pages are read from
pub trait PageSource: Send + Sync + fmt::Debug {
    /// Fill `dst` with the bytes starting at `offset`
    fn read_at(&self, offset: u64, dst: &mut [u8]) -> io::Result<()>;

    /// Total readable bytes
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// False for sources that only support blocking reads on the caller's thread
    fn supports_async(&self) -> bool {
        true
    }
}

fn out_of_range(offset: u64, len: usize, size: u64) -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("read of {} bytes at {} exceeds source size {}", len, offset, size),
    )
}

/// Source over an in-memory byte buffer
#[derive(Clone)]
pub struct MemorySource {
    data: Arc<[u8]>,
}

impl MemorySource {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data: data.into() }
    }
}

impl fmt::Debug for MemorySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySource").field("len", &self.data.len()).finish()
    }
}

impl PageSource for MemorySource {
    fn read_at(&self, offset: u64, dst: &mut [u8]) -> io::Result<()> {
        let start = usize::try_from(offset).map_err(|_| out_of_range(offset, dst.len(), self.len()))?;
        let bytes = start
            .checked_add(dst.len())
            .and_then(|end| self.data.get(start..end))
            .ok_or_else(|| out_of_range(offset, dst.len(), self.len()))?;
        dst.copy_from_slice(bytes);
        Ok(())
    }

    fn len(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Plain file read with seek + read under a lock. Reads block the caller,
/// so the manager treats this as a legacy source.
#[derive(Debug)]
pub struct FileSource {
    file: Mutex<File>,
    len: u64,
}

impl FileSource {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Mutex::new(file),
            len,
        })
    }
}

impl PageSource for FileSource {
    fn read_at(&self, offset: u64, dst: &mut [u8]) -> io::Result<()> {
        if offset + dst.len() as u64 > self.len {
            return Err(out_of_range(offset, dst.len(), self.len));
        }
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(dst)
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn supports_async(&self) -> bool {
        false
    }
}

/// Memory-mapped file region
pub struct MmapSource {
    mmap: Arc<Mmap>,
    base: usize,
    len: usize,
}

impl MmapSource {
    /// Map a whole file read-only
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = File::open(path)?;
        // SAFETY: the mapping is read-only; callers must not truncate the file while it is mapped
        let mmap = unsafe { MmapOptions::new().map(&file)? };
        let len = mmap.len();
        Ok(Self {
            mmap: Arc::new(mmap),
            base: 0,
            len,
        })
    }

    /// View of `len` bytes starting at `base` inside an existing mapping
    pub fn from_region(mmap: Arc<Mmap>, base: usize, len: usize) -> io::Result<Self> {
        if base.checked_add(len).map_or(true, |end| end > mmap.len()) {
            return Err(out_of_range(base as u64, len, mmap.len() as u64));
        }
        Ok(Self { mmap, base, len })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.mmap[self.base..self.base + self.len]
    }
}

impl fmt::Debug for MmapSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MmapSource")
            .field("base", &self.base)
            .field("len", &self.len)
            .finish()
    }
}

impl PageSource for MmapSource {
    fn read_at(&self, offset: u64, dst: &mut [u8]) -> io::Result<()> {
        let bytes = self.as_bytes();
        let start = usize::try_from(offset).map_err(|_| out_of_range(offset, dst.len(), self.len()))?;
        let region = start
            .checked_add(dst.len())
            .and_then(|end| bytes.get(start..end))
            .ok_or_else(|| out_of_range(offset, dst.len(), self.len()))?;
        dst.copy_from_slice(region);
        Ok(())
    }

    fn len(&self) -> u64 {
        self.len as u64
    }
}
