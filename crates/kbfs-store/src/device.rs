//! Block I/O seam.
//!
//! The store never touches sectors directly. It reads and writes whole blocks
//! through [`BlockDevice`], and relies on each acknowledged write being complete
//! and durable before the next one is issued. Retry policy belongs to the
//! implementation, not to the store.
//!
//! - [`MemDevice`]: in-memory image, cloneable to snapshot a crash state
//! - [`FileDevice`]: positioned I/O on an image file or raw device

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

use crate::BLOCK_SIZE;

/// Unified interface for block-granular device access
pub trait BlockDevice {
    /// Read `count` consecutive blocks starting at block number `block`.
    fn read_blocks(&self, block: u64, count: usize) -> io::Result<Vec<u8>>;

    /// Write whole blocks starting at block number `block`.
    ///
    /// `data.len()` must be a multiple of [`BLOCK_SIZE`]. The data is durable
    /// when this returns `Ok`.
    fn write_blocks(&mut self, block: u64, data: &[u8]) -> io::Result<()>;

    /// Size of the device in bytes.
    fn len_bytes(&self) -> io::Result<u64>;

    /// Read a single block.
    fn read_block(&self, block: u64) -> io::Result<Vec<u8>> {
        self.read_blocks(block, 1)
    }
}

impl<D: BlockDevice + ?Sized> BlockDevice for &mut D {
    fn read_blocks(&self, block: u64, count: usize) -> io::Result<Vec<u8>> {
        (**self).read_blocks(block, count)
    }

    fn write_blocks(&mut self, block: u64, data: &[u8]) -> io::Result<()> {
        (**self).write_blocks(block, data)
    }

    fn len_bytes(&self) -> io::Result<u64> {
        (**self).len_bytes()
    }
}

fn check_aligned(data: &[u8]) -> io::Result<()> {
    if data.len() % BLOCK_SIZE != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("write of {} bytes is not block aligned", data.len()),
        ));
    }
    Ok(())
}

fn byte_range(block: u64, len: usize) -> io::Result<(u64, u64)> {
    let start = block
        .checked_mul(BLOCK_SIZE as u64)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "block number overflow"))?;
    let end = start
        .checked_add(len as u64)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "block range overflow"))?;
    Ok((start, end))
}

// ============================================================================
// In-memory device
// ============================================================================

/// Device backed by a byte vector.
#[derive(Debug, Clone)]
pub struct MemDevice {
    data: Vec<u8>,
}

impl MemDevice {
    /// Create a zero-filled device of `blocks` blocks.
    pub fn new(blocks: u64) -> Self {
        Self {
            data: vec![0u8; blocks as usize * BLOCK_SIZE],
        }
    }

    /// Wrap an existing image.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

impl BlockDevice for MemDevice {
    fn read_blocks(&self, block: u64, count: usize) -> io::Result<Vec<u8>> {
        let (start, end) = byte_range(block, count * BLOCK_SIZE)?;
        if end > self.data.len() as u64 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("read past end of device at block {}", block),
            ));
        }
        Ok(self.data[start as usize..end as usize].to_vec())
    }

    fn write_blocks(&mut self, block: u64, data: &[u8]) -> io::Result<()> {
        check_aligned(data)?;
        let (start, end) = byte_range(block, data.len())?;
        if end > self.data.len() as u64 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("write past end of device at block {}", block),
            ));
        }
        self.data[start as usize..end as usize].copy_from_slice(data);
        Ok(())
    }

    fn len_bytes(&self) -> io::Result<u64> {
        Ok(self.data.len() as u64)
    }
}

// ============================================================================
// File-backed device
// ============================================================================

/// Device backed by a regular file or a raw device node.
#[derive(Debug)]
pub struct FileDevice {
    file: File,
}

impl FileDevice {
    /// Open an existing image or device for reading and writing.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self { file })
    }

    /// Create (or grow) an image file of exactly `size` bytes.
    pub fn create<P: AsRef<Path>>(path: P, size: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.set_len(size)?;
        Ok(Self { file })
    }
}

#[cfg(unix)]
impl BlockDevice for FileDevice {
    fn read_blocks(&self, block: u64, count: usize) -> io::Result<Vec<u8>> {
        use std::os::unix::fs::FileExt;

        let (start, _) = byte_range(block, count * BLOCK_SIZE)?;
        let mut buf = vec![0u8; count * BLOCK_SIZE];
        self.file.read_exact_at(&mut buf, start)?;
        Ok(buf)
    }

    fn write_blocks(&mut self, block: u64, data: &[u8]) -> io::Result<()> {
        use std::os::unix::fs::FileExt;

        check_aligned(data)?;
        let (start, _) = byte_range(block, data.len())?;
        self.file.write_all_at(data, start)?;
        self.file.sync_data()
    }

    fn len_bytes(&self) -> io::Result<u64> {
        use std::io::{Seek, SeekFrom};

        // Raw device nodes report a zero metadata length, seeking works for both
        let meta = self.file.metadata()?;
        if meta.is_file() {
            return Ok(meta.len());
        }
        let mut file = &self.file;
        let end = file.seek(SeekFrom::End(0))?;
        file.seek(SeekFrom::Start(0))?;
        Ok(end)
    }
}
