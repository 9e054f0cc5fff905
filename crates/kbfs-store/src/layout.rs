//! Superblock encoding and volume geometry.

use serde::Serialize;
use tracing::{debug, info};

use crate::dedup::{DedupEntry, ENTRIES_PER_BLOCK as DEDUP_PER_BLOCK};
use crate::device::BlockDevice;
use crate::keytable::{KeyEntry, ENTRY_SIZE as KEY_ENTRY_SIZE};
use crate::{ceil_div, pad, Result, StoreError, BLOCK_SIZE, MAGIC, MAX_BLOCKS};

/// Encoded size of the superblock.
pub const SUPERBLOCK_SIZE: u16 = 48;

/// Superblock flag: the volume carries a dedup table.
pub const FLAG_DEDUP: u64 = 0x1;

const BS: u64 = BLOCK_SIZE as u64;

/// On-disk superblock, always in block 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Superblock {
    pub magic: u16,
    pub superblock_size: u16,
    /// Byte offset of the free-space bitmap
    pub freelist_off: u64,
    /// Byte offset of the key table
    pub inode_off: u64,
    /// Byte offset of the first data block
    pub data_off: u64,
    pub block_count: u32,
    pub flags: u64,
    /// Total bytes used by the filesystem
    pub fs_size: u64,
}

impl Superblock {
    pub fn encode(&self) -> [u8; SUPERBLOCK_SIZE as usize] {
        let mut buf = [0u8; SUPERBLOCK_SIZE as usize];
        buf[0..2].copy_from_slice(&self.magic.to_le_bytes());
        buf[2..4].copy_from_slice(&self.superblock_size.to_le_bytes());
        buf[4..12].copy_from_slice(&self.freelist_off.to_le_bytes());
        buf[12..20].copy_from_slice(&self.inode_off.to_le_bytes());
        buf[20..28].copy_from_slice(&self.data_off.to_le_bytes());
        buf[28..32].copy_from_slice(&self.block_count.to_le_bytes());
        buf[32..40].copy_from_slice(&self.flags.to_le_bytes());
        buf[40..48].copy_from_slice(&self.fs_size.to_le_bytes());
        buf
    }

    /// Decode without validating. `buf` must hold at least 48 bytes.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < SUPERBLOCK_SIZE as usize {
            return Err(StoreError::corrupt("superblock truncated"));
        }
        let u16_at = |o: usize| u16::from_le_bytes([buf[o], buf[o + 1]]);
        let u32_at = |o: usize| {
            let mut b = [0u8; 4];
            b.copy_from_slice(&buf[o..o + 4]);
            u32::from_le_bytes(b)
        };
        let u64_at = |o: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[o..o + 8]);
            u64::from_le_bytes(b)
        };
        Ok(Self {
            magic: u16_at(0),
            superblock_size: u16_at(2),
            freelist_off: u64_at(4),
            inode_off: u64_at(12),
            data_off: u64_at(20),
            block_count: u32_at(28),
            flags: u64_at(32),
            fs_size: u64_at(40),
        })
    }

    pub fn is_dedup(&self) -> bool {
        self.flags & FLAG_DEDUP != 0
    }

    /// First block of the dedup table.
    pub fn dedup_start(&self) -> u64 {
        (self.inode_off + pad(self.block_count as u64 * KEY_ENTRY_SIZE as u64)) / BS
    }

    /// Number of dedup-table blocks (zero on a plain volume).
    pub fn dedup_blocks(&self) -> u64 {
        if !self.is_dedup() {
            return 0;
        }
        (self.data_off / BS).saturating_sub(self.dedup_start())
    }

    /// Device block number of the data block owned by `slot`.
    pub fn data_block(&self, slot: u32) -> u64 {
        self.data_off / BS + slot as u64
    }

    /// Slot owning device block `block`, if it lies in the data region.
    pub fn slot_of_block(&self, block: u64) -> Option<u32> {
        let first = self.data_off / BS;
        if block < first || block >= first + self.block_count as u64 {
            return None;
        }
        Some((block - first) as u32)
    }

    /// Check the structural invariants against a device of `device_len` bytes.
    pub fn validate(&self, device_len: u64) -> Result<()> {
        if self.magic != MAGIC {
            return Err(StoreError::corrupt(format!(
                "bad magic: expected {:#06x}, got {:#06x}",
                MAGIC, self.magic
            )));
        }
        if self.superblock_size != SUPERBLOCK_SIZE {
            return Err(StoreError::corrupt(format!(
                "superblock size {} (expected {})",
                self.superblock_size, SUPERBLOCK_SIZE
            )));
        }
        if self.block_count == 0 || self.block_count > MAX_BLOCKS {
            return Err(StoreError::corrupt(format!(
                "block count {} out of range",
                self.block_count
            )));
        }
        for (name, off) in [
            ("freelist_off", self.freelist_off),
            ("inode_off", self.inode_off),
            ("data_off", self.data_off),
        ] {
            if off % BS != 0 {
                return Err(StoreError::corrupt(format!(
                    "{} {:#x} is not block aligned",
                    name, off
                )));
            }
        }
        if !(self.data_off > self.inode_off
            && self.inode_off > self.freelist_off
            && self.freelist_off > self.superblock_size as u64)
        {
            return Err(StoreError::corrupt("regions out of order"));
        }
        let count = self.block_count as u64;
        if self.inode_off - self.freelist_off < ceil_div(count, 8) {
            return Err(StoreError::corrupt("bitmap region too small"));
        }
        // Offsets come straight off the disk, so sums may overflow
        let table_end = self
            .inode_off
            .checked_add(count * KEY_ENTRY_SIZE as u64)
            .ok_or_else(|| StoreError::corrupt("key table end overflows"))?;
        if table_end > self.data_off {
            return Err(StoreError::corrupt("key table overlaps data region"));
        }
        if self.is_dedup() && self.dedup_blocks() == 0 {
            return Err(StoreError::corrupt("dedup volume without dedup table"));
        }
        let data_end = self
            .data_off
            .checked_add(count * BS)
            .ok_or_else(|| StoreError::corrupt("data region end overflows"))?;
        if self.fs_size < data_end {
            return Err(StoreError::corrupt(format!(
                "fs_size {} smaller than data end {}",
                self.fs_size, data_end
            )));
        }
        if device_len < self.fs_size {
            return Err(StoreError::corrupt(format!(
                "device holds {} bytes, filesystem needs {}",
                device_len, self.fs_size
            )));
        }
        Ok(())
    }

    /// Read block 0 and validate it.
    pub fn read<D: BlockDevice>(dev: &D) -> Result<Self> {
        let block = dev.read_block(0)?;
        let sb = Self::decode(&block)?;
        sb.validate(dev.len_bytes()?)?;
        Ok(sb)
    }

    /// Whether block 0 of `dev` carries the magic number.
    pub fn probe<D: BlockDevice>(dev: &D) -> bool {
        dev.read_block(0)
            .ok()
            .and_then(|b| Self::decode(&b).ok())
            .is_some_and(|sb| sb.magic == MAGIC)
    }
}

/// Geometry of a volume with a given number of data blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub block_count: u32,
    pub dedup: bool,
}

impl Layout {
    pub fn for_blocks(block_count: u32, dedup: bool) -> Result<Self> {
        if block_count == 0 || block_count > MAX_BLOCKS {
            return Err(StoreError::NoSpace);
        }
        Ok(Self { block_count, dedup })
    }

    /// Largest layout whose total size fits in `device_len` bytes.
    pub fn for_device(device_len: u64, dedup: bool) -> Result<Self> {
        let fits = |n: u64| Self::total_size(n, dedup) <= device_len;
        if !fits(1) {
            return Err(StoreError::NoSpace);
        }
        // Size grows monotonically with the block count, so bisect
        let (mut lo, mut hi) = (1u64, (device_len / BS).min(MAX_BLOCKS as u64));
        while lo < hi {
            let mid = lo + (hi - lo + 1) / 2;
            if fits(mid) {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }
        Self::for_blocks(lo as u32, dedup)
    }

    fn total_size(n: u64, dedup: bool) -> u64 {
        let dedup_bytes = if dedup {
            ceil_div(n, DEDUP_PER_BLOCK as u64) * BS
        } else {
            0
        };
        BS + pad(ceil_div(n, 8)) + pad(n * KEY_ENTRY_SIZE as u64) + dedup_bytes + n * BS
    }

    pub fn dedup_blocks(&self) -> u64 {
        if self.dedup {
            ceil_div(self.block_count as u64, DEDUP_PER_BLOCK as u64)
        } else {
            0
        }
    }

    pub fn fs_size(&self) -> u64 {
        Self::total_size(self.block_count as u64, self.dedup)
    }

    pub fn superblock(&self) -> Superblock {
        let n = self.block_count as u64;
        let freelist_off = BS;
        let inode_off = freelist_off + pad(ceil_div(n, 8));
        let data_off =
            inode_off + pad(n * KEY_ENTRY_SIZE as u64) + self.dedup_blocks() * BS;
        Superblock {
            magic: MAGIC,
            superblock_size: SUPERBLOCK_SIZE,
            freelist_off,
            inode_off,
            data_off,
            block_count: self.block_count,
            flags: if self.dedup { FLAG_DEDUP } else { 0 },
            fs_size: self.fs_size(),
        }
    }
}

/// Write a fresh, empty volume described by `layout` onto `dev`.
///
/// Every region is rewritten: superblock, zero bitmap, all-FREE key table,
/// all-FREE dedup table and zeroed data blocks.
pub fn format<D: BlockDevice>(dev: &mut D, layout: &Layout) -> Result<Superblock> {
    let sb = layout.superblock();
    let device_len = dev.len_bytes()?;
    if device_len < sb.fs_size {
        return Err(StoreError::NoSpace);
    }
    info!(
        block_count = sb.block_count,
        dedup = layout.dedup,
        fs_size = sb.fs_size,
        "formatting volume"
    );

    let zero = vec![0u8; BLOCK_SIZE];

    let mut block0 = vec![0u8; BLOCK_SIZE];
    block0[..SUPERBLOCK_SIZE as usize].copy_from_slice(&sb.encode());

    // Invalidate any previous superblock first, the new one goes in last
    dev.write_blocks(0, &zero)?;
    fill_region(dev, sb.freelist_off / BS, sb.inode_off / BS, &zero)?;

    let key_end = sb.dedup_start();
    let free_keys = fill_block(&KeyEntry::free().encode());
    fill_region(dev, sb.inode_off / BS, key_end, &free_keys)?;

    let free_dedup = fill_block(&DedupEntry::free().encode());
    fill_region(dev, key_end, key_end + sb.dedup_blocks(), &free_dedup)?;

    fill_region(dev, sb.data_off / BS, sb.fs_size / BS, &zero)?;

    dev.write_blocks(0, &block0)?;
    debug!(data_off = sb.data_off, "format complete");
    Ok(sb)
}

/// Blocks written per device call while formatting.
const FORMAT_BATCH: u64 = 256;

/// Write `block` repeatedly over blocks `start..end`.
fn fill_region<D: BlockDevice>(dev: &mut D, start: u64, end: u64, block: &[u8]) -> Result<()> {
    let mut next = start;
    while next < end {
        let count = (end - next).min(FORMAT_BATCH);
        dev.write_blocks(next, &block.repeat(count as usize))?;
        next += count;
    }
    Ok(())
}

fn fill_block(entry: &[u8]) -> Vec<u8> {
    let mut block = Vec::with_capacity(BLOCK_SIZE);
    while block.len() + entry.len() <= BLOCK_SIZE {
        block.extend_from_slice(entry);
    }
    block.resize(BLOCK_SIZE, 0);
    block
}
