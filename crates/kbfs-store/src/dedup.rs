//! Deduplication table.
//!
//! Maps a content key to a shared physical block with a reference count.
//! Entries live in a fixed number of dedicated blocks and are scanned
//! linearly; there is no bucket hashing, so every operation is O(capacity).
//!
//! ```text
//! u8[20] key | u16 flags | u16 ref_count | u64 blockptr
//! ```
//!
//! Entry lifecycle: `FREE -> ACTIVE(1) -> ACTIVE(n > 1)* -> FREE`. An ACTIVE
//! entry never holds a zero refcount, and at most one ACTIVE entry exists per
//! content key.

use serde::Serialize;
use tracing::{debug, instrument};

use crate::device::BlockDevice;
use crate::{Key, Result, StoreError, BLOCK_SIZE, KEY_LEN};

/// Encoded size of one entry.
pub const ENTRY_SIZE: usize = 32;

/// Entries per table block.
pub const ENTRIES_PER_BLOCK: usize = BLOCK_SIZE / ENTRY_SIZE;

pub const FLAG_FREE: u16 = 0x0001;
pub const FLAG_ACTIVE: u16 = 0x0010;

/// Decoded dedup-table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupEntry {
    pub key: Key,
    pub flags: u16,
    pub ref_count: u16,
    /// Device block number of the shared data
    pub blockptr: u64,
}

impl DedupEntry {
    pub fn free() -> Self {
        Self {
            key: Key::ZERO,
            flags: FLAG_FREE,
            ref_count: 0,
            blockptr: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.flags & FLAG_ACTIVE != 0
    }

    pub fn is_free(&self) -> bool {
        !self.is_active()
    }

    pub fn encode(&self) -> [u8; ENTRY_SIZE] {
        let mut buf = [0u8; ENTRY_SIZE];
        buf[..KEY_LEN].copy_from_slice(self.key.as_bytes());
        buf[20..22].copy_from_slice(&self.flags.to_le_bytes());
        buf[22..24].copy_from_slice(&self.ref_count.to_le_bytes());
        buf[24..32].copy_from_slice(&self.blockptr.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Self {
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&buf[..KEY_LEN]);
        let mut ptr = [0u8; 8];
        ptr.copy_from_slice(&buf[24..32]);
        Self {
            key: Key::from_bytes(key),
            flags: u16::from_le_bytes([buf[20], buf[21]]),
            ref_count: u16::from_le_bytes([buf[22], buf[23]]),
            blockptr: u64::from_le_bytes(ptr),
        }
    }
}

/// What a scan is looking for. Exactly one criterion per scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Criterion {
    /// ACTIVE entry holding this content key
    Content(Key),
    /// ACTIVE entry pointing at this device block
    Block(u64),
}

impl Criterion {
    fn matches(&self, entry: &DedupEntry) -> bool {
        entry.is_active()
            && match self {
                Criterion::Content(key) => entry.key == *key,
                Criterion::Block(block) => entry.blockptr == *block,
            }
    }
}

/// Result of a table scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Located {
    /// Index and contents of the matching entry
    pub found: Option<(u32, DedupEntry)>,
    /// First FREE entry seen before the scan stopped
    pub first_free: Option<u32>,
}

/// Usage summary of the dedup table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DedupStats {
    pub capacity: u64,
    /// Physical blocks currently shared through the table
    pub active_entries: u64,
    /// Logical references to those blocks
    pub total_refs: u64,
    /// Bytes saved by sharing
    pub bytes_saved: u64,
}

/// Handle on the dedup-table region of a device.
#[derive(Debug, Clone, Copy)]
pub struct DedupTable {
    start: u64,
    blocks: u64,
}

impl DedupTable {
    pub fn new(start_block: u64, blocks: u64) -> Self {
        Self {
            start: start_block,
            blocks,
        }
    }

    pub fn capacity(&self) -> u64 {
        self.blocks * ENTRIES_PER_BLOCK as u64
    }

    fn position(&self, index: u32) -> (u64, usize) {
        let index = index as usize;
        (
            self.start + (index / ENTRIES_PER_BLOCK) as u64,
            (index % ENTRIES_PER_BLOCK) * ENTRY_SIZE,
        )
    }

    pub fn entry<D: BlockDevice>(&self, dev: &D, index: u32) -> Result<DedupEntry> {
        let (block, off) = self.position(index);
        let buf = dev.read_block(block)?;
        Ok(DedupEntry::decode(&buf[off..off + ENTRY_SIZE]))
    }

    pub fn write_entry<D: BlockDevice>(&self, dev: &mut D, index: u32, entry: &DedupEntry) -> Result<()> {
        let (block, off) = self.position(index);
        let mut buf = dev.read_block(block)?;
        buf[off..off + ENTRY_SIZE].copy_from_slice(&entry.encode());
        dev.write_blocks(block, &buf)?;
        Ok(())
    }

    /// Scan every entry in block order, then entry order within a block.
    ///
    /// Stops at the first match. The first FREE entry met on the way is
    /// remembered either way, for the insert-if-missing path of [`alloc`].
    ///
    /// [`alloc`]: DedupTable::alloc
    pub fn locate<D: BlockDevice>(&self, dev: &D, criterion: Criterion) -> Result<Located> {
        let mut first_free = None;
        for b in 0..self.blocks {
            let buf = dev.read_block(self.start + b)?;
            for (i, raw) in buf.chunks_exact(ENTRY_SIZE).enumerate() {
                let index = (b as usize * ENTRIES_PER_BLOCK + i) as u32;
                let entry = DedupEntry::decode(raw);
                if criterion.matches(&entry) {
                    return Ok(Located {
                        found: Some((index, entry)),
                        first_free,
                    });
                }
                if first_free.is_none() && entry.is_free() {
                    first_free = Some(index);
                }
            }
        }
        Ok(Located {
            found: None,
            first_free,
        })
    }

    /// Share an existing block holding `content`, or register `candidate` as one.
    ///
    /// On a match the entry's refcount goes up and its block is returned;
    /// `candidate` is then unreferenced and the caller must release it. On a
    /// miss a new ACTIVE entry pointing at `candidate` takes the first free
    /// slot and `candidate` is returned.
    #[instrument(skip(self, dev), level = "debug", fields(content = %content))]
    pub fn alloc<D: BlockDevice>(&self, dev: &mut D, content: &Key, candidate: u64) -> Result<u64> {
        let located = self.locate(dev, Criterion::Content(*content))?;
        if let Some((index, mut entry)) = located.found {
            entry.ref_count = entry
                .ref_count
                .checked_add(1)
                .ok_or(StoreError::RefcountSaturated {
                    block: entry.blockptr,
                })?;
            self.write_entry(dev, index, &entry)?;
            debug!(block = entry.blockptr, refcount = entry.ref_count, "dedup hit");
            return Ok(entry.blockptr);
        }

        let index = located.first_free.ok_or(StoreError::TableFull)?;
        let entry = DedupEntry {
            key: *content,
            flags: FLAG_ACTIVE,
            ref_count: 1,
            blockptr: candidate,
        };
        self.write_entry(dev, index, &entry)?;
        debug!(block = candidate, index, "dedup entry created");
        Ok(candidate)
    }

    /// Drop one reference to `block`, returning the refcount left.
    ///
    /// At zero the entry is reset to FREE. The block's bytes are left alone;
    /// zeroing and releasing it is the caller's job, and must happen after
    /// this returns.
    #[instrument(skip(self, dev), level = "debug")]
    pub fn unref<D: BlockDevice>(&self, dev: &mut D, block: u64) -> Result<u16> {
        let located = self.locate(dev, Criterion::Block(block))?;
        let (index, mut entry) = located
            .found
            .ok_or_else(|| StoreError::not_found(format!("dedup entry for block {}", block)))?;

        entry.ref_count = entry.ref_count.saturating_sub(1);
        let remaining = entry.ref_count;
        if remaining == 0 {
            entry = DedupEntry::free();
        }
        self.write_entry(dev, index, &entry)?;
        debug!(block, refcount = remaining, "dedup unref");
        Ok(remaining)
    }

    /// Every entry with its index, one block read at a time.
    pub fn entries<'a, D: BlockDevice>(
        &'a self,
        dev: &'a D,
    ) -> impl Iterator<Item = Result<(u32, DedupEntry)>> + 'a {
        (0..self.blocks).flat_map(move |b| {
            let entries: Vec<Result<(u32, DedupEntry)>> = match dev.read_block(self.start + b) {
                Ok(buf) => buf
                    .chunks_exact(ENTRY_SIZE)
                    .enumerate()
                    .map(|(i, raw)| {
                        let index = (b as usize * ENTRIES_PER_BLOCK + i) as u32;
                        Ok((index, DedupEntry::decode(raw)))
                    })
                    .collect(),
                Err(e) => vec![Err(e.into())],
            };
            entries
        })
    }

    /// Count active entries and references.
    pub fn stats<D: BlockDevice>(&self, dev: &D) -> Result<DedupStats> {
        let mut stats = DedupStats {
            capacity: self.capacity(),
            ..Default::default()
        };
        for item in self.entries(dev) {
            let (_, entry) = item?;
            if entry.is_active() {
                stats.active_entries += 1;
                stats.total_refs += entry.ref_count as u64;
            }
        }
        stats.bytes_saved =
            stats.total_refs.saturating_sub(stats.active_entries) * BLOCK_SIZE as u64;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;
    use crate::hash::content_hash;

    fn table(blocks: u64) -> (MemDevice, DedupTable) {
        let mut dev = MemDevice::new(blocks + 1);
        let free = DedupEntry::free().encode().repeat(ENTRIES_PER_BLOCK);
        for b in 1..=blocks {
            dev.write_blocks(b, &free).unwrap();
        }
        (dev, DedupTable::new(1, blocks))
    }

    fn digest(byte: u8) -> Key {
        content_hash(&[byte; BLOCK_SIZE])
    }

    #[test]
    fn test_entry_encoding() {
        let entry = DedupEntry {
            key: digest(1),
            flags: FLAG_ACTIVE,
            ref_count: 3,
            blockptr: 0x1122,
        };
        let buf = entry.encode();
        assert_eq!(&buf[20..22], &[0x10, 0x00]);
        assert_eq!(&buf[22..24], &[0x03, 0x00]);
        assert_eq!(&buf[24..26], &[0x22, 0x11]);
        assert_eq!(DedupEntry::decode(&buf), entry);
        assert!(DedupEntry::decode(&DedupEntry::free().encode()).is_free());
    }

    #[test]
    fn test_alloc_shares_identical_content() {
        let (mut dev, table) = table(1);
        let c = digest(7);

        assert_eq!(table.alloc(&mut dev, &c, 100).unwrap(), 100);
        assert_eq!(table.alloc(&mut dev, &c, 200).unwrap(), 100);

        let located = table.locate(&dev, Criterion::Content(c)).unwrap();
        let (_, entry) = located.found.unwrap();
        assert_eq!(entry.ref_count, 2);
        assert_eq!(entry.blockptr, 100);

        // The second candidate is never recorded
        let by_block = table.locate(&dev, Criterion::Block(200)).unwrap();
        assert!(by_block.found.is_none());
    }

    #[test]
    fn test_refcount_lifecycle() {
        let (mut dev, table) = table(1);
        let c = digest(1);
        let block = table.alloc(&mut dev, &c, 50).unwrap();
        table.alloc(&mut dev, &c, 51).unwrap();

        assert_eq!(table.unref(&mut dev, block).unwrap(), 1);
        assert_eq!(table.unref(&mut dev, block).unwrap(), 0);
        assert!(table.entry(&dev, 0).unwrap().is_free());

        // The freed entry is reused by unrelated content
        let other = digest(2);
        assert_eq!(table.alloc(&mut dev, &other, 60).unwrap(), 60);
        let (index, _) = table
            .locate(&dev, Criterion::Content(other))
            .unwrap()
            .found
            .unwrap();
        assert_eq!(index, 0);
    }

    #[test]
    fn test_unref_unknown_block() {
        let (mut dev, table) = table(1);
        table.alloc(&mut dev, &digest(1), 10).unwrap();
        let before = dev.as_bytes().to_vec();

        assert!(matches!(
            table.unref(&mut dev, 99),
            Err(StoreError::NotFound { .. })
        ));
        assert_eq!(dev.as_bytes(), &before[..]);
    }

    #[test]
    fn test_locate_remembers_first_free_before_match() {
        let (mut dev, table) = table(2);
        for (i, byte) in [1u8, 2, 3].iter().enumerate() {
            table.alloc(&mut dev, &digest(*byte), 10 + i as u64).unwrap();
        }
        table.unref(&mut dev, 11).unwrap();

        let located = table.locate(&dev, Criterion::Content(digest(3))).unwrap();
        assert_eq!(located.found.map(|(i, _)| i), Some(2));
        assert_eq!(located.first_free, Some(1));

        let miss = table.locate(&dev, Criterion::Block(999)).unwrap();
        assert!(miss.found.is_none());
        assert_eq!(miss.first_free, Some(1));
    }

    #[test]
    fn test_scan_crosses_blocks() {
        let (mut dev, table) = table(2);
        let n = ENTRIES_PER_BLOCK as u64 + 5;
        for i in 0..n {
            let content = content_hash(&i.to_le_bytes());
            assert_eq!(table.alloc(&mut dev, &content, 1000 + i).unwrap(), 1000 + i);
        }
        let last = content_hash(&(n - 1).to_le_bytes());
        let (index, entry) = table
            .locate(&dev, Criterion::Content(last))
            .unwrap()
            .found
            .unwrap();
        assert_eq!(index as u64, n - 1);
        assert_eq!(entry.blockptr, 1000 + n - 1);
    }

    #[test]
    fn test_table_full() {
        let (mut dev, table) = table(1);
        for i in 0..ENTRIES_PER_BLOCK as u64 {
            table
                .alloc(&mut dev, &content_hash(&i.to_le_bytes()), 10 + i)
                .unwrap();
        }
        let err = table
            .alloc(&mut dev, &content_hash(b"one too many"), 5000)
            .unwrap_err();
        assert!(matches!(err, StoreError::TableFull));

        // Existing content still shares even when full
        let first = content_hash(&0u64.to_le_bytes());
        assert_eq!(table.alloc(&mut dev, &first, 5001).unwrap(), 10);
    }

    #[test]
    fn test_refcount_saturation() {
        let (mut dev, table) = table(1);
        let c = digest(9);
        let entry = DedupEntry {
            key: c,
            flags: FLAG_ACTIVE,
            ref_count: u16::MAX,
            blockptr: 77,
        };
        table.write_entry(&mut dev, 0, &entry).unwrap();
        assert!(matches!(
            table.alloc(&mut dev, &c, 78),
            Err(StoreError::RefcountSaturated { block: 77 })
        ));
        assert_eq!(table.entry(&dev, 0).unwrap().ref_count, u16::MAX);
    }

    #[test]
    fn test_stats() {
        let (mut dev, table) = table(1);
        let a = digest(1);
        let b = digest(2);
        table.alloc(&mut dev, &a, 10).unwrap();
        table.alloc(&mut dev, &a, 11).unwrap();
        table.alloc(&mut dev, &a, 12).unwrap();
        table.alloc(&mut dev, &b, 13).unwrap();

        let stats = table.stats(&dev).unwrap();
        assert_eq!(stats.capacity, ENTRIES_PER_BLOCK as u64);
        assert_eq!(stats.active_entries, 2);
        assert_eq!(stats.total_refs, 4);
        assert_eq!(stats.bytes_saved, 2 * BLOCK_SIZE as u64);
    }
}
