//! Mounted volume: the per-instance context every operation goes through.
//!
//! A `Volume` owns the device, the superblock, the allocator state and the
//! table handles. Mutating calls take `&mut self`, which is the coarse
//! per-instance lock: each multi-step sequence below runs without another
//! caller interleaving. Wrap the volume in a `Mutex` to share it.
//!
//! ## Write ordering
//!
//! No operation is transactional. Steps are individually durable block writes
//! issued so that a crash after any prefix leaves residue that
//! [`Volume::check`] can detect and repair:
//!
//! - create: pop slot, set bitmap bit, write ACTIVE entry
//! - delete: write FREE entry, zero data block, clear bitmap bit, push slot
//! - dedup put: write candidate, dedup alloc, write pointer, unref old block
//! - dedup unref: free the dedup entry before releasing the physical block
//!
//! ## Dedup volumes
//!
//! The data block of a logical slot holds an 8-byte little-endian pointer to
//! the physical block with the value; 0 means the key has no value yet.
//! Physical blocks are ordinary slots whose key entry stays FREE while their
//! bitmap bit is set; the dedup table is what keeps them alive.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::alloc::Allocator;
use crate::dedup::{Criterion, DedupEntry, DedupStats, DedupTable};
use crate::device::BlockDevice;
use crate::hash::content_hash;
use crate::keytable::{ActiveKeys, KeyEntry, KeyTable, Timestamp};
use crate::layout::{format, Layout, Superblock};
use crate::{Key, Result, StoreError, BLOCK_SIZE};

/// Options applied while mounting.
#[derive(Debug, Clone, Copy, Default)]
pub struct MountOptions {
    /// Run [`Volume::check`] with repair before the volume is handed out
    pub repair: bool,
}

/// Metadata of one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EntryInfo {
    pub key: Key,
    pub slot: u32,
    pub timestamp: Timestamp,
    /// Device block holding the value; `None` for an empty dedup key
    pub data_block: Option<u64>,
    /// References to the shared block (dedup volumes only)
    pub shared_refs: Option<u16>,
}

/// Usage summary of a mounted volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VolumeStats {
    pub block_size: u64,
    pub block_count: u32,
    pub free_blocks: u64,
    pub used_blocks: u64,
    pub keys: u64,
    pub fs_size: u64,
    pub dedup: Option<DedupStats>,
}

/// Findings of a consistency pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CheckReport {
    /// Slots marked used in the bitmap that nothing references
    pub leaked_slots: Vec<u32>,
    /// Referenced slots whose bitmap bit is clear
    pub unmarked_slots: Vec<u32>,
    /// Key entries with neither or both of ACTIVE and FREE set
    pub invalid_entries: Vec<u32>,
    /// ACTIVE slots repeating a key already held by a lower slot
    pub duplicate_keys: Vec<u32>,
    /// Logical slots pointing at a block without a dedup entry
    pub dangling_pointers: Vec<u32>,
    /// Dedup entries pointing outside the data region or at a claimed block
    pub bad_dedup_entries: Vec<u32>,
    /// `(entry index, recorded, actual)` refcount mismatches
    pub refcount_fixes: Vec<(u32, u16, u16)>,
    pub repaired: bool,
}

impl CheckReport {
    pub fn is_clean(&self) -> bool {
        self.leaked_slots.is_empty()
            && self.unmarked_slots.is_empty()
            && self.invalid_entries.is_empty()
            && self.duplicate_keys.is_empty()
            && self.dangling_pointers.is_empty()
            && self.bad_dedup_entries.is_empty()
            && self.refcount_fixes.is_empty()
    }

    pub fn problem_count(&self) -> usize {
        self.leaked_slots.len()
            + self.unmarked_slots.len()
            + self.invalid_entries.len()
            + self.duplicate_keys.len()
            + self.dangling_pointers.len()
            + self.bad_dedup_entries.len()
            + self.refcount_fixes.len()
    }
}

/// A mounted kbfs volume.
pub struct Volume<D: BlockDevice> {
    dev: D,
    sb: Superblock,
    alloc: Allocator,
    keys: KeyTable,
    dedup: Option<DedupTable>,
}

impl<D: BlockDevice> Volume<D> {
    /// Format `dev` with `layout` and mount the empty result.
    pub fn format(mut dev: D, layout: &Layout) -> Result<Self> {
        format(&mut dev, layout)?;
        Self::mount(dev, &MountOptions::default())
    }

    /// Validate the superblock and rebuild the free list from the bitmap.
    pub fn mount(dev: D, opts: &MountOptions) -> Result<Self> {
        let sb = Superblock::read(&dev)?;
        let alloc = Allocator::read(&dev, sb.freelist_off, sb.block_count)?;
        let keys = KeyTable::new(sb.inode_off, sb.block_count);
        let dedup = sb
            .is_dedup()
            .then(|| DedupTable::new(sb.dedup_start(), sb.dedup_blocks()));

        info!(
            block_count = sb.block_count,
            free = alloc.free_count(),
            dedup = sb.is_dedup(),
            "volume mounted"
        );

        let mut volume = Self {
            dev,
            sb,
            alloc,
            keys,
            dedup,
        };
        if opts.repair {
            let report = volume.check(true)?;
            if !report.is_clean() {
                warn!(problems = report.problem_count(), "repaired volume at mount");
            }
        }
        Ok(volume)
    }

    pub fn superblock(&self) -> &Superblock {
        &self.sb
    }

    pub fn is_dedup(&self) -> bool {
        self.dedup.is_some()
    }

    pub fn allocator(&self) -> &Allocator {
        &self.alloc
    }

    pub fn free_count(&self) -> usize {
        self.alloc.free_count()
    }

    pub fn key_table(&self) -> &KeyTable {
        &self.keys
    }

    pub fn dedup_table(&self) -> Option<&DedupTable> {
        self.dedup.as_ref()
    }

    pub fn device(&self) -> &D {
        &self.dev
    }

    /// Unmount, handing the device back.
    pub fn into_device(self) -> D {
        self.dev
    }

    pub fn lookup(&self, key: &Key) -> Result<u32> {
        self.keys.lookup(&self.dev, key)
    }

    pub fn contains(&self, key: &Key) -> Result<bool> {
        match self.lookup(key) {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Register a new, empty key.
    #[instrument(skip(self), level = "debug", fields(key = %key))]
    pub fn create(&mut self, key: &Key) -> Result<u32> {
        if self.contains(key)? {
            return Err(StoreError::KeyExists {
                key: key.to_string(),
            });
        }
        let slot = self.alloc.acquire(&mut self.dev)?;
        self.keys
            .allocate(&mut self.dev, slot, key, Timestamp::now())?;
        debug!(slot, "key created");
        Ok(slot)
    }

    /// Store `data` (at most one block) under `key`, creating the key if needed.
    #[instrument(skip(self, data), level = "debug", fields(key = %key, len = data.len()))]
    pub fn put(&mut self, key: &Key, data: &[u8]) -> Result<u32> {
        if data.len() > BLOCK_SIZE {
            return Err(StoreError::ValueTooLarge { len: data.len() });
        }
        let (slot, created) = match self.lookup(key) {
            Ok(slot) => (slot, false),
            Err(StoreError::NotFound { .. }) => (self.create(key)?, true),
            Err(e) => return Err(e),
        };

        let mut block = vec![0u8; BLOCK_SIZE];
        block[..data.len()].copy_from_slice(data);

        let stored = match self.dedup {
            None => {
                let target = self.sb.data_block(slot);
                self.dev.write_blocks(target, &block).map_err(StoreError::from)
            }
            Some(table) => self.put_shared(&table, slot, &block),
        };
        if let Err(e) = stored {
            // A key this call created must not outlive the failed write
            if created {
                if let Err(undo) = self.discard(slot) {
                    warn!(slot, error = %undo, "could not roll back created key");
                }
            }
            return Err(e);
        }
        self.keys.touch(&mut self.dev, slot, Timestamp::now())?;
        Ok(slot)
    }

    /// Free a slot's entry and reclaim its data block, as `remove` does.
    fn discard(&mut self, slot: u32) -> Result<()> {
        self.keys.free(&mut self.dev, slot)?;
        self.reclaim(slot)
    }

    fn put_shared(&mut self, table: &DedupTable, slot: u32, block: &[u8]) -> Result<()> {
        let digest = content_hash(block);

        let candidate_slot = self.alloc.acquire(&mut self.dev)?;
        let candidate = self.sb.data_block(candidate_slot);
        self.dev.write_blocks(candidate, block)?;

        let physical = match table.alloc(&mut self.dev, &digest, candidate) {
            Ok(physical) => physical,
            Err(e) => {
                self.reclaim(candidate_slot)?;
                return Err(e);
            }
        };
        if physical != candidate {
            // Same content already stored: the candidate is an orphan
            self.reclaim(candidate_slot)?;
        }

        let old = self.read_pointer(slot)?;
        self.write_pointer(slot, physical)?;
        if old != 0 {
            self.drop_shared(table, old)?;
        }
        debug!(slot, block = physical, shared = physical != candidate, "value stored");
        Ok(())
    }

    /// Read the block stored under `key`.
    ///
    /// Always returns [`BLOCK_SIZE`] bytes; a dedup key that was never written
    /// reads as zeros.
    #[instrument(skip(self), level = "debug", fields(key = %key))]
    pub fn get(&self, key: &Key) -> Result<Vec<u8>> {
        let slot = self.lookup(key)?;
        match self.value_block(slot)? {
            Some(block) => Ok(self.dev.read_block(block)?),
            None => Ok(vec![0u8; BLOCK_SIZE]),
        }
    }

    /// Device block holding the value of `slot`.
    fn value_block(&self, slot: u32) -> Result<Option<u64>> {
        if self.dedup.is_none() {
            return Ok(Some(self.sb.data_block(slot)));
        }
        let ptr = self.read_pointer(slot)?;
        if ptr == 0 {
            return Ok(None);
        }
        if self.sb.slot_of_block(ptr).is_none() {
            return Err(StoreError::not_found(format!("data block {}", ptr)));
        }
        Ok(Some(ptr))
    }

    /// Delete `key` and reclaim its blocks.
    #[instrument(skip(self), level = "debug", fields(key = %key))]
    pub fn remove(&mut self, key: &Key) -> Result<()> {
        let slot = self.lookup(key)?;
        let ptr = match self.dedup {
            Some(_) => self.read_pointer(slot)?,
            None => 0,
        };

        self.discard(slot)?;

        if let (Some(table), true) = (self.dedup, ptr != 0) {
            self.drop_shared(&table, ptr)?;
        }
        debug!(slot, "key removed");
        Ok(())
    }

    /// Give the value of `old` the name `new`. The data does not move.
    #[instrument(skip(self), level = "debug", fields(old = %old, new = %new))]
    pub fn rename(&mut self, old: &Key, new: &Key) -> Result<()> {
        let slot = self.lookup(old)?;
        if old == new {
            return Ok(());
        }
        if self.contains(new)? {
            return Err(StoreError::KeyExists {
                key: new.to_string(),
            });
        }
        self.keys.rename(&mut self.dev, slot, new)
    }

    /// `(slot, key)` of every stored key, in slot order.
    pub fn iter(&self) -> ActiveKeys<'_, D> {
        self.keys.iter(&self.dev)
    }

    /// All stored keys.
    pub fn list(&self) -> Result<Vec<Key>> {
        self.iter().map(|item| item.map(|(_, key)| key)).collect()
    }

    pub fn stat(&self, key: &Key) -> Result<EntryInfo> {
        let slot = self.lookup(key)?;
        let entry = self.keys.entry(&self.dev, slot)?;
        let data_block = self.value_block(slot)?;
        let shared_refs = match (self.dedup, data_block) {
            (Some(table), Some(block)) => table
                .locate(&self.dev, Criterion::Block(block))?
                .found
                .map(|(_, e)| e.ref_count),
            _ => None,
        };
        Ok(EntryInfo {
            key: entry.key,
            slot,
            timestamp: entry.timestamp,
            data_block,
            shared_refs,
        })
    }

    pub fn statfs(&self) -> Result<VolumeStats> {
        let keys = self.iter().try_fold(0u64, |n, item| item.map(|_| n + 1))?;
        let dedup = match self.dedup {
            Some(table) => Some(table.stats(&self.dev)?),
            None => None,
        };
        let free = self.alloc.free_count() as u64;
        Ok(VolumeStats {
            block_size: BLOCK_SIZE as u64,
            block_count: self.sb.block_count,
            free_blocks: free,
            used_blocks: self.sb.block_count as u64 - free,
            keys,
            fs_size: self.sb.fs_size,
            dedup,
        })
    }

    /// Zero the slot's data block, then clear its bit and put it back on the free list.
    fn reclaim(&mut self, slot: u32) -> Result<()> {
        let zero = vec![0u8; BLOCK_SIZE];
        self.dev.write_blocks(self.sb.data_block(slot), &zero)?;
        self.alloc.release(&mut self.dev, slot)
    }

    /// Drop one reference to a shared block, reclaiming it at zero.
    fn drop_shared(&mut self, table: &DedupTable, block: u64) -> Result<()> {
        let remaining = table.unref(&mut self.dev, block)?;
        if remaining > 0 {
            return Ok(());
        }
        match self.sb.slot_of_block(block) {
            Some(slot) => self.reclaim(slot),
            None => {
                warn!(block, "dedup entry pointed outside the data region");
                Ok(())
            }
        }
    }

    fn read_pointer(&self, slot: u32) -> Result<u64> {
        let buf = self.dev.read_block(self.sb.data_block(slot))?;
        let mut ptr = [0u8; 8];
        ptr.copy_from_slice(&buf[..8]);
        Ok(u64::from_le_bytes(ptr))
    }

    fn write_pointer(&mut self, slot: u32, ptr: u64) -> Result<()> {
        let mut buf = vec![0u8; BLOCK_SIZE];
        buf[..8].copy_from_slice(&ptr.to_le_bytes());
        self.dev.write_blocks(self.sb.data_block(slot), &buf)?;
        Ok(())
    }

    /// Cross-check bitmap, key table and dedup table.
    ///
    /// The free list always comes from the bitmap; this pass decides what is
    /// really referenced and, with `repair`, rewrites whatever disagrees.
    /// Crash residue of every write sequence in this module is detected here.
    #[instrument(skip(self), level = "debug")]
    pub fn check(&mut self, repair: bool) -> Result<CheckReport> {
        let n = self.sb.block_count as usize;
        let mut report = CheckReport {
            repaired: repair,
            ..Default::default()
        };
        let mut referenced = vec![false; n];
        let mut logical = Vec::new();
        let mut seen = HashSet::new();
        let mut discard = Vec::new();

        for item in self.keys.entries(&self.dev) {
            let (slot, entry) = item?;
            if !entry.is_valid() {
                report.invalid_entries.push(slot);
                discard.push(slot);
            } else if entry.is_active() {
                if seen.insert(entry.key) {
                    referenced[slot as usize] = true;
                    logical.push(slot);
                } else {
                    report.duplicate_keys.push(slot);
                    discard.push(slot);
                }
            }
        }

        if let Some(table) = self.dedup {
            self.check_shared(&table, &logical, &mut referenced, &mut report, repair)?;
        }

        if repair {
            for &slot in &discard {
                self.keys.write_entry(&mut self.dev, slot, &KeyEntry::free())?;
                // A dedup entry may still hold this slot's block
                if !referenced[slot as usize] {
                    let zero = vec![0u8; BLOCK_SIZE];
                    self.dev.write_blocks(self.sb.data_block(slot), &zero)?;
                }
            }
        }

        for slot in 0..n as u32 {
            let used = self.alloc.is_used(slot);
            let wanted = referenced[slot as usize];
            if used && !wanted {
                report.leaked_slots.push(slot);
                if repair {
                    self.reclaim(slot)?;
                }
            } else if !used && wanted {
                report.unmarked_slots.push(slot);
                if repair {
                    self.alloc.mark_used(&mut self.dev, slot)?;
                }
            }
        }

        if report.is_clean() {
            debug!("volume is consistent");
        } else {
            warn!(
                leaked = report.leaked_slots.len(),
                unmarked = report.unmarked_slots.len(),
                invalid = report.invalid_entries.len(),
                duplicates = report.duplicate_keys.len(),
                dangling = report.dangling_pointers.len(),
                bad_dedup = report.bad_dedup_entries.len(),
                refcounts = report.refcount_fixes.len(),
                repair,
                "consistency check found problems"
            );
        }
        Ok(report)
    }

    fn check_shared(
        &mut self,
        table: &DedupTable,
        logical: &[u32],
        referenced: &mut [bool],
        report: &mut CheckReport,
        repair: bool,
    ) -> Result<()> {
        // block -> (entry index, recorded refcount)
        let mut shared: HashMap<u64, (u32, u16)> = HashMap::new();
        let mut contents = HashSet::new();
        let mut bad = Vec::new();

        for item in table.entries(&self.dev) {
            let (index, entry) = item?;
            if !entry.is_active() {
                continue;
            }
            let claimable = match self.sb.slot_of_block(entry.blockptr) {
                Some(slot) => !referenced[slot as usize] && !shared.contains_key(&entry.blockptr),
                None => false,
            };
            if !claimable || !contents.insert(entry.key) {
                bad.push(index);
                continue;
            }
            shared.insert(entry.blockptr, (index, entry.ref_count));
        }

        let mut actual: HashMap<u64, u16> = HashMap::new();
        for &slot in logical {
            let ptr = self.read_pointer(slot)?;
            if ptr == 0 {
                continue;
            }
            if shared.contains_key(&ptr) {
                let count = actual.entry(ptr).or_default();
                *count = count.saturating_add(1);
            } else {
                report.dangling_pointers.push(slot);
                if repair {
                    self.write_pointer(slot, 0)?;
                }
            }
        }

        for (&block, &(index, recorded)) in &shared {
            let count = actual.get(&block).copied().unwrap_or(0);
            if count != recorded {
                report.refcount_fixes.push((index, recorded, count));
                if repair {
                    let mut entry = table.entry(&self.dev, index)?;
                    if count == 0 {
                        entry = DedupEntry::free();
                    } else {
                        entry.ref_count = count;
                    }
                    table.write_entry(&mut self.dev, index, &entry)?;
                }
            }
            if count > 0 {
                if let Some(slot) = self.sb.slot_of_block(block) {
                    referenced[slot as usize] = true;
                }
            }
        }
        report.refcount_fixes.sort_unstable();

        if repair {
            for &index in &bad {
                table.write_entry(&mut self.dev, index, &DedupEntry::free())?;
            }
        }
        report.bad_dedup_entries = bad;
        Ok(())
    }
}

impl<D: BlockDevice> std::fmt::Debug for Volume<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("superblock", &self.sb)
            .field("free", &self.alloc.free_count())
            .field("dedup", &self.dedup.is_some())
            .finish()
    }
}
