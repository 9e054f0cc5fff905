//! Flat key table.
//!
//! One 32-byte entry per slot, packed 128 to a block:
//!
//! ```text
//! u8[20] key | u16 flags | u16 ref_count | u64 timestamp_ns
//! ```
//!
//! A slot index is also the index of its data block, so the namespace is flat
//! and 1:1 unless the dedup layer puts a pointer in between.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::{instrument, trace};

use crate::device::BlockDevice;
use crate::{Key, Result, StoreError, BLOCK_SIZE, KEY_LEN};

/// Encoded size of one entry.
pub const ENTRY_SIZE: usize = 32;

/// Entries per table block.
pub const ENTRIES_PER_BLOCK: usize = BLOCK_SIZE / ENTRY_SIZE;

pub const FLAG_ACTIVE: u16 = 0x0001;
pub const FLAG_FREE: u16 = 0x0002;

const NS_PER_SEC: u64 = 1_000_000_000;

/// Modification time packed as nanoseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub fn now() -> Self {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(Self::from)
            .unwrap_or_default()
    }

    pub fn from_parts(secs: u64, nanos: u32) -> Self {
        // Saturates instead of wrapping for times past the year 2554
        Self(secs.saturating_mul(NS_PER_SEC).saturating_add(nanos as u64))
    }

    /// Split into whole seconds and the remaining nanoseconds.
    pub fn to_parts(self) -> (u64, u32) {
        (self.0 / NS_PER_SEC, (self.0 % NS_PER_SEC) as u32)
    }

    pub fn to_system_time(self) -> SystemTime {
        UNIX_EPOCH + Duration::from_nanos(self.0)
    }
}

impl From<Duration> for Timestamp {
    fn from(d: Duration) -> Self {
        Self::from_parts(d.as_secs(), d.subsec_nanos())
    }
}

/// Decoded key-table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyEntry {
    pub key: Key,
    pub flags: u16,
    pub ref_count: u16,
    pub timestamp: Timestamp,
}

impl KeyEntry {
    /// The zeroed FREE entry written at format and on delete.
    pub fn free() -> Self {
        Self {
            key: Key::ZERO,
            flags: FLAG_FREE,
            ref_count: 0,
            timestamp: Timestamp(0),
        }
    }

    pub fn active(key: Key, timestamp: Timestamp) -> Self {
        Self {
            key,
            flags: FLAG_ACTIVE,
            ref_count: 1,
            timestamp,
        }
    }

    pub fn is_active(&self) -> bool {
        self.flags & FLAG_ACTIVE != 0 && self.flags & FLAG_FREE == 0
    }

    pub fn is_free(&self) -> bool {
        self.flags & FLAG_FREE != 0 && self.flags & FLAG_ACTIVE == 0
    }

    /// Exactly one of ACTIVE or FREE must be set.
    pub fn is_valid(&self) -> bool {
        self.is_active() || self.is_free()
    }

    pub fn encode(&self) -> [u8; ENTRY_SIZE] {
        let mut buf = [0u8; ENTRY_SIZE];
        buf[..KEY_LEN].copy_from_slice(self.key.as_bytes());
        buf[20..22].copy_from_slice(&self.flags.to_le_bytes());
        buf[22..24].copy_from_slice(&self.ref_count.to_le_bytes());
        buf[24..32].copy_from_slice(&self.timestamp.0.to_le_bytes());
        buf
    }

    /// Decode one entry; `buf` must hold at least [`ENTRY_SIZE`] bytes.
    pub fn decode(buf: &[u8]) -> Self {
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&buf[..KEY_LEN]);
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&buf[24..32]);
        Self {
            key: Key::from_bytes(key),
            flags: u16::from_le_bytes([buf[20], buf[21]]),
            ref_count: u16::from_le_bytes([buf[22], buf[23]]),
            timestamp: Timestamp(u64::from_le_bytes(ts)),
        }
    }
}

/// Handle on the key-table region of a device.
#[derive(Debug, Clone, Copy)]
pub struct KeyTable {
    /// First block of the table
    start: u64,
    slots: u32,
}

impl KeyTable {
    pub fn new(region_off: u64, slots: u32) -> Self {
        Self {
            start: region_off / BLOCK_SIZE as u64,
            slots,
        }
    }

    pub fn slots(&self) -> u32 {
        self.slots
    }

    fn locate(&self, slot: u32) -> Result<(u64, usize)> {
        if slot >= self.slots {
            return Err(StoreError::SlotState {
                slot,
                expected: "within the key table",
            });
        }
        let slot = slot as usize;
        Ok((
            self.start + (slot / ENTRIES_PER_BLOCK) as u64,
            (slot % ENTRIES_PER_BLOCK) * ENTRY_SIZE,
        ))
    }

    pub fn entry<D: BlockDevice>(&self, dev: &D, slot: u32) -> Result<KeyEntry> {
        let (block, off) = self.locate(slot)?;
        let buf = dev.read_block(block)?;
        Ok(KeyEntry::decode(&buf[off..off + ENTRY_SIZE]))
    }

    /// Read-modify-write the block holding `slot`.
    pub fn write_entry<D: BlockDevice>(&self, dev: &mut D, slot: u32, entry: &KeyEntry) -> Result<()> {
        let (block, off) = self.locate(slot)?;
        let mut buf = dev.read_block(block)?;
        buf[off..off + ENTRY_SIZE].copy_from_slice(&entry.encode());
        dev.write_blocks(block, &buf)?;
        Ok(())
    }

    /// Linear scan for the first ACTIVE slot holding `key`.
    #[instrument(skip(self, dev), level = "debug", fields(key = %key))]
    pub fn lookup<D: BlockDevice>(&self, dev: &D, key: &Key) -> Result<u32> {
        for item in self.entries(dev) {
            let (slot, entry) = item?;
            if entry.is_active() && entry.key == *key {
                return Ok(slot);
            }
        }
        Err(StoreError::not_found(format!("key {}", key)))
    }

    /// Turn a FREE slot into an ACTIVE entry for `key`.
    pub fn allocate<D: BlockDevice>(
        &self,
        dev: &mut D,
        slot: u32,
        key: &Key,
        timestamp: Timestamp,
    ) -> Result<()> {
        let current = self.entry(dev, slot)?;
        if !current.is_free() {
            return Err(StoreError::SlotState {
                slot,
                expected: "free",
            });
        }
        self.write_entry(dev, slot, &KeyEntry::active(*key, timestamp))?;
        trace!(slot, key = %key, "key entry allocated");
        Ok(())
    }

    /// Reset a slot to the zeroed FREE entry.
    pub fn free<D: BlockDevice>(&self, dev: &mut D, slot: u32) -> Result<()> {
        self.write_entry(dev, slot, &KeyEntry::free())?;
        trace!(slot, "key entry freed");
        Ok(())
    }

    /// Replace only the key of an ACTIVE entry. The data block does not move.
    pub fn rename<D: BlockDevice>(&self, dev: &mut D, slot: u32, new_key: &Key) -> Result<()> {
        let mut entry = self.active_entry(dev, slot)?;
        entry.key = *new_key;
        self.write_entry(dev, slot, &entry)
    }

    /// Update the modification time of an ACTIVE entry.
    pub fn touch<D: BlockDevice>(&self, dev: &mut D, slot: u32, timestamp: Timestamp) -> Result<()> {
        let mut entry = self.active_entry(dev, slot)?;
        entry.timestamp = timestamp;
        self.write_entry(dev, slot, &entry)
    }

    fn active_entry<D: BlockDevice>(&self, dev: &D, slot: u32) -> Result<KeyEntry> {
        let entry = self.entry(dev, slot)?;
        if !entry.is_active() {
            return Err(StoreError::SlotState {
                slot,
                expected: "active",
            });
        }
        Ok(entry)
    }

    /// Every entry in slot order, one table block read at a time.
    pub fn entries<'a, D: BlockDevice>(&self, dev: &'a D) -> Entries<'a, D> {
        Entries {
            dev,
            table: *self,
            next: 0,
            buf: Vec::new(),
            failed: false,
        }
    }

    /// `(slot, key)` of every ACTIVE entry.
    ///
    /// The iterator is finite and can only start over from the beginning;
    /// mutating the table while it runs gives unspecified (but safe) results.
    pub fn iter<'a, D: BlockDevice>(&self, dev: &'a D) -> ActiveKeys<'a, D> {
        ActiveKeys {
            inner: self.entries(dev),
        }
    }
}

/// Iterator over all key-table entries.
pub struct Entries<'a, D> {
    dev: &'a D,
    table: KeyTable,
    next: u32,
    buf: Vec<u8>,
    failed: bool,
}

impl<D: BlockDevice> Iterator for Entries<'_, D> {
    type Item = Result<(u32, KeyEntry)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.next >= self.table.slots {
            return None;
        }
        let slot = self.next;
        let idx = slot as usize % ENTRIES_PER_BLOCK;
        if idx == 0 || self.buf.is_empty() {
            let block = self.table.start + (slot as usize / ENTRIES_PER_BLOCK) as u64;
            match self.dev.read_block(block) {
                Ok(buf) => self.buf = buf,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e.into()));
                }
            }
        }
        self.next += 1;
        let off = idx * ENTRY_SIZE;
        Some(Ok((slot, KeyEntry::decode(&self.buf[off..off + ENTRY_SIZE]))))
    }
}

/// Iterator over ACTIVE `(slot, key)` pairs.
pub struct ActiveKeys<'a, D> {
    inner: Entries<'a, D>,
}

impl<D: BlockDevice> Iterator for ActiveKeys<'_, D> {
    type Item = Result<(u32, Key)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.inner.next()? {
                Ok((slot, entry)) if entry.is_active() => return Some(Ok((slot, entry.key))),
                Ok(_) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
