//! # kbfs-store
//!
//! Flat key-addressed block store with an optional content-deduplication layer.
//!
//! Clients address fixed 4096-byte blocks by a 160-bit key instead of a path.
//! On a deduplicating volume several keys may share one physical block when
//! their contents hash identically; a reference-counted dedup table decides
//! when that block can be reclaimed.
//!
//! ## On-disk Layout
//!
//! ```text
//! block 0        superblock (48 bytes, padded to one block)
//! freelist_off   free-space bitmap, one bit per slot, MSB first
//! inode_off      key table, 32-byte entries, one per slot
//! (dedup only)   dedup table, 32-byte entries, ceil(slots / 128) blocks
//! data_off       data blocks, slot `s` owns block `data_off / 4096 + s`
//! ```
//!
//! Every mutation is a sequence of individually durable block writes issued in
//! an order that keeps the device consistent after a crash at any point (soft
//! updates). Crash residue is repaired by [`Volume::check`].

pub mod alloc;
pub mod dedup;
pub mod device;
pub mod hash;
pub mod key;
pub mod keytable;
pub mod layout;
pub mod volume;

pub use alloc::Allocator;
pub use dedup::{Criterion, DedupEntry, DedupStats, DedupTable, Located};
pub use device::{BlockDevice, FileDevice, MemDevice};
pub use hash::content_hash;
pub use key::Key;
pub use keytable::{ActiveKeys, KeyEntry, KeyTable, Timestamp};
pub use layout::{format, Layout, Superblock};
pub use volume::{CheckReport, EntryInfo, MountOptions, Volume, VolumeStats};

use std::io;

use thiserror::Error;

/// Size of every block on the device, and of every value.
pub const BLOCK_SIZE: usize = 4096;

/// Keys are 160 bits.
pub const KEY_LEN: usize = 20;

/// Keys are written as 40 hex digits.
pub const KEY_STRLEN: usize = 40;

/// Superblock magic number.
pub const MAGIC: u16 = 0x666F;

/// Largest supported slot count. Slot indices always fit in a `u32`.
pub const MAX_BLOCKS: u32 = 1 << 30;

/// Errors that can occur during store operations
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid key format: {0:?} (expected {KEY_STRLEN} hex digits)")]
    InvalidKeyFormat(String),

    #[error("not found: {what}")]
    NotFound { what: String },

    #[error("key already exists: {key}")]
    KeyExists { key: String },

    #[error("no free blocks left")]
    NoSpace,

    #[error("dedup table is full")]
    TableFull,

    #[error("reference count of block {block} is saturated")]
    RefcountSaturated { block: u64 },

    #[error("corrupt superblock: {reason}")]
    CorruptSuperblock { reason: String },

    #[error("value of {len} bytes exceeds block size {BLOCK_SIZE}")]
    ValueTooLarge { len: usize },

    #[error("slot {slot} is not {expected}")]
    SlotState { slot: u32, expected: &'static str },
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    pub(crate) fn not_found(what: impl Into<String>) -> Self {
        StoreError::NotFound { what: what.into() }
    }

    pub(crate) fn corrupt(reason: impl Into<String>) -> Self {
        StoreError::CorruptSuperblock {
            reason: reason.into(),
        }
    }
}

/// Ceiling of `a / b` without floats.
#[inline]
pub(crate) const fn ceil_div(a: u64, b: u64) -> u64 {
    a.div_ceil(b)
}

/// Pad a byte count up to the next multiple of [`BLOCK_SIZE`].
#[inline]
pub(crate) const fn pad(bytes: u64) -> u64 {
    ceil_div(bytes, BLOCK_SIZE as u64) * BLOCK_SIZE as u64
}
