//! Free-space allocator.
//!
//! The on-disk bitmap is the source of truth: one bit per slot, MSB first in
//! each byte, 1 = in use. The free list is rebuilt from it at mount and is the
//! fast path afterwards. Every acquire/release changes exactly one bit and
//! writes the one bitmap block that holds it.

use tracing::{debug, trace};

use crate::device::BlockDevice;
use crate::{ceil_div, pad, Result, StoreError, BLOCK_SIZE};

#[inline]
fn mask(slot: u32) -> u8 {
    0x80 >> (slot % 8)
}

/// Per-volume allocator state.
#[derive(Debug, Clone)]
pub struct Allocator {
    /// Byte offset of the bitmap region on the device
    region_off: u64,
    slot_count: u32,
    /// In-memory copy of the bitmap, padded to whole blocks
    bitmap: Vec<u8>,
    /// Free slots; the next slot handed out is at the end
    free: Vec<u32>,
}

impl Allocator {
    /// Rebuild the free list from a bitmap.
    ///
    /// Only the first `slot_count` bits are considered; padding bits in the
    /// final byte are ignored whatever their value.
    pub fn load(region_off: u64, bitmap: &[u8], slot_count: u32) -> Self {
        let mut copy = bitmap.to_vec();
        copy.resize(pad(ceil_div(slot_count as u64, 8)) as usize, 0);

        // Push highest first so the lowest free slot is handed out first
        let free = (0..slot_count)
            .rev()
            .filter(|&slot| copy[(slot / 8) as usize] & mask(slot) == 0)
            .collect::<Vec<_>>();

        debug!(slot_count, free = free.len(), "free list rebuilt from bitmap");
        Self {
            region_off,
            slot_count,
            bitmap: copy,
            free,
        }
    }

    /// Read the bitmap region from `dev` and rebuild the free list.
    pub fn read<D: BlockDevice>(dev: &D, region_off: u64, slot_count: u32) -> Result<Self> {
        let bytes = pad(ceil_div(slot_count as u64, 8));
        let raw = dev.read_blocks(
            region_off / BLOCK_SIZE as u64,
            (bytes / BLOCK_SIZE as u64) as usize,
        )?;
        Ok(Self::load(region_off, &raw, slot_count))
    }

    pub fn slot_count(&self) -> u32 {
        self.slot_count
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Slots currently on the free list, next-to-be-acquired last.
    pub fn free_slots(&self) -> &[u32] {
        &self.free
    }

    /// Whether the slot's bit is set. Slots past the end are never used.
    pub fn is_used(&self, slot: u32) -> bool {
        slot < self.slot_count && self.bitmap[(slot / 8) as usize] & mask(slot) != 0
    }

    /// Pop a free slot and durably mark it used.
    ///
    /// If the bitmap write fails the slot goes back on the free list.
    pub fn acquire<D: BlockDevice>(&mut self, dev: &mut D) -> Result<u32> {
        let slot = self.free.pop().ok_or(StoreError::NoSpace)?;
        if let Err(e) = self.set_bit(dev, slot, true) {
            self.free.push(slot);
            return Err(e);
        }
        trace!(slot, "slot acquired");
        Ok(slot)
    }

    /// Durably clear the slot's bit, then push it onto the free list.
    ///
    /// Releasing a slot that is already free is the caller's bug; the key
    /// table flags are the guard.
    pub fn release<D: BlockDevice>(&mut self, dev: &mut D, slot: u32) -> Result<()> {
        self.set_bit(dev, slot, false)?;
        self.free.push(slot);
        trace!(slot, "slot released");
        Ok(())
    }

    /// Mark a referenced slot as used without popping it off the list.
    ///
    /// Used by the consistency pass when the bitmap lost a bit.
    pub fn mark_used<D: BlockDevice>(&mut self, dev: &mut D, slot: u32) -> Result<()> {
        self.set_bit(dev, slot, true)?;
        self.free.retain(|&s| s != slot);
        Ok(())
    }

    fn set_bit<D: BlockDevice>(&mut self, dev: &mut D, slot: u32, used: bool) -> Result<()> {
        if slot >= self.slot_count {
            return Err(StoreError::SlotState {
                slot,
                expected: "within the volume",
            });
        }
        let byte = (slot / 8) as usize;
        let before = self.bitmap[byte];
        if used {
            self.bitmap[byte] |= mask(slot);
        } else {
            self.bitmap[byte] &= !mask(slot);
        }

        let block_idx = byte / BLOCK_SIZE;
        let start = block_idx * BLOCK_SIZE;
        let block = self.region_off / BLOCK_SIZE as u64 + block_idx as u64;
        if let Err(e) = dev.write_blocks(block, &self.bitmap[start..start + BLOCK_SIZE]) {
            self.bitmap[byte] = before;
            return Err(e.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;

    const OFF: u64 = BLOCK_SIZE as u64;

    fn device() -> MemDevice {
        MemDevice::new(4)
    }

    #[test]
    fn test_load_counts_zero_bits() {
        // 0b1010_0000, 0b0000_0001 over 16 slots: 3 used, 13 free
        let alloc = Allocator::load(OFF, &[0xa0, 0x01], 16);
        assert_eq!(alloc.free_count(), 13);
        assert!(alloc.is_used(0));
        assert!(!alloc.is_used(1));
        assert!(alloc.is_used(2));
        assert!(alloc.is_used(15));
        assert!(alloc.free_slots().iter().all(|&s| s < 16));
    }

    #[test]
    fn test_load_ignores_padding_bits() {
        // 5 slots: low three bits of the byte are padding, zero or not
        let alloc = Allocator::load(OFF, &[0x00], 5);
        assert_eq!(alloc.free_count(), 5);
        let alloc = Allocator::load(OFF, &[0x07], 5);
        assert_eq!(alloc.free_count(), 5);
        let alloc = Allocator::load(OFF, &[0xf8], 5);
        assert_eq!(alloc.free_count(), 0);
    }

    #[test]
    fn test_acquire_lowest_first_and_persists() {
        let mut dev = device();
        let mut alloc = Allocator::load(OFF, &[0x80], 4);
        let slot = alloc.acquire(&mut dev).unwrap();
        assert_eq!(slot, 1);
        assert!(alloc.is_used(1));

        let on_disk = dev.read_block(1).unwrap();
        assert_eq!(on_disk[0], 0xc0);
    }

    #[test]
    fn test_release_is_lifo() {
        let mut dev = device();
        let mut alloc = Allocator::load(OFF, &[0x00], 8);
        let a = alloc.acquire(&mut dev).unwrap();
        let b = alloc.acquire(&mut dev).unwrap();
        assert_eq!((a, b), (0, 1));

        alloc.release(&mut dev, a).unwrap();
        alloc.release(&mut dev, b).unwrap();
        assert_eq!(alloc.acquire(&mut dev).unwrap(), b);
        assert_eq!(alloc.acquire(&mut dev).unwrap(), a);
        assert_eq!(dev.read_block(1).unwrap()[0], 0xc0);
    }

    #[test]
    fn test_exhaustion() {
        let mut dev = device();
        let mut alloc = Allocator::load(OFF, &[0x00], 2);
        alloc.acquire(&mut dev).unwrap();
        alloc.acquire(&mut dev).unwrap();
        assert!(matches!(alloc.acquire(&mut dev), Err(StoreError::NoSpace)));
    }

    #[test]
    fn test_failed_write_restores_state() {
        // Bitmap region past the end of the device: every write fails
        let mut dev = MemDevice::new(1);
        let mut alloc = Allocator::load(OFF * 8, &[0x00], 4);
        assert!(alloc.acquire(&mut dev).is_err());
        assert_eq!(alloc.free_count(), 4);
        assert!(!alloc.is_used(0));
    }

    #[test]
    fn test_bits_in_second_bitmap_block() {
        let mut dev = MemDevice::new(4);
        let slots = (BLOCK_SIZE * 8 + 3) as u32;
        let mut alloc = Allocator::read(&dev, OFF, slots).unwrap();
        assert_eq!(alloc.free_count(), slots as usize);

        alloc.mark_used(&mut dev, slots - 1).unwrap();
        assert_eq!(alloc.free_count(), slots as usize - 1);
        // Slot BLOCK_SIZE*8 + 2 lives in byte 0 of the second bitmap block
        assert_eq!(dev.read_block(2).unwrap()[0], 0x20);

        let reloaded = Allocator::read(&dev, OFF, slots).unwrap();
        assert!(reloaded.is_used(slots - 1));
        assert_eq!(reloaded.free_count(), slots as usize - 1);
    }

    #[test]
    fn test_out_of_range_slot() {
        let mut dev = device();
        let mut alloc = Allocator::load(OFF, &[0x00], 4);
        assert!(alloc.release(&mut dev, 9).is_err());
        assert_eq!(alloc.free_count(), 4);
        assert!(!alloc.is_used(9));
        assert!(!alloc.is_used(u32::MAX));
    }
}
