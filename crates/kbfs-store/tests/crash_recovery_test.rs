//! Each test stops a write sequence part way by driving the table modules
//! directly, then mounts the device and checks what the consistency pass finds.

use kbfs_store::dedup::FLAG_ACTIVE;
use kbfs_store::{
    content_hash, Allocator, BlockDevice, DedupEntry, DedupTable, Key, KeyTable, Layout, MemDevice,
    MountOptions, Superblock, Timestamp, Volume, BLOCK_SIZE,
};

fn formatted(blocks: u32, dedup: bool) -> MemDevice {
    let layout = Layout::for_blocks(blocks, dedup).unwrap();
    let dev = MemDevice::new(layout.fs_size() / BLOCK_SIZE as u64);
    Volume::format(dev, &layout).unwrap().into_device()
}

fn parts(dev: &MemDevice) -> (Superblock, Allocator, KeyTable) {
    let sb = Superblock::read(dev).unwrap();
    let alloc = Allocator::read(dev, sb.freelist_off, sb.block_count).unwrap();
    let keys = KeyTable::new(sb.inode_off, sb.block_count);
    (sb, alloc, keys)
}

fn block_of(data: &[u8]) -> Vec<u8> {
    let mut block = vec![0u8; BLOCK_SIZE];
    block[..data.len()].copy_from_slice(data);
    block
}

#[test]
fn test_create_interrupted_after_bitmap_write() {
    let mut dev = formatted(4, false);
    let (_, mut alloc, _) = parts(&dev);
    assert_eq!(alloc.acquire(&mut dev).unwrap(), 0);

    // Without repair the slot is simply unavailable
    let mut vol = Volume::mount(dev.clone(), &MountOptions::default()).unwrap();
    assert_eq!(vol.free_count(), 3);
    let report = vol.check(false).unwrap();
    assert_eq!(report.leaked_slots, vec![0]);
    assert_eq!(vol.free_count(), 3);

    let vol = Volume::mount(dev, &MountOptions { repair: true }).unwrap();
    assert_eq!(vol.free_count(), 4);
}

#[test]
fn test_delete_interrupted_after_entry_freed() {
    let mut vol = Volume::mount(formatted(8, false), &MountOptions::default()).unwrap();
    let k = Key::from_bytes([5; 20]);
    let slot = vol.put(&k, b"gone").unwrap();
    let mut dev = vol.into_device();

    let (sb, _, keys) = parts(&dev);
    keys.free(&mut dev, slot).unwrap();

    let mut vol = Volume::mount(dev, &MountOptions::default()).unwrap();
    assert!(!vol.contains(&k).unwrap());
    assert_eq!(vol.free_count(), 7);

    let report = vol.check(true).unwrap();
    assert_eq!(report.leaked_slots, vec![slot]);
    assert_eq!(vol.free_count(), 8);
    assert_eq!(
        vol.device().as_bytes()[(sb.data_block(slot) as usize) * BLOCK_SIZE],
        0
    );
}

#[test]
fn test_active_entry_with_clear_bit_is_remarked() {
    let mut dev = formatted(4, false);
    let (_, _, keys) = parts(&dev);
    let k = Key::from_bytes([9; 20]);
    keys.allocate(&mut dev, 2, &k, Timestamp(42)).unwrap();

    let mut vol = Volume::mount(dev, &MountOptions::default()).unwrap();
    assert_eq!(vol.free_count(), 4);
    let report = vol.check(true).unwrap();
    assert_eq!(report.unmarked_slots, vec![2]);
    assert_eq!(vol.free_count(), 3);
    assert!(vol.allocator().is_used(2));

    // The slot is no longer handed out twice
    for i in 0..3u8 {
        assert_ne!(vol.create(&Key::from_bytes([i; 20])).unwrap(), 2);
    }
    assert_eq!(vol.lookup(&k).unwrap(), 2);
}

#[test]
fn test_dedup_match_interrupted_before_pointer_write() {
    let mut vol = Volume::mount(formatted(16, true), &MountOptions::default()).unwrap();
    let first = Key::from_bytes([1; 20]);
    let second = Key::from_bytes([2; 20]);
    vol.put(&first, b"dup").unwrap();
    vol.create(&second).unwrap();
    let mut dev = vol.into_device();

    // Candidate written and matched, orphan not yet released, pointer not written
    let (sb, mut alloc, _) = parts(&dev);
    let table = DedupTable::new(sb.dedup_start(), sb.dedup_blocks());
    let block = block_of(b"dup");
    let orphan = alloc.acquire(&mut dev).unwrap();
    dev.write_blocks(sb.data_block(orphan), &block).unwrap();
    table.alloc(&mut dev, &content_hash(&block), sb.data_block(orphan)).unwrap();

    let mut vol = Volume::mount(dev, &MountOptions::default()).unwrap();
    let report = vol.check(true).unwrap();
    assert_eq!(report.leaked_slots, vec![orphan]);
    assert_eq!(report.refcount_fixes.len(), 1);
    let (_, recorded, actual) = report.refcount_fixes[0];
    assert_eq!((recorded, actual), (2, 1));

    assert_eq!(vol.stat(&first).unwrap().shared_refs, Some(1));
    assert_eq!(vol.get(&second).unwrap(), vec![0u8; BLOCK_SIZE]);
    assert!(vol.check(false).unwrap().is_clean());

    // The repaired volume still shares correctly
    vol.put(&second, b"dup").unwrap();
    assert_eq!(vol.stat(&first).unwrap().shared_refs, Some(2));
}

#[test]
fn test_dedup_entry_without_referrers_is_dropped() {
    let mut dev = formatted(8, true);
    let (sb, mut alloc, _) = parts(&dev);
    let table = DedupTable::new(sb.dedup_start(), sb.dedup_blocks());
    let block = block_of(b"lonely");
    let slot = alloc.acquire(&mut dev).unwrap();
    dev.write_blocks(sb.data_block(slot), &block).unwrap();
    table.alloc(&mut dev, &content_hash(&block), sb.data_block(slot)).unwrap();

    let vol = Volume::mount(dev, &MountOptions { repair: true }).unwrap();
    assert_eq!(vol.free_count(), 8);
    let stats = vol.statfs().unwrap().dedup.unwrap();
    assert_eq!(stats.active_entries, 0);
}

#[test]
fn test_repair_is_idempotent() {
    let mut dev = formatted(8, false);
    let (_, mut alloc, _) = parts(&dev);
    alloc.acquire(&mut dev).unwrap();
    alloc.acquire(&mut dev).unwrap();

    let mut vol = Volume::mount(dev, &MountOptions::default()).unwrap();
    let first = vol.check(true).unwrap();
    assert_eq!(first.problem_count(), 2);
    let second = vol.check(true).unwrap();
    assert!(second.is_clean());
}

#[test]
fn test_pointer_without_dedup_entry_is_cleared() {
    let mut vol = Volume::mount(formatted(8, true), &MountOptions::default()).unwrap();
    let k = Key::from_bytes([4; 20]);
    let slot = vol.put(&k, b"orphaned").unwrap();
    let physical = vol.stat(&k).unwrap().data_block.unwrap();
    let mut dev = vol.into_device();

    // The entry went FREE but the logical pointer was never cleared
    let sb = Superblock::read(&dev).unwrap();
    let table = DedupTable::new(sb.dedup_start(), sb.dedup_blocks());
    table.write_entry(&mut dev, 0, &DedupEntry::free()).unwrap();

    let mut vol = Volume::mount(dev, &MountOptions::default()).unwrap();
    let report = vol.check(true).unwrap();
    assert_eq!(report.dangling_pointers, vec![slot]);
    assert_eq!(
        report.leaked_slots,
        vec![sb.slot_of_block(physical).unwrap()]
    );

    assert!(vol.check(false).unwrap().is_clean());
    assert_eq!(vol.get(&k).unwrap(), vec![0u8; BLOCK_SIZE]);
    assert_eq!(vol.free_count(), 7);
}

#[test]
fn test_bad_dedup_entries_are_freed() {
    let mut vol = Volume::mount(formatted(16, true), &MountOptions::default()).unwrap();
    let k = Key::from_bytes([6; 20]);
    let slot = vol.put(&k, b"kept").unwrap();
    let mut dev = vol.into_device();

    let sb = Superblock::read(&dev).unwrap();
    let table = DedupTable::new(sb.dedup_start(), sb.dedup_blocks());
    let live = table.entry(&dev, 0).unwrap();
    assert!(live.is_active());

    let active = |content: Key, blockptr: u64| DedupEntry {
        key: content,
        flags: FLAG_ACTIVE,
        ref_count: 1,
        blockptr,
    };
    // Points at the ACTIVE logical slot of `k`
    table
        .write_entry(
            &mut dev,
            3,
            &active(Key::from_bytes([0x33; 20]), sb.data_block(slot)),
        )
        .unwrap();
    // Repeats the content key of the live entry
    table
        .write_entry(&mut dev, 4, &active(live.key, sb.data_block(9)))
        .unwrap();
    // Points into the bitmap, outside the data region
    table
        .write_entry(&mut dev, 5, &active(Key::from_bytes([0x55; 20]), 1))
        .unwrap();

    let mut vol = Volume::mount(dev, &MountOptions::default()).unwrap();
    let report = vol.check(true).unwrap();
    assert_eq!(report.bad_dedup_entries, vec![3, 4, 5]);
    assert!(report.leaked_slots.is_empty());
    assert!(report.refcount_fixes.is_empty());

    assert!(vol.check(false).unwrap().is_clean());
    assert_eq!(&vol.get(&k).unwrap()[..4], b"kept");
    let stats = vol.statfs().unwrap().dedup.unwrap();
    assert_eq!(stats.active_entries, 1);
}
