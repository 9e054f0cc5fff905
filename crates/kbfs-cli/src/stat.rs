//! # kbfs stat
//!
//! Superblock and usage summary.

use std::path::Path;

use anyhow::{Context, Result};
use kbfs_store::{FileDevice, MountOptions, Superblock, Volume, VolumeStats};
use serde::Serialize;

#[derive(Serialize)]
struct StatOutput<'a> {
    device: &'a Path,
    superblock: &'a Superblock,
    usage: VolumeStats,
}

pub fn run(path: &Path, json: bool) -> Result<()> {
    let dev = FileDevice::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let volume = Volume::mount(dev, &MountOptions::default())
        .with_context(|| format!("Failed to mount {}", path.display()))?;
    let usage = volume.statfs()?;

    if json {
        let out = StatOutput {
            device: path,
            superblock: volume.superblock(),
            usage,
        };
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    let sb = volume.superblock();
    println!("Volume {}", path.display());
    println!("  magic:       {:#06x}", sb.magic);
    println!("  block size:  {}", usage.block_size);
    println!("  blocks:      {}", usage.block_count);
    println!(
        "  used:        {} ({:.1}%)",
        usage.used_blocks,
        percent(usage.used_blocks, usage.block_count as u64)
    );
    println!("  free:        {}", usage.free_blocks);
    println!("  keys:        {}", usage.keys);
    println!("  volume size: {} bytes", usage.fs_size);

    match usage.dedup {
        Some(d) => {
            println!("  dedup:       on");
            println!(
                "    entries:   {} of {} ({} references)",
                d.active_entries, d.capacity, d.total_refs
            );
            println!("    saved:     {} bytes", d.bytes_saved);
        }
        None => println!("  dedup:       off"),
    }
    Ok(())
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    part as f64 * 100.0 / whole as f64
}
