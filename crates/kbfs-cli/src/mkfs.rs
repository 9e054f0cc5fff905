//! # kbfs mkfs
//!
//! Lay out an empty volume on a device or image file.

use std::path::Path;

use anyhow::{bail, Context, Result};
use clap::Args;
use kbfs_config::{log_mkfs_debug, log_mkfs_info, Config};
use kbfs_store::{BlockDevice, FileDevice, Layout, Superblock, Volume, BLOCK_SIZE};

#[derive(Args, Debug)]
pub struct MkfsArgs {
    /// Enable the deduplication layer
    #[arg(long)]
    dedup: bool,

    /// Create or resize the image file to SIZE bytes first
    #[arg(long, value_name = "BYTES")]
    size: Option<u64>,

    /// Number of data blocks (default: as many as fit)
    #[arg(long, value_name = "N")]
    blocks: Option<u32>,

    /// Reformat even if the device already holds a volume
    #[arg(long)]
    force: bool,
}

pub fn run(path: &Path, args: MkfsArgs, config: &Config) -> Result<()> {
    let dedup = args.dedup || config.format.dedup;
    let size = args.size.or(config.format.size_bytes);

    // Look for a volume before --size gets a chance to truncate it
    if path.exists() && !args.force {
        let existing = FileDevice::open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        if Superblock::probe(&existing) {
            bail!(
                "{} already holds a kbfs volume; pass --force to reformat it",
                path.display()
            );
        }
    }

    let dev = match size {
        Some(size) => FileDevice::create(path, size)
            .with_context(|| format!("Failed to create {}", path.display()))?,
        None => FileDevice::open(path).with_context(|| {
            format!("Failed to open {} (use --size to create it)", path.display())
        })?,
    };

    let device_len = dev.len_bytes()?;
    let layout = match args.blocks {
        Some(n) => Layout::for_blocks(n, dedup)?,
        None => Layout::for_device(device_len, dedup)?,
    };
    log_mkfs_debug!(
        "computed layout",
        blocks = layout.block_count,
        dedup = dedup,
        device_len = device_len
    );

    let volume = Volume::format(dev, &layout)
        .with_context(|| format!("Failed to format {}", path.display()))?;
    let sb = volume.superblock();
    log_mkfs_info!("volume formatted", blocks = sb.block_count, dedup = dedup);

    println!("Formatted {}", path.display());
    println!("  blocks:      {} x {} bytes", sb.block_count, BLOCK_SIZE);
    println!("  dedup:       {}", if dedup { "on" } else { "off" });
    println!("  bitmap at:   block {}", sb.freelist_off / BLOCK_SIZE as u64);
    println!("  keys at:     block {}", sb.inode_off / BLOCK_SIZE as u64);
    if dedup {
        println!(
            "  dedup at:    block {} ({} blocks)",
            sb.dedup_start(),
            sb.dedup_blocks()
        );
    }
    println!("  data at:     block {}", sb.data_off / BLOCK_SIZE as u64);
    println!("  volume size: {} bytes", sb.fs_size);
    Ok(())
}
