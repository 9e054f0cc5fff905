//! Key operations: put, get, rm, mv, ls.

use std::io::{Read, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use kbfs_config::log_cli_info;
use kbfs_store::{BlockDevice, Key, Volume, BLOCK_SIZE};

pub fn put<D: BlockDevice>(volume: &mut Volume<D>, key: &Key, file: Option<&Path>) -> Result<()> {
    let data = match file {
        Some(path) => {
            std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?
        }
        None => {
            let mut buf = Vec::new();
            // One byte past the limit is enough to know the value is too large
            std::io::stdin()
                .take(BLOCK_SIZE as u64 + 1)
                .read_to_end(&mut buf)
                .context("Failed to read stdin")?;
            buf
        }
    };
    if data.len() > BLOCK_SIZE {
        bail!("value is larger than one block ({} bytes)", BLOCK_SIZE);
    }

    let slot = volume.put(key, &data)?;
    log_cli_info!(
        "stored",
        key = tracing::field::display(key),
        slot = slot,
        len = data.len()
    );
    Ok(())
}

pub fn get<D: BlockDevice>(volume: &Volume<D>, key: &Key, output: Option<&Path>) -> Result<()> {
    let data = volume.get(key)?;
    match output {
        Some(path) => {
            std::fs::write(path, &data).with_context(|| format!("Failed to write {}", path.display()))?
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&data)?;
            stdout.flush()?;
        }
    }
    Ok(())
}

pub fn remove<D: BlockDevice>(volume: &mut Volume<D>, key: &Key) -> Result<()> {
    volume.remove(key)?;
    log_cli_info!("removed", key = tracing::field::display(key));
    Ok(())
}

pub fn rename<D: BlockDevice>(volume: &mut Volume<D>, old: &Key, new: &Key) -> Result<()> {
    volume.rename(old, new)?;
    log_cli_info!(
        "renamed",
        old = tracing::field::display(old),
        new = tracing::field::display(new)
    );
    Ok(())
}

pub fn list<D: BlockDevice>(volume: &Volume<D>, long: bool) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    for item in volume.iter() {
        let (_, key) = item?;
        if !long {
            writeln!(stdout, "{}", key)?;
            continue;
        }
        let info = volume.stat(&key)?;
        let (secs, nanos) = info.timestamp.to_parts();
        let refs = info
            .shared_refs
            .map(|r| r.to_string())
            .unwrap_or_else(|| "-".to_string());
        writeln!(
            stdout,
            "{}  slot {:>6}  {}.{:09}  refs {}",
            key, info.slot, secs, nanos, refs
        )?;
    }
    Ok(())
}
