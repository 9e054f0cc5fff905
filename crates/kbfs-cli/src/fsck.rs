//! # kbfs fsck
//!
//! Cross-check bitmap, key table and dedup table; optionally repair.

use std::path::Path;

use anyhow::{bail, Context, Result};
use kbfs_config::{log_fsck_info, log_fsck_warn};
use kbfs_store::{CheckReport, FileDevice, MountOptions, Volume};

pub fn run(path: &Path, repair: bool, json: bool) -> Result<()> {
    let dev = FileDevice::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut volume = Volume::mount(dev, &MountOptions::default())
        .with_context(|| format!("Failed to mount {}", path.display()))?;
    let report = volume.check(repair)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    if report.is_clean() {
        log_fsck_info!("volume clean", device = tracing::field::display(path.display()));
        return Ok(());
    }
    if repair {
        log_fsck_info!("volume repaired", problems = report.problem_count());
        return Ok(());
    }
    log_fsck_warn!("volume has problems", problems = report.problem_count());
    bail!(
        "{} problem(s) found; run `kbfs fsck --repair` to fix them",
        report.problem_count()
    )
}

fn print_report(report: &CheckReport) {
    if report.is_clean() {
        println!("clean");
        return;
    }
    let verb = if report.repaired { "fixed" } else { "found" };
    section("leaked slots", verb, &report.leaked_slots);
    section("unmarked slots", verb, &report.unmarked_slots);
    section("invalid key entries", verb, &report.invalid_entries);
    section("duplicate keys", verb, &report.duplicate_keys);
    section("dangling pointers", verb, &report.dangling_pointers);
    section("bad dedup entries", verb, &report.bad_dedup_entries);
    for (index, recorded, actual) in &report.refcount_fixes {
        println!(
            "refcount {}: dedup entry {} recorded {}, actual {}",
            verb, index, recorded, actual
        );
    }
}

fn section(name: &str, verb: &str, items: &[u32]) {
    if items.is_empty() {
        return;
    }
    let list: Vec<String> = items.iter().map(u32::to_string).collect();
    println!("{} {}: {}", name, verb, list.join(", "));
}
