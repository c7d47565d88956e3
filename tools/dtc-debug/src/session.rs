//! Host-side resource manager sessions
//!
//! Runs the firmware lifecycle (init, load, protect, gate) against a
//! directory of block files, a heap image of the reserved block and the
//! simulated TEE, so a configuration set can be checked before it ships.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use colored::Colorize;
use log::{debug, info, warn};
use walkdir::WalkDir;

use dtc_resmgr::block::BlockKind;
use dtc_resmgr::context::Diagnostics;
use dtc_resmgr::manifest::{Manifest, ManifestEntry, MANIFEST_KEY};
use dtc_resmgr::platform::{self, BuiltinHooks};
use dtc_resmgr::region::BankType;
use dtc_resmgr::secure::{read_status, SecureStatusView, SimulatedTee};
use dtc_resmgr::store::{SecureKeyStore, StoreError, StoreResult};
use dtc_resmgr::{CoreFlags, DtcContext, GateDecision, RamImage, Resolution, ReservedMemory};

use crate::blockfile::{pack_block, PackOptions};
use crate::error::ToolError;
use crate::platforms::PlatformProfile;

/// File extension of stored values
const VALUE_EXT: &str = "bin";

// ============================================================================
// DIRECTORY STORE
// ============================================================================

/// Key-value store backed by `<key>.bin` files under one directory
#[derive(Debug, Default)]
pub struct DirStore {
    files: BTreeMap<String, PathBuf>,
    corrupt: HashMap<String, u32>,
}

impl DirStore {
    pub fn open(root: &Path) -> Result<Self> {
        if !root.is_dir() {
            anyhow::bail!("Store directory not found: {}", root.display());
        }

        let mut files = BTreeMap::new();
        for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
            let path = entry.path();
            if !entry.file_type().is_file()
                || path.extension().and_then(|e| e.to_str()) != Some(VALUE_EXT)
            {
                continue;
            }
            if let Some(key) = path.file_stem().and_then(|s| s.to_str()) {
                debug!("store: {} -> {}", key, path.display());
                files.insert(key.to_string(), path.to_path_buf());
            }
        }

        Ok(Self {
            files,
            corrupt: HashMap::new(),
        })
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(|k| k.as_str())
    }

    /// The next `count` reads of `key` come back with one byte flipped
    pub fn corrupt_next_reads(&mut self, key: &str, count: u32) {
        self.corrupt.insert(key.to_string(), count);
    }
}

fn io_status(e: &std::io::Error) -> StoreError {
    StoreError::Io(e.raw_os_error().unwrap_or(-1))
}

impl SecureKeyStore for DirStore {
    fn exists(&self, name: &str) -> bool {
        self.files.contains_key(name)
    }

    fn size(&self, name: &str) -> StoreResult<u32> {
        let path = self.files.get(name).ok_or(StoreError::NotFound)?;
        let meta = std::fs::metadata(path).map_err(|e| io_status(&e))?;
        u32::try_from(meta.len()).map_err(|_| StoreError::Io(-1))
    }

    fn read(&mut self, name: &str, buf: &mut [u8]) -> StoreResult<()> {
        let path = self.files.get(name).ok_or(StoreError::NotFound)?;
        let value = std::fs::read(path).map_err(|e| io_status(&e))?;
        if buf.len() < value.len() {
            return Err(StoreError::BufferTooSmall {
                needed: value.len() as u32,
                got: buf.len(),
            });
        }
        buf[..value.len()].copy_from_slice(&value);

        if let Some(remaining) = self.corrupt.get_mut(name) {
            if *remaining > 0 {
                *remaining -= 1;
                warn!("store: corrupting read of '{}'", name);
                if let Some(b) = buf.get_mut(8) {
                    *b ^= 0xFF;
                }
            }
        }
        Ok(())
    }
}

/// Parse `KEY=COUNT`
pub fn parse_corrupt(text: &str) -> Result<(String, u32), ToolError> {
    let bad = || ToolError::BadCorrupt(text.to_string());
    let (key, count) = text.split_once('=').ok_or_else(bad)?;
    if key.is_empty() {
        return Err(bad());
    }
    Ok((key.to_string(), count.parse().map_err(|_| bad())?))
}

// ============================================================================
// SESSION
// ============================================================================

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub profile: PlatformProfile,
    pub panel: Resolution,
    pub base: u64,
    /// Overrides the profile's reserved size
    pub size: Option<u32>,
    /// Run as if no TEE were present
    pub no_tee: bool,
    /// TEE rejects this many protect calls
    pub fail_protects: u32,
    pub reload: Option<u16>,
    pub release: bool,
}

pub struct SessionOutcome {
    pub diagnostics: Diagnostics,
    pub gate: GateDecision,
    /// Size of the basic-init block handed to the timing logic
    pub activated: Option<usize>,
    pub status: Option<SecureStatusView>,
    pub tee: SimulatedTee,
}

pub fn run(store: &mut DirStore, opts: &SessionOptions) -> Result<SessionOutcome> {
    let chip = opts.profile.chip()?;
    let table = opts.profile.table()?;
    let size = opts.size.unwrap_or(opts.profile.reserved_size);
    let reserved = ReservedMemory::new(opts.base, size);

    let mut mem = RamImage::new(reserved);
    let mut tee = if opts.no_tee {
        SimulatedTee::absent()
    } else {
        SimulatedTee::new()
    };
    tee.fail_next_protects(opts.fail_protects);

    info!(
        "session: {} rev {} panel {} reserved {:#x}+{:#x}",
        chip.family.name(),
        chip.revision,
        opts.panel,
        reserved.base,
        reserved.size
    );

    let mut ctx = DtcContext::new(chip, opts.panel, reserved, table, BuiltinHooks);

    let mut activated = None;
    match ctx.init(store, &mut mem) {
        Ok(()) => {
            if let Err(e) = ctx.load_all(store, &mut mem) {
                warn!("session: load stopped: {}", e);
            }
            let protected = ctx.protect_secure(&mut tee, &mut mem).unwrap_or(0);
            info!("session: {} region(s) protected", protected);

            if let Some(index) = opts.reload {
                if let Err(e) = ctx.reload_block(index, store, &mut tee, &mut mem) {
                    warn!("session: reload of block {} failed: {}", index, e);
                }
            }

            match ctx.activate(&mem) {
                Ok((header, payload)) => {
                    info!("session: activated '{}' ({} bytes)", header.name, payload.len());
                    activated = Some(payload.len());
                }
                Err(e) => warn!("session: not activated: {}", e),
            }
        }
        Err(e) => warn!("session: init failed: {}", e),
    }

    let gate = ctx.gate();
    let status = ctx
        .layout()
        .and_then(|l| l.secure_status())
        .and_then(|region| read_status(&mem, region));

    if opts.release {
        ctx.release(&mut tee, &mut mem)
            .context("Failed to release reserved memory")?;
    }

    Ok(SessionOutcome {
        diagnostics: ctx.diagnostics(),
        gate,
        activated,
        status,
        tee,
    })
}

pub fn print_outcome(outcome: &SessionOutcome) {
    crate::report::print_diagnostics(&outcome.diagnostics);

    if let Some(status) = &outcome.status {
        println!("{} (generation {})", "Secure Status Mirror:".white().bold(), status.generation);
        for (slot, s) in status.slots.iter().enumerate() {
            println!(
                "  slot {} protected={} error={:#x} handle={:#x}",
                slot, s.protected, s.error, s.handle
            );
        }
        println!();
    }

    match outcome.gate {
        GateDecision::Allow => println!("{} Configuration may drive the controller", "[OK]".green().bold()),
        GateDecision::NotComplete => println!("{} Configuration set incomplete", "[WARNING]".yellow()),
        GateDecision::Vetoed => println!("{} Activation vetoed by platform", "[ERROR]".red().bold()),
    }
    if let Some(len) = outcome.activated {
        println!("{} Basic-init handed over ({} bytes)", "[OK]".green().bold(), len);
    }
}

// ============================================================================
// SAMPLE STORE
// ============================================================================

/// LUT payload bytes written per sample bank block
const SAMPLE_LUT_SIZE: usize = 4096;

fn bank_block_kind(bank: BankType) -> Option<BlockKind> {
    BlockKind::ALL.iter().copied().find(|k| k.bank() == Some(bank))
}

fn sample_features(cores: CoreFlags) -> u32 {
    let mut features = platform::FEATURE_VAC;
    for (core, feature) in [
        (CoreFlags::OD, platform::FEATURE_OD),
        (CoreFlags::DEMURA, platform::FEATURE_DEMURA),
        (CoreFlags::LOD, platform::FEATURE_LOD),
        (CoreFlags::ACC, platform::FEATURE_ACC),
    ] {
        if cores.contains(core) {
            features |= feature;
        }
    }
    features
}

/// Write a complete configuration set for `profile` into `dir`.
///
/// Returns the keys written, manifest first.
pub fn write_sample_store(
    dir: &Path,
    profile: &PlatformProfile,
    panel: Resolution,
    version: u32,
) -> Result<Vec<String>> {
    let chip = profile.chip()?;
    let table = profile.table()?;
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;

    let mut blocks: Vec<(ManifestEntry, PackOptions, Vec<u8>)> = Vec::new();
    let init = PackOptions {
        kind: BlockKind::BasicInit,
        name: "basic_init".to_string(),
        chip: Some(chip.family),
        resolution: panel,
        secure: false,
        optional: false,
    };
    let init_payload = platform::init_payload(sample_features(chip.cores), &[(0x1000, 1), (0x1004, 0)]);
    blocks.push((ManifestEntry::new(0, BlockKind::BasicInit, "basic_init"), init, init_payload));

    let vac = PackOptions {
        kind: BlockKind::Vac,
        name: "vac".to_string(),
        chip: None,
        resolution: Resolution::ANY,
        secure: false,
        optional: true,
    };
    blocks.push((ManifestEntry::new(1, BlockKind::Vac, "vac").optional(), vac, vec![0x5A; 256]));

    for spec in &table.banks {
        let Some(kind) = bank_block_kind(spec.mem_type) else {
            continue;
        };
        let index = blocks.len() as u16;
        let name = kind.name().replace('-', "_");
        let mut entry = ManifestEntry::new(index, kind, &name).secure();
        if !spec.mandatory {
            entry = entry.optional();
        }
        let opts = PackOptions {
            kind,
            name: name.clone(),
            chip: None,
            resolution: Resolution::ANY,
            secure: true,
            optional: !spec.mandatory,
        };
        let payload = (0..SAMPLE_LUT_SIZE).map(|i| (i as u8) ^ index as u8).collect();
        blocks.push((entry, opts, payload));
    }

    let manifest = Manifest::new(version, blocks.iter().map(|(e, _, _)| e.clone()).collect())?;
    let mut written = vec![MANIFEST_KEY.to_string()];
    write_value(dir, MANIFEST_KEY, &manifest.encode()?)?;

    for (entry, opts, payload) in &blocks {
        write_value(dir, &entry.name, &pack_block(opts, payload)?)?;
        written.push(entry.name.clone());
    }
    Ok(written)
}

fn write_value(dir: &Path, key: &str, bytes: &[u8]) -> Result<()> {
    let path = dir.join(format!("{}.{}", key, VALUE_EXT));
    std::fs::write(&path, bytes).with_context(|| format!("Failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platforms::get_platform;
    use dtc_resmgr::context::DtcState;
    use dtc_resmgr::reason::ReasonCode;

    const UHD: Resolution = Resolution::new(3840, 2160);

    fn options(platform: &str) -> SessionOptions {
        let profile = get_platform(platform).unwrap().clone();
        SessionOptions {
            panel: UHD,
            base: 0x7000_0000,
            size: None,
            no_tee: false,
            fail_protects: 0,
            reload: None,
            release: false,
            profile,
        }
    }

    fn sample(platform: &str) -> (tempfile::TempDir, DirStore) {
        let dir = tempfile::tempdir().unwrap();
        let profile = get_platform(platform).unwrap();
        write_sample_store(dir.path(), profile, UHD, 1).unwrap();
        let store = DirStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_dir_store_reads_files() {
        let (_dir, mut store) = sample("t5");
        let keys: Vec<&str> = store.keys().collect();
        assert!(keys.contains(&MANIFEST_KEY));
        assert!(keys.contains(&"basic_init"));

        let size = store.size("vac").unwrap() as usize;
        let mut buf = vec![0u8; size];
        store.read("vac", &mut buf).unwrap();
        assert!(dtc_resmgr::block::decode(&buf).is_ok());
        assert_eq!(store.read("missing", &mut buf), Err(StoreError::NotFound));
    }

    #[test]
    fn test_sample_store_activates() {
        let (_dir, mut store) = sample("t3");
        let outcome = run(&mut store, &options("t3")).unwrap();

        assert_eq!(outcome.gate, GateDecision::Allow);
        assert_eq!(outcome.diagnostics.state, DtcState::Ready);
        assert!(outcome.activated.is_some());
        assert_eq!(outcome.tee.protected_ranges().count(), 3);

        let status = outcome.status.unwrap();
        assert!(status.slots[..3].iter().all(|s| s.protected));
    }

    #[test]
    fn test_transient_corruption_is_retried() {
        let (_dir, mut store) = sample("t5");
        store.corrupt_next_reads("od_lut", 1);
        let outcome = run(&mut store, &options("t5")).unwrap();

        assert_eq!(outcome.gate, GateDecision::Allow);
        assert!(outcome
            .diagnostics
            .reasons
            .iter()
            .any(|r| r.code == ReasonCode::CrcRetry));
    }

    #[test]
    fn test_missing_tee_does_not_block_activation() {
        let (_dir, mut store) = sample("tl1");
        let mut opts = options("tl1");
        opts.no_tee = true;
        let outcome = run(&mut store, &opts).unwrap();

        assert_eq!(outcome.gate, GateDecision::Allow);
        assert!(outcome
            .diagnostics
            .reasons
            .iter()
            .any(|r| r.code == ReasonCode::ProtectFailed));
    }

    #[test]
    fn test_small_reservation_drops_optional_bank() {
        let (_dir, mut store) = sample("t5");
        let mut opts = options("t5");
        // Overdrive and staging fit, demura does not
        opts.size = Some(7 * 1024 * 1024 + 0x1000);
        let outcome = run(&mut store, &opts).unwrap();

        assert!(outcome.diagnostics.banks.iter().any(|b| !b.valid));
        assert_eq!(outcome.gate, GateDecision::Allow);
    }

    #[test]
    fn test_release_clears_protection() {
        let (_dir, mut store) = sample("t5");
        let mut opts = options("t5");
        opts.release = true;
        let outcome = run(&mut store, &opts).unwrap();

        assert_eq!(outcome.diagnostics.state, DtcState::Released);
        assert_eq!(outcome.tee.protected_ranges().count(), 0);
    }

    #[test]
    fn test_parse_corrupt() {
        assert_eq!(parse_corrupt("od_lut=2").unwrap(), ("od_lut".to_string(), 2));
        assert!(parse_corrupt("=2").is_err());
        assert!(parse_corrupt("od_lut").is_err());
    }
}
