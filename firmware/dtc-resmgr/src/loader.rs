//! # Block Loader
//!
//! Reads blocks from the secure key-value store with bounded retry, verifies
//! them with the block codec and places them in the reserved block:
//!
//! - payloads of bank-feeding kinds go into their working buffer bank
//! - under the legacy layout, LUT kinds go into their fixed buffer
//! - everything else is kept whole (header included) in the staging data
//!   area, 16-byte aligned, so it can be re-verified later

use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;
use log::{debug, warn};

use crate::block::{self, ctrl, BlockKind, DataBlockHeader, DecodeError, FormatError, BLOCK_ALIGN};
use crate::layout::{Layout, LayoutPolicy};
use crate::manifest::{Manifest, ManifestEntry, ManifestError, MANIFEST_KEY, MANIFEST_MAX_SIZE};
use crate::memory::{MemoryError, ReservedMemoryAccess};
use crate::platform::PlatformHooks;
use crate::reason::{ReasonCode, ReasonLog};
use crate::region::{BankType, ReservedMemoryRegion};
use crate::store::{SecureKeyStore, StoreError};
use crate::{ChipId, Resolution};

/// Attempts per block before the load is permanently failed
pub const MAX_READ_RETRIES: u32 = 3;

/// Blocks start here in the staging buffer; the manifest sits below
pub const STAGING_DATA_OFFSET: u64 = 0x800;

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadError {
    Store(StoreError),
    /// Verification failed on every attempt
    Format(FormatError),
    /// Keyed for another chip or panel
    NotApplicable,
    /// Header kind differs from the manifest entry
    KindMismatch { expected: BlockKind, found: BlockKind },
    BankUnavailable(BankType),
    /// Payload larger than its destination
    TooLarge { len: usize, capacity: u32 },
    /// Layout has no region for this kind
    NoTarget(BlockKind),
    Memory(MemoryError),
    Manifest(ManifestError),
}

impl core::fmt::Display for LoadError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            LoadError::Store(e) => write!(f, "store: {}", e),
            LoadError::Format(e) => write!(f, "format: {}", e),
            LoadError::NotApplicable => write!(f, "block does not apply to this chip/panel"),
            LoadError::KindMismatch { expected, found } => write!(
                f,
                "manifest expects {}, block is {}",
                expected.name(),
                found.name()
            ),
            LoadError::BankUnavailable(bank) => write!(f, "{} bank not available", bank.name()),
            LoadError::TooLarge { len, capacity } => {
                write!(f, "{} bytes do not fit in {} byte region", len, capacity)
            }
            LoadError::NoTarget(kind) => write!(f, "no region for {} blocks", kind.name()),
            LoadError::Memory(e) => write!(f, "memory: {}", e),
            LoadError::Manifest(e) => write!(f, "manifest: {}", e),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for LoadError {}

impl From<StoreError> for LoadError {
    fn from(e: StoreError) -> Self {
        LoadError::Store(e)
    }
}

impl From<MemoryError> for LoadError {
    fn from(e: MemoryError) -> Self {
        LoadError::Memory(e)
    }
}

impl From<DecodeError> for LoadError {
    fn from(e: DecodeError) -> Self {
        match e {
            DecodeError::Format(f) => LoadError::Format(f),
            DecodeError::Integrity(i) => LoadError::Format(i.into()),
        }
    }
}

pub type LoadResult<T> = Result<T, LoadError>;

// ============================================================================
// STAGING ALLOCATION
// ============================================================================

/// Bump allocator over the staging data area.
///
/// A block reloaded with the same or a smaller size reuses its slot.
#[derive(Clone, Debug)]
pub struct StagingCursor {
    region: ReservedMemoryRegion,
    next: u64,
    slots: BTreeMap<u16, (u64, u32)>,
}

impl StagingCursor {
    pub fn new(region: ReservedMemoryRegion) -> Self {
        Self {
            region,
            next: region.physical_base + STAGING_DATA_OFFSET,
            slots: BTreeMap::new(),
        }
    }

    fn alloc(&mut self, index: u16, len: usize) -> LoadResult<u64> {
        if let Some(&(addr, cap)) = self.slots.get(&index) {
            if len <= cap as usize {
                return Ok(addr);
            }
        }
        let addr = (self.next + BLOCK_ALIGN as u64 - 1) & !(BLOCK_ALIGN as u64 - 1);
        let end = addr + len as u64;
        if end > self.region.end() {
            return Err(LoadError::TooLarge {
                len,
                capacity: self.free() as u32,
            });
        }
        self.next = end;
        self.slots.insert(index, (addr, len as u32));
        Ok(addr)
    }

    /// Bytes left in the data area
    pub fn free(&self) -> u64 {
        self.region.end().saturating_sub(self.next)
    }

    pub fn used(&self) -> u64 {
        self.next - (self.region.physical_base + STAGING_DATA_OFFSET)
    }
}

// ============================================================================
// LOADING
// ============================================================================

/// Where a verified block ended up
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadedBlock {
    pub index: u16,
    pub header: DataBlockHeader,
    /// Whole encoded block in the staging area `(addr, len)`
    pub staged: Option<(u64, u32)>,
    /// Bank or legacy buffer holding the payload
    pub target: Option<ReservedMemoryRegion>,
    /// Store reads it took
    pub attempts: u32,
}

impl LoadedBlock {
    /// Whether the bank fed by this block must be protected
    pub fn wants_protection(&self, entry: &ManifestEntry) -> bool {
        self.header.is_secure() || entry.is_secure()
    }
}

/// Read `name` until it verifies, at most [`MAX_READ_RETRIES`] times.
///
/// Retried reads are logged and recorded as [`ReasonCode::CrcRetry`].
/// A key that does not exist fails immediately.
pub fn read_verified<S: SecureKeyStore>(
    store: &mut S,
    name: &str,
    index: u16,
    reasons: &mut ReasonLog,
) -> LoadResult<(Vec<u8>, u32)> {
    let size = store.size(name)?;
    let mut buf = vec![0u8; size as usize];
    let mut last = LoadError::Store(StoreError::NotFound);

    for attempt in 1..=MAX_READ_RETRIES {
        let verdict = match store.read(name, &mut buf) {
            Ok(()) => block::decode(&buf).map(|_| ()).map_err(LoadError::from),
            Err(StoreError::NotFound) => return Err(StoreError::NotFound.into()),
            Err(e) => Err(e.into()),
        };
        match verdict {
            Ok(()) => return Ok((buf, attempt)),
            Err(e) => {
                warn!(
                    "loader: {} attempt {}/{} failed: {}",
                    name, attempt, MAX_READ_RETRIES, e
                );
                if attempt < MAX_READ_RETRIES {
                    reasons.push(ReasonCode::CrcRetry, Some(index), attempt);
                }
                last = e;
            }
        }
    }
    Err(last)
}

/// Read and verify the staging manifest with the same retry bound as blocks
pub fn read_manifest<S: SecureKeyStore>(store: &mut S, reasons: &mut ReasonLog) -> LoadResult<(Vec<u8>, Manifest)> {
    let size = store.size(MANIFEST_KEY)? as usize;
    if size > MANIFEST_MAX_SIZE {
        return Err(LoadError::TooLarge {
            len: size,
            capacity: MANIFEST_MAX_SIZE as u32,
        });
    }
    let mut buf = vec![0u8; size];
    let mut last = LoadError::Store(StoreError::NotFound);

    for attempt in 1..=MAX_READ_RETRIES {
        let verdict = match store.read(MANIFEST_KEY, &mut buf) {
            Ok(()) => Manifest::decode(&buf).map_err(LoadError::Manifest),
            Err(StoreError::NotFound) => return Err(StoreError::NotFound.into()),
            Err(e) => Err(e.into()),
        };
        match verdict {
            Ok(manifest) => return Ok((buf, manifest)),
            Err(e) => {
                warn!("loader: manifest attempt {}/{} failed: {}", attempt, MAX_READ_RETRIES, e);
                if attempt < MAX_READ_RETRIES {
                    reasons.push(ReasonCode::CrcRetry, None, attempt);
                }
                last = e;
            }
        }
    }
    Err(last)
}

/// Everything a load needs to know about the target
pub struct LoadTarget<'a, H: PlatformHooks + ?Sized> {
    pub layout: &'a Layout,
    pub chip: &'a ChipId,
    pub panel: Resolution,
    pub hooks: &'a H,
}

/// Load one manifest entry into reserved memory
pub fn load_block<S, M, H>(
    store: &mut S,
    mem: &mut M,
    target: &LoadTarget<'_, H>,
    staging: &mut StagingCursor,
    entry: &ManifestEntry,
    reasons: &mut ReasonLog,
) -> LoadResult<LoadedBlock>
where
    S: SecureKeyStore,
    M: ReservedMemoryAccess,
    H: PlatformHooks + ?Sized,
{
    let (mut raw, attempts) = read_verified(store, &entry.name, entry.index, reasons)?;
    let (header, _) = block::decode(&raw)?;

    if header.block_kind != entry.kind {
        return Err(LoadError::KindMismatch {
            expected: entry.kind,
            found: header.block_kind,
        });
    }
    if !header.applies_to(target.chip, target.panel) {
        debug!(
            "loader: {} keyed for chip {:#x} / {}, skipping",
            entry.name, header.chip_id_match, header.resolution_match
        );
        return Err(LoadError::NotApplicable);
    }

    if header.block_kind == BlockKind::BasicInit {
        let chip = target.chip;
        let hooks = target.hooks;
        if let Some(rewritten) = block::rewrite(&raw, ctrl::PREPROCESSED, |h, p| {
            hooks.preprocess_init(chip, h, p)
        })? {
            debug!("loader: {} rewritten by platform hook", entry.name);
            raw = rewritten;
        }
    }

    let (header, payload) = block::decode(&raw)?;
    let destination = destination(target.layout, header.block_kind)?;

    let (staged, region) = match destination {
        Some(region) => {
            if payload.len() > region.size as usize {
                return Err(LoadError::TooLarge {
                    len: payload.len(),
                    capacity: region.size,
                });
            }
            mem.write(region.physical_base, payload)?;
            (None, Some(region))
        }
        None => {
            let addr = staging.alloc(entry.index, raw.len())?;
            mem.write(addr, &raw)?;
            (Some((addr, raw.len() as u32)), None)
        }
    };

    debug!(
        "loader: {} ({}) {} bytes after {} attempt(s)",
        entry.name,
        header.block_kind.name(),
        payload.len(),
        attempts
    );

    Ok(LoadedBlock {
        index: entry.index,
        header,
        staged,
        target: region,
        attempts,
    })
}

/// Region receiving the payload of `kind`, or `None` to stage it whole
fn destination(layout: &Layout, kind: BlockKind) -> LoadResult<Option<ReservedMemoryRegion>> {
    if layout.policy == LayoutPolicy::LegacyFixed {
        if let Some(lut) = kind.legacy_lut() {
            return layout
                .legacy_lut(lut)
                .copied()
                .map(Some)
                .ok_or(LoadError::NoTarget(kind));
        }
    }
    match kind.bank() {
        Some(bank) => layout
            .bank(bank)
            .and_then(|b| b.usable_region())
            .copied()
            .map(Some)
            .ok_or(LoadError::BankUnavailable(bank)),
        None => Ok(None),
    }
}

/// Re-read and verify a staged block from reserved memory
pub fn read_staged<M: ReservedMemoryAccess>(
    mem: &M,
    staged: (u64, u32),
) -> LoadResult<(DataBlockHeader, Vec<u8>)> {
    let mut raw = vec![0u8; staged.1 as usize];
    mem.read(staged.0, &mut raw)?;
    let (header, payload) = block::decode(&raw)?;
    Ok((header, payload.to_vec()))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::encode;
    use crate::layout::{self, BankSpec, RegionSizeTable};
    use crate::memory::RamImage;
    use crate::platform::NoHooks;
    use crate::region::ReservedMemory;
    use crate::store::MemoryKeyStore;
    use crate::{ChipFamily, CoreFlags};

    const KB: u32 = 1024;
    const BASE: u64 = 0x1000_0000;

    fn table() -> RegionSizeTable {
        RegionSizeTable {
            banks: vec![
                BankSpec::mandatory(BankType::Overdrive, 64 * KB),
                BankSpec::optional(BankType::Demura, 32 * KB),
            ],
            staging_size: 64 * KB,
            secure_status_size: 0x1000,
        }
    }

    fn chip() -> ChipId {
        ChipId::new(ChipFamily::T5, 1, CoreFlags::OD.union(CoreFlags::DEMURA))
    }

    fn panel() -> Resolution {
        Resolution::new(1920, 1080)
    }

    fn init_block() -> Vec<u8> {
        let header = DataBlockHeader::new(BlockKind::BasicInit, "init").with_resolution(panel());
        encode(&header, &[0x11u8; 40]).unwrap()
    }

    #[test]
    fn test_retry_recovers_transient_corruption() {
        let mut store = MemoryKeyStore::new();
        store.insert("init", init_block());
        store.corrupt_next_reads("init", MAX_READ_RETRIES - 1);
        let mut reasons = ReasonLog::new();

        let (_, attempts) = read_verified(&mut store, "init", 0, &mut reasons).unwrap();
        assert_eq!(attempts, MAX_READ_RETRIES);
        assert_eq!(reasons.count_of(ReasonCode::CrcRetry), (MAX_READ_RETRIES - 1) as usize);
    }

    #[test]
    fn test_retry_bounded() {
        let mut store = MemoryKeyStore::new();
        store.insert("init", init_block());
        store.corrupt_next_reads("init", MAX_READ_RETRIES);
        let mut reasons = ReasonLog::new();

        let err = read_verified(&mut store, "init", 0, &mut reasons).unwrap_err();
        assert!(matches!(err, LoadError::Format(FormatError::Corrupted { .. })));
        assert_eq!(store.read_count("init"), MAX_READ_RETRIES);
    }

    #[test]
    fn test_missing_key_not_retried() {
        let mut store = MemoryKeyStore::new();
        let mut reasons = ReasonLog::new();
        let err = read_verified(&mut store, "nope", 0, &mut reasons).unwrap_err();
        assert_eq!(err, LoadError::Store(StoreError::NotFound));
        assert!(reasons.is_empty());
    }

    #[test]
    fn test_placement_table_driven() {
        let reserved = ReservedMemory::new(BASE, 256 * KB);
        let layout = layout::plan(reserved, &table()).unwrap();
        let mut ram = RamImage::new(reserved);
        let mut staging = StagingCursor::new(*layout.staging().unwrap());
        let mut reasons = ReasonLog::new();
        let chip = chip();
        let target = LoadTarget {
            layout: &layout,
            chip: &chip,
            panel: panel(),
            hooks: &NoHooks,
        };

        let mut store = MemoryKeyStore::new();
        store.insert("init", init_block());
        let od = DataBlockHeader::new(BlockKind::OdLut, "od").with_flags(ctrl::SECURE);
        store.insert("od", encode(&od, &[0xAB; 1000]).unwrap());

        let init = ManifestEntry::new(0, BlockKind::BasicInit, "init");
        let loaded = load_block(&mut store, &mut ram, &target, &mut staging, &init, &mut reasons)
            .unwrap();
        let (addr, len) = loaded.staged.unwrap();
        assert_eq!(addr, layout.staging().unwrap().physical_base + STAGING_DATA_OFFSET);
        assert_eq!(addr % BLOCK_ALIGN as u64, 0);
        let (header, payload) = read_staged(&ram, (addr, len)).unwrap();
        assert_eq!(header, loaded.header);
        assert_eq!(payload, vec![0x11u8; 40]);

        let od_entry = ManifestEntry::new(1, BlockKind::OdLut, "od");
        let loaded = load_block(&mut store, &mut ram, &target, &mut staging, &od_entry, &mut reasons)
            .unwrap();
        let bank = loaded.target.unwrap();
        assert_eq!(bank, *layout.bank(BankType::Overdrive).unwrap().usable_region().unwrap());
        assert!(loaded.wants_protection(&od_entry));
        let mut first = [0u8; 4];
        ram.read(bank.physical_base, &mut first).unwrap();
        assert_eq!(first, [0xAB; 4]);
    }

    #[test]
    fn test_not_applicable_and_kind_mismatch() {
        let reserved = ReservedMemory::new(BASE, 256 * KB);
        let layout = layout::plan(reserved, &table()).unwrap();
        let mut ram = RamImage::new(reserved);
        let mut staging = StagingCursor::new(*layout.staging().unwrap());
        let mut reasons = ReasonLog::new();
        let chip = chip();
        let target = LoadTarget {
            layout: &layout,
            chip: &chip,
            panel: panel(),
            hooks: &NoHooks,
        };

        let mut store = MemoryKeyStore::new();
        let vac = DataBlockHeader::new(BlockKind::Vac, "vac").with_chip(ChipFamily::T3);
        store.insert("vac", encode(&vac, &[0u8; 8]).unwrap());
        store.insert("init", init_block());

        let entry = ManifestEntry::new(1, BlockKind::Vac, "vac");
        assert_eq!(
            load_block(&mut store, &mut ram, &target, &mut staging, &entry, &mut reasons),
            Err(LoadError::NotApplicable)
        );

        let entry = ManifestEntry::new(1, BlockKind::Vac, "init");
        assert!(matches!(
            load_block(&mut store, &mut ram, &target, &mut staging, &entry, &mut reasons),
            Err(LoadError::KindMismatch { .. })
        ));
    }

    #[test]
    fn test_dropped_bank_unavailable() {
        // Demura does not fit: 64K + 64K + 4K mandatory, 8K spare
        let reserved = ReservedMemory::new(BASE, 140 * KB);
        let layout = layout::plan(reserved, &table()).unwrap();
        let mut ram = RamImage::new(reserved);
        let mut staging = StagingCursor::new(*layout.staging().unwrap());
        let mut reasons = ReasonLog::new();
        let chip = chip();
        let target = LoadTarget {
            layout: &layout,
            chip: &chip,
            panel: panel(),
            hooks: &NoHooks,
        };

        let mut store = MemoryKeyStore::new();
        let demura = DataBlockHeader::new(BlockKind::DemuraLut, "demura");
        store.insert("demura", encode(&demura, &[0u8; 64]).unwrap());

        let entry = ManifestEntry::new(1, BlockKind::DemuraLut, "demura").optional();
        assert_eq!(
            load_block(&mut store, &mut ram, &target, &mut staging, &entry, &mut reasons),
            Err(LoadError::BankUnavailable(BankType::Demura))
        );
    }

    #[test]
    fn test_staging_slot_reused_on_reload() {
        let region = ReservedMemoryRegion::new(
            crate::region::RegionKind::StagingBuffer,
            BASE,
            0x1000,
        );
        let mut cursor = StagingCursor::new(region);
        let a = cursor.alloc(0, 100).unwrap();
        let b = cursor.alloc(1, 50).unwrap();
        assert_eq!(b, a + 112);
        assert_eq!(cursor.alloc(0, 90).unwrap(), a);
        assert!(cursor.alloc(0, 200).unwrap() > b);
        assert!(cursor.alloc(2, 0x1000).is_err());
    }
}
