//! # Region Layout Planner
//!
//! Computes region addresses inside the reserved block from
//! `(reserved memory, platform table)` alone, so the result is reproducible.
//!
//! Planning is two-phase:
//!
//! 1. [`provisional`] checks the mandatory budget, decides which optional
//!    banks fit and places the working buffers followed by the staging
//!    buffer. The staging buffer address is final after this step, so the
//!    manifest can be read from it.
//! 2. [`ProvisionalLayout::finalize`] applies the rules of the layout policy
//!    selected by the manifest version and places the tail regions.
//!
//! Canonical order is always: working buffers (table order), staging buffer,
//! then the secure status mirror (table-driven) or the four legacy buffers.

use alloc::vec::Vec;
use log::{debug, info, warn};

use crate::region::{
    BankType, LegacyLutType, RegionKind, ReservedMemory, ReservedMemoryRegion, WorkingBufferBank,
};
use crate::secure::STATUS_USED_SIZE;

/// Maximum number of working buffer banks in a table
pub const MAX_BANKS: usize = 8;

// ============================================================================
// ERRORS
// ============================================================================

/// Mandatory regions do not fit in the reserved block.
///
/// Fatal to the controller instance that planned the layout, not to the
/// system.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InsufficientMemory {
    /// Bytes the layout needs
    pub required: u64,
    /// Bytes granted
    pub available: u32,
}

impl core::fmt::Display for InsufficientMemory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "insufficient reserved memory: need {:#x} bytes, have {:#x}",
            self.required, self.available
        )
    }
}

#[cfg(feature = "std")]
impl std::error::Error for InsufficientMemory {}

/// Result type for layout planning
pub type LayoutResult<T> = Result<T, InsufficientMemory>;

// ============================================================================
// PLATFORM TABLE
// ============================================================================

/// Size request for one working buffer bank
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BankSpec {
    pub mem_type: BankType,
    pub size: u32,
    pub mandatory: bool,
}

impl BankSpec {
    pub const fn mandatory(mem_type: BankType, size: u32) -> Self {
        Self {
            mem_type,
            size,
            mandatory: true,
        }
    }

    pub const fn optional(mem_type: BankType, size: u32) -> Self {
        Self {
            mem_type,
            size,
            mandatory: false,
        }
    }
}

/// Per-platform region sizes
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegionSizeTable {
    /// Working buffer banks, in address order
    pub banks: Vec<BankSpec>,
    pub staging_size: u32,
    pub secure_status_size: u32,
}

impl RegionSizeTable {
    /// Bytes every table-driven layout must be able to place
    pub fn mandatory_sum(&self) -> u64 {
        let banks: u64 = self
            .banks
            .iter()
            .filter(|b| b.mandatory)
            .map(|b| b.size as u64)
            .sum();
        banks + self.staging_size as u64 + self.secure_status_size as u64
    }

    /// Bytes needed when every bank, optional ones included, is placed
    pub fn full_sum(&self) -> u64 {
        let banks: u64 = self.banks.iter().map(|b| b.size as u64).sum();
        banks + self.staging_size as u64 + self.secure_status_size as u64
    }

    pub fn bank(&self, mem_type: BankType) -> Option<&BankSpec> {
        self.banks.iter().find(|b| b.mem_type == mem_type)
    }
}

// ============================================================================
// POLICY
// ============================================================================

/// Which layout algorithm's rules apply
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LayoutPolicy {
    /// Four fixed-size buffers after staging, no per-bank validity.
    /// Fails outright if anything does not fit.
    LegacyFixed,
    /// Table sizes with graceful degradation of optional banks
    TableDriven,
}

impl LayoutPolicy {
    /// Policy selected by the staging manifest version
    pub const fn from_manifest_version(version: u32) -> Self {
        if version == 0 {
            LayoutPolicy::LegacyFixed
        } else {
            LayoutPolicy::TableDriven
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            LayoutPolicy::LegacyFixed => "legacy-fixed",
            LayoutPolicy::TableDriven => "table-driven",
        }
    }
}

// ============================================================================
// PLANNING
// ============================================================================

/// Result of phase one: banks and staging placed, tail pending
#[derive(Clone, Debug)]
pub struct ProvisionalLayout {
    reserved: ReservedMemory,
    banks: Vec<WorkingBufferBank>,
    staging: ReservedMemoryRegion,
    secure_status_size: u32,
    /// First free address after the staging buffer
    cursor: u64,
}

/// Phase one of planning.
///
/// Fails with [`InsufficientMemory`] when `reserved.size` is below the
/// table's mandatory sum. Optional banks are offered the spare budget in
/// priority order; a bank that does not fit is marked invalid and left out
/// of the address plan.
pub fn provisional(
    reserved: ReservedMemory,
    table: &RegionSizeTable,
) -> LayoutResult<ProvisionalLayout> {
    // The status mirror must hold every record slot
    if (table.secure_status_size as usize) < STATUS_USED_SIZE {
        warn!(
            "layout: secure status region {:#x} bytes, mirror needs {:#x}",
            table.secure_status_size, STATUS_USED_SIZE
        );
        return Err(InsufficientMemory {
            required: STATUS_USED_SIZE as u64,
            available: table.secure_status_size,
        });
    }

    let required = table.mandatory_sum();
    // Tables larger than MAX_BANKS cannot be placed at all
    if table.banks.len() > MAX_BANKS || (reserved.size as u64) < required {
        warn!(
            "layout: mandatory regions need {:#x} bytes, reserved {:#x}",
            required, reserved.size
        );
        return Err(InsufficientMemory {
            required,
            available: reserved.size,
        });
    }

    // Decide validity in priority order, address in table order
    let mut spare = reserved.size as u64 - required;
    let mut valid = [false; MAX_BANKS];
    let mut order: Vec<usize> = (0..table.banks.len()).collect();
    order.sort_by_key(|&i| (table.banks[i].mem_type.priority(), i));

    for i in order {
        let spec = &table.banks[i];
        if spec.mandatory {
            valid[i] = true;
        } else if spec.size > 0 && spec.size as u64 <= spare {
            spare -= spec.size as u64;
            valid[i] = true;
        } else {
            warn!(
                "layout: optional {} bank ({:#x} bytes) does not fit, spare {:#x}",
                spec.mem_type.name(),
                spec.size,
                spare
            );
        }
    }

    let mut cursor = reserved.base;
    let mut banks = Vec::with_capacity(table.banks.len());
    for (i, spec) in table.banks.iter().enumerate() {
        let region = if valid[i] {
            let region = ReservedMemoryRegion::new(
                RegionKind::WorkingBuffer(spec.mem_type),
                cursor,
                spec.size,
            );
            cursor += spec.size as u64;
            Some(region)
        } else {
            None
        };
        banks.push(WorkingBufferBank {
            mem_type: spec.mem_type,
            size: spec.size,
            mandatory: spec.mandatory,
            valid: valid[i],
            region,
        });
    }

    let staging = ReservedMemoryRegion::new(RegionKind::StagingBuffer, cursor, table.staging_size);
    cursor += table.staging_size as u64;

    debug!(
        "layout: provisional staging @ {:#x} ({:#x} bytes)",
        staging.physical_base, staging.size
    );

    Ok(ProvisionalLayout {
        reserved,
        banks,
        staging,
        secure_status_size: table.secure_status_size,
        cursor,
    })
}

impl ProvisionalLayout {
    /// Staging buffer; its address does not change in [`finalize`](Self::finalize)
    pub fn staging(&self) -> &ReservedMemoryRegion {
        &self.staging
    }

    pub fn banks(&self) -> &[WorkingBufferBank] {
        &self.banks
    }

    /// Phase two: apply the selected policy's rules and place the tail.
    pub fn finalize(self, policy: LayoutPolicy) -> LayoutResult<Layout> {
        let mut regions: Vec<ReservedMemoryRegion> = self
            .banks
            .iter()
            .filter_map(|b| b.usable_region().copied())
            .collect();
        regions.push(self.staging);

        match policy {
            LayoutPolicy::TableDriven => {
                // Budget for the mirror was reserved in phase one
                regions.push(ReservedMemoryRegion::new(
                    RegionKind::SecureStatus,
                    self.cursor,
                    self.secure_status_size,
                ));
            }
            LayoutPolicy::LegacyFixed => {
                let banks: u64 = self.banks.iter().map(|b| b.size as u64).sum();
                let required =
                    banks + self.staging.size as u64 + LegacyLutType::total_size() as u64;
                let all_placed = self.banks.iter().all(|b| b.valid);
                let tail_fits =
                    self.cursor + LegacyLutType::total_size() as u64 <= self.reserved.end();
                if !all_placed || !tail_fits {
                    warn!(
                        "layout: legacy layout needs {:#x} bytes, reserved {:#x}",
                        required, self.reserved.size
                    );
                    return Err(InsufficientMemory {
                        required,
                        available: self.reserved.size,
                    });
                }

                let mut cursor = self.cursor;
                for lut in LegacyLutType::ALL {
                    regions.push(ReservedMemoryRegion::new(
                        RegionKind::LegacyLut(lut),
                        cursor,
                        lut.size(),
                    ));
                    cursor += lut.size() as u64;
                }
            }
        }

        let layout = Layout {
            policy,
            reserved: self.reserved,
            banks: self.banks,
            regions,
        };
        info!(
            "layout: {} finalized, {} regions, {:#x}/{:#x} bytes used",
            policy.name(),
            layout.regions.len(),
            layout.used_size(),
            layout.reserved.size
        );
        Ok(layout)
    }
}

/// Plan a table-driven layout in one call
pub fn plan(reserved: ReservedMemory, table: &RegionSizeTable) -> LayoutResult<Layout> {
    provisional(reserved, table)?.finalize(LayoutPolicy::TableDriven)
}

// ============================================================================
// FINAL LAYOUT
// ============================================================================

/// Final, immutable layout of the reserved block
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Layout {
    pub policy: LayoutPolicy,
    pub reserved: ReservedMemory,
    /// Every bank of the table, valid or not
    pub banks: Vec<WorkingBufferBank>,
    /// Placed regions in address order
    pub regions: Vec<ReservedMemoryRegion>,
}

impl Layout {
    pub fn region(&self, kind: RegionKind) -> Option<&ReservedMemoryRegion> {
        self.regions.iter().find(|r| r.kind == kind)
    }

    pub fn staging(&self) -> Option<&ReservedMemoryRegion> {
        self.region(RegionKind::StagingBuffer)
    }

    pub fn secure_status(&self) -> Option<&ReservedMemoryRegion> {
        self.region(RegionKind::SecureStatus)
    }

    pub fn legacy_lut(&self, lut: LegacyLutType) -> Option<&ReservedMemoryRegion> {
        self.region(RegionKind::LegacyLut(lut))
    }

    pub fn bank(&self, mem_type: BankType) -> Option<&WorkingBufferBank> {
        self.banks.iter().find(|b| b.mem_type == mem_type)
    }

    pub fn valid_banks(&self) -> impl Iterator<Item = &WorkingBufferBank> {
        self.banks.iter().filter(|b| b.valid)
    }

    pub fn dropped_banks(&self) -> impl Iterator<Item = &WorkingBufferBank> {
        self.banks.iter().filter(|b| !b.valid)
    }

    /// Total bytes covered by placed regions
    pub fn used_size(&self) -> u64 {
        self.regions.iter().map(|r| r.size as u64).sum()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u32 = 1024 * 1024;
    const BASE: u64 = 0x7E00_0000;

    fn table() -> RegionSizeTable {
        RegionSizeTable {
            banks: vec![
                BankSpec::mandatory(BankType::Overdrive, 8 * MB),
                BankSpec::optional(BankType::Demura, MB),
            ],
            staging_size: 2 * MB - 0x1000,
            secure_status_size: 0x1000,
        }
    }

    fn assert_well_formed(layout: &Layout) {
        for (i, a) in layout.regions.iter().enumerate() {
            assert!(a.physical_base >= layout.reserved.base);
            assert!(a.end() <= layout.reserved.end());
            for b in &layout.regions[i + 1..] {
                assert!(!a.overlaps(b), "{:?} overlaps {:?}", a, b);
            }
        }
        assert!(layout.used_size() <= layout.reserved.size as u64);
    }

    #[test]
    fn test_optional_bank_dropped_without_spare() {
        // mandatory = 10MB exactly, optional 1MB does not fit
        let table = table();
        assert_eq!(table.mandatory_sum(), 10 * MB as u64);

        let layout = plan(ReservedMemory::new(BASE, 10 * MB), &table).unwrap();
        let demura = layout.bank(BankType::Demura).unwrap();
        assert!(!demura.valid);
        assert!(demura.region.is_none());
        assert!(layout.bank(BankType::Overdrive).unwrap().valid);
        assert_eq!(layout.dropped_banks().count(), 1);
        assert_well_formed(&layout);
    }

    #[test]
    fn test_insufficient_memory_fails() {
        let table = table();
        let err = plan(ReservedMemory::new(BASE, 10 * MB - 1), &table).unwrap_err();
        assert_eq!(err.required, 10 * MB as u64);
        assert_eq!(err.available, 10 * MB - 1);
    }

    #[test]
    fn test_canonical_order() {
        let table = table();
        let layout = plan(ReservedMemory::new(BASE, 11 * MB), &table).unwrap();

        let kinds: Vec<RegionKind> = layout.regions.iter().map(|r| r.kind).collect();
        assert_eq!(
            kinds,
            vec![
                RegionKind::WorkingBuffer(BankType::Overdrive),
                RegionKind::WorkingBuffer(BankType::Demura),
                RegionKind::StagingBuffer,
                RegionKind::SecureStatus,
            ]
        );
        assert_eq!(layout.regions[0].physical_base, BASE);
        for pair in layout.regions.windows(2) {
            assert_eq!(pair[0].end(), pair[1].physical_base);
        }
        assert_well_formed(&layout);
    }

    #[test]
    fn test_reproducible() {
        let table = table();
        let reserved = ReservedMemory::new(BASE, 10 * MB + MB / 2);
        assert_eq!(plan(reserved, &table), plan(reserved, &table));
    }

    #[test]
    fn test_priority_order_degrades_lower_priority_first() {
        // Table lists lod before demura; demura still gets the spare first
        let table = RegionSizeTable {
            banks: vec![
                BankSpec::mandatory(BankType::Overdrive, 4 * MB),
                BankSpec::optional(BankType::LineOverdrive, MB),
                BankSpec::optional(BankType::Demura, MB),
            ],
            staging_size: MB,
            secure_status_size: 0x1000,
        };
        let reserved = ReservedMemory::new(BASE, 6 * MB + 0x1000);
        let layout = plan(reserved, &table).unwrap();

        assert!(layout.bank(BankType::Demura).unwrap().valid);
        assert!(!layout.bank(BankType::LineOverdrive).unwrap().valid);
        // Addresses follow table order among the placed banks
        assert_eq!(
            layout.bank(BankType::Demura).unwrap().region.unwrap().physical_base,
            BASE + 4 * MB as u64
        );
        assert_well_formed(&layout);
    }

    #[test]
    fn test_smaller_lower_priority_bank_can_still_fit() {
        let table = RegionSizeTable {
            banks: vec![
                BankSpec::mandatory(BankType::Overdrive, MB),
                BankSpec::optional(BankType::Demura, 2 * MB),
                BankSpec::optional(BankType::LineOverdrive, MB / 2),
            ],
            staging_size: MB,
            secure_status_size: 0x1000,
        };
        let layout = plan(ReservedMemory::new(BASE, 3 * MB + 0x1000), &table).unwrap();
        assert!(!layout.bank(BankType::Demura).unwrap().valid);
        assert!(layout.bank(BankType::LineOverdrive).unwrap().valid);
        assert_well_formed(&layout);
    }

    #[test]
    fn test_status_region_too_small_for_mirror() {
        let mut table = table();
        table.secure_status_size = 0x40;
        let err = plan(ReservedMemory::new(BASE, 13 * MB), &table).unwrap_err();
        assert_eq!(err.required, STATUS_USED_SIZE as u64);
        assert_eq!(err.available, 0x40);

        table.secure_status_size = STATUS_USED_SIZE as u32;
        assert!(plan(ReservedMemory::new(BASE, 13 * MB), &table).is_ok());
    }

    #[test]
    fn test_staging_address_stable_across_finalize() {
        let table = table();
        let reserved = ReservedMemory::new(BASE, 13 * MB);
        let provisional = provisional(reserved, &table).unwrap();
        let staging = *provisional.staging();

        let table_driven = provisional.clone().finalize(LayoutPolicy::TableDriven).unwrap();
        let legacy = provisional.finalize(LayoutPolicy::LegacyFixed).unwrap();
        assert_eq!(table_driven.staging(), Some(&staging));
        assert_eq!(legacy.staging(), Some(&staging));
    }

    #[test]
    fn test_legacy_layout_places_four_buffers() {
        let table = table();
        let reserved = ReservedMemory::new(BASE, 13 * MB);
        let layout = provisional(reserved, &table)
            .unwrap()
            .finalize(LayoutPolicy::LegacyFixed)
            .unwrap();

        assert!(layout.secure_status().is_none());
        for lut in LegacyLutType::ALL {
            let region = layout.legacy_lut(lut).unwrap();
            assert_eq!(region.size, lut.size());
        }
        assert_eq!(layout.regions.len(), 2 + 1 + 4);
        assert_well_formed(&layout);
    }

    #[test]
    fn test_legacy_layout_never_degrades() {
        // Fits table-driven with demura dropped, but legacy needs every bank
        let table = table();
        let reserved = ReservedMemory::new(BASE, 10 * MB);
        let provisional = provisional(reserved, &table).unwrap();
        assert!(provisional.banks().iter().any(|b| !b.valid));
        assert!(provisional.finalize(LayoutPolicy::LegacyFixed).is_err());
    }

    #[test]
    fn test_policy_from_manifest_version() {
        assert_eq!(LayoutPolicy::from_manifest_version(0), LayoutPolicy::LegacyFixed);
        assert_eq!(LayoutPolicy::from_manifest_version(1), LayoutPolicy::TableDriven);
        assert_eq!(LayoutPolicy::from_manifest_version(7), LayoutPolicy::TableDriven);
    }

    #[test]
    fn test_sizes_sweep_properties() {
        let table = table();
        let mandatory = table.mandatory_sum() as u32;
        for size in [mandatory - 1, mandatory, mandatory + MB / 2, mandatory + MB, 32 * MB] {
            let result = plan(ReservedMemory::new(BASE, size), &table);
            if size < mandatory {
                assert!(result.is_err());
            } else {
                assert_well_formed(&result.unwrap());
            }
        }
    }
}
