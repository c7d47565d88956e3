//! # Platform Support
//!
//! Built-in region-size tables per chip family and the injectable hook
//! strategy ([`PlatformHooks`]) consulted during loading, at completion and
//! before activation.
//!
//! ## Basic-init payload
//!
//! Only the parts the hooks touch are interpreted here:
//!
//! ```text
//! 0x00  feature enable (u32, big-endian), see FEATURE_*
//! 0x04  register writes: [reg:4][value:4] ...
//! ```

use alloc::vec;
use alloc::vec::Vec;
use byteorder::{BigEndian, ByteOrder};
use log::{debug, info};

use crate::block::{BlockKind, DataBlockHeader};
use crate::completion::CompletionState;
use crate::layout::{BankSpec, RegionSizeTable};
use crate::region::{BankType, WorkingBufferBank};
use crate::{ChipFamily, ChipId, CoreFlags};

const KB: u32 = 1024;
const MB: u32 = 1024 * 1024;

/// Size of the secure status mirror on every platform
pub const SECURE_STATUS_SIZE: u32 = 0x1000;

// ============================================================================
// HOOKS
// ============================================================================

/// Platform strategy object.
///
/// Every method has a neutral default, so an implementation overrides only
/// what its platform needs.
pub trait PlatformHooks {
    /// Rewrite a verified basic-init payload before it is staged.
    /// Returning `Some` causes the block to be re-encoded with a fresh CRC.
    fn preprocess_init(
        &self,
        _chip: &ChipId,
        _header: &DataBlockHeader,
        _payload: &[u8],
    ) -> Option<Vec<u8>> {
        None
    }

    /// Run once when the configuration becomes complete. May return a new
    /// basic-init payload of the same length to reconcile waived blocks.
    fn reconcile(
        &self,
        _chip: &ChipId,
        _completion: &CompletionState,
        _init_header: &DataBlockHeader,
        _init_payload: &[u8],
    ) -> Option<Vec<u8>> {
        None
    }

    /// Veto activation. `banks` holds valid banks only.
    fn veto(&self, _chip: &ChipId, _completion: &CompletionState, _banks: &[WorkingBufferBank]) -> bool {
        false
    }
}

/// No platform behaviour at all
#[derive(Clone, Copy, Debug, Default)]
pub struct NoHooks;

impl PlatformHooks for NoHooks {}

// ============================================================================
// BASIC-INIT PAYLOAD
// ============================================================================

pub const FEATURE_OD: u32 = 1 << 0;
pub const FEATURE_DEMURA: u32 = 1 << 1;
pub const FEATURE_LOD: u32 = 1 << 2;
pub const FEATURE_ACC: u32 = 1 << 3;
pub const FEATURE_VAC: u32 = 1 << 4;

/// Offset of the first register write
pub const INIT_REGS_OFFSET: usize = 4;

/// Feature disabled when blocks of `kind` are missing
pub const fn feature_of(kind: BlockKind) -> u32 {
    match kind {
        BlockKind::BasicInit => 0,
        BlockKind::Vac => FEATURE_VAC,
        BlockKind::DemuraSet | BlockKind::DemuraLut => FEATURE_DEMURA,
        BlockKind::AccLut => FEATURE_ACC,
        BlockKind::OdLut => FEATURE_OD,
        BlockKind::LodLut => FEATURE_LOD,
    }
}

pub fn feature_bits(payload: &[u8]) -> Option<u32> {
    if payload.len() < INIT_REGS_OFFSET {
        return None;
    }
    Some(BigEndian::read_u32(payload))
}

/// Register writes carried by a basic-init payload
pub fn init_registers(payload: &[u8]) -> impl Iterator<Item = (u32, u32)> + '_ {
    payload
        .get(INIT_REGS_OFFSET..)
        .unwrap_or(&[])
        .chunks_exact(8)
        .map(|c| (BigEndian::read_u32(c), BigEndian::read_u32(&c[4..])))
}

/// Build a basic-init payload
pub fn init_payload(features: u32, registers: &[(u32, u32)]) -> Vec<u8> {
    let mut out = vec![0u8; INIT_REGS_OFFSET + registers.len() * 8];
    BigEndian::write_u32(&mut out, features);
    for (i, &(reg, value)) in registers.iter().enumerate() {
        let off = INIT_REGS_OFFSET + i * 8;
        BigEndian::write_u32(&mut out[off..], reg);
        BigEndian::write_u32(&mut out[off + 4..], value);
    }
    out
}

// ============================================================================
// BUILT-IN HOOKS
// ============================================================================

/// Revision-specific register value override
struct RevisionPatch {
    family: ChipFamily,
    revision: u8,
    reg: u32,
    value: u32,
}

const REVISION_PATCHES: &[RevisionPatch] = &[
    RevisionPatch { family: ChipFamily::T5, revision: 0, reg: 0x1054, value: 0x0003 },
    RevisionPatch { family: ChipFamily::T3, revision: 0, reg: 0x2214, value: 0x0100 },
    RevisionPatch { family: ChipFamily::T3x, revision: 0, reg: 0x2214, value: 0x0180 },
];

/// Engines that must not be driven on a given silicon revision
struct Forbidden {
    family: ChipFamily,
    revision: u8,
    bank: BankType,
}

const FORBIDDEN: &[Forbidden] = &[
    Forbidden { family: ChipFamily::T5w, revision: 0, bank: BankType::Demura },
    Forbidden { family: ChipFamily::T3, revision: 0, bank: BankType::LineOverdrive },
];

/// Hooks shipped for the supported chip families
#[derive(Clone, Copy, Debug, Default)]
pub struct BuiltinHooks;

impl PlatformHooks for BuiltinHooks {
    fn preprocess_init(
        &self,
        chip: &ChipId,
        _header: &DataBlockHeader,
        payload: &[u8],
    ) -> Option<Vec<u8>> {
        let mut patched = payload.to_vec();
        let mut changed = false;
        for patch in REVISION_PATCHES
            .iter()
            .filter(|p| p.family == chip.family && p.revision == chip.revision)
        {
            let regs = patched.get_mut(INIT_REGS_OFFSET..).unwrap_or(&mut []);
            for entry in regs.chunks_exact_mut(8) {
                if BigEndian::read_u32(entry) == patch.reg
                    && BigEndian::read_u32(&entry[4..]) != patch.value
                {
                    BigEndian::write_u32(&mut entry[4..], patch.value);
                    debug!(
                        "platform: {} rev {} reg {:#x} := {:#x}",
                        chip.family.name(),
                        chip.revision,
                        patch.reg,
                        patch.value
                    );
                    changed = true;
                }
            }
        }
        changed.then_some(patched)
    }

    fn reconcile(
        &self,
        _chip: &ChipId,
        completion: &CompletionState,
        _init_header: &DataBlockHeader,
        init_payload: &[u8],
    ) -> Option<Vec<u8>> {
        let features = feature_bits(init_payload)?;
        let mut clear = 0;
        for kind in BlockKind::ALL {
            if completion.degraded(kind) > 0 {
                clear |= feature_of(kind);
            }
        }
        if features & clear == 0 {
            return None;
        }
        info!(
            "platform: disabling features {:#x} for waived blocks",
            features & clear
        );
        let mut patched = init_payload.to_vec();
        BigEndian::write_u32(&mut patched, features & !clear);
        Some(patched)
    }

    fn veto(&self, chip: &ChipId, _completion: &CompletionState, banks: &[WorkingBufferBank]) -> bool {
        FORBIDDEN.iter().any(|f| {
            f.family == chip.family
                && f.revision == chip.revision
                && banks.iter().any(|b| b.mem_type == f.bank)
        })
    }
}

// ============================================================================
// BUILT-IN TABLES
// ============================================================================

/// Built-in description of one chip family
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Platform {
    pub family: ChipFamily,
    /// Cores present on production parts
    pub cores: CoreFlags,
    pub table: RegionSizeTable,
    /// Reserved memory the bootloader grants by default
    pub reserved_size: u32,
}

pub fn builtin(family: ChipFamily) -> Platform {
    let od = CoreFlags::OD;
    let od_demura = CoreFlags::OD.union(CoreFlags::DEMURA);
    let all = od_demura.union(CoreFlags::LOD).union(CoreFlags::ACC);

    let (cores, banks, staging_size, reserved_size) = match family {
        ChipFamily::Tl1 => (
            od,
            vec![BankSpec::mandatory(BankType::Overdrive, 4 * MB)],
            MB,
            8 * MB,
        ),
        ChipFamily::T5 | ChipFamily::T5w => (
            od_demura,
            vec![
                BankSpec::mandatory(BankType::Overdrive, 6 * MB),
                BankSpec::optional(BankType::Demura, 2 * MB),
            ],
            MB,
            12 * MB,
        ),
        ChipFamily::T5d => (
            od,
            vec![BankSpec::mandatory(BankType::Overdrive, 4 * MB)],
            MB,
            8 * MB,
        ),
        ChipFamily::T3 => (
            all,
            vec![
                BankSpec::mandatory(BankType::Overdrive, 8 * MB),
                BankSpec::optional(BankType::Demura, MB),
                BankSpec::optional(BankType::LineOverdrive, 512 * KB),
            ],
            MB + 512 * KB,
            16 * MB,
        ),
        ChipFamily::T3x => (
            all,
            vec![
                BankSpec::mandatory(BankType::Overdrive, 9 * MB),
                BankSpec::optional(BankType::Demura, 2 * MB),
                BankSpec::optional(BankType::LineOverdrive, MB),
            ],
            MB + 512 * KB,
            16 * MB,
        ),
        ChipFamily::Txhd2 => (
            od,
            vec![BankSpec::mandatory(BankType::Overdrive, 3 * MB)],
            MB,
            6 * MB,
        ),
    };

    Platform {
        family,
        cores,
        table: RegionSizeTable {
            banks,
            staging_size,
            secure_status_size: SECURE_STATUS_SIZE,
        },
        reserved_size,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::CompletionTracker;
    use crate::layout::{self, LayoutPolicy};
    use crate::region::ReservedMemory;

    #[test]
    fn test_builtin_tables_plan_both_policies() {
        for family in ChipFamily::ALL {
            let p = builtin(family);
            let reserved = ReservedMemory::new(0x7000_0000, p.reserved_size);
            for policy in [LayoutPolicy::TableDriven, LayoutPolicy::LegacyFixed] {
                let layout = layout::provisional(reserved, &p.table)
                    .and_then(|pl| pl.finalize(policy))
                    .unwrap_or_else(|e| panic!("{}: {}", family.name(), e));
                assert!(layout.used_size() <= p.reserved_size as u64);
                assert!(layout.dropped_banks().next().is_none());
            }
        }
    }

    #[test]
    fn test_revision_patch_applied() {
        let chip = ChipId::new(ChipFamily::T3, 0, CoreFlags::OD);
        let header = DataBlockHeader::new(BlockKind::BasicInit, "init");
        let payload = init_payload(FEATURE_OD, &[(0x1000, 1), (0x2214, 0)]);

        let patched = BuiltinHooks.preprocess_init(&chip, &header, &payload).unwrap();
        let regs: Vec<_> = init_registers(&patched).collect();
        assert_eq!(regs, vec![(0x1000, 1), (0x2214, 0x0100)]);

        // Later revisions untouched
        let rev_b = ChipId::new(ChipFamily::T3, 1, CoreFlags::OD);
        assert!(BuiltinHooks.preprocess_init(&rev_b, &header, &payload).is_none());
    }

    #[test]
    fn test_reconcile_clears_waived_features() {
        let mut tracker = CompletionTracker::new(2).unwrap();
        tracker.mark_arrived(0);
        tracker.waive(1, BlockKind::DemuraLut).unwrap();

        let chip = ChipId::new(ChipFamily::T5, 1, CoreFlags::OD);
        let header = DataBlockHeader::new(BlockKind::BasicInit, "init");
        let payload = init_payload(FEATURE_OD | FEATURE_DEMURA, &[(0x10, 0x20)]);

        let patched = BuiltinHooks
            .reconcile(&chip, tracker.state(), &header, &payload)
            .unwrap();
        assert_eq!(patched.len(), payload.len());
        assert_eq!(feature_bits(&patched), Some(FEATURE_OD));

        // Nothing to clear: no rewrite
        let payload = init_payload(FEATURE_OD, &[]);
        assert!(BuiltinHooks.reconcile(&chip, tracker.state(), &header, &payload).is_none());
    }

    #[test]
    fn test_forbidden_combination_vetoed() {
        let tracker = CompletionTracker::new(1).unwrap();
        let demura = WorkingBufferBank {
            mem_type: BankType::Demura,
            size: MB,
            mandatory: false,
            valid: true,
            region: None,
        };
        let rev_a = ChipId::new(ChipFamily::T5w, 0, CoreFlags::OD.union(CoreFlags::DEMURA));
        let rev_b = ChipId::new(ChipFamily::T5w, 1, rev_a.cores);

        assert!(BuiltinHooks.veto(&rev_a, tracker.state(), &[demura]));
        assert!(!BuiltinHooks.veto(&rev_b, tracker.state(), &[demura]));
        assert!(!BuiltinHooks.veto(&rev_a, tracker.state(), &[]));
    }
}
