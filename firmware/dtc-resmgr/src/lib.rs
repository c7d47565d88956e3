//! # Display Timing Controller Resource Manager
//!
//! Firmware-resident manager for the reserved memory block handed to the
//! display timing controller (DTC) at boot. It carves the block into typed
//! regions, loads checksummed configuration blocks from the secure key-value
//! store into them, tracks when a configuration set is complete, and asks the
//! TEE to shield the working buffers that must not be visible to untrusted
//! software.
//!
//! ## Reserved Memory Layout
//!
//! ```text
//! +------------------------+ base
//! | Working buffer bank 0  | (overdrive, mandatory)
//! | Working buffer bank 1  | (demura, optional)
//! | Working buffer bank 2  | (line overdrive, optional, dropped first)
//! +------------------------+
//! | Staging buffer         | manifest @ 0x000, blocks @ 0x800 (16-byte aligned)
//! +------------------------+
//! | Secure status mirror   | (table-driven layout)
//! |   -- or --             |
//! | VAC / demura set /     | (legacy fixed layout)
//! | demura LUT / ACC LUT   |
//! +------------------------+ base + size
//! ```
//!
//! ## Lifecycle
//!
//! 1. [`layout`] plans regions (provisional, then finalized once the
//!    manifest version is known)
//! 2. [`loader`] reads each block with bounded retry, [`block`] verifies it
//! 3. [`completion`] accumulates arrivals and waived optional blocks
//! 4. [`secure`] protects banks fed by secure blocks, mirroring state
//! 5. [`gate`] decides whether the result may drive the timing controller
//!
//! All of it is owned by one [`context::DtcContext`] per display output.

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![allow(clippy::new_without_default)]

extern crate alloc;

pub mod block;
pub mod completion;
pub mod context;
pub mod gate;
pub mod layout;
pub mod loader;
pub mod manifest;
pub mod memory;
pub mod platform;
pub mod reason;
pub mod region;
pub mod secure;
pub mod store;

// Re-exports
pub use block::{BlockKind, DataBlockHeader, DecodeError, FormatError, IntegrityError};
pub use completion::{CompletionState, CompletionTracker};
pub use context::{DtcContext, DtcError};
pub use gate::{may_activate, GateDecision};
pub use layout::{InsufficientMemory, Layout, LayoutPolicy, RegionSizeTable};
pub use manifest::Manifest;
pub use memory::{RamImage, ReservedMemoryAccess};
pub use platform::PlatformHooks;
pub use reason::{Reason, ReasonCode};
pub use region::{BankType, RegionKind, ReservedMemory, ReservedMemoryRegion, WorkingBufferBank};
pub use secure::{SecureMemoryCoordinator, SecureProtectionRecord, TeeError, TeeHandle, TrustedExecEnv};
pub use store::{SecureKeyStore, StoreError};

// ============================================================================
// CORE TYPES
// ============================================================================

/// SoC families carrying a display timing controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ChipFamily {
    Tl1 = 0x0001,
    T5 = 0x0002,
    T5d = 0x0003,
    T3 = 0x0004,
    T5w = 0x0005,
    T3x = 0x0006,
    Txhd2 = 0x0007,
}

impl ChipFamily {
    /// All known families, in chip-id order
    pub const ALL: [ChipFamily; 7] = [
        ChipFamily::Tl1,
        ChipFamily::T5,
        ChipFamily::T5d,
        ChipFamily::T3,
        ChipFamily::T5w,
        ChipFamily::T3x,
        ChipFamily::Txhd2,
    ];

    /// Chip-id code used in block headers
    pub const fn code(&self) -> u16 {
        *self as u16
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Self::ALL.iter().copied().find(|f| f.code() == code)
    }

    pub const fn name(&self) -> &'static str {
        match self {
            ChipFamily::Tl1 => "tl1",
            ChipFamily::T5 => "t5",
            ChipFamily::T5d => "t5d",
            ChipFamily::T3 => "t3",
            ChipFamily::T5w => "t5w",
            ChipFamily::T3x => "t3x",
            ChipFamily::Txhd2 => "txhd2",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|f| f.name().eq_ignore_ascii_case(name))
    }
}

/// Post-processing cores present on a chip (bitmap)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CoreFlags {
    bits: u32,
}

impl CoreFlags {
    /// Overdrive engine
    pub const OD: CoreFlags = CoreFlags { bits: 1 << 0 };
    /// Demura correction engine
    pub const DEMURA: CoreFlags = CoreFlags { bits: 1 << 1 };
    /// Line overdrive engine
    pub const LOD: CoreFlags = CoreFlags { bits: 1 << 2 };
    /// Accurate colour LUT
    pub const ACC: CoreFlags = CoreFlags { bits: 1 << 3 };

    pub const fn empty() -> Self {
        Self { bits: 0 }
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self { bits: bits & 0x0F }
    }

    pub const fn bits(&self) -> u32 {
        self.bits
    }

    pub const fn union(self, other: CoreFlags) -> Self {
        Self {
            bits: self.bits | other.bits,
        }
    }

    #[inline]
    pub const fn contains(&self, other: CoreFlags) -> bool {
        (self.bits & other.bits) == other.bits
    }
}

/// Identity of the chip the controller runs on
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChipId {
    pub family: ChipFamily,
    /// Silicon revision (0 = revision A)
    pub revision: u8,
    /// Cores present on this part
    pub cores: CoreFlags,
}

impl ChipId {
    pub const fn new(family: ChipFamily, revision: u8, cores: CoreFlags) -> Self {
        Self {
            family,
            revision,
            cores,
        }
    }
}

/// Panel resolution used as an applicability key
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Resolution {
    pub h: u16,
    pub v: u16,
}

impl Resolution {
    /// Wildcard: applies to every panel
    pub const ANY: Resolution = Resolution { h: 0, v: 0 };

    pub const fn new(h: u16, v: u16) -> Self {
        Self { h, v }
    }

    pub const fn is_any(&self) -> bool {
        self.h == 0 && self.v == 0
    }

    /// Whether a block keyed on `self` applies to a panel of `actual`
    pub fn matches(&self, actual: Resolution) -> bool {
        self.is_any() || *self == actual
    }
}

impl core::fmt::Display for Resolution {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_any() {
            write!(f, "any")
        } else {
            write!(f, "{}x{}", self.h, self.v)
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chip_family_codes_round_trip() {
        for family in ChipFamily::ALL {
            assert_eq!(ChipFamily::from_code(family.code()), Some(family));
            assert_eq!(ChipFamily::from_name(family.name()), Some(family));
        }
        assert_eq!(ChipFamily::from_code(0), None);
        assert_eq!(ChipFamily::from_name("T5D"), Some(ChipFamily::T5d));
    }

    #[test]
    fn test_core_flags() {
        let cores = CoreFlags::OD.union(CoreFlags::DEMURA);
        assert!(cores.contains(CoreFlags::OD));
        assert!(cores.contains(CoreFlags::DEMURA));
        assert!(!cores.contains(CoreFlags::LOD));
        assert_eq!(CoreFlags::from_bits(0xFF).bits(), 0x0F);
    }

    #[test]
    fn test_resolution_matching() {
        let fhd = Resolution::new(1920, 1080);
        assert!(Resolution::ANY.matches(fhd));
        assert!(fhd.matches(fhd));
        assert!(!fhd.matches(Resolution::new(3840, 2160)));
    }
}
