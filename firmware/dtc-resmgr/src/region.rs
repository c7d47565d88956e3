//! Typed regions of the reserved memory block.
//!
//! Regions are created once by the layout planner and only referenced by
//! everything else. Addresses are physical.

/// Reserved memory granted by the bootloader, whatever its origin
/// (device-tree `reg`/`alloc-ranges` or an environment-provided address)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReservedMemory {
    pub base: u64,
    pub size: u32,
}

impl ReservedMemory {
    pub const fn new(base: u64, size: u32) -> Self {
        Self { base, size }
    }

    /// One past the last byte
    pub const fn end(&self) -> u64 {
        self.base + self.size as u64
    }
}

/// Post-processing engine a working buffer bank serves
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BankType {
    /// Primary overdrive engine
    Overdrive,
    /// Demura correction engine
    Demura,
    /// Line overdrive engine
    LineOverdrive,
}

impl BankType {
    pub const ALL: [BankType; 3] = [BankType::Overdrive, BankType::Demura, BankType::LineOverdrive];

    pub const fn name(&self) -> &'static str {
        match self {
            BankType::Overdrive => "overdrive",
            BankType::Demura => "demura",
            BankType::LineOverdrive => "lod",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.name() == name)
    }

    /// Order in which optional banks are offered the spare budget.
    /// Historical ordering, kept for layout compatibility.
    pub const fn priority(&self) -> u8 {
        match self {
            BankType::Overdrive => 0,
            BankType::Demura => 1,
            BankType::LineOverdrive => 2,
        }
    }

    /// Slot in the secure status mirror
    pub const fn slot(&self) -> usize {
        match self {
            BankType::Overdrive => 0,
            BankType::Demura => 1,
            BankType::LineOverdrive => 2,
        }
    }
}

/// Fixed buffers of the legacy layout
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LegacyLutType {
    Vac,
    DemuraSet,
    DemuraLut,
    AccLut,
}

impl LegacyLutType {
    /// Canonical order of the legacy buffers
    pub const ALL: [LegacyLutType; 4] = [
        LegacyLutType::Vac,
        LegacyLutType::DemuraSet,
        LegacyLutType::DemuraLut,
        LegacyLutType::AccLut,
    ];

    pub const fn name(&self) -> &'static str {
        match self {
            LegacyLutType::Vac => "vac",
            LegacyLutType::DemuraSet => "demura_set",
            LegacyLutType::DemuraLut => "demura_lut",
            LegacyLutType::AccLut => "acc_lut",
        }
    }

    /// Fixed size of the buffer in bytes
    pub const fn size(&self) -> u32 {
        match self {
            LegacyLutType::Vac => 0x2000,
            LegacyLutType::DemuraSet => 0x100,
            LegacyLutType::DemuraLut => 0x12_0000,
            LegacyLutType::AccLut => 0x400,
        }
    }

    /// Total bytes taken by the four legacy buffers
    pub const fn total_size() -> u32 {
        LegacyLutType::Vac.size()
            + LegacyLutType::DemuraSet.size()
            + LegacyLutType::DemuraLut.size()
            + LegacyLutType::AccLut.size()
    }
}

/// What a region is used for
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionKind {
    WorkingBuffer(BankType),
    StagingBuffer,
    SecureStatus,
    LegacyLut(LegacyLutType),
}

impl RegionKind {
    pub const fn name(&self) -> &'static str {
        match self {
            RegionKind::WorkingBuffer(t) => t.name(),
            RegionKind::StagingBuffer => "staging",
            RegionKind::SecureStatus => "secure_status",
            RegionKind::LegacyLut(t) => t.name(),
        }
    }
}

/// A named, address-significant slice of the reserved block
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReservedMemoryRegion {
    pub name: &'static str,
    pub physical_base: u64,
    pub size: u32,
    pub kind: RegionKind,
}

impl ReservedMemoryRegion {
    pub const fn new(kind: RegionKind, physical_base: u64, size: u32) -> Self {
        Self {
            name: kind.name(),
            physical_base,
            size,
            kind,
        }
    }

    /// One past the last byte
    #[inline]
    pub const fn end(&self) -> u64 {
        self.physical_base + self.size as u64
    }

    /// Whether `[addr, addr + len)` lies entirely inside the region
    pub fn contains(&self, addr: u64, len: u64) -> bool {
        addr >= self.physical_base && addr.saturating_add(len) <= self.end()
    }

    pub fn overlaps(&self, other: &ReservedMemoryRegion) -> bool {
        self.physical_base < other.end() && other.physical_base < self.end()
    }
}

/// A working buffer bank and its validity after planning
///
/// A bank with `valid == false` has no region and must never be handed to
/// hardware.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkingBufferBank {
    pub mem_type: BankType,
    pub size: u32,
    pub mandatory: bool,
    pub valid: bool,
    pub region: Option<ReservedMemoryRegion>,
}

impl WorkingBufferBank {
    /// Region of a valid bank
    pub fn usable_region(&self) -> Option<&ReservedMemoryRegion> {
        if self.valid {
            self.region.as_ref()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_overlap() {
        let a = ReservedMemoryRegion::new(RegionKind::StagingBuffer, 0x1000, 0x1000);
        let b = ReservedMemoryRegion::new(RegionKind::SecureStatus, 0x2000, 0x100);
        let c = ReservedMemoryRegion::new(RegionKind::SecureStatus, 0x1FFF, 0x100);
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c));
        assert!(a.contains(0x1800, 0x800));
        assert!(!a.contains(0x1800, 0x801));
    }

    #[test]
    fn test_legacy_sizes() {
        assert_eq!(LegacyLutType::total_size(), 0x2000 + 0x100 + 0x12_0000 + 0x400);
        assert_eq!(RegionKind::LegacyLut(LegacyLutType::AccLut).name(), "acc_lut");
    }

    #[test]
    fn test_invalid_bank_has_no_usable_region() {
        let region = ReservedMemoryRegion::new(RegionKind::WorkingBuffer(BankType::Demura), 0, 16);
        let bank = WorkingBufferBank {
            mem_type: BankType::Demura,
            size: 16,
            mandatory: false,
            valid: false,
            region: Some(region),
        };
        assert!(bank.usable_region().is_none());
    }
}
