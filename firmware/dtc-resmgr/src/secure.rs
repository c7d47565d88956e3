//! # Secure Memory Coordinator
//!
//! Asks the TEE to shield regions of the reserved block and keeps one
//! [`SecureProtectionRecord`] per protectable slot:
//!
//! ```text
//! Unprotected --protect--> Protected --unprotect--> Unprotected
//! ```
//!
//! Both transitions are idempotent. A failed protect leaves the record
//! unprotected and the region usable as ordinary memory.
//!
//! Record state is mirrored into the secure status region so other
//! components can poll it without a TEE round trip:
//!
//! ```text
//! 0x00  magic "DTCS"     0x04  version
//! 0x08  slot count       0x0C  generation (bumped on every write)
//! 0x10  slot 0: [protected:4][last error:4][handle:8]
//! 0x20  slot 1: ...
//! ```

use alloc::collections::BTreeMap;
use byteorder::{BigEndian, ByteOrder};
use log::{debug, info, warn};

use crate::memory::ReservedMemoryAccess;
use crate::region::{BankType, RegionKind, ReservedMemoryRegion};

// ============================================================================
// TEE INTERFACE
// ============================================================================

/// Opaque protection handle issued by the TEE
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TeeHandle(pub u64);

impl TeeHandle {
    pub const NONE: TeeHandle = TeeHandle(0);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TeeError {
    /// No TEE present or not responding
    NotAvailable,
    /// TEE refused the request with its own status
    Rejected(u32),
    /// Handle unknown to the TEE
    BadHandle,
    /// Region kind cannot be protected
    NotProtectable,
}

impl TeeError {
    /// Value stored in the status mirror
    pub const fn code(&self) -> u32 {
        match self {
            TeeError::NotAvailable => 0xFFFF_0001,
            TeeError::BadHandle => 0xFFFF_0002,
            TeeError::NotProtectable => 0xFFFF_0003,
            TeeError::Rejected(status) => *status,
        }
    }
}

impl core::fmt::Display for TeeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            TeeError::NotAvailable => write!(f, "TEE not available"),
            TeeError::Rejected(status) => write!(f, "TEE rejected request (status {:#x})", status),
            TeeError::BadHandle => write!(f, "unknown protection handle"),
            TeeError::NotProtectable => write!(f, "region kind cannot be protected"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for TeeError {}

/// Memory protection service of the trusted execution environment
pub trait TrustedExecEnv {
    fn protect_region(&mut self, phys_addr: u64, size: u32) -> Result<TeeHandle, TeeError>;

    fn unprotect_region(&mut self, handle: TeeHandle) -> Result<(), TeeError>;
}

// ============================================================================
// RECORDS
// ============================================================================

/// Slots in the status mirror: one per bank type, then staging
pub const STATUS_SLOTS: usize = 4;
const STAGING_SLOT: usize = 3;

pub const STATUS_MAGIC: u32 = 0x4454_4353; // "DTCS"
pub const STATUS_VERSION: u32 = 1;
pub const STATUS_HEADER_SIZE: usize = 16;
pub const STATUS_SLOT_SIZE: usize = 16;

/// Bytes of the mirror actually written
pub const STATUS_USED_SIZE: usize = STATUS_HEADER_SIZE + STATUS_SLOTS * STATUS_SLOT_SIZE;

/// Mirror slot of a protectable region kind
pub fn slot_of(kind: RegionKind) -> Option<usize> {
    match kind {
        RegionKind::WorkingBuffer(bank) => Some(bank.slot()),
        RegionKind::StagingBuffer => Some(STAGING_SLOT),
        _ => None,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SecureProtectionRecord {
    pub region: ReservedMemoryRegion,
    pub protected: bool,
    /// Valid only while `protected`
    pub handle: TeeHandle,
    /// Error of the last failed transition
    pub last_error: Option<TeeError>,
}

impl SecureProtectionRecord {
    pub const fn new(region: ReservedMemoryRegion) -> Self {
        Self {
            region,
            protected: false,
            handle: TeeHandle::NONE,
            last_error: None,
        }
    }
}

// ============================================================================
// COORDINATOR
// ============================================================================

pub struct SecureMemoryCoordinator {
    records: [Option<SecureProtectionRecord>; STATUS_SLOTS],
    /// Absent under the legacy layout
    status: Option<ReservedMemoryRegion>,
    generation: u32,
}

impl SecureMemoryCoordinator {
    pub const fn new(status: Option<ReservedMemoryRegion>) -> Self {
        Self {
            records: [None; STATUS_SLOTS],
            status,
            generation: 0,
        }
    }

    pub fn record(&self, kind: RegionKind) -> Option<&SecureProtectionRecord> {
        slot_of(kind).and_then(|s| self.records[s].as_ref())
    }

    pub fn bank_record(&self, bank: BankType) -> Option<&SecureProtectionRecord> {
        self.record(RegionKind::WorkingBuffer(bank))
    }

    pub fn records(&self) -> impl Iterator<Item = &SecureProtectionRecord> {
        self.records.iter().flatten()
    }

    pub fn any_protected(&self) -> bool {
        self.records().any(|r| r.protected)
    }

    /// Write an empty mirror. Call once the layout is final.
    pub fn init_mirror<M: ReservedMemoryAccess>(&mut self, mem: &mut M) {
        self.write_mirror(mem);
    }

    /// Protect `region`, flushing its contents first.
    ///
    /// No-op returning the current record if the region is already
    /// protected.
    pub fn protect<T, M>(
        &mut self,
        region: &ReservedMemoryRegion,
        tee: &mut T,
        mem: &mut M,
    ) -> Result<SecureProtectionRecord, TeeError>
    where
        T: TrustedExecEnv,
        M: ReservedMemoryAccess,
    {
        let slot = slot_of(region.kind).ok_or(TeeError::NotProtectable)?;

        if let Some(record) = self.records[slot] {
            if record.protected && record.region == *region {
                debug!("secure: {} already protected", region.name);
                return Ok(record);
            }
        }

        let mut record = SecureProtectionRecord::new(*region);
        mem.flush_dcache(region.physical_base, region.size as usize);

        let result = tee.protect_region(region.physical_base, region.size);
        match result {
            Ok(handle) => {
                record.protected = true;
                record.handle = handle;
                info!(
                    "secure: protected {} @ {:#x} ({:#x} bytes), handle {:#x}",
                    region.name, region.physical_base, region.size, handle.0
                );
            }
            Err(e) => {
                record.last_error = Some(e);
                warn!("secure: protect {} failed: {}", region.name, e);
            }
        }
        self.records[slot] = Some(record);
        self.write_mirror(mem);

        result.map(|_| record)
    }

    /// Release protection of the region of `kind`, handing back the stored
    /// handle unchanged. No-op if not protected.
    ///
    /// A refused unprotect keeps the record protected.
    pub fn unprotect<T, M>(&mut self, kind: RegionKind, tee: &mut T, mem: &mut M) -> Result<(), TeeError>
    where
        T: TrustedExecEnv,
        M: ReservedMemoryAccess,
    {
        let slot = slot_of(kind).ok_or(TeeError::NotProtectable)?;
        let record = match self.records[slot].as_mut() {
            Some(r) if r.protected => r,
            _ => return Ok(()),
        };

        let result = tee.unprotect_region(record.handle);
        match result {
            Ok(()) => {
                info!("secure: unprotected {}", record.region.name);
                record.protected = false;
                record.handle = TeeHandle::NONE;
                record.last_error = None;
            }
            Err(e) => {
                warn!("secure: unprotect {} failed: {}", record.region.name, e);
                record.last_error = Some(e);
            }
        }
        self.write_mirror(mem);
        result
    }

    /// Unprotect every record. Returns the first error; the rest are still
    /// attempted.
    pub fn unprotect_all<T, M>(&mut self, tee: &mut T, mem: &mut M) -> Result<(), TeeError>
    where
        T: TrustedExecEnv,
        M: ReservedMemoryAccess,
    {
        let kinds: [Option<RegionKind>; STATUS_SLOTS] =
            core::array::from_fn(|s| self.records[s].map(|r| r.region.kind));
        let mut first = Ok(());
        for kind in kinds.into_iter().flatten() {
            if let Err(e) = self.unprotect(kind, tee, mem) {
                if first.is_ok() {
                    first = Err(e);
                }
            }
        }
        first
    }

    fn write_mirror<M: ReservedMemoryAccess>(&mut self, mem: &mut M) {
        let Some(status) = self.status else {
            return;
        };
        if (status.size as usize) < STATUS_USED_SIZE {
            warn!(
                "secure: status region {:#x} bytes, mirror needs {:#x}",
                status.size, STATUS_USED_SIZE
            );
            return;
        }
        self.generation = self.generation.wrapping_add(1);

        let mut buf = [0u8; STATUS_USED_SIZE];
        BigEndian::write_u32(&mut buf[0..], STATUS_MAGIC);
        BigEndian::write_u32(&mut buf[4..], STATUS_VERSION);
        BigEndian::write_u32(&mut buf[8..], STATUS_SLOTS as u32);
        BigEndian::write_u32(&mut buf[12..], self.generation);
        for (slot, record) in self.records.iter().enumerate() {
            if let Some(r) = record {
                let off = STATUS_HEADER_SIZE + slot * STATUS_SLOT_SIZE;
                BigEndian::write_u32(&mut buf[off..], r.protected as u32);
                BigEndian::write_u32(&mut buf[off + 4..], r.last_error.map_or(0, |e| e.code()));
                BigEndian::write_u64(&mut buf[off + 8..], r.handle.0);
            }
        }

        if let Err(e) = mem.write(status.physical_base, &buf) {
            warn!("secure: status mirror write failed: {}", e);
            return;
        }
        mem.flush_dcache(status.physical_base, STATUS_USED_SIZE);
    }
}

// ============================================================================
// MIRROR READER
// ============================================================================

/// One slot as seen by a poller
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatusSlot {
    pub protected: bool,
    pub error: u32,
    pub handle: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SecureStatusView {
    pub generation: u32,
    pub slots: [StatusSlot; STATUS_SLOTS],
}

/// Read the status mirror without calling into the coordinator.
///
/// Returns `None` if the region does not hold a mirror yet.
pub fn read_status<M: ReservedMemoryAccess>(
    mem: &M,
    status: &ReservedMemoryRegion,
) -> Option<SecureStatusView> {
    let mut buf = [0u8; STATUS_USED_SIZE];
    mem.read(status.physical_base, &mut buf).ok()?;
    if BigEndian::read_u32(&buf[0..]) != STATUS_MAGIC
        || BigEndian::read_u32(&buf[4..]) != STATUS_VERSION
    {
        return None;
    }
    let mut slots = [StatusSlot::default(); STATUS_SLOTS];
    for (i, slot) in slots.iter_mut().enumerate() {
        let off = STATUS_HEADER_SIZE + i * STATUS_SLOT_SIZE;
        *slot = StatusSlot {
            protected: BigEndian::read_u32(&buf[off..]) != 0,
            error: BigEndian::read_u32(&buf[off + 4..]),
            handle: BigEndian::read_u64(&buf[off + 8..]),
        };
    }
    Some(SecureStatusView {
        generation: BigEndian::read_u32(&buf[12..]),
        slots,
    })
}

// ============================================================================
// SIMULATED TEE
// ============================================================================

/// Deterministic TEE for host tools and tests
#[derive(Clone, Debug)]
pub struct SimulatedTee {
    available: bool,
    next_handle: u64,
    active: BTreeMap<TeeHandle, (u64, u32)>,
    fail_protect: u32,
    fail_unprotect: u32,
    reject_status: u32,
    pub protect_calls: u32,
    pub unprotect_calls: u32,
}

impl SimulatedTee {
    pub fn new() -> Self {
        Self {
            available: true,
            next_handle: 0x1000,
            active: BTreeMap::new(),
            fail_protect: 0,
            fail_unprotect: 0,
            reject_status: 0xFFFF_000C,
            protect_calls: 0,
            unprotect_calls: 0,
        }
    }

    /// TEE that answers every call with `NotAvailable`
    pub fn absent() -> Self {
        Self {
            available: false,
            ..Self::new()
        }
    }

    /// Reject the next `count` protect requests
    pub fn fail_next_protects(&mut self, count: u32) {
        self.fail_protect = count;
    }

    /// Reject the next `count` unprotect requests
    pub fn fail_next_unprotects(&mut self, count: u32) {
        self.fail_unprotect = count;
    }

    /// Currently protected `(phys_addr, size)` ranges
    pub fn protected_ranges(&self) -> impl Iterator<Item = (u64, u32)> + '_ {
        self.active.values().copied()
    }

    pub fn is_protected(&self, phys_addr: u64) -> bool {
        self.active.values().any(|&(base, _)| base == phys_addr)
    }
}

impl TrustedExecEnv for SimulatedTee {
    fn protect_region(&mut self, phys_addr: u64, size: u32) -> Result<TeeHandle, TeeError> {
        self.protect_calls += 1;
        if !self.available {
            return Err(TeeError::NotAvailable);
        }
        if self.fail_protect > 0 {
            self.fail_protect -= 1;
            return Err(TeeError::Rejected(self.reject_status));
        }
        let handle = TeeHandle(self.next_handle);
        self.next_handle += 1;
        self.active.insert(handle, (phys_addr, size));
        Ok(handle)
    }

    fn unprotect_region(&mut self, handle: TeeHandle) -> Result<(), TeeError> {
        self.unprotect_calls += 1;
        if !self.available {
            return Err(TeeError::NotAvailable);
        }
        if self.fail_unprotect > 0 {
            self.fail_unprotect -= 1;
            return Err(TeeError::Rejected(self.reject_status));
        }
        self.active.remove(&handle).map(|_| ()).ok_or(TeeError::BadHandle)
    }
}

// ============================================================================
// TESTS
// ============================================================================
