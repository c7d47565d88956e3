//! Access port for the reserved memory block.
//!
//! Nothing in the crate touches reserved memory directly; every read, write
//! and cache maintenance goes through [`ReservedMemoryAccess`].

use alloc::vec;
use alloc::vec::Vec;

use crate::region::{ReservedMemory, ReservedMemoryRegion};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryError {
    /// Access outside the reserved block
    OutOfBounds { addr: u64, len: usize },
}

impl core::fmt::Display for MemoryError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            MemoryError::OutOfBounds { addr, len } => {
                write!(f, "access {:#x}+{:#x} outside reserved memory", addr, len)
            }
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for MemoryError {}

pub type MemoryResult<T> = Result<T, MemoryError>;

/// Physical access to the reserved block
pub trait ReservedMemoryAccess {
    fn read(&self, addr: u64, buf: &mut [u8]) -> MemoryResult<()>;

    fn write(&mut self, addr: u64, data: &[u8]) -> MemoryResult<()>;

    /// Clean and invalidate data cache lines covering the range so that
    /// another agent (TEE, DMA) observes the current contents.
    fn flush_dcache(&mut self, addr: u64, len: usize);

    /// Read a whole region
    fn read_region(&self, region: &ReservedMemoryRegion) -> MemoryResult<Vec<u8>> {
        let mut buf = vec![0u8; region.size as usize];
        self.read(region.physical_base, &mut buf)?;
        Ok(buf)
    }
}

fn check(reserved: &ReservedMemory, addr: u64, len: usize) -> MemoryResult<usize> {
    let end = addr.checked_add(len as u64);
    match end {
        Some(end) if addr >= reserved.base && end <= reserved.end() => {
            Ok((addr - reserved.base) as usize)
        }
        _ => Err(MemoryError::OutOfBounds { addr, len }),
    }
}

// ============================================================================
// RAM IMAGE
// ============================================================================

/// Heap-backed image of the reserved block, for host tools and tests
#[derive(Clone, Debug)]
pub struct RamImage {
    reserved: ReservedMemory,
    bytes: Vec<u8>,
    flushes: usize,
}

impl RamImage {
    pub fn new(reserved: ReservedMemory) -> Self {
        Self {
            reserved,
            bytes: vec![0u8; reserved.size as usize],
            flushes: 0,
        }
    }

    pub fn reserved(&self) -> ReservedMemory {
        self.reserved
    }

    /// Number of cache flushes requested so far
    pub fn flush_count(&self) -> usize {
        self.flushes
    }

    /// Bytes of a region, borrowed
    pub fn slice(&self, region: &ReservedMemoryRegion) -> MemoryResult<&[u8]> {
        let off = check(&self.reserved, region.physical_base, region.size as usize)?;
        Ok(&self.bytes[off..off + region.size as usize])
    }
}

impl ReservedMemoryAccess for RamImage {
    fn read(&self, addr: u64, buf: &mut [u8]) -> MemoryResult<()> {
        let off = check(&self.reserved, addr, buf.len())?;
        buf.copy_from_slice(&self.bytes[off..off + buf.len()]);
        Ok(())
    }

    fn write(&mut self, addr: u64, data: &[u8]) -> MemoryResult<()> {
        let off = check(&self.reserved, addr, data.len())?;
        self.bytes[off..off + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn flush_dcache(&mut self, _addr: u64, _len: usize) {
        self.flushes += 1;
    }
}

// ============================================================================
// IDENTITY-MAPPED FIRMWARE ACCESS
// ============================================================================

/// Cache line size assumed for maintenance loops
const CACHE_LINE: u64 = 64;

/// Reserved memory reached through an identity mapping
pub struct IdentityMapped {
    reserved: ReservedMemory,
}

impl IdentityMapped {
    /// # Safety
    ///
    /// `reserved` must be identity mapped, exclusively owned by the caller
    /// and not aliased by any Rust reference for the lifetime of the value.
    pub const unsafe fn new(reserved: ReservedMemory) -> Self {
        Self { reserved }
    }
}

impl ReservedMemoryAccess for IdentityMapped {
    fn read(&self, addr: u64, buf: &mut [u8]) -> MemoryResult<()> {
        check(&self.reserved, addr, buf.len())?;
        for (i, b) in buf.iter_mut().enumerate() {
            // SAFETY: bounds checked above; mapping guaranteed by `new`
            *b = unsafe { core::ptr::read_volatile((addr as usize + i) as *const u8) };
        }
        Ok(())
    }

    fn write(&mut self, addr: u64, data: &[u8]) -> MemoryResult<()> {
        check(&self.reserved, addr, data.len())?;
        for (i, &b) in data.iter().enumerate() {
            // SAFETY: bounds checked above; mapping guaranteed by `new`
            unsafe { core::ptr::write_volatile((addr as usize + i) as *mut u8, b) };
        }
        Ok(())
    }

    fn flush_dcache(&mut self, addr: u64, len: usize) {
        let start = addr & !(CACHE_LINE - 1);
        let end = addr.saturating_add(len as u64);
        let mut line = start;
        while line < end {
            clean_invalidate_line(line);
            line += CACHE_LINE;
        }
        barrier();
    }
}

#[cfg(target_arch = "aarch64")]
#[inline(always)]
fn clean_invalidate_line(va: u64) {
    // SAFETY: cache maintenance by VA on an address inside the mapping
    unsafe {
        core::arch::asm!("dc civac, {}", in(reg) va, options(nostack, preserves_flags));
    }
}

#[cfg(not(target_arch = "aarch64"))]
#[inline(always)]
fn clean_invalidate_line(_va: u64) {}

#[cfg(target_arch = "aarch64")]
#[inline(always)]
fn barrier() {
    // SAFETY: barrier only
    unsafe {
        core::arch::asm!("dsb sy", options(nostack, preserves_flags));
    }
}

#[cfg(not(target_arch = "aarch64"))]
#[inline(always)]
fn barrier() {
    core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
}
