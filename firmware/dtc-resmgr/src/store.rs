//! Secure key-value store port.
//!
//! The store's transport may return transiently corrupted reads; callers
//! verify everything they read (see [`crate::loader`]).

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreError {
    NotFound,
    /// Transport failure with a store-specific status
    Io(i32),
    BufferTooSmall { needed: u32, got: usize },
}

impl core::fmt::Display for StoreError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            StoreError::NotFound => write!(f, "key not found"),
            StoreError::Io(status) => write!(f, "store I/O error {}", status),
            StoreError::BufferTooSmall { needed, got } => {
                write!(f, "buffer of {} bytes, {} needed", got, needed)
            }
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for StoreError {}

pub type StoreResult<T> = Result<T, StoreError>;

pub trait SecureKeyStore {
    fn exists(&self, name: &str) -> bool;

    fn size(&self, name: &str) -> StoreResult<u32>;

    /// Read the value of `name` into the front of `buf`
    fn read(&mut self, name: &str, buf: &mut [u8]) -> StoreResult<()>;
}

/// In-memory store with scripted transient corruption
#[derive(Clone, Debug, Default)]
pub struct MemoryKeyStore {
    values: BTreeMap<String, Vec<u8>>,
    /// Remaining corrupted reads per key
    corrupt: BTreeMap<String, u32>,
    reads: BTreeMap<String, u32>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, value: Vec<u8>) {
        self.values.insert(String::from(name), value);
    }

    pub fn remove(&mut self, name: &str) -> Option<Vec<u8>> {
        self.values.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.values.get(name).map(|v| v.as_slice())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(|k| k.as_str())
    }

    /// The next `count` reads of `name` return a byte-flipped copy
    pub fn corrupt_next_reads(&mut self, name: &str, count: u32) {
        self.corrupt.insert(String::from(name), count);
    }

    /// Reads issued for `name`
    pub fn read_count(&self, name: &str) -> u32 {
        self.reads.get(name).copied().unwrap_or(0)
    }
}

impl SecureKeyStore for MemoryKeyStore {
    fn exists(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    fn size(&self, name: &str) -> StoreResult<u32> {
        self.values
            .get(name)
            .map(|v| v.len() as u32)
            .ok_or(StoreError::NotFound)
    }

    fn read(&mut self, name: &str, buf: &mut [u8]) -> StoreResult<()> {
        let value = self.values.get(name).ok_or(StoreError::NotFound)?;
        if buf.len() < value.len() {
            return Err(StoreError::BufferTooSmall {
                needed: value.len() as u32,
                got: buf.len(),
            });
        }
        *self.reads.entry(String::from(name)).or_insert(0) += 1;
        buf[..value.len()].copy_from_slice(value);

        if let Some(remaining) = self.corrupt.get_mut(name) {
            if *remaining > 0 {
                *remaining -= 1;
                // Past the checksum field, inside the covered span
                if let Some(b) = buf.get_mut(8) {
                    *b ^= 0xFF;
                }
            }
        }
        Ok(())
    }
}
