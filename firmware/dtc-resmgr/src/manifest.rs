//! # Staging Manifest
//!
//! Declares the expected block set of a configuration and the layout
//! version. It sits at offset 0 of the staging buffer and is stored in the
//! key-value store under [`MANIFEST_KEY`].
//!
//! ```text
//! [crc32:4][size:4][version:4][block_count:4]
//! block_count x [index:2][kind:1][flags:1][name:44]
//! ```
//!
//! The checksum covers `[4 .. size)`, same convention as block headers.

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use byteorder::{BigEndian, ByteOrder};

use crate::block::{crc32, BlockKind};
use crate::layout::LayoutPolicy;

/// Key of the manifest in the key-value store
pub const MANIFEST_KEY: &str = "dtc_manifest";

pub const MANIFEST_HEADER_SIZE: usize = 16;
pub const MANIFEST_ENTRY_SIZE: usize = 48;
pub const MANIFEST_NAME_MAX: usize = 44;

/// Maximum number of blocks one manifest may declare
pub const MAX_MANIFEST_ENTRIES: usize = 32;

/// Largest encoded manifest
pub const MANIFEST_MAX_SIZE: usize =
    MANIFEST_HEADER_SIZE + MAX_MANIFEST_ENTRIES * MANIFEST_ENTRY_SIZE;

/// Entry flag: block may be waived
pub const ENTRY_OPTIONAL: u8 = 1 << 0;
/// Entry flag: the bank fed by this block must be protected
pub const ENTRY_SECURE: u8 = 1 << 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ManifestError {
    TooShort { len: usize },
    SizeMismatch { declared: u32, expected: usize },
    TooManyEntries(u32),
    Crc { stored: u32, computed: u32 },
    UnknownKind(u8),
    /// Indices are not a permutation of `0..block_count`
    BadIndex(u16),
    BadName,
    /// No basic-init entry, or it is marked optional
    MissingBasicInit,
}

impl core::fmt::Display for ManifestError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ManifestError::TooShort { len } => write!(f, "manifest too short ({} bytes)", len),
            ManifestError::SizeMismatch { declared, expected } => write!(
                f,
                "manifest size {} does not match {} expected",
                declared, expected
            ),
            ManifestError::TooManyEntries(n) => {
                write!(f, "{} entries exceed {}", n, MAX_MANIFEST_ENTRIES)
            }
            ManifestError::Crc { stored, computed } => write!(
                f,
                "manifest crc32 mismatch (stored {:#010x}, computed {:#010x})",
                stored, computed
            ),
            ManifestError::UnknownKind(k) => write!(f, "unknown block kind {:#04x}", k),
            ManifestError::BadIndex(i) => write!(f, "duplicate or out-of-range index {}", i),
            ManifestError::BadName => write!(f, "entry name invalid"),
            ManifestError::MissingBasicInit => write!(f, "no mandatory basic-init entry"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for ManifestError {}

/// One expected block
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManifestEntry {
    /// Position in the completion bitmap
    pub index: u16,
    pub kind: BlockKind,
    pub flags: u8,
    /// Key of the block in the key-value store
    pub name: String,
}

impl ManifestEntry {
    pub fn new(index: u16, kind: BlockKind, name: &str) -> Self {
        Self {
            index,
            kind,
            flags: 0,
            name: String::from(name),
        }
    }

    pub fn optional(mut self) -> Self {
        self.flags |= ENTRY_OPTIONAL;
        self
    }

    pub fn secure(mut self) -> Self {
        self.flags |= ENTRY_SECURE;
        self
    }

    #[inline]
    pub fn is_optional(&self) -> bool {
        self.flags & ENTRY_OPTIONAL != 0
    }

    #[inline]
    pub fn is_secure(&self) -> bool {
        self.flags & ENTRY_SECURE != 0
    }
}

/// Expected block set of one configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Manifest {
    pub version: u32,
    /// Entries sorted by index
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    /// Build and validate a manifest; entries are sorted by index
    pub fn new(version: u32, mut entries: Vec<ManifestEntry>) -> Result<Self, ManifestError> {
        entries.sort_by_key(|e| e.index);
        let manifest = Self { version, entries };
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn policy(&self) -> LayoutPolicy {
        LayoutPolicy::from_manifest_version(self.version)
    }

    pub fn block_count(&self) -> usize {
        self.entries.len()
    }

    pub fn entry(&self, index: u16) -> Option<&ManifestEntry> {
        self.entries.iter().find(|e| e.index == index)
    }

    pub fn basic_init(&self) -> Option<&ManifestEntry> {
        self.entries.iter().find(|e| e.kind == BlockKind::BasicInit)
    }

    pub fn encoded_len(&self) -> usize {
        MANIFEST_HEADER_SIZE + self.entries.len() * MANIFEST_ENTRY_SIZE
    }

    fn validate(&self) -> Result<(), ManifestError> {
        if self.entries.len() > MAX_MANIFEST_ENTRIES {
            return Err(ManifestError::TooManyEntries(self.entries.len() as u32));
        }
        let mut seen = [false; MAX_MANIFEST_ENTRIES];
        for e in &self.entries {
            let i = e.index as usize;
            if i >= self.entries.len() || seen[i] {
                return Err(ManifestError::BadIndex(e.index));
            }
            seen[i] = true;
            // Names are NUL-padded on the wire
            if e.name.is_empty() || e.name.len() > MANIFEST_NAME_MAX || e.name.contains('\0') {
                return Err(ManifestError::BadName);
            }
        }
        match self.basic_init() {
            Some(e) if !e.is_optional() => Ok(()),
            _ => Err(ManifestError::MissingBasicInit),
        }
    }

    /// Declared size of a manifest buffer, if the header is present
    pub fn peek_size(raw: &[u8]) -> Option<usize> {
        if raw.len() < MANIFEST_HEADER_SIZE {
            return None;
        }
        Some(BigEndian::read_u32(&raw[4..]) as usize)
    }

    pub fn decode(raw: &[u8]) -> Result<Self, ManifestError> {
        if raw.len() < MANIFEST_HEADER_SIZE {
            return Err(ManifestError::TooShort { len: raw.len() });
        }
        let declared = BigEndian::read_u32(&raw[4..]);
        let version = BigEndian::read_u32(&raw[8..]);
        let count = BigEndian::read_u32(&raw[12..]);
        if count as usize > MAX_MANIFEST_ENTRIES {
            return Err(ManifestError::TooManyEntries(count));
        }

        let expected = MANIFEST_HEADER_SIZE + count as usize * MANIFEST_ENTRY_SIZE;
        if declared as usize != expected || expected > raw.len() {
            return Err(ManifestError::SizeMismatch { declared, expected });
        }

        let stored = BigEndian::read_u32(&raw[0..]);
        let computed = crc32(&raw[4..expected]);
        if stored != computed {
            return Err(ManifestError::Crc { stored, computed });
        }

        let mut entries = Vec::with_capacity(count as usize);
        for chunk in raw[MANIFEST_HEADER_SIZE..expected].chunks_exact(MANIFEST_ENTRY_SIZE) {
            let kind = BlockKind::from_u8(chunk[2]).ok_or(ManifestError::UnknownKind(chunk[2]))?;
            let name_bytes = &chunk[4..];
            let end = name_bytes.iter().position(|&b| b == 0).unwrap_or(MANIFEST_NAME_MAX);
            let name =
                core::str::from_utf8(&name_bytes[..end]).map_err(|_| ManifestError::BadName)?;
            entries.push(ManifestEntry {
                index: BigEndian::read_u16(chunk),
                kind,
                flags: chunk[3],
                name: String::from(name),
            });
        }

        Manifest::new(version, entries)
    }

    pub fn encode(&self) -> Result<Vec<u8>, ManifestError> {
        self.validate()?;
        let len = self.encoded_len();
        let mut out = vec![0u8; len];
        BigEndian::write_u32(&mut out[4..], len as u32);
        BigEndian::write_u32(&mut out[8..], self.version);
        BigEndian::write_u32(&mut out[12..], self.entries.len() as u32);

        for (e, chunk) in self
            .entries
            .iter()
            .zip(out[MANIFEST_HEADER_SIZE..].chunks_exact_mut(MANIFEST_ENTRY_SIZE))
        {
            BigEndian::write_u16(chunk, e.index);
            chunk[2] = e.kind as u8;
            chunk[3] = e.flags;
            chunk[4..4 + e.name.len()].copy_from_slice(e.name.as_bytes());
        }

        let crc = crc32(&out[4..]);
        BigEndian::write_u32(&mut out[0..], crc);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(version: u32) -> Manifest {
        Manifest::new(
            version,
            vec![
                ManifestEntry::new(1, BlockKind::OdLut, "od_lut").secure(),
                ManifestEntry::new(0, BlockKind::BasicInit, "basic_init"),
                ManifestEntry::new(2, BlockKind::DemuraLut, "demura_lut")
                    .optional()
                    .secure(),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_entries_sorted_and_round_trip() {
        let manifest = sample(1);
        assert_eq!(manifest.entries[0].kind, BlockKind::BasicInit);

        let bytes = manifest.encode().unwrap();
        assert_eq!(bytes.len(), MANIFEST_HEADER_SIZE + 3 * MANIFEST_ENTRY_SIZE);
        assert_eq!(Manifest::peek_size(&bytes), Some(bytes.len()));
        assert_eq!(Manifest::decode(&bytes).unwrap(), manifest);
    }

    #[test]
    fn test_version_selects_policy() {
        assert_eq!(sample(0).policy(), LayoutPolicy::LegacyFixed);
        assert_eq!(sample(2).policy(), LayoutPolicy::TableDriven);
    }

    #[test]
    fn test_corruption_detected() {
        let mut bytes = sample(1).encode().unwrap();
        bytes[MANIFEST_HEADER_SIZE + 5] ^= 0x20;
        assert!(matches!(Manifest::decode(&bytes), Err(ManifestError::Crc { .. })));
    }

    #[test]
    fn test_requires_mandatory_basic_init() {
        let err = Manifest::new(1, vec![ManifestEntry::new(0, BlockKind::OdLut, "od")]);
        assert_eq!(err, Err(ManifestError::MissingBasicInit));

        let err = Manifest::new(
            1,
            vec![ManifestEntry::new(0, BlockKind::BasicInit, "init").optional()],
        );
        assert_eq!(err, Err(ManifestError::MissingBasicInit));
    }

    #[test]
    fn test_indices_must_be_dense() {
        let err = Manifest::new(
            1,
            vec![
                ManifestEntry::new(0, BlockKind::BasicInit, "init"),
                ManifestEntry::new(2, BlockKind::Vac, "vac"),
            ],
        );
        assert_eq!(err, Err(ManifestError::BadIndex(2)));

        let err = Manifest::new(
            1,
            vec![
                ManifestEntry::new(0, BlockKind::BasicInit, "init"),
                ManifestEntry::new(0, BlockKind::Vac, "vac"),
            ],
        );
        assert_eq!(err, Err(ManifestError::BadIndex(0)));
    }

    #[test]
    fn test_name_with_nul_rejected() {
        let err = Manifest::new(
            1,
            vec![
                ManifestEntry::new(0, BlockKind::BasicInit, "init"),
                ManifestEntry::new(1, BlockKind::Vac, "vac\0extra"),
            ],
        );
        assert_eq!(err, Err(ManifestError::BadName));
    }
}
