//! # Configuration Block Codec
//!
//! A block is a self-describing, checksummed unit of binary configuration:
//!
//! ```text
//! +--------+------+---------------------------------------------+
//! | offset | size | field                                       |
//! +--------+------+---------------------------------------------+
//! | 0x00   | 4    | crc32 over [0x04 .. declared_size)          |
//! | 0x04   | 4    | declared_size (header + payload)            |
//! | 0x08   | 4    | header version                              |
//! | 0x0C   | 4    | control flags                               |
//! | 0x10   | 2    | chip id match (0 = any)                     |
//! | 0x12   | 2    | resolution match, horizontal (0 = any)      |
//! | 0x14   | 2    | resolution match, vertical (0 = any)        |
//! | 0x16   | 1    | block kind                                  |
//! | 0x17   | 1    | name length                                 |
//! | 0x18   | 40   | name, zero padded                           |
//! | 0x40   | ...  | payload                                     |
//! +--------+------+---------------------------------------------+
//! ```
//!
//! Multi-byte fields are big-endian. Encoded blocks are padded to a 16-byte
//! multiple; bytes past `declared_size` are not covered by the checksum.
//!
//! The codec is a pure validator. Retrying transiently corrupted reads is the
//! caller's job (see [`crate::loader`]).

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use byteorder::{BigEndian, ByteOrder};
use crc::{Crc, CRC_32_ISO_HDLC};

use crate::region::{BankType, LegacyLutType};
use crate::{ChipFamily, ChipId, Resolution};

// ============================================================================
// WIRE CONSTANTS
// ============================================================================

/// Fixed header size in bytes
pub const HEADER_SIZE: usize = 64;

/// Header version written by [`encode`]
pub const BLOCK_HEADER_VERSION: u32 = 1;

/// Maximum name length in bytes
pub const NAME_MAX: usize = 40;

/// Encoded blocks are padded to this alignment
pub const BLOCK_ALIGN: usize = 16;

const OFF_CRC: usize = 0x00;
const OFF_SIZE: usize = 0x04;
const OFF_VERSION: usize = 0x08;
const OFF_CONTROL: usize = 0x0C;
const OFF_CHIP: usize = 0x10;
const OFF_RES_H: usize = 0x12;
const OFF_RES_V: usize = 0x14;
const OFF_KIND: usize = 0x16;
const OFF_NAME_LEN: usize = 0x17;
const OFF_NAME: usize = 0x18;

/// Control flag bits
pub mod ctrl {
    /// Bank fed by this block must be protected by the TEE
    pub const SECURE: u32 = 1 << 0;
    /// Block may be waived if it cannot be loaded
    pub const OPTIONAL: u32 = 1 << 1;
    /// Payload was rewritten by a platform pre-processing hook
    pub const PREPROCESSED: u32 = 1 << 2;
}

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// CRC-32 (ISO-HDLC) of `data`
pub fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

// ============================================================================
// BLOCK KIND
// ============================================================================

/// Number of block kinds
pub const BLOCK_KIND_COUNT: usize = 7;

/// What a block configures
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BlockKind {
    /// Register init table; mandatory, consumed by timing logic
    BasicInit = 0x00,
    Vac = 0x01,
    DemuraSet = 0x02,
    DemuraLut = 0x03,
    AccLut = 0x04,
    OdLut = 0x05,
    LodLut = 0x06,
}

impl BlockKind {
    pub const ALL: [BlockKind; BLOCK_KIND_COUNT] = [
        BlockKind::BasicInit,
        BlockKind::Vac,
        BlockKind::DemuraSet,
        BlockKind::DemuraLut,
        BlockKind::AccLut,
        BlockKind::OdLut,
        BlockKind::LodLut,
    ];

    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.get(value as usize).copied()
    }

    #[inline]
    pub const fn index(&self) -> usize {
        *self as usize
    }

    pub const fn name(&self) -> &'static str {
        match self {
            BlockKind::BasicInit => "basic-init",
            BlockKind::Vac => "vac",
            BlockKind::DemuraSet => "demura-set",
            BlockKind::DemuraLut => "demura-lut",
            BlockKind::AccLut => "acc-lut",
            BlockKind::OdLut => "od-lut",
            BlockKind::LodLut => "lod-lut",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.name() == name)
    }

    pub const fn is_mandatory(&self) -> bool {
        matches!(self, BlockKind::BasicInit)
    }

    /// Working buffer bank this block's payload is copied into
    pub const fn bank(&self) -> Option<BankType> {
        match self {
            BlockKind::OdLut => Some(BankType::Overdrive),
            BlockKind::DemuraLut => Some(BankType::Demura),
            BlockKind::LodLut => Some(BankType::LineOverdrive),
            _ => None,
        }
    }

    /// Legacy fixed buffer holding this block under the legacy layout
    pub const fn legacy_lut(&self) -> Option<LegacyLutType> {
        match self {
            BlockKind::Vac => Some(LegacyLutType::Vac),
            BlockKind::DemuraSet => Some(LegacyLutType::DemuraSet),
            BlockKind::DemuraLut => Some(LegacyLutType::DemuraLut),
            BlockKind::AccLut => Some(LegacyLutType::AccLut),
            _ => None,
        }
    }
}

// ============================================================================
// ERRORS
// ============================================================================

/// Header malformed or size inconsistent
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FormatError {
    /// Buffer shorter than the fixed header
    TooShort { len: usize },
    /// declared_size outside `[HEADER_SIZE, buffer length]`
    SizeOutOfRange { declared: u32, available: usize },
    /// Header version newer than this codec
    UnsupportedVersion(u32),
    UnknownKind(u8),
    NameTooLong(usize),
    NameNotUtf8,
    /// Basic-init block without a resolution key
    MissingResolution,
    /// Checksum kept failing after bounded retries
    Corrupted { stored: u32, computed: u32 },
}

impl core::fmt::Display for FormatError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            FormatError::TooShort { len } => {
                write!(f, "block too short ({} bytes, header is {})", len, HEADER_SIZE)
            }
            FormatError::SizeOutOfRange { declared, available } => write!(
                f,
                "declared size {} outside [{}, {}]",
                declared, HEADER_SIZE, available
            ),
            FormatError::UnsupportedVersion(v) => write!(f, "unsupported header version {}", v),
            FormatError::UnknownKind(k) => write!(f, "unknown block kind {:#04x}", k),
            FormatError::NameTooLong(n) => write!(f, "name length {} exceeds {}", n, NAME_MAX),
            FormatError::NameNotUtf8 => write!(f, "name is not valid UTF-8"),
            FormatError::MissingResolution => {
                write!(f, "basic-init block has no resolution key")
            }
            FormatError::Corrupted { stored, computed } => write!(
                f,
                "checksum mismatch persisted (stored {:#010x}, computed {:#010x})",
                stored, computed
            ),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for FormatError {}

/// Stored CRC does not match the recomputed one
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IntegrityError {
    pub stored: u32,
    pub computed: u32,
}

impl core::fmt::Display for IntegrityError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "crc32 mismatch (stored {:#010x}, computed {:#010x})",
            self.stored, self.computed
        )
    }
}

#[cfg(feature = "std")]
impl std::error::Error for IntegrityError {}

impl From<IntegrityError> for FormatError {
    fn from(e: IntegrityError) -> Self {
        FormatError::Corrupted {
            stored: e.stored,
            computed: e.computed,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeError {
    Format(FormatError),
    Integrity(IntegrityError),
}

impl core::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            DecodeError::Format(e) => write!(f, "format error: {}", e),
            DecodeError::Integrity(e) => write!(f, "integrity error: {}", e),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for DecodeError {}

impl From<FormatError> for DecodeError {
    fn from(e: FormatError) -> Self {
        DecodeError::Format(e)
    }
}

impl From<IntegrityError> for DecodeError {
    fn from(e: IntegrityError) -> Self {
        DecodeError::Integrity(e)
    }
}

/// Result type for block decoding
pub type DecodeResult<T> = Result<T, DecodeError>;

// ============================================================================
// HEADER
// ============================================================================

/// Verified block header
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataBlockHeader {
    pub crc32: u32,
    /// Header plus payload, in bytes
    pub declared_size: u32,
    pub version: u32,
    pub control_flags: u32,
    /// Chip family code this block applies to (0 = any)
    pub chip_id_match: u16,
    pub resolution_match: Resolution,
    pub block_kind: BlockKind,
    pub name: String,
}

impl DataBlockHeader {
    /// Unsealed header; `crc32` and `declared_size` are filled by [`seal`]
    pub fn new(block_kind: BlockKind, name: &str) -> Self {
        Self {
            crc32: 0,
            declared_size: 0,
            version: BLOCK_HEADER_VERSION,
            control_flags: 0,
            chip_id_match: 0,
            resolution_match: Resolution::ANY,
            block_kind,
            name: String::from(name),
        }
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.control_flags |= flags;
        self
    }

    pub fn with_chip(mut self, family: ChipFamily) -> Self {
        self.chip_id_match = family.code();
        self
    }

    pub fn with_resolution(mut self, resolution: Resolution) -> Self {
        self.resolution_match = resolution;
        self
    }

    /// Payload length implied by `declared_size`
    pub fn payload_len(&self) -> usize {
        (self.declared_size as usize).saturating_sub(HEADER_SIZE)
    }

    #[inline]
    pub fn is_secure(&self) -> bool {
        self.control_flags & ctrl::SECURE != 0
    }

    #[inline]
    pub fn is_optional(&self) -> bool {
        self.control_flags & ctrl::OPTIONAL != 0
    }

    /// Whether this block's applicability key admits `chip` and `panel`
    pub fn applies_to(&self, chip: &ChipId, panel: Resolution) -> bool {
        let chip_ok = self.chip_id_match == 0 || self.chip_id_match == chip.family.code();
        chip_ok && self.resolution_match.matches(panel)
    }

    fn write_fields(&self, out: &mut [u8], declared_size: u32) -> Result<(), FormatError> {
        let name = self.name.as_bytes();
        if name.len() > NAME_MAX {
            return Err(FormatError::NameTooLong(name.len()));
        }
        BigEndian::write_u32(&mut out[OFF_SIZE..], declared_size);
        BigEndian::write_u32(&mut out[OFF_VERSION..], self.version);
        BigEndian::write_u32(&mut out[OFF_CONTROL..], self.control_flags);
        BigEndian::write_u16(&mut out[OFF_CHIP..], self.chip_id_match);
        BigEndian::write_u16(&mut out[OFF_RES_H..], self.resolution_match.h);
        BigEndian::write_u16(&mut out[OFF_RES_V..], self.resolution_match.v);
        out[OFF_KIND] = self.block_kind as u8;
        out[OFF_NAME_LEN] = name.len() as u8;
        out[OFF_NAME..OFF_NAME + name.len()].copy_from_slice(name);
        Ok(())
    }
}

// ============================================================================
// DECODE
// ============================================================================

/// Validate a raw block and split it into header and payload.
///
/// Checks run cheapest first and stop at the first failure:
/// 1. buffer holds a full header
/// 2. `HEADER_SIZE <= declared_size <= raw.len()`
/// 3. CRC-32 over `raw[4..declared_size]` matches the stored value
/// 4. header fields are well formed; basic-init blocks carry a resolution key
pub fn decode(raw: &[u8]) -> DecodeResult<(DataBlockHeader, &[u8])> {
    if raw.len() < HEADER_SIZE {
        return Err(FormatError::TooShort { len: raw.len() }.into());
    }

    let declared = BigEndian::read_u32(&raw[OFF_SIZE..]);
    if (declared as usize) < HEADER_SIZE || declared as usize > raw.len() {
        return Err(FormatError::SizeOutOfRange {
            declared,
            available: raw.len(),
        }
        .into());
    }
    let block = &raw[..declared as usize];

    let stored = BigEndian::read_u32(&block[OFF_CRC..]);
    let computed = crc32(&block[OFF_SIZE..]);
    if stored != computed {
        return Err(IntegrityError { stored, computed }.into());
    }

    let version = BigEndian::read_u32(&block[OFF_VERSION..]);
    if version == 0 || version > BLOCK_HEADER_VERSION {
        return Err(FormatError::UnsupportedVersion(version).into());
    }

    let kind_byte = block[OFF_KIND];
    let block_kind = BlockKind::from_u8(kind_byte).ok_or(FormatError::UnknownKind(kind_byte))?;

    let name_len = block[OFF_NAME_LEN] as usize;
    if name_len > NAME_MAX {
        return Err(FormatError::NameTooLong(name_len).into());
    }
    let name = core::str::from_utf8(&block[OFF_NAME..OFF_NAME + name_len])
        .map_err(|_| FormatError::NameNotUtf8)?;

    let resolution_match = Resolution::new(
        BigEndian::read_u16(&block[OFF_RES_H..]),
        BigEndian::read_u16(&block[OFF_RES_V..]),
    );
    if block_kind == BlockKind::BasicInit && (resolution_match.h == 0 || resolution_match.v == 0) {
        return Err(FormatError::MissingResolution.into());
    }

    let header = DataBlockHeader {
        crc32: stored,
        declared_size: declared,
        version,
        control_flags: BigEndian::read_u32(&block[OFF_CONTROL..]),
        chip_id_match: BigEndian::read_u16(&block[OFF_CHIP..]),
        resolution_match,
        block_kind,
        name: String::from(name),
    };

    Ok((header, &block[HEADER_SIZE..]))
}

// ============================================================================
// ENCODE
// ============================================================================

/// Length of an encoded block including alignment padding
pub const fn encoded_len(payload_len: usize) -> usize {
    let len = HEADER_SIZE + payload_len;
    (len + BLOCK_ALIGN - 1) & !(BLOCK_ALIGN - 1)
}

/// Serialize a block with a freshly computed checksum.
///
/// `header.crc32` and `header.declared_size` are ignored and derived from
/// `payload`. Use [`seal`] to also get the resulting header back.
pub fn encode(header: &DataBlockHeader, payload: &[u8]) -> Result<Vec<u8>, FormatError> {
    let declared = HEADER_SIZE + payload.len();
    if declared > u32::MAX as usize {
        return Err(FormatError::SizeOutOfRange {
            declared: u32::MAX,
            available: declared,
        });
    }

    let mut out = vec![0u8; encoded_len(payload.len())];
    header.write_fields(&mut out, declared as u32)?;
    out[HEADER_SIZE..declared].copy_from_slice(payload);

    let crc = crc32(&out[OFF_SIZE..declared]);
    BigEndian::write_u32(&mut out[OFF_CRC..], crc);
    Ok(out)
}

/// Encode and return the header as a decoder would see it
pub fn seal(header: &DataBlockHeader, payload: &[u8]) -> Result<(DataBlockHeader, Vec<u8>), FormatError> {
    let bytes = encode(header, payload)?;
    let mut sealed = header.clone();
    sealed.declared_size = (HEADER_SIZE + payload.len()) as u32;
    sealed.crc32 = BigEndian::read_u32(&bytes[OFF_CRC..]);
    Ok((sealed, bytes))
}

/// Replace a block's payload through a pure transform.
///
/// `transform` sees the verified header and payload and returns the new
/// payload, or `None` to leave the block untouched. A rewritten block is
/// always re-encoded, so its checksum can never go stale. `extra_flags` are
/// OR-ed into the control flags of the rewritten header.
pub fn rewrite<F>(raw: &[u8], extra_flags: u32, transform: F) -> DecodeResult<Option<Vec<u8>>>
where
    F: FnOnce(&DataBlockHeader, &[u8]) -> Option<Vec<u8>>,
{
    let (header, payload) = decode(raw)?;
    match transform(&header, payload) {
        Some(new_payload) => {
            let header = header.with_flags(extra_flags);
            Ok(Some(encode(&header, &new_payload)?))
        }
        None => Ok(None),
    }
}

/// Recompute the stored checksum of a block edited in place.
///
/// Only the size/format checks run; the old checksum is overwritten.
/// Returns the new checksum.
pub fn regenerate_crc(raw: &mut [u8]) -> Result<u32, FormatError> {
    if raw.len() < HEADER_SIZE {
        return Err(FormatError::TooShort { len: raw.len() });
    }
    let declared = BigEndian::read_u32(&raw[OFF_SIZE..]) as usize;
    if declared < HEADER_SIZE || declared > raw.len() {
        return Err(FormatError::SizeOutOfRange {
            declared: declared as u32,
            available: raw.len(),
        });
    }
    let crc = crc32(&raw[OFF_SIZE..declared]);
    BigEndian::write_u32(&mut raw[OFF_CRC..], crc);
    Ok(crc)
}

// ============================================================================
// TESTS
// ============================================================================
