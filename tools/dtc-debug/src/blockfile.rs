//! Configuration block and manifest files
//!
//! Pack, inspect and repair the binary images the resource manager reads
//! from the key-value store.

use anyhow::{Context, Result};
use colored::Colorize;

use dtc_resmgr::block::{self, ctrl, BlockKind, DataBlockHeader, DecodeError};
use dtc_resmgr::manifest::{Manifest, ManifestEntry};
use dtc_resmgr::{ChipFamily, Resolution};

use crate::error::ToolError;
use crate::report;

/// Payload bytes shown by `--dump`
const DUMP_LIMIT: usize = 256;

pub fn parse_kind(text: &str) -> Result<BlockKind, ToolError> {
    let normalized = text.to_ascii_lowercase().replace('_', "-");
    BlockKind::from_name(&normalized).ok_or_else(|| ToolError::UnknownKind(text.to_string()))
}

/// Parse `INDEX:KIND:NAME[:optional][:secure]`
pub fn parse_entry(text: &str) -> Result<ManifestEntry, ToolError> {
    let bad = || ToolError::BadEntry(text.to_string());
    let mut parts = text.split(':');
    let index = parts.next().and_then(|s| s.parse::<u16>().ok()).ok_or_else(bad)?;
    let kind = parse_kind(parts.next().ok_or_else(bad)?)?;
    let name = parts.next().filter(|s| !s.is_empty()).ok_or_else(bad)?;

    let mut entry = ManifestEntry::new(index, kind, name);
    for flag in parts {
        entry = match flag {
            "optional" => entry.optional(),
            "secure" => entry.secure(),
            _ => return Err(bad()),
        };
    }
    Ok(entry)
}

/// What goes into a packed block
#[derive(Debug, Clone)]
pub struct PackOptions {
    pub kind: BlockKind,
    pub name: String,
    pub chip: Option<ChipFamily>,
    pub resolution: Resolution,
    pub secure: bool,
    pub optional: bool,
}

impl PackOptions {
    pub fn header(&self) -> DataBlockHeader {
        let mut flags = 0;
        if self.secure {
            flags |= ctrl::SECURE;
        }
        if self.optional {
            flags |= ctrl::OPTIONAL;
        }
        let header = DataBlockHeader::new(self.kind, &self.name)
            .with_flags(flags)
            .with_resolution(self.resolution);
        match self.chip {
            Some(family) => header.with_chip(family),
            None => header,
        }
    }
}

pub fn pack_block(opts: &PackOptions, payload: &[u8]) -> Result<Vec<u8>> {
    block::encode(&opts.header(), payload)
        .with_context(|| format!("Failed to encode block '{}'", opts.name))
}

/// Print a block report. Returns whether the block verified.
pub fn inspect_block(raw: &[u8], dump: bool) -> bool {
    println!(
        "{} {} bytes, {} aligned",
        "[*]".cyan().bold(),
        raw.len(),
        if raw.len() % block::BLOCK_ALIGN == 0 { "16-byte" } else { "not" }
    );

    match block::decode(raw) {
        Ok((header, payload)) => {
            report::print_header(&header);
            if dump && !payload.is_empty() {
                let shown = payload.len().min(DUMP_LIMIT);
                println!("\n{} (first {} bytes)", "Payload:".white().bold(), shown);
                hexdump::hexdump(&payload[..shown]);
            }
            println!("\n{} Block verified", "[OK]".green().bold());
            true
        }
        Err(DecodeError::Integrity(e)) => {
            println!(
                "{} CRC mismatch: stored {:#010x}, computed {:#010x}",
                "[ERROR]".red().bold(),
                e.stored,
                e.computed
            );
            println!(
                "  Use {} after an intentional edit",
                "dtc-debug block fix-crc".cyan()
            );
            false
        }
        Err(DecodeError::Format(e)) => {
            println!("{} {}", "[ERROR]".red().bold(), e);
            false
        }
    }
}

/// Recompute the stored checksum in place. Returns `(old, new)`.
pub fn fix_crc(raw: &mut [u8]) -> Result<(u32, u32)> {
    let old = raw
        .get(..4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .unwrap_or(0);
    let new = block::regenerate_crc(raw).context("Block header is not repairable")?;
    Ok((old, new))
}

pub fn pack_manifest(version: u32, entries: &[String]) -> Result<Vec<u8>> {
    let entries = entries
        .iter()
        .map(|e| parse_entry(e))
        .collect::<Result<Vec<_>, _>>()?;
    let manifest = Manifest::new(version, entries).context("Invalid manifest")?;
    Ok(manifest.encode()?)
}

pub fn inspect_manifest(raw: &[u8]) -> Result<Manifest> {
    let manifest = Manifest::decode(raw).context("Manifest failed verification")?;
    report::print_manifest(&manifest);
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_opts() -> PackOptions {
        PackOptions {
            kind: BlockKind::BasicInit,
            name: "basic_init".to_string(),
            chip: Some(ChipFamily::T3),
            resolution: Resolution::new(3840, 2160),
            secure: false,
            optional: false,
        }
    }

    #[test]
    fn test_parse_entry() {
        let e = parse_entry("2:demura_lut:demura:optional:secure").unwrap();
        assert_eq!(e.index, 2);
        assert_eq!(e.kind, BlockKind::DemuraLut);
        assert!(e.is_optional() && e.is_secure());

        assert!(parse_entry("0:basic-init:").is_err());
        assert!(parse_entry("x:vac:vac").is_err());
        assert!(parse_entry("1:vac:vac:sometimes").is_err());
        assert!(matches!(parse_entry("1:gamma:g"), Err(ToolError::UnknownKind(_))));
    }

    #[test]
    fn test_packed_block_verifies() {
        let raw = pack_block(&init_opts(), &[1, 2, 3, 4, 5]).unwrap();
        assert_eq!(raw.len() % block::BLOCK_ALIGN, 0);
        assert!(inspect_block(&raw, true));

        let (header, payload) = block::decode(&raw).unwrap();
        assert_eq!(header.chip_id_match, ChipFamily::T3.code());
        assert_eq!(payload, &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_fix_crc_repairs_edit() {
        let mut raw = pack_block(&init_opts(), &[0xAA; 32]).unwrap();
        raw[block::HEADER_SIZE] = 0x55;
        assert!(!inspect_block(&raw, false));

        let (old, new) = fix_crc(&mut raw).unwrap();
        assert_ne!(old, new);
        assert!(inspect_block(&raw, false));
    }

    #[test]
    fn test_basic_init_needs_resolution_to_verify() {
        let mut opts = init_opts();
        opts.resolution = Resolution::ANY;
        let raw = pack_block(&opts, &[0; 8]).unwrap();
        assert!(!inspect_block(&raw, false));
    }

    #[test]
    fn test_manifest_pack_and_inspect() {
        let raw = pack_manifest(
            1,
            &["1:od-lut:od_lut:secure".to_string(), "0:basic-init:basic_init".to_string()],
        )
        .unwrap();
        let manifest = inspect_manifest(&raw).unwrap();
        assert_eq!(manifest.block_count(), 2);
        assert_eq!(manifest.entries[0].kind, BlockKind::BasicInit);

        assert!(pack_manifest(1, &["0:vac:vac".to_string()]).is_err());
    }
}
