//! Human-readable reports and command-line value parsing

use colored::Colorize;

use dtc_resmgr::block::{ctrl, DataBlockHeader};
use dtc_resmgr::context::{Diagnostics, DtcState};
use dtc_resmgr::layout::Layout;
use dtc_resmgr::manifest::Manifest;
use dtc_resmgr::{ChipFamily, Resolution};

use crate::error::ToolError;

// ============================================================================
// PARSING
// ============================================================================

/// Parse a size: decimal, `0x` hex, or a `K`/`M` suffix (binary units)
pub fn parse_size(text: &str) -> Result<u64, ToolError> {
    let bad = || ToolError::BadSize(text.to_string());
    let t = text.trim();
    let upper = t.to_ascii_uppercase();

    let (digits, scale) = if let Some(n) = upper.strip_suffix('K') {
        (n, 1024)
    } else if let Some(n) = upper.strip_suffix('M') {
        (n, 1024 * 1024)
    } else {
        (upper.as_str(), 1)
    };

    let value = if let Some(hex) = digits.strip_prefix("0X") {
        u64::from_str_radix(hex, 16).map_err(|_| bad())?
    } else {
        digits.parse::<u64>().map_err(|_| bad())?
    };
    value.checked_mul(scale).ok_or_else(bad)
}

/// Parse a size that must fit the 32-bit size fields
pub fn parse_size32(text: &str) -> Result<u32, ToolError> {
    let value = parse_size(text)?;
    u32::try_from(value).map_err(|_| ToolError::BadSize(text.to_string()))
}

/// Parse `1920x1080` or `any`
pub fn parse_resolution(text: &str) -> Result<Resolution, ToolError> {
    if text.eq_ignore_ascii_case("any") {
        return Ok(Resolution::ANY);
    }
    let bad = || ToolError::BadResolution(text.to_string());
    let (h, v) = text.split_once(['x', 'X']).ok_or_else(bad)?;
    Ok(Resolution::new(
        h.trim().parse().map_err(|_| bad())?,
        v.trim().parse().map_err(|_| bad())?,
    ))
}

/// Format a size in human-readable form
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;

    if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

pub fn banner(title: &str) {
    println!("{}", "=".repeat(70));
    println!("{}", title.cyan().bold());
    println!("{}", "=".repeat(70));
}

fn chip_name(code: u16) -> String {
    match code {
        0 => "any".to_string(),
        c => ChipFamily::from_code(c)
            .map(|f| f.name().to_string())
            .unwrap_or_else(|| format!("{:#06x}", c)),
    }
}

fn flag_names(flags: u32) -> String {
    let mut names = Vec::new();
    if flags & ctrl::SECURE != 0 {
        names.push("secure");
    }
    if flags & ctrl::OPTIONAL != 0 {
        names.push("optional");
    }
    if flags & ctrl::PREPROCESSED != 0 {
        names.push("preprocessed");
    }
    if names.is_empty() {
        "none".to_string()
    } else {
        names.join(", ")
    }
}

// ============================================================================
// REPORTS
// ============================================================================

pub fn print_header(header: &DataBlockHeader) {
    println!("\n{}", "Block Header:".white().bold());
    println!("  Name: {}", header.name);
    println!("  Kind: {}", header.block_kind.name());
    println!("  Version: {}", header.version);
    println!("  CRC32: {:#010x}", header.crc32);
    println!(
        "  Declared size: {} ({} payload)",
        header.declared_size,
        format_size(header.payload_len() as u64)
    );
    println!("  Flags: {}", flag_names(header.control_flags));
    println!("  Chip: {}", chip_name(header.chip_id_match));
    println!("  Resolution: {}", header.resolution_match);
}

pub fn print_layout(layout: &Layout) {
    println!("\n{}", "Regions:".white().bold());
    for region in &layout.regions {
        println!(
            "  {:#012x}-{:#012x}  {:<14} {}",
            region.physical_base,
            region.end(),
            region.name,
            format_size(region.size as u64).dimmed()
        );
    }

    println!("\n{}", "Working Buffer Banks:".white().bold());
    for bank in &layout.banks {
        let status = if bank.valid {
            "[OK]".green()
        } else {
            "[DROPPED]".yellow()
        };
        let role = if bank.mandatory { "mandatory" } else { "optional" };
        println!(
            "  {} {:<10} {:>10}  {}",
            status,
            bank.mem_type.name(),
            format_size(bank.size as u64),
            role.dimmed()
        );
    }

    println!(
        "\n  Policy: {}   Used: {} of {}",
        layout.policy.name().cyan(),
        format_size(layout.used_size()),
        format_size(layout.reserved.size as u64)
    );
}

pub fn print_manifest(manifest: &Manifest) {
    println!("\n{}", "Manifest:".white().bold());
    println!(
        "  Version: {} ({} layout)",
        manifest.version,
        manifest.policy().name()
    );
    println!("  Blocks: {}", manifest.block_count());
    for entry in &manifest.entries {
        let role = if entry.is_optional() {
            "[optional]".dimmed()
        } else {
            "[required]".red()
        };
        let secure = if entry.is_secure() { " secure" } else { "" };
        println!(
            "  {:>3} {} {:<11} {}{}",
            entry.index,
            role,
            entry.kind.name(),
            entry.name,
            secure.cyan()
        );
    }
}

pub fn print_diagnostics(diag: &Diagnostics) {
    banner(&format!(
        "DTC Session: {} rev {} ({})",
        diag.chip.family.name(),
        diag.chip.revision,
        diag.panel
    ));

    let state = match diag.state {
        DtcState::Ready => diag.state.name().green(),
        DtcState::Released => diag.state.name().cyan(),
        DtcState::Disabled(_) => diag.state.name().red(),
        DtcState::Uninit => diag.state.name().yellow(),
    };
    println!("\n  State: {}", state);
    if let DtcState::Disabled(cause) = diag.state {
        println!("  Cause: {:?}", cause);
    }
    println!(
        "  Reserved: {:#x} ({})",
        diag.reserved.base,
        format_size(diag.reserved.size as u64)
    );
    if let Some(version) = diag.manifest_version {
        println!("  Manifest version: {}", version);
    }

    if !diag.regions.is_empty() {
        println!("\n{}", "Regions:".white().bold());
        for region in &diag.regions {
            println!(
                "  {:#012x}  {:<14} {}",
                region.physical_base,
                region.name,
                format_size(region.size as u64).dimmed()
            );
        }
        for bank in diag.banks.iter().filter(|b| !b.valid) {
            println!(
                "  {} {} bank dropped",
                "[DROPPED]".yellow(),
                bank.mem_type.name()
            );
        }
    }

    if let Some(c) = &diag.completion {
        println!("\n{}", "Completion:".white().bold());
        let complete = if c.complete { "yes".green() } else { "no".red() };
        println!(
            "  Complete: {}  ({} of {} arrived, {} waived)",
            complete,
            c.arrived_count(),
            c.expected_block_count,
            c.waived_bitmask.count_ones()
        );
        let missing: Vec<String> = c.missing().map(|i| i.to_string()).collect();
        if !missing.is_empty() {
            println!("  Outstanding: {}", missing.join(", ").red());
        }
    }

    if !diag.blocks.is_empty() {
        println!("\n{}", "Loaded Blocks:".white().bold());
        for b in &diag.blocks {
            let place = match (b.target, b.staged) {
                (Some(name), _) => name.to_string(),
                (None, Some((addr, _))) => format!("staging @ {:#x}", addr),
                (None, None) => "-".to_string(),
            };
            let retries = if b.attempts > 1 {
                format!(" ({} attempts)", b.attempts).yellow()
            } else {
                "".normal()
            };
            let pre = if b.preprocessed { " preprocessed" } else { "" };
            println!(
                "  {:>3} {:<11} {:<16} {:>10} -> {}{}{}",
                b.index,
                b.kind.name(),
                b.name,
                format_size(b.payload_len as u64),
                place,
                retries,
                pre.dimmed()
            );
        }
    }

    if !diag.protection.is_empty() {
        println!("\n{}", "Protection:".white().bold());
        for r in &diag.protection {
            let status = if r.protected {
                "[PROTECTED]".green()
            } else {
                "[OPEN]".yellow()
            };
            let error = r
                .last_error
                .map(|e| format!("  last error: {}", e))
                .unwrap_or_default();
            println!(
                "  {} {:<12} handle {:#x}{}",
                status,
                r.region.name,
                r.handle.0,
                error.red()
            );
        }
    }

    println!("\n{}", "Reason Codes:".white().bold());
    if diag.reasons.is_empty() {
        println!("  {}", "none".dimmed());
    }
    for r in &diag.reasons {
        let block = r.block.map(|b| format!(" block {}", b)).unwrap_or_default();
        println!(
            "  {:#04x} {}{} detail {:#x}",
            r.code.code(),
            r.code.name().yellow(),
            block,
            r.detail
        );
    }
    if diag.reasons_dropped > 0 {
        println!("  ... {} more not recorded", diag.reasons_dropped);
    }

    println!("\n{}", "=".repeat(70));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size("0x1000").unwrap(), 0x1000);
        assert_eq!(parse_size("512K").unwrap(), 512 * 1024);
        assert_eq!(parse_size("16m").unwrap(), 16 * 1024 * 1024);
        assert_eq!(parse_size("0x10M").unwrap(), 16 * 1024 * 1024);
        assert!(parse_size("lots").is_err());
        assert!(parse_size32("8192M").is_err());
    }

    #[test]
    fn test_parse_resolution() {
        assert_eq!(parse_resolution("1920x1080").unwrap(), Resolution::new(1920, 1080));
        assert_eq!(parse_resolution("ANY").unwrap(), Resolution::ANY);
        assert!(parse_resolution("1920").is_err());
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 bytes");
        assert_eq!(format_size(1536), "1.50 KB");
        assert_eq!(format_size(1048576), "1.00 MB");
    }

    #[test]
    fn test_flag_names() {
        assert_eq!(flag_names(0), "none");
        assert_eq!(flag_names(ctrl::SECURE | ctrl::OPTIONAL), "secure, optional");
    }
}
