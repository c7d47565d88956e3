//! Platform profiles for layout planning
//!
//! Built-in profiles are generated from the firmware's own tables so the
//! tool never drifts from what the resource manager plans on target.
//! Custom profiles come from TOML files (`--table`).

pub mod profile;

pub use profile::PlatformProfile;

use std::collections::HashMap;
use std::path::Path;

use anyhow::Result;
use once_cell::sync::Lazy;

use dtc_resmgr::platform::builtin;
use dtc_resmgr::ChipFamily;

use crate::error::ToolError;

fn describe(family: ChipFamily) -> &'static str {
    match family {
        ChipFamily::Tl1 => "TL1 TV SoC, overdrive only",
        ChipFamily::T5 => "T5 TV SoC, overdrive with optional demura",
        ChipFamily::T5d => "T5D TV SoC, overdrive only",
        ChipFamily::T3 => "T3 TV SoC, overdrive, demura and line overdrive",
        ChipFamily::T5w => "T5W TV SoC, overdrive with optional demura",
        ChipFamily::T3x => "T3X TV SoC, overdrive, demura and line overdrive",
        ChipFamily::Txhd2 => "TXHD2 TV SoC, overdrive only",
    }
}

/// Registry of built-in platform profiles
pub static PLATFORM_PROFILES: Lazy<HashMap<&'static str, PlatformProfile>> = Lazy::new(|| {
    let mut m = HashMap::new();
    for family in ChipFamily::ALL {
        let profile = PlatformProfile::from_builtin(&builtin(family), describe(family));
        m.insert(family.name(), profile);
    }
    // Hyphenated spelling used in board names
    if let Some(profile) = m.get("t5w").cloned() {
        m.insert("t5-w", profile);
    }
    m
});

/// Get a built-in profile by name
pub fn get_platform(name: &str) -> Option<&'static PlatformProfile> {
    PLATFORM_PROFILES.get(name.to_lowercase().as_str())
}

/// Built-in profile names, in chip-id order (aliases excluded)
pub fn platform_names() -> Vec<&'static str> {
    ChipFamily::ALL.iter().map(|f| f.name()).collect()
}

/// Resolve `--platform` / `--table` into a profile; a table file wins
pub fn resolve(platform: Option<&str>, table: Option<&Path>) -> Result<PlatformProfile> {
    if let Some(path) = table {
        return PlatformProfile::load(path);
    }
    let name = platform.ok_or(ToolError::NoPlatform)?;
    get_platform(name)
        .cloned()
        .ok_or_else(|| ToolError::UnknownPlatform(name.to_string()).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_matches_firmware_tables() {
        for name in platform_names() {
            let profile = get_platform(name).unwrap();
            let family = profile.family().unwrap();
            assert_eq!(profile.table().unwrap(), builtin(family).table);
        }
    }

    #[test]
    fn test_lookup_is_case_insensitive_with_aliases() {
        assert_eq!(get_platform("T3").unwrap().family, "t3");
        assert_eq!(get_platform("T5-W").unwrap().family, "t5w");
        assert!(get_platform("t7").is_none());
    }

    #[test]
    fn test_resolve_requires_a_source() {
        assert!(resolve(None, None).is_err());
        assert!(resolve(Some("nope"), None).is_err());
        assert_eq!(resolve(Some("tl1"), None).unwrap().name, "tl1");
    }
}
