//! Platform profile definitions
//!
//! A profile is the host-side, serializable form of a chip family's region
//! size table. Built-in profiles mirror the firmware tables; custom ones are
//! loaded from TOML so a new board can be planned without rebuilding.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};

use dtc_resmgr::layout::{BankSpec, RegionSizeTable};
use dtc_resmgr::platform::{Platform, SECURE_STATUS_SIZE};
use dtc_resmgr::region::BankType;
use dtc_resmgr::{ChipFamily, ChipId, CoreFlags};

use crate::error::ToolError;
use crate::report::parse_size32;

/// Size field: integer bytes or a string such as `"8M"` or `"0x1000"`
#[derive(Deserialize)]
#[serde(untagged)]
enum SizeRepr {
    Bytes(u32),
    Text(String),
}

fn de_size<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    match SizeRepr::deserialize(deserializer)? {
        SizeRepr::Bytes(n) => Ok(n),
        SizeRepr::Text(s) => parse_size32(&s).map_err(serde::de::Error::custom),
    }
}

fn default_revision() -> u8 {
    1
}

fn default_status_size() -> u32 {
    SECURE_STATUS_SIZE
}

/// One working buffer bank
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BankProfile {
    /// Bank type ("overdrive", "demura", "lod")
    #[serde(rename = "type")]
    pub mem_type: String,
    #[serde(deserialize_with = "de_size")]
    pub size: u32,
    /// Mandatory banks must fit or planning fails
    #[serde(default)]
    pub mandatory: bool,
}

/// Complete platform profile
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformProfile {
    /// Profile name
    pub name: String,
    /// Chip family ("tl1", "t5", ...)
    pub family: String,
    #[serde(default)]
    pub description: String,
    /// Silicon revision (0 = revision A)
    #[serde(default = "default_revision")]
    pub revision: u8,
    /// Cores present ("od", "demura", "lod", "acc")
    #[serde(default)]
    pub cores: Vec<String>,
    /// Reserved memory the bootloader grants
    #[serde(deserialize_with = "de_size")]
    pub reserved_size: u32,
    #[serde(deserialize_with = "de_size")]
    pub staging_size: u32,
    #[serde(default = "default_status_size", deserialize_with = "de_size")]
    pub secure_status_size: u32,
    #[serde(default)]
    pub banks: Vec<BankProfile>,
}

const CORE_NAMES: [(&str, CoreFlags); 4] = [
    ("od", CoreFlags::OD),
    ("demura", CoreFlags::DEMURA),
    ("lod", CoreFlags::LOD),
    ("acc", CoreFlags::ACC),
];

impl PlatformProfile {
    /// Profile of a built-in firmware table
    pub fn from_builtin(platform: &Platform, description: &str) -> Self {
        let cores = CORE_NAMES
            .iter()
            .filter(|(_, flag)| platform.cores.contains(*flag))
            .map(|(name, _)| name.to_string())
            .collect();

        Self {
            name: platform.family.name().to_string(),
            family: platform.family.name().to_string(),
            description: description.to_string(),
            revision: default_revision(),
            cores,
            reserved_size: platform.reserved_size,
            staging_size: platform.table.staging_size,
            secure_status_size: platform.table.secure_status_size,
            banks: platform
                .table
                .banks
                .iter()
                .map(|b| BankProfile {
                    mem_type: b.mem_type.name().to_string(),
                    size: b.size,
                    mandatory: b.mandatory,
                })
                .collect(),
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Load a custom profile from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read platform table {}", path.display()))?;
        let profile = Self::from_toml_str(&text).map_err(|e| ToolError::BadTable {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        // Surface bad names now rather than at first use
        profile.chip()?;
        profile.table()?;
        Ok(profile)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize platform profile")
    }

    pub fn family(&self) -> Result<ChipFamily, ToolError> {
        ChipFamily::from_name(&self.family).ok_or_else(|| ToolError::UnknownPlatform(self.family.clone()))
    }

    pub fn core_flags(&self) -> Result<CoreFlags, ToolError> {
        self.cores.iter().try_fold(CoreFlags::empty(), |acc, name| {
            CORE_NAMES
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case(name))
                .map(|(_, flag)| acc.union(*flag))
                .ok_or_else(|| ToolError::UnknownCore(name.clone()))
        })
    }

    pub fn chip(&self) -> Result<ChipId, ToolError> {
        Ok(ChipId::new(self.family()?, self.revision, self.core_flags()?))
    }

    /// Region size table handed to the layout planner
    pub fn table(&self) -> Result<RegionSizeTable, ToolError> {
        let banks = self
            .banks
            .iter()
            .map(|b| {
                let mem_type = BankType::from_name(&b.mem_type.to_ascii_lowercase())
                    .ok_or_else(|| ToolError::UnknownBank(b.mem_type.clone()))?;
                Ok(if b.mandatory {
                    BankSpec::mandatory(mem_type, b.size)
                } else {
                    BankSpec::optional(mem_type, b.size)
                })
            })
            .collect::<Result<Vec<_>, ToolError>>()?;

        Ok(RegionSizeTable {
            banks,
            staging_size: self.staging_size,
            secure_status_size: self.secure_status_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dtc_resmgr::platform::builtin;

    const CUSTOM: &str = r#"
name = "bench-board"
family = "t3"
revision = 0
cores = ["od", "demura"]
reserved_size = "16M"
staging_size = 0x180000

[[banks]]
type = "overdrive"
size = "8M"
mandatory = true

[[banks]]
type = "demura"
size = 1048576
"#;

    #[test]
    fn test_custom_profile_sizes_and_defaults() {
        let profile = PlatformProfile::from_toml_str(CUSTOM).unwrap();
        assert_eq!(profile.reserved_size, 16 * 1024 * 1024);
        assert_eq!(profile.staging_size, 0x18_0000);
        assert_eq!(profile.secure_status_size, SECURE_STATUS_SIZE);

        let chip = profile.chip().unwrap();
        assert_eq!(chip.family, ChipFamily::T3);
        assert_eq!(chip.revision, 0);
        assert!(chip.cores.contains(CoreFlags::DEMURA));
        assert!(!chip.cores.contains(CoreFlags::LOD));

        let table = profile.table().unwrap();
        assert_eq!(table.banks.len(), 2);
        assert!(table.banks[0].mandatory);
        assert!(!table.banks[1].mandatory);
    }

    #[test]
    fn test_builtin_profile_survives_toml() {
        let platform = builtin(ChipFamily::T3x);
        let profile = PlatformProfile::from_builtin(&platform, "test");
        let text = profile.to_toml().unwrap();
        let back = PlatformProfile::from_toml_str(&text).unwrap();
        assert_eq!(back.table().unwrap(), platform.table);
        assert_eq!(back.core_flags().unwrap(), platform.cores);
    }

    #[test]
    fn test_rejects_unknown_names() {
        let mut profile = PlatformProfile::from_toml_str(CUSTOM).unwrap();
        profile.banks[1].mem_type = "sharpness".to_string();
        assert!(matches!(profile.table(), Err(ToolError::UnknownBank(_))));

        profile.cores.push("gpu".to_string());
        assert!(matches!(profile.chip(), Err(ToolError::UnknownCore(_))));
    }

    #[test]
    fn test_load_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "name = 3").unwrap();
        let err = PlatformProfile::load(&path).unwrap_err();
        assert!(err.to_string().contains("broken.toml"));
    }
}
