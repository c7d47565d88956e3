//! Tool-specific errors
//!
//! Library errors pass through `anyhow` unchanged; these cover what the tool
//! itself rejects.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown platform '{0}'. Use 'dtc-debug platforms list' to see available platforms")]
    UnknownPlatform(String),

    #[error("either --platform or --table is required")]
    NoPlatform,

    #[error("invalid size '{0}': expected decimal, 0x hex, or a K/M suffix")]
    BadSize(String),

    #[error("invalid resolution '{0}': expected WIDTHxHEIGHT or 'any'")]
    BadResolution(String),

    #[error("unknown bank type '{0}' (overdrive, demura, lod)")]
    UnknownBank(String),

    #[error("unknown core '{0}' (od, demura, lod, acc)")]
    UnknownCore(String),

    #[error("unknown block kind '{0}'")]
    UnknownKind(String),

    #[error("invalid manifest entry '{0}': expected INDEX:KIND:NAME[:optional][:secure]")]
    BadEntry(String),

    #[error("invalid platform table {path}: {reason}")]
    BadTable { path: String, reason: String },

    #[error("invalid --corrupt '{0}': expected KEY=COUNT")]
    BadCorrupt(String),
}
