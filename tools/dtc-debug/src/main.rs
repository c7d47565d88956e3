//! DTC Debug Tools
//!
//! Host-side toolkit for the display timing controller resource manager:
//! plan reserved-memory layouts, build and check configuration blocks, and
//! run a full load/protect/gate session against a directory of block files.
//!
//! # Usage
//!
//! ```bash
//! # List built-in platforms
//! dtc-debug platforms list
//!
//! # Plan the layout of a 12 MB reservation on T5
//! dtc-debug layout plan --platform t5 --size 12M
//!
//! # Pack and inspect a block
//! dtc-debug block pack --kind od-lut --name od_lut --payload od.raw -o od_lut.bin --secure
//! dtc-debug block inspect od_lut.bin --dump
//!
//! # Build a manifest
//! dtc-debug manifest pack -o dtc_manifest.bin 0:basic-init:basic_init 1:od-lut:od_lut:secure
//!
//! # Generate a sample configuration set and run it
//! dtc-debug generate store ./cfg --platform t3 --panel 3840x2160
//! dtc-debug session run ./cfg --platform t3 --panel 3840x2160 --corrupt od_lut=1
//! ```

mod blockfile;
mod error;
mod platforms;
mod report;
mod session;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;

use dtc_resmgr::layout::{self, LayoutPolicy};
use dtc_resmgr::ReservedMemory;

use blockfile::PackOptions;
use error::ToolError;
use platforms::{get_platform, platform_names, PlatformProfile};
use report::{parse_resolution, parse_size, parse_size32};
use session::{DirStore, SessionOptions};

/// Default physical base used when none is given
const DEFAULT_BASE: &str = "0x70000000";

/// DTC Debug Tools
///
/// Diagnostic toolkit for display timing controller configuration
#[derive(Parser)]
#[command(name = "dtc-debug")]
#[command(author = "Prasanna Gautam")]
#[command(version = "0.1.0")]
#[command(about = "Layout planner, block toolkit and session runner for the DTC resource manager")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Built-in platform tables
    #[command(subcommand)]
    Platforms(PlatformCommands),

    /// Reserved-memory layout planning
    #[command(subcommand)]
    Layout(LayoutCommands),

    /// Configuration block files
    #[command(subcommand)]
    Block(BlockCommands),

    /// Staging manifest files
    #[command(subcommand)]
    Manifest(ManifestCommands),

    /// Run the resource manager against a block directory
    #[command(subcommand)]
    Session(SessionCommands),

    /// Generate platform tables and sample configuration sets
    #[command(subcommand)]
    Generate(GenerateCommands),
}

#[derive(Subcommand)]
enum PlatformCommands {
    /// List all built-in platforms
    List,

    /// Show the region size table of a platform
    Show {
        /// Platform name (e.g., t5, t3, t3x)
        platform: String,
    },
}

#[derive(Subcommand)]
enum LayoutCommands {
    /// Plan regions for a reservation
    Plan {
        /// Built-in platform
        #[arg(short, long)]
        platform: Option<String>,

        /// Custom platform table (TOML), overrides --platform
        #[arg(short, long)]
        table: Option<PathBuf>,

        /// Reservation size (default: the platform's)
        #[arg(short, long)]
        size: Option<String>,

        /// Physical base address
        #[arg(short, long, default_value = DEFAULT_BASE)]
        base: String,

        /// Manifest version (0 selects the legacy fixed layout)
        #[arg(long, default_value_t = 1)]
        manifest_version: u32,
    },
}

#[derive(Subcommand)]
enum BlockCommands {
    /// Verify a block file and show its header
    Inspect {
        path: PathBuf,

        /// Hex dump the start of the payload
        #[arg(short, long)]
        dump: bool,
    },

    /// Build a block from a raw payload
    Pack {
        /// Block kind (basic-init, vac, demura-set, demura-lut, acc-lut, od-lut, lod-lut)
        #[arg(short, long)]
        kind: String,

        /// Block name stored in the header
        #[arg(short, long)]
        name: String,

        /// Raw payload file
        #[arg(short, long)]
        payload: PathBuf,

        /// Output path
        #[arg(short, long)]
        output: PathBuf,

        /// Restrict to one chip family
        #[arg(short, long)]
        chip: Option<String>,

        /// Panel resolution key (WIDTHxHEIGHT or any)
        #[arg(short, long, default_value = "any")]
        resolution: String,

        /// Destination bank must be protected
        #[arg(long)]
        secure: bool,

        /// Block may be waived
        #[arg(long)]
        optional: bool,
    },

    /// Recompute the checksum after an intentional edit
    FixCrc { path: PathBuf },
}

#[derive(Subcommand)]
enum ManifestCommands {
    /// Verify a manifest file and list its entries
    Inspect { path: PathBuf },

    /// Build a manifest from INDEX:KIND:NAME[:optional][:secure] entries
    Pack {
        #[arg(required = true)]
        entries: Vec<String>,

        /// Manifest version (0 = legacy layout)
        #[arg(long, default_value_t = 1)]
        manifest_version: u32,

        /// Output path
        #[arg(short, long)]
        output: PathBuf,
    },
}

#[derive(Subcommand)]
enum SessionCommands {
    /// Init, load, protect and gate a configuration set
    Run {
        /// Directory holding <key>.bin files
        dir: PathBuf,

        /// Built-in platform
        #[arg(short, long)]
        platform: Option<String>,

        /// Custom platform table (TOML), overrides --platform
        #[arg(short, long)]
        table: Option<PathBuf>,

        /// Silicon revision (overrides the profile)
        #[arg(long)]
        revision: Option<u8>,

        /// Panel resolution
        #[arg(long, default_value = "3840x2160")]
        panel: String,

        /// Reservation size (default: the platform's)
        #[arg(short, long)]
        size: Option<String>,

        /// Physical base address
        #[arg(short, long, default_value = DEFAULT_BASE)]
        base: String,

        /// Simulate a system without a TEE
        #[arg(long)]
        no_tee: bool,

        /// TEE rejects this many protect requests
        #[arg(long, default_value_t = 0)]
        fail_protect: u32,

        /// Corrupt reads of a key: KEY=COUNT (repeatable)
        #[arg(long)]
        corrupt: Vec<String>,

        /// Reload one block by manifest index after protection
        #[arg(long)]
        reload: Option<u16>,

        /// Release the reservation at the end
        #[arg(long)]
        release: bool,
    },
}

#[derive(Subcommand)]
enum GenerateCommands {
    /// Write a platform table as TOML
    Table {
        /// Built-in platform to start from
        #[arg(short, long, default_value = "t5")]
        platform: String,

        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Write a complete sample configuration set
    Store {
        /// Output directory
        dir: PathBuf,

        /// Built-in platform
        #[arg(short, long)]
        platform: Option<String>,

        /// Custom platform table (TOML), overrides --platform
        #[arg(short, long)]
        table: Option<PathBuf>,

        /// Panel resolution of the basic-init block
        #[arg(long, default_value = "3840x2160")]
        panel: String,

        /// Manifest version (0 = legacy layout)
        #[arg(long, default_value_t = 1)]
        manifest_version: u32,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match cli.command {
        Commands::Platforms(cmd) => handle_platforms(cmd),
        Commands::Layout(cmd) => handle_layout(cmd),
        Commands::Block(cmd) => handle_block(cmd),
        Commands::Manifest(cmd) => handle_manifest(cmd),
        Commands::Session(cmd) => handle_session(cmd),
        Commands::Generate(cmd) => handle_generate(cmd),
    }
}

fn handle_platforms(cmd: PlatformCommands) -> Result<()> {
    match cmd {
        PlatformCommands::List => {
            report::banner("Built-in Platforms");

            for name in platform_names() {
                if let Some(profile) = get_platform(name) {
                    println!("\n  {}: {}", name.white().bold(), profile.description);
                    println!("    Cores: {}", profile.cores.join(", "));
                    println!(
                        "    Reserved: {}",
                        report::format_size(profile.reserved_size as u64)
                    );
                }
            }

            println!("\n{}", "=".repeat(70));
            println!(
                "Use {} to see the region size table",
                "dtc-debug platforms show <platform>".cyan()
            );
        }

        PlatformCommands::Show { platform } => {
            let profile = get_platform(&platform)
                .ok_or_else(|| ToolError::UnknownPlatform(platform.clone()))?;
            print_platform(profile);
        }
    }

    Ok(())
}

fn print_platform(profile: &PlatformProfile) {
    report::banner(&format!("Platform: {}", profile.name));

    println!("\n{}", "Basic Information:".white().bold());
    println!("  Family: {}", profile.family);
    println!("  Description: {}", profile.description);
    println!("  Cores: {}", profile.cores.join(", "));

    println!("\n{}", "Region Sizes:".white().bold());
    println!("  Reserved: {}", report::format_size(profile.reserved_size as u64));
    println!("  Staging: {}", report::format_size(profile.staging_size as u64));
    println!(
        "  Secure status: {}",
        report::format_size(profile.secure_status_size as u64)
    );

    println!("\n{}", "Working Buffer Banks:".white().bold());
    for bank in &profile.banks {
        let role = if bank.mandatory {
            "[mandatory]".red()
        } else {
            "[optional]".dimmed()
        };
        println!(
            "  {} {:<10} {}",
            role,
            bank.mem_type,
            report::format_size(bank.size as u64)
        );
    }

    println!("\n{}", "=".repeat(70));
}

fn handle_layout(cmd: LayoutCommands) -> Result<()> {
    match cmd {
        LayoutCommands::Plan {
            platform,
            table,
            size,
            base,
            manifest_version,
        } => {
            let profile = platforms::resolve(platform.as_deref(), table.as_deref())?;
            let size = match size {
                Some(s) => parse_size32(&s)?,
                None => profile.reserved_size,
            };
            let reserved = ReservedMemory::new(parse_size(&base)?, size);
            let policy = LayoutPolicy::from_manifest_version(manifest_version);

            report::banner(&format!(
                "Layout: {} ({} at {:#x})",
                profile.name,
                report::format_size(size as u64),
                reserved.base
            ));

            let planned = layout::provisional(reserved, &profile.table()?)
                .and_then(|p| p.finalize(policy));
            match planned {
                Ok(layout) => {
                    report::print_layout(&layout);
                    let dropped = layout.dropped_banks().count();
                    if dropped > 0 {
                        println!(
                            "\n{} {} optional bank(s) dropped",
                            "[WARNING]".yellow(),
                            dropped
                        );
                    } else {
                        println!("\n{} All banks placed", "[OK]".green().bold());
                    }
                }
                Err(e) => {
                    println!("{} {}", "[ERROR]".red().bold(), e);
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    std::fs::write(path, bytes).with_context(|| format!("Failed to write {}", path.display()))
}

fn handle_block(cmd: BlockCommands) -> Result<()> {
    match cmd {
        BlockCommands::Inspect { path, dump } => {
            println!("{} Inspecting block: {}", "[*]".cyan().bold(), path.display());
            let raw = read_file(&path)?;
            if !blockfile::inspect_block(&raw, dump) {
                std::process::exit(1);
            }
        }

        BlockCommands::Pack {
            kind,
            name,
            payload,
            output,
            chip,
            resolution,
            secure,
            optional,
        } => {
            let chip = chip
                .map(|c| {
                    platforms::get_platform(&c)
                        .ok_or_else(|| ToolError::UnknownPlatform(c.clone()))
                        .and_then(|p| p.family())
                })
                .transpose()?;
            let opts = PackOptions {
                kind: blockfile::parse_kind(&kind)?,
                name,
                chip,
                resolution: parse_resolution(&resolution)?,
                secure,
                optional,
            };
            let payload = read_file(&payload)?;
            let raw = blockfile::pack_block(&opts, &payload)?;
            write_file(&output, &raw)?;
            println!(
                "{} Wrote {} ({}, {} payload)",
                "[OK]".green().bold(),
                output.display(),
                opts.kind.name(),
                report::format_size(payload.len() as u64)
            );
        }

        BlockCommands::FixCrc { path } => {
            let mut raw = read_file(&path)?;
            let (old, new) = blockfile::fix_crc(&mut raw)?;
            if old == new {
                println!("{} Checksum already correct ({:#010x})", "[OK]".green().bold(), new);
            } else {
                write_file(&path, &raw)?;
                println!(
                    "{} Checksum {:#010x} -> {:#010x}",
                    "[OK]".green().bold(),
                    old,
                    new
                );
            }
        }
    }

    Ok(())
}

fn handle_manifest(cmd: ManifestCommands) -> Result<()> {
    match cmd {
        ManifestCommands::Inspect { path } => {
            println!("{} Inspecting manifest: {}", "[*]".cyan().bold(), path.display());
            let raw = read_file(&path)?;
            blockfile::inspect_manifest(&raw)?;
            println!("\n{} Manifest verified", "[OK]".green().bold());
        }

        ManifestCommands::Pack {
            entries,
            manifest_version,
            output,
        } => {
            let raw = blockfile::pack_manifest(manifest_version, &entries)?;
            write_file(&output, &raw)?;
            println!(
                "{} Wrote {} ({} entries)",
                "[OK]".green().bold(),
                output.display(),
                entries.len()
            );
        }
    }

    Ok(())
}

fn handle_session(cmd: SessionCommands) -> Result<()> {
    match cmd {
        SessionCommands::Run {
            dir,
            platform,
            table,
            revision,
            panel,
            size,
            base,
            no_tee,
            fail_protect,
            corrupt,
            reload,
            release,
        } => {
            let mut profile = platforms::resolve(platform.as_deref(), table.as_deref())?;
            if let Some(rev) = revision {
                profile.revision = rev;
            }

            let mut store = DirStore::open(&dir)?;
            println!(
                "{} Store {}: {} key(s)",
                "[*]".cyan().bold(),
                dir.display(),
                store.keys().count()
            );
            for spec in &corrupt {
                let (key, count) = session::parse_corrupt(spec)?;
                store.corrupt_next_reads(&key, count);
            }

            let opts = SessionOptions {
                profile,
                panel: parse_resolution(&panel)?,
                base: parse_size(&base)?,
                size: size.as_deref().map(parse_size32).transpose()?,
                no_tee,
                fail_protects: fail_protect,
                reload,
                release,
            };
            let outcome = session::run(&mut store, &opts)?;
            session::print_outcome(&outcome);
        }
    }

    Ok(())
}

fn handle_generate(cmd: GenerateCommands) -> Result<()> {
    match cmd {
        GenerateCommands::Table { platform, output } => {
            let profile = get_platform(&platform)
                .ok_or_else(|| ToolError::UnknownPlatform(platform.clone()))?;
            let text = format!(
                "# Region size table for {}\n# Sizes accept bytes, 0x hex, or K/M suffixes\n\n{}",
                profile.name,
                profile.to_toml()?
            );

            if let Some(path) = output {
                write_file(&path, text.as_bytes())?;
                println!("{} Written to {}", "[OK]".green().bold(), path.display());
            } else {
                print!("{}", text);
            }
        }

        GenerateCommands::Store {
            dir,
            platform,
            table,
            panel,
            manifest_version,
        } => {
            let profile = platforms::resolve(platform.as_deref(), table.as_deref())?;
            let keys =
                session::write_sample_store(&dir, &profile, parse_resolution(&panel)?, manifest_version)?;
            println!(
                "{} Wrote {} value(s) to {}",
                "[OK]".green().bold(),
                keys.len(),
                dir.display()
            );
            for key in keys {
                println!("  {}.bin", key);
            }
        }
    }

    Ok(())
}
