use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::backend::IoMode;

#[derive(Parser, Debug)]
#[command(name = "fsal", about = "Inspect FSAL exports and pNFS layouts")]
pub struct Cli {
    /// Log file path
    #[arg(long, global = true, default_value = "/tmp/fsal.log")]
    pub log_file: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Resolve a path on a local directory export and print its wire handle
    Handle {
        /// Directory served by the export
        root: PathBuf,

        /// Path to resolve, relative to the export root
        path: String,

        /// Export id to report
        #[arg(long, default_value_t = 1)]
        export_id: u16,
    },
    /// Grant a layout on a simulated striped cluster and describe it
    Layout {
        /// Number of storage nodes in the simulated cluster
        #[arg(long, default_value_t = 4)]
        nodes: u32,

        /// Stripe unit in bytes
        #[arg(long, default_value_t = DEFAULT_STRIPE_UNIT)]
        stripe_unit: u32,

        /// Requested offset
        #[arg(long, default_value_t = 0)]
        offset: u64,

        /// Requested length (defaults to the whole file)
        #[arg(long, default_value_t = u64::MAX)]
        length: u64,

        /// Smallest acceptable length
        #[arg(long, default_value_t = 0)]
        min_length: u64,

        /// Layout I/O mode
        #[arg(long, value_enum, default_value_t = ModeArg::Read)]
        mode: ModeArg,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    Read,
    Rw,
}

impl From<ModeArg> for IoMode {
    fn from(m: ModeArg) -> Self {
        match m {
            ModeArg::Read => IoMode::Read,
            ModeArg::Rw => IoMode::ReadWrite,
        }
    }
}

/// Default stripe unit reported as the layout block size (4 MiB).
pub const DEFAULT_STRIPE_UNIT: u32 = 0x40_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Distributed striped cluster filesystem.
    Cluster,
    /// Directory on the local filesystem.
    Local,
}

/// Everything that identifies one backend connection. Exports with equal
/// parameters share a single connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MountParams {
    pub backend: BackendKind,
    /// Cluster configuration path, or the directory for a local backend.
    pub target: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub fs_name: Option<String>,
}

impl MountParams {
    pub fn cluster(target: impl Into<String>) -> Self {
        Self {
            backend: BackendKind::Cluster,
            target: target.into(),
            user_id: None,
            secret: None,
            fs_name: None,
        }
    }

    pub fn local(dir: impl Into<String>) -> Self {
        Self {
            backend: BackendKind::Local,
            target: dir.into(),
            user_id: None,
            secret: None,
            fs_name: None,
        }
    }
}

/// Identity the export acts as towards the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: Option<String>,
    pub uid: u32,
    pub gid: u32,
}

/// Buffer sizes and capabilities advertised for pNFS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PnfsConfig {
    pub layout_blocksize: u32,
    pub maximum_segments: u32,
    pub loc_body_size: usize,
    pub da_addr_size: usize,
}

impl Default for PnfsConfig {
    fn default() -> Self {
        Self {
            layout_blocksize: DEFAULT_STRIPE_UNIT,
            maximum_segments: 1,
            loc_body_size: 0x100,
            da_addr_size: 0x1400,
        }
    }
}

/// One share as handed over by the server's configuration layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportConfig {
    pub export_id: u16,
    pub mount: MountParams,
    /// Path inside the backend that becomes the export root.
    #[serde(default = "default_sub_path")]
    pub sub_path: String,
    #[serde(default)]
    pub identity: Identity,
    #[serde(default)]
    pub pnfs: PnfsConfig,
}

fn default_sub_path() -> String {
    "/".to_string()
}

impl ExportConfig {
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}
