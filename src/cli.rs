use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Parser)]
#[command(name = "htcache", about = "htcache caching proxy data tools")]
pub struct Cli {
    /// Path to the runtime configuration file (defaults to ./htcache.toml if present).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Print the metrics registry after the command finishes.
    #[arg(long, global = true)]
    pub metrics: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Create the metadata schema if it does not exist yet.
    InitDb,
    /// List every resource with its descriptors.
    List,
    /// Print the resource record for a URL.
    Record { url: String },
    /// Search records by URL substring or `mediatype:<prefix>`.
    Find { query: String },
    /// Print the descriptor stored for one or more cache paths.
    Info {
        #[arg(required = true)]
        paths: Vec<String>,
    },
    /// Walk the cache tree and report files no descriptor claims.
    CheckFiles {
        #[arg(long)]
        prune: bool,
    },
    /// Validate every descriptor against its cache object.
    CheckCache {
        #[arg(long)]
        prune: bool,
    },
    /// Run both integrity passes.
    Sweep {
        #[arg(long)]
        prune: bool,
    },
}

impl Command {
    /// Returns the `--prune` flag for the sweep commands.
    pub fn prune(&self) -> bool {
        match self {
            Command::CheckFiles { prune }
            | Command::CheckCache { prune }
            | Command::Sweep { prune } => *prune,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}
