//! Command-line interface for toolmesh.

pub mod commands;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Multi-server MCP tool client
#[derive(Parser, Debug)]
#[command(name = "toolmesh", version, about = "Query and drive MCP tool servers")]
pub struct Cli {
    /// Config file (TOML or JSON); defaults to $TOOLMESH_CONFIG or ./toolmesh.toml
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List the merged tool catalog
    Tools,
    /// Show per-server status
    Servers,
    /// Call one tool by its exposed name
    Call(CallArgs),
    /// Run tasks through the invocation loop
    Run(RunArgs),
}

/// Arguments for `toolmesh call`.
#[derive(Args, Debug)]
pub struct CallArgs {
    /// Exposed tool name (e.g. `multiply` or `math__add`)
    pub tool: String,

    /// Arguments as a JSON object
    #[arg(short, long, default_value = "{}")]
    pub args: String,

    /// Call deadline; defaults to the client's call timeout
    #[arg(long)]
    pub timeout_ms: Option<u64>,
}

/// Arguments for `toolmesh run`.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Task description; runs the config's `[[tasks]]` when omitted
    #[arg(short, long)]
    pub task: Option<String>,

    /// Task type used to pick limits
    #[arg(long)]
    pub task_type: Option<String>,
}
