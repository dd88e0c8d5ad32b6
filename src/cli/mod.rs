//! CLI module for nbpipe
//!
//! Subcommands:
//! - `nbpipe serve` - Run the scheduler HTTP endpoint
//! - `nbpipe submit` - Package, upload and launch a pipeline payload
//! - `nbpipe compile` - Print the workflow a payload compiles to (dry run)

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod display;

pub use commands::*;
pub use display::*;

#[derive(Parser, Debug)]
#[command(name = "nbpipe")]
#[command(about = "Compile notebook graphs into staged Kubeflow pipelines")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to settings file (default: ~/.nbpipe/config.yaml)
    #[arg(long, global = true, env = "NBPIPE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Path to a .env file loaded before settings are read
    #[arg(long, value_name = "FILE", global = true)]
    pub env_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the scheduler server
    Serve(ServeArgs),

    /// Submit a pipeline payload to the execution engine
    Submit(SubmitArgs),

    /// Compile a pipeline payload without touching storage or the engine
    Compile(CompileArgs),
}

/// Arguments for the serve command
#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Bind address for the server (overrides settings)
    #[arg(long)]
    pub bind_addr: Option<String>,

    /// Port to listen on (overrides settings)
    #[arg(short, long)]
    pub port: Option<u16>,
}

/// Arguments for the submit command
#[derive(Parser, Debug)]
pub struct SubmitArgs {
    /// Path to the pipeline payload (JSON)
    pub payload: PathBuf,
}

/// Arguments for the compile command
#[derive(Parser, Debug)]
pub struct CompileArgs {
    /// Path to the pipeline payload (JSON)
    pub payload: PathBuf,

    /// Write the workflow YAML here instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}
