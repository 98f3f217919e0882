//! CLI command definitions using clap

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Orion - run WebAssembly modules against a minimal WASI host
#[derive(Parser)]
#[command(name = "orion")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run a module and print its captured output
    Run(RunArgs),

    /// List a module's imports and exports
    Inspect {
        /// Module path, URL, or `file://` locator (.wasm or .wat)
        module: String,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(clap::Args, Debug, Clone)]
pub struct RunArgs {
    /// Module path, URL, or `file://` locator (.wasm or .wat)
    pub module: String,

    /// Instantiate as a reactor instead of calling the entry point
    #[arg(long)]
    pub reactor: bool,

    /// Export to call after instantiation (reactor mode)
    #[arg(long, requires = "reactor")]
    pub invoke: Option<String>,

    /// Argument for --invoke, e.g. `7`, `i64:-3`, `f64:2.5`
    #[arg(long = "arg", value_name = "VALUE", allow_hyphen_values = true, requires = "invoke")]
    pub call_args: Vec<String>,

    /// Guest environment variable
    #[arg(short, long = "env", value_name = "KEY=VALUE")]
    pub env: Vec<String>,

    /// File served to the guest on stdin
    #[arg(long)]
    pub stdin_file: Option<PathBuf>,

    /// Host configuration file (yaml, toml, json)
    #[arg(short, long, env = "ORION_CONFIG")]
    pub config: Option<PathBuf>,

    /// Command-mode entry export
    #[arg(long)]
    pub entry: Option<String>,

    /// Fuel budget
    #[arg(long)]
    pub fuel: Option<u64>,

    /// Wall-clock budget in milliseconds
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Print the run report as JSON
    #[arg(long)]
    pub json: bool,

    /// Guest arguments; argv[0] is the module name
    #[arg(last = true)]
    pub guest_args: Vec<String>,
}
