use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(name = "sandlink")]
#[clap(version, about = "Network relay and OSC side channel for sandboxed programs")]
#[clap(propagate_version = true)]
pub struct Cli {
    #[clap(flatten)]
    pub global_opts: GlobalOpts,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug)]
pub struct GlobalOpts {
    /// Configuration file path
    #[clap(short, long, global = true, env = "SANDLINK_CONFIG")]
    pub config: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv)
    #[clap(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Output format
    #[clap(long, global = true, default_value = "text", value_enum)]
    pub format: OutputFormat,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Send one request through the relay
    Fetch(FetchArgs),

    /// Run a program and serve the OSC invocations it prints
    Run(RunArgs),

    /// Initialize a new sandlink configuration
    Init(InitArgs),

    /// Manage configuration
    Config(ConfigArgs),
}

// ============================================================================
// Relay Commands
// ============================================================================

#[derive(Args, Debug)]
pub struct FetchArgs {
    /// Base URL of the request
    pub url: String,

    /// HTTP method
    #[clap(short = 'X', long, default_value = "GET")]
    pub method: String,

    /// Path resolved against the URL
    #[clap(long)]
    pub path: Option<String>,

    /// Request header (NAME:VALUE)
    #[clap(short = 'H', long = "header", value_parser = parse_header)]
    pub headers: Vec<(String, String)>,

    /// Request body
    #[clap(long)]
    pub body: Option<String>,
}

// ============================================================================
// OSC Commands
// ============================================================================

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Signal directory shared with the program (overrides config)
    #[clap(long)]
    pub signal_dir: Option<PathBuf>,

    /// Program and arguments
    #[clap(required = true, last = true)]
    pub command: Vec<String>,
}

// ============================================================================
// Config Commands
// ============================================================================

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Force overwrite existing configuration
    #[clap(short, long)]
    pub force: bool,
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[clap(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,
    /// Show configuration file path
    Path,
}

// ============================================================================
// Common Types
// ============================================================================

fn parse_header(s: &str) -> Result<(String, String), String> {
    s.split_once(':')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| "Header format: NAME:VALUE".to_string())
}

#[derive(Debug, Clone, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}
