//! Sandlink relay agent
//!
//! Runs inside the sandbox, in one of two modes:
//! - no subcommand: the relay process. stdin/stdout are the framed pipe to
//!   the host, requests are performed with a real HTTP client and answered
//!   in order; the agent exits when stdin closes.
//! - `osc <id> <json>`: print an OSC invocation for the host to handle, wait
//!   for its answer in the signal directory and print it.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tracing::error;

use sandlink::error::Result;
use sandlink::osc::emit;
use sandlink::relay::{HttpFetcher, RelayProcess};
use sandlink::signal::SignalDir;

#[derive(Parser, Debug)]
#[clap(name = "sandlink-relay")]
#[clap(version, about = "Relay process for sandlink sandboxes")]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[clap(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[clap(subcommand)]
    command: Option<AgentCommand>,
}

#[derive(Subcommand, Debug)]
enum AgentCommand {
    /// Invoke a host OSC handler and print its result
    Osc(OscArgs),
}

#[derive(Args, Debug)]
struct OscArgs {
    /// OSC channel id
    id: u32,

    /// JSON payload
    data: String,

    /// Directory shared with the host for results
    #[clap(long, env = "SANDLINK_SIGNAL_DIR", default_value = "/tmp")]
    signal_dir: PathBuf,

    /// How long to wait for the host
    #[clap(long, default_value = "5000")]
    timeout_ms: u64,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match cli.command {
        None => relay().await,
        Some(AgentCommand::Osc(args)) => osc(args).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "sandlink-relay failed");
            eprintln!("sandlink-relay: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn relay() -> Result<()> {
    let process = RelayProcess::new(Arc::new(HttpFetcher::new()?));
    process.run(tokio::io::stdin(), tokio::io::stdout()).await
}

async fn osc(args: OscArgs) -> Result<()> {
    let data: Value = serde_json::from_str(&args.data)?;
    let signals =
        SignalDir::new(args.signal_dir).with_timeout(Duration::from_millis(args.timeout_ms));

    let mut stdout = tokio::io::stdout();
    if let Some(result) = emit(args.id, &data, &signals, &mut stdout).await? {
        stdout.write_all(result.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }
    Ok(())
}

fn init_logging(verbosity: u8) {
    use tracing_subscriber::EnvFilter;

    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_subcommand_runs_relay() {
        let cli = Cli::parse_from(["sandlink-relay"]);
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_osc_args() {
        let cli = Cli::parse_from([
            "sandlink-relay",
            "osc",
            "80085",
            "{\"html\":\"<b>x</b>\"}",
            "--signal-dir",
            "/shared",
            "--timeout-ms",
            "250",
        ]);
        let Some(AgentCommand::Osc(args)) = cli.command else {
            panic!("expected osc");
        };
        assert_eq!(args.id, 80085);
        assert_eq!(args.signal_dir, PathBuf::from("/shared"));
        assert_eq!(args.timeout_ms, 250);
    }
}
