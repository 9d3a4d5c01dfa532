use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cli::args::{ConfigAction, ConfigArgs, FetchArgs, InitArgs, OutputFormat, RunArgs};
use crate::config::loader::get_config_path;
use crate::config::types::{OscCommandConfig, SandlinkConfig};
use crate::error::{Result, SandlinkError};
use crate::feature::{Feature, FeatureRegistry};
use crate::osc::{CommandHandler, OscContext, OscDispatcher, OscRegistration, OscScanner, ScanItem};
use crate::relay::{launcher_from_config, RelayEndpoint, RelayRequest, RelayResponse};
use crate::signal::{FsWriteback, SignalDir, SIGNAL_DIR_ENV};

const RUN_READ_CHUNK: usize = 8 * 1024;

// ============================================================================
// Relay Commands
// ============================================================================

/// Send one request through the configured relay
pub async fn fetch(args: FetchArgs, config: SandlinkConfig, format: OutputFormat) -> Result<()> {
    let launcher = launcher_from_config(&config.relay)?;
    info!(relay = launcher.name(), url = %args.url, "Fetching through relay");

    let endpoint = RelayEndpoint::new(launcher, config.relay.timeouts());

    let mut request = RelayRequest::new(args.url).with_method(args.method);
    for (name, value) in args.headers {
        request = request.with_header(name, value);
    }
    if let Some(path) = args.path {
        request = request.with_path(path);
    }
    if let Some(body) = args.body {
        request = request.with_body(body);
    }

    let result = endpoint.try_fetch(request).await;
    endpoint.stop().await;

    output_response(&result?, format)
}

// ============================================================================
// OSC Commands
// ============================================================================

/// Run a program, pass its output through, and serve its OSC invocations
pub async fn run(args: RunArgs, config: SandlinkConfig, format: OutputFormat) -> Result<()> {
    let mut signal_config = config.signal.clone();
    if let Some(dir) = args.signal_dir {
        signal_config.dir = dir;
    }
    let signals = SignalDir::from_config(&signal_config);

    let mut dispatcher = OscDispatcher::new();
    let registry = FeatureRegistry::load(osc_features(&config.osc)?, &mut dispatcher)?;
    info!(features = ?registry.names(), "Loaded OSC features");
    let dispatcher = Arc::new(dispatcher);

    let program = &args.command[0];
    let mut child = Command::new(program)
        .args(&args.command[1..])
        .env(SIGNAL_DIR_ENV, signals.dir())
        .stdin(Stdio::inherit())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            SandlinkError::Other(anyhow::anyhow!("failed to run '{}': {}", program, e))
        })?;
    let mut output = child
        .stdout
        .take()
        .ok_or_else(|| SandlinkError::Other(anyhow::anyhow!("stdout of '{}' not captured", program)))?;

    let ctx = OscContext::new()
        .with_writeback(Arc::new(FsWriteback::new(signals.clone())))
        .with_active_process(child.id())
        .with_document_root(std::env::current_dir()?);

    let mut scanner = OscScanner::for_channels(dispatcher.channel_ids());
    let mut stdout = tokio::io::stdout();
    let mut dispatches = JoinSet::new();
    let mut buf = vec![0u8; RUN_READ_CHUNK];

    loop {
        let n = output.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        for item in scanner.push(&buf[..n]) {
            match item {
                ScanItem::Passthrough(bytes) => {
                    stdout.write_all(&bytes).await?;
                    stdout.flush().await?;
                }
                ScanItem::Invocation { channel, payload } => {
                    debug!(channel, "OSC invocation");
                    let dispatcher = dispatcher.clone();
                    let ctx = ctx.clone();
                    dispatches.spawn(async move {
                        (channel, dispatcher.dispatch(channel, &payload, &ctx).await)
                    });
                }
            }
        }
    }
    if let Some(rest) = scanner.finish() {
        stdout.write_all(&rest).await?;
        stdout.flush().await?;
    }

    let mut handled = 0usize;
    let mut unhandled = 0usize;
    while let Some(joined) = dispatches.join_next().await {
        match joined {
            Ok((_, true)) => handled += 1,
            Ok((channel, false)) => {
                warn!(channel, "OSC invocation not handled");
                unhandled += 1;
            }
            Err(e) => {
                warn!(error = %e, "OSC dispatch task failed");
                unhandled += 1;
            }
        }
    }

    let status = child.wait().await?;
    let exit_code = status.code().unwrap_or(1);
    info!(exit_code, handled, unhandled, "Program finished");

    match format {
        OutputFormat::Text => {
            if exit_code != 0 {
                std::process::exit(exit_code);
            }
        }
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "exit_code": exit_code,
                    "handled": handled,
                    "unhandled": unhandled,
                })
            );
        }
    }

    Ok(())
}

// ============================================================================
// Config Commands
// ============================================================================

pub async fn init(args: InitArgs) -> Result<()> {
    let config_path = get_config_path();

    if config_path.exists() && !args.force {
        println!("Configuration already exists at: {}", config_path.display());
        println!("Use --force to overwrite");
        return Ok(());
    }

    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let default_config = SandlinkConfig::default();
    let toml_str = toml::to_string_pretty(&default_config)
        .map_err(|e| SandlinkError::Config(e.to_string()))?;

    std::fs::write(&config_path, toml_str)?;

    println!("Created configuration at: {}", config_path.display());
    println!("\nQuick start:");
    println!("  # Fetch through an in-process relay");
    println!("  sandlink fetch https://example.com/");
    println!();
    println!("  # Use the standalone relay instead");
    println!("  #   [relay]");
    println!("  #   command = [\"sandlink-relay\"]");
    println!();
    println!("  # Bind a host command to an OSC channel");
    println!("  #   [[osc]]");
    println!("  #   name = \"html\"");
    println!("  #   id = 80085");
    println!("  #   command = [\"cat\"]");
    println!("  sandlink run -- sandlink-relay osc 80085 '{{\"html\":\"<b>hi</b>\"}}'");

    Ok(())
}

pub async fn config(args: ConfigArgs, config: SandlinkConfig) -> Result<()> {
    match args.action {
        ConfigAction::Show => {
            let toml_str = toml::to_string_pretty(&config)
                .map_err(|e| SandlinkError::Config(e.to_string()))?;
            println!("{}", toml_str);
        }
        ConfigAction::Path => {
            println!("{}", get_config_path().display());
        }
    }
    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// One feature per configured OSC command.
fn osc_features(commands: &[OscCommandConfig]) -> Result<Vec<Feature>> {
    commands
        .iter()
        .map(|osc| {
            let handler = CommandHandler::from_config(osc)?;
            Ok(Feature::new(&osc.name)
                .with_bin([osc.name.clone()])
                .with_osc(OscRegistration::builder().id(osc.id).handler(Arc::new(handler))))
        })
        .collect()
}

fn output_response(response: &RelayResponse, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => {
            print!("{}", response.body);
            if !response.is_success() {
                eprintln!("{} {}", response.status, response.status_text);
                std::process::exit(1);
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(response)?);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_osc_features_from_config() {
        let commands = vec![OscCommandConfig {
            name: "html".to_string(),
            id: 80085,
            command: vec!["cat".to_string()],
        }];

        let mut dispatcher = OscDispatcher::new();
        let registry = FeatureRegistry::load(osc_features(&commands).unwrap(), &mut dispatcher)
            .unwrap();

        assert_eq!(registry.bins(), vec!["html"]);
        assert_eq!(dispatcher.channel_ids(), vec![80085]);
    }

    #[test]
    fn test_osc_feature_without_command_fails() {
        let commands = vec![OscCommandConfig {
            name: "broken".to_string(),
            id: 1,
            command: Vec::new(),
        }];
        assert!(matches!(
            osc_features(&commands),
            Err(SandlinkError::Config(_))
        ));
    }
}
