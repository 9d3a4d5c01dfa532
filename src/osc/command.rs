use std::io::ErrorKind;
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::config::types::OscCommandConfig;
use crate::error::{Result, SandlinkError};
use crate::osc::handler::{OscContext, OscHandler, OscOutcome};

/// Environment variable carrying the pid of the invoking process.
pub const ACTIVE_PID_ENV: &str = "SANDLINK_ACTIVE_PID";

/// Serves an OSC channel by running a host command.
///
/// The payload JSON goes to the command's stdin. Non-empty stdout (trailing
/// whitespace trimmed) is the string result; empty stdout means `Done(true)`.
#[derive(Debug, Clone)]
pub struct CommandHandler {
    name: String,
    command: Vec<String>,
}

impl CommandHandler {
    pub fn new(name: impl Into<String>, command: Vec<String>) -> Result<Self> {
        let name = name.into();
        if command.is_empty() {
            return Err(SandlinkError::Config(format!(
                "osc '{}' needs a command",
                name
            )));
        }
        Ok(Self { name, command })
    }

    pub fn from_config(config: &OscCommandConfig) -> Result<Self> {
        Self::new(&config.name, config.command.clone())
    }
}

#[async_trait]
impl OscHandler for CommandHandler {
    async fn handle(&self, data: Value, ctx: &OscContext) -> Result<OscOutcome> {
        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(root) = &ctx.document_root {
            cmd.current_dir(root);
        }
        if let Some(pid) = ctx.active_process {
            cmd.env(ACTIVE_PID_ENV, pid.to_string());
        }

        let mut child = cmd.spawn().map_err(|e| {
            SandlinkError::Other(anyhow::anyhow!(
                "failed to run osc command '{}': {}",
                self.name,
                e
            ))
        })?;

        // Feed stdin while stdout drains
        let stdin = child.stdin.take();
        let payload = data.to_string();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(payload.as_bytes()).await?;
            }
            Ok::<(), std::io::Error>(())
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());

        match fed {
            // Commands that ignore their input may exit before reading it
            Err(e) if e.kind() != ErrorKind::BrokenPipe => return Err(e.into()),
            _ => {}
        }
        let output = output?;
        if !output.status.success() {
            return Err(SandlinkError::Other(anyhow::anyhow!(
                "osc command '{}' exited with {}",
                self.name,
                output.status
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let result = stdout.trim_end();
        debug!(name = %self.name, bytes = result.len(), "OSC command finished");
        Ok(if result.is_empty() {
            OscOutcome::Done(true)
        } else {
            OscOutcome::Value(result.to_string())
        })
    }
}
