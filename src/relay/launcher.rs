use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{duplex, split, AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bounded::run_bounded;
use crate::config::types::RelayConfig;
use crate::error::{Result, SandlinkError};
use crate::frame::{FrameReader, FrameWriter};
use crate::relay::process::{Fetcher, RelayProcess};

/// In-memory pipe capacity for in-process relays.
const IN_PROCESS_PIPE_BYTES: usize = 64 * 1024;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A running relay: the framed pipe plus whatever keeps the other end alive.
pub struct RelayPipe {
    pub(crate) reader: FrameReader<BoxedReader>,
    pub(crate) writer: FrameWriter<BoxedWriter>,
    child: Option<Child>,
    task: Option<JoinHandle<()>>,
}

impl RelayPipe {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: FrameReader::new(Box::new(reader)),
            writer: FrameWriter::new(Box::new(writer)),
            child: None,
            task: None,
        }
    }

    /// Attach the child process serving this pipe.
    pub fn with_child(mut self, child: Child) -> Self {
        self.child = Some(child);
        self
    }

    /// Attach the task serving this pipe.
    pub fn with_task(mut self, task: JoinHandle<()>) -> Self {
        self.task = Some(task);
        self
    }

    /// Close the relay's input and wait up to `grace` for it to exit.
    pub async fn close(mut self, grace: Duration) {
        if let Err(e) = self.writer.shutdown().await {
            debug!(error = %e, "Relay input already closed");
        }

        if let Some(mut child) = self.child.take() {
            match run_bounded(child.wait(), grace).await {
                Ok(Ok(status)) => debug!(status = %status, "Relay process exited"),
                Ok(Err(e)) => warn!(error = %e, "Failed to wait for relay process"),
                Err(_) => {
                    warn!(grace_ms = grace.as_millis() as u64, "Relay process did not exit, killing");
                    let _ = child.kill().await;
                }
            }
        }

        if let Some(mut task) = self.task.take() {
            if run_bounded(&mut task, grace).await.is_err() {
                warn!("Relay task did not finish, aborting");
                task.abort();
            }
        }
    }
}

/// Starts relay processes ("spawn a process with stdio pipes").
#[async_trait]
pub trait RelayLauncher: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Start a relay and return its pipe. The handshake is done by the caller.
    async fn launch(&self) -> Result<RelayPipe>;
}

/// Launches the relay as an external program speaking the protocol on stdio.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    command: Vec<String>,
    install: Vec<String>,
    workdir: Option<PathBuf>,
    /// Set once the install command has succeeded
    installed: Arc<OnceCell<()>>,
}

impl CommandLauncher {
    pub fn new(command: Vec<String>) -> Result<Self> {
        if command.is_empty() {
            return Err(SandlinkError::Config(
                "relay command must name a program".to_string(),
            ));
        }
        Ok(Self {
            command,
            install: Vec::new(),
            workdir: None,
            installed: Arc::new(OnceCell::new()),
        })
    }

    /// Command run to completion before the first launch (e.g. a package install).
    pub fn with_install(mut self, install: Vec<String>) -> Self {
        self.install = install;
        self
    }

    pub fn with_workdir(mut self, workdir: Option<PathBuf>) -> Self {
        self.workdir = workdir;
        self
    }

    fn command_for(&self, argv: &[String]) -> Command {
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }
        cmd
    }

    async fn run_install(&self) -> Result<()> {
        if self.install.is_empty() {
            return Ok(());
        }

        info!(command = ?self.install, "Installing relay");
        let output = self
            .command_for(&self.install)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                SandlinkError::RelayUnavailable(format!(
                    "failed to run install command '{}': {}",
                    self.install[0], e
                ))
            })?;

        if !output.status.success() {
            return Err(SandlinkError::RelayUnavailable(format!(
                "install command exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl RelayLauncher for CommandLauncher {
    fn name(&self) -> &str {
        &self.command[0]
    }

    async fn launch(&self) -> Result<RelayPipe> {
        self.installed
            .get_or_try_init(|| self.run_install())
            .await?;

        let mut child = self
            .command_for(&self.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                SandlinkError::RelayUnavailable(format!(
                    "failed to spawn relay '{}': {}",
                    self.command[0], e
                ))
            })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            SandlinkError::RelayUnavailable("relay stdin not captured".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            SandlinkError::RelayUnavailable("relay stdout not captured".to_string())
        })?;

        debug!(pid = ?child.id(), command = ?self.command, "Spawned relay process");
        Ok(RelayPipe::new(stdout, stdin).with_child(child))
    }
}

/// Runs the relay loop on a local task over an in-memory pipe.
///
/// Used when the host itself can reach the network, and in tests.
pub struct InProcessLauncher {
    fetcher: Arc<dyn Fetcher>,
}

impl InProcessLauncher {
    pub fn new(fetcher: Arc<dyn Fetcher>) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl RelayLauncher for InProcessLauncher {
    fn name(&self) -> &str {
        "in-process"
    }

    async fn launch(&self) -> Result<RelayPipe> {
        let (host, relay) = duplex(IN_PROCESS_PIPE_BYTES);
        let (relay_read, relay_write) = split(relay);
        let (host_read, host_write) = split(host);

        let process = RelayProcess::new(self.fetcher.clone());
        let task = tokio::spawn(async move {
            if let Err(e) = process.run(relay_read, relay_write).await {
                error!(error = %e, "In-process relay stopped");
            }
        });

        Ok(RelayPipe::new(host_read, host_write).with_task(task))
    }
}

/// Build the launcher described by the `[relay]` config section.
pub fn launcher_from_config(config: &RelayConfig) -> Result<Arc<dyn RelayLauncher>> {
    match &config.command {
        Some(command) => Ok(Arc::new(
            CommandLauncher::new(command.clone())?
                .with_install(config.install.clone())
                .with_workdir(config.workdir.clone()),
        )),
        None => Ok(Arc::new(InProcessLauncher::new(Arc::new(
            crate::relay::process::HttpFetcher::new()?,
        )))),
    }
}
