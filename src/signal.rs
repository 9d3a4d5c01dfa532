//! Rendezvous through a watched file.
//!
//! The sandbox and the host share no memory and no duplex channel for OSC
//! results, so a blocking call is emulated with a file:
//!
//! 1. the producer creates `<dir>/<correlationId>` empty and watches it
//! 2. the producer emits a trigger the consumer is already observing
//! 3. the consumer does its work and writes the result (or nothing) into the file
//! 4. the write wakes the producer, which reads the file and deletes it
//!
//! The producer deletes the file on every exit path, including timeouts and
//! being dropped mid-wait.

use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use notify::event::{AccessKind, AccessMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::bounded::{run_bounded, wait_until};
use crate::config::types::SignalConfig;
use crate::error::{Result, SandlinkError};

/// Directory holding signal files unless configured otherwise.
pub const DEFAULT_SIGNAL_DIR: &str = "/tmp";

/// Tells processes started by the host where the signal directory is.
pub const SIGNAL_DIR_ENV: &str = "SANDLINK_SIGNAL_DIR";

/// Where signal files live and how long to wait on them.
#[derive(Debug, Clone)]
pub struct SignalDir {
    dir: PathBuf,
    timeout: Duration,
    settle: Duration,
}

impl Default for SignalDir {
    fn default() -> Self {
        Self::new(DEFAULT_SIGNAL_DIR)
    }
}

impl SignalDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            timeout: Duration::from_secs(5),
            settle: Duration::from_millis(20),
        }
    }

    pub fn from_config(config: &SignalConfig) -> Self {
        Self::new(&config.dir)
            .with_timeout(Duration::from_millis(config.timeout_ms))
            .with_settle(Duration::from_millis(config.settle_ms))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Quiet period after the first change event before the file is read.
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Path of the signal file for `correlation_id`.
    pub fn path_for(&self, correlation_id: &str) -> PathBuf {
        self.dir.join(correlation_id)
    }

    /// Producer side: create the file, run `trigger`, wait for the consumer.
    ///
    /// Returns the consumer's result, or `None` if it left the file empty.
    pub async fn signal<F, Fut>(&self, correlation_id: &str, trigger: F) -> Result<Option<String>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let path = self.path_for(correlation_id);
        let guard = SignalGuard::create(&path).await?;
        debug!(path = %path.display(), "Created signal file");

        let outcome = self.await_change(&path, trigger).await;
        guard.remove().await;
        outcome
    }

    async fn await_change<F, Fut>(&self, path: &Path, trigger: F) -> Result<Option<String>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        // The watch must exist before the trigger, or a fast consumer is missed
        let (watcher, mut changes) = watch_file(path)?;

        trigger().await?;

        match run_bounded(changes.recv(), self.timeout).await {
            Ok(Some(())) => {}
            Ok(None) => {
                return Err(SandlinkError::Other(anyhow::anyhow!(
                    "watcher for {} stopped",
                    path.display()
                )))
            }
            Err(timeout) => {
                return Err(SandlinkError::SignalTimeout {
                    path: path.display().to_string(),
                    millis: timeout.millis,
                })
            }
        }

        // Truncate and write arrive as separate events; read once they settle
        sleep(self.settle).await;
        while changes.try_recv().is_ok() {}
        drop(watcher);

        let contents = fs::read_to_string(path).await?;
        debug!(path = %path.display(), bytes = contents.len(), "Signal file changed");
        Ok(if contents.is_empty() {
            None
        } else {
            Some(contents)
        })
    }

    /// Consumer side: write `content` into an existing signal file.
    ///
    /// Fails with `NotFound` if the producer is gone, so a late consumer never
    /// leaves an orphaned file behind.
    pub async fn respond(&self, correlation_id: &str, content: &str) -> Result<()> {
        let path = self.path_for(correlation_id);
        let mut file = fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&path)
            .await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        debug!(path = %path.display(), bytes = content.len(), "Wrote signal response");
        Ok(())
    }
}

/// Removes the signal file when the producer finishes or is dropped.
struct SignalGuard {
    path: PathBuf,
    armed: bool,
}

impl SignalGuard {
    async fn create(path: &Path) -> Result<Self> {
        fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await?;
        Ok(Self {
            path: path.to_path_buf(),
            armed: true,
        })
    }

    async fn remove(mut self) {
        if let Err(e) = fs::remove_file(&self.path).await {
            if e.kind() != ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to remove signal file");
            }
        }
        self.armed = false;
    }
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

fn is_change(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Modify(_)
            | EventKind::Create(_)
            | EventKind::Access(AccessKind::Close(AccessMode::Write))
    )
}

fn watch_file(path: &Path) -> Result<(RecommendedWatcher, mpsc::UnboundedReceiver<()>)> {
    let (tx, rx) = mpsc::unbounded_channel();

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) if is_change(&event.kind) => {
            let _ = tx.send(());
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "Signal file watch error"),
    })
    .map_err(|e| SandlinkError::Other(anyhow::anyhow!("failed to create watcher: {}", e)))?;

    watcher
        .watch(path, RecursiveMode::NonRecursive)
        .map_err(|e| {
            SandlinkError::Other(anyhow::anyhow!(
                "failed to watch {}: {}",
                path.display(),
                e
            ))
        })?;

    Ok((watcher, rx))
}

/// An execution context able to hand a result back into the sandbox.
#[async_trait]
pub trait Writeback: Send + Sync {
    /// Write `content` into the signal file for `correlation_id` and wait
    /// until the producer has consumed it.
    async fn write_until_read(&self, correlation_id: &str, content: &str) -> Result<()>;
}

/// [`Writeback`] for a signal directory the host can reach directly
/// (e.g. a directory mounted into the sandbox).
#[derive(Debug, Clone)]
pub struct FsWriteback {
    signals: SignalDir,
}

impl FsWriteback {
    pub fn new(signals: SignalDir) -> Self {
        Self { signals }
    }
}

#[async_trait]
impl Writeback for FsWriteback {
    async fn write_until_read(&self, correlation_id: &str, content: &str) -> Result<()> {
        self.signals.respond(correlation_id, content).await?;

        let path = self.signals.path_for(correlation_id);
        let consumed = path.clone();
        wait_until(move || !consumed.exists(), self.signals.timeout())
            .await
            .map_err(|timeout| SandlinkError::SignalTimeout {
                path: path.display().to_string(),
                millis: timeout.millis,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn signals(dir: &TempDir) -> SignalDir {
        SignalDir::new(dir.path()).with_timeout(Duration::from_secs(3))
    }

    fn respond_later(signals: &SignalDir, id: &str, content: &'static str) {
        let signals = signals.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            signals.respond(&id, content).await.unwrap();
        });
    }

    #[tokio::test]
    async fn test_signal_returns_consumer_result() {
        let dir = TempDir::new().unwrap();
        let signals = signals(&dir);
        let id = Uuid::new_v4().to_string();

        let result = signals
            .signal(&id, || async {
                respond_later(&signals, &id, "{\"path\":\"/a\"}");
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(result.as_deref(), Some("{\"path\":\"/a\"}"));
        assert!(!signals.path_for(&id).exists());
    }

    #[tokio::test]
    async fn test_empty_result_is_none() {
        let dir = TempDir::new().unwrap();
        let signals = signals(&dir);
        let id = Uuid::new_v4().to_string();

        let result = signals
            .signal(&id, || async {
                respond_later(&signals, &id, "");
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(result, None);
        assert!(!signals.path_for(&id).exists());
    }

    #[tokio::test]
    async fn test_timeout_still_removes_file() {
        let dir = TempDir::new().unwrap();
        let signals = signals(&dir).with_timeout(Duration::from_millis(100));
        let id = Uuid::new_v4().to_string();

        let err = signals.signal(&id, || async { Ok(()) }).await.unwrap_err();

        assert!(matches!(err, SandlinkError::SignalTimeout { millis: 100, .. }));
        assert!(!signals.path_for(&id).exists());
    }

    #[tokio::test]
    async fn test_trigger_error_still_removes_file() {
        let dir = TempDir::new().unwrap();
        let signals = signals(&dir);
        let id = Uuid::new_v4().to_string();

        let err = signals
            .signal(&id, || async {
                Err(SandlinkError::Config("stdout closed".to_string()))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, SandlinkError::Config(_)));
        assert!(!signals.path_for(&id).exists());
    }

    #[tokio::test]
    async fn test_abandoned_producer_removes_file() {
        let dir = TempDir::new().unwrap();
        let signals = signals(&dir);
        let id = Uuid::new_v4().to_string();

        let pending = signals.signal(&id, || std::future::pending::<Result<()>>());
        assert!(run_bounded(pending, Duration::from_millis(50)).await.is_err());

        assert!(!signals.path_for(&id).exists());
    }

    #[tokio::test]
    async fn test_one_file_per_correlation_id() {
        let dir = TempDir::new().unwrap();
        let signals = signals(&dir);
        let id = Uuid::new_v4().to_string();
        std::fs::write(signals.path_for(&id), "").unwrap();

        let err = signals.signal(&id, || async { Ok(()) }).await.unwrap_err();
        assert!(matches!(err, SandlinkError::Io(ref e) if e.kind() == ErrorKind::AlreadyExists));
    }

    #[tokio::test]
    async fn test_late_respond_does_not_create_file() {
        let dir = TempDir::new().unwrap();
        let signals = signals(&dir);

        let err = signals.respond("gone", "late").await.unwrap_err();
        assert!(matches!(err, SandlinkError::Io(ref e) if e.kind() == ErrorKind::NotFound));
        assert!(!signals.path_for("gone").exists());
    }

    #[tokio::test]
    async fn test_fs_writeback_waits_for_producer() {
        let dir = TempDir::new().unwrap();
        let signals = signals(&dir);
        let writeback = FsWriteback::new(signals.clone());
        let id = Uuid::new_v4().to_string();

        let consumer = {
            let id = id.clone();
            async move {
                sleep(Duration::from_millis(50)).await;
                writeback.write_until_read(&id, "done").await
            }
        };
        let producer = signals.signal(&id, || async { Ok(()) });

        let (produced, consumed) = tokio::join!(producer, consumer);
        assert_eq!(produced.unwrap().as_deref(), Some("done"));
        consumed.unwrap();
    }

    #[tokio::test]
    async fn test_fs_writeback_times_out_without_producer() {
        let dir = TempDir::new().unwrap();
        let signals = signals(&dir).with_timeout(Duration::from_millis(50));
        let id = "orphan";
        std::fs::write(signals.path_for(id), "").unwrap();

        let err = FsWriteback::new(signals)
            .write_until_read(id, "x")
            .await
            .unwrap_err();
        assert!(matches!(err, SandlinkError::SignalTimeout { millis: 50, .. }));
    }
}
