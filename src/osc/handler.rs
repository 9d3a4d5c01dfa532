use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Result, SandlinkError};
use crate::signal::Writeback;

/// What a handler produced.
///
/// A `Value` is written back to the sandbox verbatim; `Done` writes back an
/// empty result and its flag becomes the dispatch outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OscOutcome {
    Done(bool),
    Value(String),
}

impl From<bool> for OscOutcome {
    fn from(done: bool) -> Self {
        Self::Done(done)
    }
}

impl From<String> for OscOutcome {
    fn from(value: String) -> Self {
        Self::Value(value)
    }
}

impl From<&str> for OscOutcome {
    fn from(value: &str) -> Self {
        Self::Value(value.to_string())
    }
}

/// Opens files in whatever editor the host provides.
#[async_trait]
pub trait EditorHandle: Send + Sync {
    async fn open(&self, path: &Path) -> Result<()>;
}

/// Host capabilities available to handlers. Every field is optional.
#[derive(Clone, Default)]
pub struct OscContext {
    /// Where results are handed back to the sandbox
    pub writeback: Option<Arc<dyn Writeback>>,
    /// Pid of the process whose output carried the invocation
    pub active_process: Option<u32>,
    pub document_root: Option<PathBuf>,
    pub editor: Option<Arc<dyn EditorHandle>>,
}

impl OscContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_writeback(mut self, writeback: Arc<dyn Writeback>) -> Self {
        self.writeback = Some(writeback);
        self
    }

    pub fn with_active_process(mut self, pid: Option<u32>) -> Self {
        self.active_process = pid;
        self
    }

    pub fn with_document_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.document_root = Some(root.into());
        self
    }

    pub fn with_editor(mut self, editor: Arc<dyn EditorHandle>) -> Self {
        self.editor = Some(editor);
        self
    }
}

impl fmt::Debug for OscContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OscContext")
            .field("writeback", &self.writeback.is_some())
            .field("active_process", &self.active_process)
            .field("document_root", &self.document_root)
            .field("editor", &self.editor.is_some())
            .finish()
    }
}

/// Host-side handler for one OSC channel.
#[async_trait]
pub trait OscHandler: Send + Sync {
    async fn handle(&self, data: Value, ctx: &OscContext) -> Result<OscOutcome>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> OscHandler for FnHandler<F>
where
    F: Fn(Value, OscContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<OscOutcome>> + Send + 'static,
{
    async fn handle(&self, data: Value, ctx: &OscContext) -> Result<OscOutcome> {
        (self.0)(data, ctx.clone()).await
    }
}

/// Wrap an async closure as an [`OscHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn OscHandler>
where
    F: Fn(Value, OscContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<OscOutcome>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// A validated channel id plus its handler.
#[derive(Clone)]
pub struct OscRegistration {
    id: u32,
    handler: Arc<dyn OscHandler>,
}

impl OscRegistration {
    pub fn builder() -> OscRegistrationBuilder {
        OscRegistrationBuilder::default()
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn handler(&self) -> &Arc<dyn OscHandler> {
        &self.handler
    }
}

impl fmt::Debug for OscRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OscRegistration")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Default)]
pub struct OscRegistrationBuilder {
    id: Option<u32>,
    handler: Option<Arc<dyn OscHandler>>,
}

impl OscRegistrationBuilder {
    pub fn id(mut self, id: u32) -> Self {
        self.id = Some(id);
        self
    }

    pub fn handler(mut self, handler: Arc<dyn OscHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Fails if the handler or a non-zero id is missing.
    pub fn build(self) -> Result<OscRegistration> {
        let handler = self.handler.ok_or_else(|| SandlinkError::OscRegistration {
            field: "handler".to_string(),
        })?;
        let id = self
            .id
            .filter(|id| *id != 0)
            .ok_or_else(|| SandlinkError::OscRegistration {
                field: "id".to_string(),
            })?;
        Ok(OscRegistration { id, handler })
    }
}
