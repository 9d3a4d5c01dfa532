//! Host-side owner of the relay pipe.
//!
//! One [`RelayEndpoint`] owns at most one relay for its lifetime. A single
//! tokio mutex guards the pipe: it serializes requests (one in flight per
//! pipe) and the lazy start, so concurrent first callers wait for the same
//! start instead of racing to spawn two relays.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bounded::run_bounded;
use crate::error::{Result, SandlinkError};
use crate::frame::FrameError;
use crate::relay::launcher::{RelayLauncher, RelayPipe};
use crate::relay::types::{
    frame_type, Envelope, RelayRequest, RelayRequestInit, RelayResponse, REQUEST_ID_HEADER,
    REQUEST_ORIGIN_HEADER,
};

/// Value of the origin header for requests issued by the host.
const REQUEST_ORIGIN: &str = "client";

/// Lifecycle of the relay owned by an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayStatus {
    /// No relay has been started (or it was stopped)
    Uninitialized,
    /// A start is in flight
    Starting,
    /// Handshake completed, pipe usable
    Ready,
    /// The last start or exchange broke the pipe; the next call restarts
    Failed,
}

/// Bounds applied by the endpoint.
#[derive(Debug, Clone, Copy)]
pub struct RelayTimeouts {
    /// Launch plus readiness handshake
    pub startup: Duration,
    /// Write of one request plus read of its response
    pub request: Duration,
}

impl Default for RelayTimeouts {
    fn default() -> Self {
        Self {
            startup: Duration::from_secs(30),
            request: Duration::from_secs(60),
        }
    }
}

pub struct RelayEndpoint {
    launcher: Arc<dyn RelayLauncher>,
    timeouts: RelayTimeouts,
    pipe: Mutex<Option<RelayPipe>>,
    status: watch::Sender<RelayStatus>,
}

impl RelayEndpoint {
    pub fn new(launcher: Arc<dyn RelayLauncher>, timeouts: RelayTimeouts) -> Self {
        let (status, _) = watch::channel(RelayStatus::Uninitialized);
        Self {
            launcher,
            timeouts,
            pipe: Mutex::new(None),
            status,
        }
    }

    pub fn status(&self) -> RelayStatus {
        *self.status.borrow()
    }

    /// Observe status changes.
    pub fn subscribe(&self) -> watch::Receiver<RelayStatus> {
        self.status.subscribe()
    }

    /// Start the relay now instead of on the first fetch.
    pub async fn start(&self) -> Result<()> {
        let mut slot = self.pipe.lock().await;
        self.ensure_started(&mut slot).await.map(|_| ())
    }

    /// Close the relay's input and wait for it to exit.
    pub async fn stop(&self) {
        let mut slot = self.pipe.lock().await;
        if let Some(pipe) = slot.take() {
            info!(launcher = self.launcher.name(), "Stopping relay");
            pipe.close(self.timeouts.startup).await;
        }
        self.status.send_replace(RelayStatus::Uninitialized);
    }

    /// Relay `request` and return the response, or `None` if it could not complete.
    ///
    /// The reason for a `None` is logged; use [`RelayEndpoint::try_fetch`] to
    /// receive it instead.
    pub async fn fetch(&self, request: RelayRequest) -> Option<RelayResponse> {
        let url = request.url.clone();
        match self.try_fetch(request).await {
            Ok(response) => Some(response),
            Err(e) => {
                error!(url = %url, error = %e, "Relay fetch failed");
                None
            }
        }
    }

    /// Relay `request`, reporting why it failed.
    pub async fn try_fetch(&self, request: RelayRequest) -> Result<RelayResponse> {
        let mut slot = self.pipe.lock().await;

        let request_id = Uuid::new_v4().to_string();
        let request = request
            .with_header(REQUEST_ID_HEADER, request_id.clone())
            .with_header(REQUEST_ORIGIN_HEADER, REQUEST_ORIGIN);

        let pipe = self.ensure_started(&mut slot).await?;
        debug!(
            request_id = %request_id,
            method = %request.method(),
            url = %request.url,
            "Sending relay request"
        );

        match run_bounded(exchange(pipe, request), self.timeouts.request).await {
            Ok(Ok(response)) => {
                debug!(request_id = %request_id, status = response.status, "Relay response received");
                Ok(response)
            }
            Ok(Err(e)) => {
                if breaks_pipe(&e) {
                    self.teardown(&mut slot, &e.to_string());
                }
                Err(e)
            }
            Err(timeout) => {
                // A late response would be read by the next caller, so the pipe goes
                self.teardown(&mut slot, "request timed out");
                Err(timeout.into())
            }
        }
    }

    /// A fetch function bound to `url`, for hooks that target one server.
    pub fn bind(self: &Arc<Self>, url: impl Into<String>) -> BoundFetch {
        BoundFetch {
            endpoint: self.clone(),
            url: url.into(),
        }
    }

    async fn ensure_started<'a>(&self, slot: &'a mut Option<RelayPipe>) -> Result<&'a mut RelayPipe> {
        if slot.is_none() {
            self.status.send_replace(RelayStatus::Starting);
            info!(launcher = self.launcher.name(), "Starting relay");

            match run_bounded(self.launch_and_handshake(), self.timeouts.startup).await {
                Ok(Ok(pipe)) => {
                    *slot = Some(pipe);
                    self.status.send_replace(RelayStatus::Ready);
                    info!("Relay ready");
                }
                Ok(Err(e)) => {
                    self.status.send_replace(RelayStatus::Failed);
                    return Err(e);
                }
                Err(timeout) => {
                    self.status.send_replace(RelayStatus::Failed);
                    warn!(millis = timeout.millis, "Relay did not become ready in time");
                    return Err(timeout.into());
                }
            }
        }

        slot.as_mut()
            .ok_or_else(|| SandlinkError::RelayUnavailable("relay pipe missing".to_string()))
    }

    async fn launch_and_handshake(&self) -> Result<RelayPipe> {
        let mut pipe = self.launcher.launch().await?;

        let value = pipe.reader.next_frame().await?.ok_or_else(|| {
            SandlinkError::RelayUnavailable("relay exited before signalling readiness".to_string())
        })?;

        match Envelope::from_value(value) {
            Ok(Envelope::Ready) => Ok(pipe),
            Ok(other) => Err(SandlinkError::RelayProtocol(format!(
                "expected ready frame, got '{}'",
                other.kind()
            ))),
            Err(e) => Err(SandlinkError::RelayProtocol(format!(
                "invalid readiness frame: {}",
                e
            ))),
        }
    }

    fn teardown(&self, slot: &mut Option<RelayPipe>, reason: &str) {
        if slot.take().is_some() {
            warn!(reason = %reason, "Dropping relay pipe");
        }
        self.status.send_replace(RelayStatus::Failed);
    }
}

/// Write one request and read until its response arrives.
///
/// Lines that do not decode as frames are logged and skipped, so the response
/// behind them is still read by this call and never left for the next one.
async fn exchange(pipe: &mut RelayPipe, request: RelayRequest) -> Result<RelayResponse> {
    pipe.writer.send(&Envelope::Request(request)).await?;

    loop {
        let value = match pipe.reader.next_frame().await {
            Ok(Some(value)) => value,
            Ok(None) => break,
            Err(e @ (FrameError::Io(_) | FrameError::TooLarge { .. })) => return Err(e.into()),
            Err(e) => {
                warn!(error = %e, "Skipping undecodable relay output");
                continue;
            }
        };

        let kind = frame_type(&value).to_string();
        match Envelope::from_value(value) {
            Ok(Envelope::Response(response)) => return Ok(response),
            Ok(_) => debug!(kind = %kind, "Ignoring relay frame"),
            Err(e) if kind == "response" => {
                return Err(SandlinkError::RelayProtocol(format!(
                    "invalid response frame: {}",
                    e
                )));
            }
            Err(e) => debug!(kind = %kind, error = %e, "Ignoring undecodable relay frame"),
        }
    }

    Err(SandlinkError::RelayUnavailable(
        "relay closed its output before responding".to_string(),
    ))
}

fn breaks_pipe(err: &SandlinkError) -> bool {
    matches!(
        err,
        SandlinkError::RelayUnavailable(_)
            | SandlinkError::Io(_)
            | SandlinkError::FrameParse(FrameError::Io(_) | FrameError::TooLarge { .. })
    )
}

/// [`RelayEndpoint::fetch`] with the URL already filled in.
#[derive(Clone)]
pub struct BoundFetch {
    endpoint: Arc<RelayEndpoint>,
    url: String,
}

impl BoundFetch {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn fetch(&self, init: RelayRequestInit) -> Option<RelayResponse> {
        self.endpoint.fetch(init.into_request(self.url.clone())).await
    }

    pub async fn try_fetch(&self, init: RelayRequestInit) -> Result<RelayResponse> {
        self.endpoint
            .try_fetch(init.into_request(self.url.clone()))
            .await
    }
}
