//! The relay process: the side of the pipe that can reach the network.
//!
//! Protocol:
//! - On start the relay writes one `ready` frame
//! - Host sends `request` frames (one per line)
//! - Relay answers each with exactly one `response` frame
//! - End of input terminates the loop cleanly

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Method, StatusCode, Url};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::error::{Result, SandlinkError};
use crate::frame::{FrameError, FrameReader, FrameWriter};
use crate::relay::types::{Envelope, RelayRequest, RelayResponse, REQUEST_ID_HEADER};

/// Performs the real network request on behalf of the sandbox.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch `url` (already resolved from `request.url` + `request.path`).
    async fn fetch(&self, url: Url, request: &RelayRequest) -> Result<RelayResponse>;
}

/// [`Fetcher`] backed by a `reqwest` client.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: Url, request: &RelayRequest) -> Result<RelayResponse> {
        let method = Method::from_bytes(request.method().to_ascii_uppercase().as_bytes())
            .map_err(|e| {
                SandlinkError::RelayProtocol(format!(
                    "invalid method '{}': {}",
                    request.method(),
                    e
                ))
            })?;

        let mut builder = self.client.request(method, url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await?;
        let url = response.url().to_string();
        let status = response.status();

        // Repeated headers are folded the way fetch's Headers does
        let mut headers: HashMap<String, String> = HashMap::new();
        for (name, value) in response.headers() {
            let value = String::from_utf8_lossy(value.as_bytes());
            headers
                .entry(name.as_str().to_string())
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(&value);
                })
                .or_insert_with(|| value.to_string());
        }

        let body = response.text().await?;

        Ok(RelayResponse {
            url,
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or("").to_string(),
            headers,
            body,
        })
    }
}

/// Stateless request loop over a framed input/output pair.
pub struct RelayProcess {
    fetcher: Arc<dyn Fetcher>,
}

impl RelayProcess {
    pub fn new(fetcher: Arc<dyn Fetcher>) -> Self {
        Self { fetcher }
    }

    /// Serve requests until `input` reaches end of stream.
    ///
    /// Per-request failures are answered with an error-shaped response; only
    /// I/O failures on the pipe itself end the loop with an error.
    pub async fn run<R, W>(&self, input: R, output: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut reader = FrameReader::new(input);
        let mut writer = FrameWriter::new(output);

        writer.send(&Envelope::Ready).await?;
        info!("Relay ready");

        loop {
            let value = match reader.next_frame().await {
                Ok(Some(value)) => value,
                Ok(None) => {
                    info!("Relay input closed, exiting");
                    break;
                }
                Err(FrameError::Io(e)) => return Err(e.into()),
                Err(e) => {
                    warn!(error = %e, "Undecodable relay frame");
                    let response = RelayResponse::error(
                        "",
                        StatusCode::BAD_REQUEST,
                        format!("Invalid relay frame: {}", e),
                    );
                    writer.send(&Envelope::Response(response)).await?;
                    continue;
                }
            };

            let response = match Envelope::from_value(value) {
                Ok(Envelope::Request(request)) => self.handle(request).await,
                Ok(other) => {
                    debug!(kind = other.kind(), "Ignoring non-request frame");
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "Invalid relay request");
                    RelayResponse::error(
                        "",
                        StatusCode::BAD_REQUEST,
                        format!("Invalid relay request: {}", e),
                    )
                }
            };

            writer.send(&Envelope::Response(response)).await?;
        }

        Ok(())
    }

    /// Perform one request, never failing: errors become error responses.
    pub async fn handle(&self, request: RelayRequest) -> RelayResponse {
        let url = match request.resolve_url() {
            Ok(url) => url,
            Err(e) => {
                warn!(url = %request.url, error = %e, "Rejecting relay request");
                return RelayResponse::error(&request.url, StatusCode::BAD_REQUEST, e.to_string());
            }
        };

        debug!(
            method = %request.method(),
            url = %url,
            request_id = request.headers.get(REQUEST_ID_HEADER).map(String::as_str).unwrap_or("-"),
            "Relaying request"
        );

        match self.fetcher.fetch(url.clone(), &request).await {
            Ok(response) => {
                debug!(status = response.status, body_len = response.body.len(), "Relay request completed");
                response
            }
            Err(e) => {
                warn!(url = %url, error = %e, "Relay request failed");
                RelayResponse::error(url.as_str(), StatusCode::BAD_GATEWAY, e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tokio::io::{duplex, split};

    /// Answers 200 with the method and resolved URL, or fails for `fail.test`.
    struct StubFetcher;

    #[async_trait]
    impl Fetcher for StubFetcher {
        async fn fetch(&self, url: Url, request: &RelayRequest) -> Result<RelayResponse> {
            if url.host_str() == Some("fail.test") {
                return Err(SandlinkError::RelayUnavailable("connection refused".to_string()));
            }
            Ok(RelayResponse::new(
                url.as_str(),
                200,
                format!("{} {}", request.method(), url.path()),
            ))
        }
    }

    async fn exchange(frames: &[&str]) -> Vec<Value> {
        let (host, relay) = duplex(4096);
        let (relay_read, relay_write) = split(relay);
        let server = tokio::spawn(async move {
            RelayProcess::new(Arc::new(StubFetcher))
                .run(relay_read, relay_write)
                .await
        });

        let (host_read, mut host_write) = split(host);
        for frame in frames {
            tokio::io::AsyncWriteExt::write_all(&mut host_write, frame.as_bytes())
                .await
                .unwrap();
        }
        tokio::io::AsyncWriteExt::shutdown(&mut host_write).await.unwrap();

        let mut reader = FrameReader::new(host_read);
        let mut out = Vec::new();
        while let Some(value) = reader.next_frame().await.unwrap() {
            out.push(value);
        }
        server.await.unwrap().unwrap();
        out
    }

    #[tokio::test]
    async fn test_ready_then_exit_on_eof() {
        let frames = exchange(&[]).await;
        assert_eq!(frames, vec![json!({"type": "ready"})]);
    }

    #[tokio::test]
    async fn test_request_is_answered_with_path_resolved() {
        let frames = exchange(&[
            "{\"type\":\"request\",\"url\":\"http://localhost:9191/\",\"method\":\"post\",\"path\":\"/exit\"}\r\n",
        ])
        .await;

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1]["type"], "response");
        assert_eq!(frames[1]["status"], 200);
        assert_eq!(frames[1]["url"], "http://localhost:9191/exit");
        assert_eq!(frames[1]["body"], "post /exit");
    }

    #[tokio::test]
    async fn test_errors_do_not_stop_the_loop() {
        let frames = exchange(&[
            "{\"type\":\"request\",\"url\":\"not a url\"}\r\n",
            "garbage\r\n",
            "{\"type\":\"request\"}\r\n",
            "{\"type\":\"request\",\"url\":\"http://fail.test/\"}\r\n",
            "{\"type\":\"ping\"}\r\n",
            "{\"type\":\"request\",\"url\":\"http://ok.test/x\"}\r\n",
        ])
        .await;

        let statuses: Vec<_> = frames[1..].iter().map(|f| f["status"].clone()).collect();
        assert_eq!(statuses, vec![json!(400), json!(400), json!(400), json!(502), json!(200)]);
        assert_eq!(frames[4]["statusText"], "Bad Gateway");
        assert!(frames[4]["body"].as_str().unwrap().contains("connection refused"));
    }
}
