use std::collections::HashMap;

use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SandlinkError};

/// Header carrying the advisory per-call identifier.
pub const REQUEST_ID_HEADER: &str = "Relay-Request-Id";
/// Header naming the side that issued the call.
pub const REQUEST_ORIGIN_HEADER: &str = "Relay-Request-Origin";

/// A request to be performed by the relay process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelayRequest {
    /// Target URL (or base URL when `path` is set)
    pub url: String,
    /// HTTP method, `GET` when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Relative override resolved against `url` by the relay
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl RelayRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Method to use, defaulting to `GET`.
    pub fn method(&self) -> &str {
        self.method.as_deref().unwrap_or("GET")
    }

    /// The final target: `url`, with `path` joined onto it when present.
    pub fn resolve_url(&self) -> Result<Url> {
        let base = Url::parse(&self.url).map_err(|e| SandlinkError::InvalidUrl {
            url: self.url.clone(),
            reason: e.to_string(),
        })?;
        match self.path.as_deref() {
            Some(path) if !path.is_empty() => {
                base.join(path).map_err(|e| SandlinkError::InvalidUrl {
                    url: format!("{} + {}", self.url, path),
                    reason: e.to_string(),
                })
            }
            _ => Ok(base),
        }
    }
}

/// A request without its URL; the URL is bound by whoever owns the target.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelayRequestInit {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl RelayRequestInit {
    pub fn method(method: impl Into<String>) -> Self {
        Self {
            method: Some(method.into()),
            ..Default::default()
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn into_request(self, url: impl Into<String>) -> RelayRequest {
        RelayRequest {
            url: url.into(),
            method: self.method,
            headers: self.headers,
            body: self.body,
            path: self.path,
        }
    }
}

/// A response produced by the relay process. Bodies are always text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayResponse {
    pub url: String,
    pub status: u16,
    #[serde(default)]
    pub status_text: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: String,
}

impl RelayResponse {
    /// Build a response with the canonical reason phrase for `status`.
    pub fn new(url: impl Into<String>, status: u16, body: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            status,
            status_text: reason_phrase(status),
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    /// An error-shaped response, used when the relay cannot perform a request.
    pub fn error(url: impl Into<String>, status: StatusCode, message: impl Into<String>) -> Self {
        let mut response = Self::new(url, status.as_u16(), message);
        response
            .headers
            .insert("content-type".to_string(), "text/plain".to_string());
        response
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Parse the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

fn reason_phrase(status: u16) -> String {
    StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("")
        .to_string()
}

/// Every frame on the relay pipe, discriminated by its `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    Request(RelayRequest),
    Response(RelayResponse),
    Ready,
    /// Any tag this side does not understand
    #[serde(other)]
    Unknown,
}

impl Envelope {
    /// Classify a decoded frame by its `type` tag.
    pub fn from_value(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Request(_) => "request",
            Self::Response(_) => "response",
            Self::Ready => "ready",
            Self::Unknown => "unknown",
        }
    }
}

/// The raw `type` tag of a decoded frame, for logging.
pub fn frame_type(value: &Value) -> &str {
    value.get("type").and_then(Value::as_str).unwrap_or("<missing>")
}
