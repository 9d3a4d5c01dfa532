use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::Value;
use thiserror::Error;

/// The only payload type the dispatcher understands.
pub const DATA_PAYLOAD_TYPE: &str = "data";

/// A decoded `data;<correlationId>;<base64Json>` payload.
#[derive(Debug, Clone, PartialEq)]
pub struct OscPayload {
    pub correlation_id: String,
    pub data: Value,
}

/// Why a raw OSC payload was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedOsc {
    #[error("unsupported payload type '{0}'")]
    UnsupportedType(String),

    #[error("missing correlation id")]
    MissingCorrelationId,

    #[error("missing payload")]
    MissingPayload,

    #[error("payload is not base64: {0}")]
    Base64(String),

    #[error("payload is not UTF-8")]
    Utf8,

    #[error("payload is not JSON: {0}")]
    Json(String),
}

impl OscPayload {
    /// Parse the text following `<id>;` in an OSC sequence.
    pub fn parse(raw: &str) -> Result<Self, MalformedOsc> {
        let mut parts = raw.splitn(3, ';');
        let kind = parts.next().unwrap_or_default();
        let correlation_id = parts.next().unwrap_or_default();
        let encoded = parts.next().unwrap_or_default();

        if kind != DATA_PAYLOAD_TYPE {
            return Err(MalformedOsc::UnsupportedType(kind.to_string()));
        }
        if correlation_id.is_empty() {
            return Err(MalformedOsc::MissingCorrelationId);
        }
        if encoded.is_empty() {
            return Err(MalformedOsc::MissingPayload);
        }

        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| MalformedOsc::Base64(e.to_string()))?;
        let text = String::from_utf8(bytes).map_err(|_| MalformedOsc::Utf8)?;
        let data = serde_json::from_str(&text).map_err(|e| MalformedOsc::Json(e.to_string()))?;

        Ok(Self {
            correlation_id: correlation_id.to_string(),
            data,
        })
    }
}
