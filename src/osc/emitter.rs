use serde_json::Value;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;
use uuid::Uuid;

use crate::error::{Result, SandlinkError};
use crate::osc::sequence::encode_invocation;
use crate::signal::SignalDir;

/// Sandbox side of an invocation: write the sequence to `out` and block until
/// the host answers through the signal file.
///
/// Returns the handler's string result, or `None` if it produced none.
pub async fn emit<W>(
    channel: u32,
    data: &Value,
    signals: &SignalDir,
    out: &mut W,
) -> Result<Option<String>>
where
    W: AsyncWrite + Unpin,
{
    let correlation_id = Uuid::new_v4().to_string();
    let sequence = encode_invocation(channel, &correlation_id, data)?;
    debug!(channel, correlation_id = %correlation_id, "Emitting OSC invocation");

    signals
        .signal(&correlation_id, || async move {
            out.write_all(sequence.as_bytes()).await?;
            out.flush().await?;
            Ok::<(), SandlinkError>(())
        })
        .await
}
