use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::osc::handler::{OscContext, OscHandler, OscOutcome, OscRegistration};
use crate::osc::payload::OscPayload;

/// Whether a channel is currently running its handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Dispatching,
}

struct Channel {
    handler: Arc<dyn OscHandler>,
    /// Serializes dispatches on this channel
    gate: Mutex<()>,
    busy: AtomicBool,
}

struct BusyFlag<'a>(&'a AtomicBool);

impl<'a> BusyFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for BusyFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Routes OSC invocations to registered handlers and hands results back.
#[derive(Default)]
pub struct OscDispatcher {
    channels: HashMap<u32, Channel>,
}

impl OscDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a handler to its channel id. A later registration replaces an
    /// earlier one for the same id.
    pub fn register(&mut self, registration: OscRegistration) {
        let id = registration.id();
        let channel = Channel {
            handler: registration.handler().clone(),
            gate: Mutex::new(()),
            busy: AtomicBool::new(false),
        };
        if self.channels.insert(id, channel).is_some() {
            warn!(channel = id, "Replacing existing OSC handler");
        } else {
            debug!(channel = id, "Registered OSC handler");
        }
    }

    pub fn is_registered(&self, channel_id: u32) -> bool {
        self.channels.contains_key(&channel_id)
    }

    pub fn channel_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.channels.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn state(&self, channel_id: u32) -> Option<ChannelState> {
        self.channels.get(&channel_id).map(|channel| {
            if channel.busy.load(Ordering::SeqCst) {
                ChannelState::Dispatching
            } else {
                ChannelState::Idle
            }
        })
    }

    /// Handle one invocation; `raw` is the text after `<id>;`.
    ///
    /// Returns whether the invocation was handled. Malformed payloads and
    /// unknown channels never reach a handler and never touch a signal file.
    pub async fn dispatch(&self, channel_id: u32, raw: &str, ctx: &OscContext) -> bool {
        let Some(channel) = self.channels.get(&channel_id) else {
            debug!(channel = channel_id, "No handler for OSC channel");
            return false;
        };

        let payload = match OscPayload::parse(raw) {
            Ok(payload) => payload,
            Err(reason) => {
                warn!(channel = channel_id, reason = %reason, "Malformed OSC payload");
                return false;
            }
        };

        let _turn = channel.gate.lock().await;
        let _busy = BusyFlag::raise(&channel.busy);

        let correlation_id = payload.correlation_id;
        let outcome = match channel.handler.handle(payload.data, ctx).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(channel = channel_id, correlation_id = %correlation_id, error = %e, "OSC handler failed");
                // Release the waiting producer with an empty result
                if let Some(writeback) = &ctx.writeback {
                    if let Err(e) = writeback.write_until_read(&correlation_id, "").await {
                        debug!(channel = channel_id, correlation_id = %correlation_id, error = %e, "OSC writeback after failure not read");
                    }
                }
                return false;
            }
        };

        let Some(writeback) = &ctx.writeback else {
            if let OscOutcome::Value(value) = &outcome {
                warn!(
                    channel = channel_id,
                    result = %value,
                    "No writeback available, dropping OSC handler output"
                );
            }
            return true;
        };

        let content = match &outcome {
            OscOutcome::Value(value) => value.as_str(),
            OscOutcome::Done(_) => "",
        };
        if let Err(e) = writeback.write_until_read(&correlation_id, content).await {
            warn!(channel = channel_id, correlation_id = %correlation_id, error = %e, "OSC writeback failed");
            return false;
        }

        debug!(channel = channel_id, correlation_id = %correlation_id, "OSC invocation handled");
        match outcome {
            OscOutcome::Value(_) => true,
            OscOutcome::Done(done) => done,
        }
    }
}
