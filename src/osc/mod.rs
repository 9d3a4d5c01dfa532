//! OSC side channel: the sandbox prints an escape sequence, the host runs a
//! handler and hands the result back through a signal file.

mod command;
mod dispatcher;
mod emitter;
mod handler;
mod payload;
pub mod sequence;

pub use command::{CommandHandler, ACTIVE_PID_ENV};
pub use dispatcher::{ChannelState, OscDispatcher};
pub use emitter::emit;
pub use handler::{
    handler_fn, EditorHandle, OscContext, OscHandler, OscOutcome, OscRegistration,
    OscRegistrationBuilder,
};
pub use payload::{MalformedOsc, OscPayload, DATA_PAYLOAD_TYPE};
pub use sequence::{encode_invocation, OscScanner, ScanItem};
