//! Network relay between the sandbox and the host.
//!
//! The sandbox has no sockets, so requests travel as frames over a pipe to a
//! relay process that can reach the network, and responses travel back the
//! same way.

mod endpoint;
mod launcher;
mod process;
mod types;

pub use endpoint::{BoundFetch, RelayEndpoint, RelayStatus, RelayTimeouts};
pub use launcher::{
    launcher_from_config, BoxedReader, BoxedWriter, CommandLauncher, InProcessLauncher,
    RelayLauncher, RelayPipe,
};
pub use process::{Fetcher, HttpFetcher, RelayProcess};
pub use types::{
    frame_type, Envelope, RelayRequest, RelayRequestInit, RelayResponse, REQUEST_ID_HEADER,
    REQUEST_ORIGIN_HEADER,
};
