pub mod bounded;
pub mod cli;
pub mod config;
pub mod error;
pub mod feature;
pub mod frame;
pub mod osc;
pub mod relay;
pub mod signal;

pub use error::{Result, SandlinkError};
