use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::relay::RelayTimeouts;
use crate::signal::DEFAULT_SIGNAL_DIR;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SandlinkConfig {
    pub relay: RelayConfig,
    pub signal: SignalConfig,
    /// Host commands bound to OSC channel ids
    pub osc: Vec<OscCommandConfig>,
}

/// How the relay process is started.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Relay program and arguments (runs in-process when not set)
    pub command: Option<Vec<String>>,
    /// Command run to completion before the relay is first launched
    pub install: Vec<String>,
    /// Working directory for both commands
    pub workdir: Option<PathBuf>,
    /// Time allowed for launch plus the ready handshake
    pub startup_timeout_ms: u64,
    /// Time allowed for one request/response exchange
    pub request_timeout_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            command: None,
            install: Vec::new(),
            workdir: None,
            startup_timeout_ms: 30_000,
            request_timeout_ms: 60_000,
        }
    }
}

impl RelayConfig {
    pub fn timeouts(&self) -> RelayTimeouts {
        RelayTimeouts {
            startup: Duration::from_millis(self.startup_timeout_ms),
            request: Duration::from_millis(self.request_timeout_ms),
        }
    }
}

/// File-signal rendezvous settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    /// Directory shared by the sandbox and the host
    pub dir: PathBuf,
    pub timeout_ms: u64,
    /// Debounce window after the first change event
    pub settle_ms: u64,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(DEFAULT_SIGNAL_DIR),
            timeout_ms: 5_000,
            settle_ms: 20,
        }
    }
}

/// An OSC channel served by a host command.
///
/// The command receives the invocation's JSON payload on stdin; its trimmed
/// stdout is handed back to the sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OscCommandConfig {
    pub name: String,
    pub id: u32,
    pub command: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: SandlinkConfig = toml::from_str("").unwrap();
        assert!(config.relay.command.is_none());
        assert_eq!(config.relay.startup_timeout_ms, 30_000);
        assert_eq!(config.relay.request_timeout_ms, 60_000);
        assert_eq!(config.signal.dir, PathBuf::from("/tmp"));
        assert_eq!(config.signal.settle_ms, 20);
        assert!(config.osc.is_empty());
    }

    #[test]
    fn test_full_config() {
        let config: SandlinkConfig = toml::from_str(
            r#"
            [relay]
            command = ["node", "relay.js"]
            install = ["npm", "install"]
            workdir = "/bin"
            request_timeout_ms = 1500

            [signal]
            dir = "/shared"

            [[osc]]
            name = "html"
            id = 80085
            command = ["cat"]
            "#,
        )
        .unwrap();

        assert_eq!(
            config.relay.command,
            Some(vec!["node".to_string(), "relay.js".to_string()])
        );
        assert_eq!(config.relay.workdir, Some(PathBuf::from("/bin")));
        assert_eq!(config.relay.timeouts().request, Duration::from_millis(1500));
        assert_eq!(config.relay.timeouts().startup, Duration::from_secs(30));
        assert_eq!(config.signal.timeout_ms, 5_000);
        assert_eq!(config.osc[0].id, 80085);
        assert_eq!(config.osc[0].name, "html");
    }

    #[test]
    fn test_default_config_serializes() {
        let rendered = toml::to_string_pretty(&SandlinkConfig::default()).unwrap();
        let parsed: SandlinkConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.signal.timeout_ms, 5_000);
    }
}
