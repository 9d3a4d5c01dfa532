//! Pluggable features: each contributes an optional OSC handler plus hooks
//! that run when a dev server in the sandbox comes up or a port changes.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::error::Result;
use crate::osc::{OscDispatcher, OscRegistrationBuilder};
use crate::relay::{BoundFetch, RelayEndpoint};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PortEvent {
    Open,
    Close,
}

/// Called once a server inside the sandbox is ready.
#[async_trait]
pub trait ServerReadyHook: Send + Sync {
    async fn on_server_ready(&self, port: u16, url: &str, fetch: BoundFetch) -> Result<()>;
}

/// Called when a port inside the sandbox opens or closes.
#[async_trait]
pub trait PortHook: Send + Sync {
    async fn on_port(&self, port: u16, event: PortEvent, url: &str, fetch: BoundFetch)
        -> Result<()>;
}

/// Everything one feature contributes.
#[derive(Clone, Default)]
pub struct Feature {
    pub name: String,
    /// Commands the feature provides inside the sandbox
    pub bin: Vec<String>,
    pub osc: Option<OscRegistrationBuilder>,
    pub on_server_ready: Option<Arc<dyn ServerReadyHook>>,
    pub on_port: Option<Arc<dyn PortHook>>,
}

impl Feature {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_bin(mut self, bin: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.bin = bin.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_osc(mut self, osc: OscRegistrationBuilder) -> Self {
        self.osc = Some(osc);
        self
    }

    pub fn with_server_ready(mut self, hook: Arc<dyn ServerReadyHook>) -> Self {
        self.on_server_ready = Some(hook);
        self
    }

    pub fn with_port_hook(mut self, hook: Arc<dyn PortHook>) -> Self {
        self.on_port = Some(hook);
        self
    }
}

struct LoadedFeature {
    name: String,
    bin: Vec<String>,
    osc_id: Option<u32>,
    on_server_ready: Option<Arc<dyn ServerReadyHook>>,
    on_port: Option<Arc<dyn PortHook>>,
}

/// The loaded set of features.
#[derive(Default)]
pub struct FeatureRegistry {
    features: Vec<LoadedFeature>,
}

impl FeatureRegistry {
    /// Validate every feature and register its OSC handler with `dispatcher`.
    ///
    /// Stops at the first feature whose OSC export is incomplete.
    pub fn load(features: Vec<Feature>, dispatcher: &mut OscDispatcher) -> Result<Self> {
        let mut loaded = Vec::with_capacity(features.len());

        for feature in features {
            let osc_id = match feature.osc {
                Some(builder) => {
                    let registration = builder.build().map_err(|e| {
                        error!(feature = %feature.name, error = %e, "Invalid OSC export");
                        e
                    })?;
                    let id = registration.id();
                    dispatcher.register(registration);
                    Some(id)
                }
                None => None,
            };

            debug!(feature = %feature.name, osc = ?osc_id, bin = ?feature.bin, "Loaded feature");
            loaded.push(LoadedFeature {
                name: feature.name,
                bin: feature.bin,
                osc_id,
                on_server_ready: feature.on_server_ready,
                on_port: feature.on_port,
            });
        }

        Ok(Self { features: loaded })
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.features.iter().map(|f| f.name.as_str()).collect()
    }

    /// All commands contributed by all features.
    pub fn bins(&self) -> Vec<&str> {
        self.features
            .iter()
            .flat_map(|f| f.bin.iter().map(String::as_str))
            .collect()
    }

    pub fn osc_channel(&self, name: &str) -> Option<u32> {
        self.features
            .iter()
            .find(|f| f.name == name)
            .and_then(|f| f.osc_id)
    }

    /// Run every server-ready hook concurrently. Hook failures are logged.
    pub async fn server_ready(&self, port: u16, url: &str, endpoint: &Arc<RelayEndpoint>) {
        let mut hooks = JoinSet::new();
        for feature in &self.features {
            let Some(hook) = feature.on_server_ready.clone() else {
                continue;
            };
            let name = feature.name.clone();
            let url = url.to_string();
            let fetch = endpoint.bind(url.clone());
            hooks.spawn(async move { (name, hook.on_server_ready(port, &url, fetch).await) });
        }
        drain(hooks, "server-ready").await;
    }

    /// Run every port hook concurrently. Hook failures are logged.
    pub async fn port_event(
        &self,
        port: u16,
        event: PortEvent,
        url: &str,
        endpoint: &Arc<RelayEndpoint>,
    ) {
        let mut hooks = JoinSet::new();
        for feature in &self.features {
            let Some(hook) = feature.on_port.clone() else {
                continue;
            };
            let name = feature.name.clone();
            let url = url.to_string();
            let fetch = endpoint.bind(url.clone());
            hooks.spawn(async move { (name, hook.on_port(port, event, &url, fetch).await) });
        }
        drain(hooks, "port").await;
    }
}

async fn drain(mut hooks: JoinSet<(String, Result<()>)>, kind: &str) {
    while let Some(joined) = hooks.join_next().await {
        match joined {
            Ok((_, Ok(()))) => {}
            Ok((feature, Err(e))) => {
                warn!(feature = %feature, hook = kind, error = %e, "Feature hook failed")
            }
            Err(e) => error!(hook = kind, error = %e, "Feature hook panicked"),
        }
    }
}
