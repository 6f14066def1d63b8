//! Configuration types for hutao-instance.
//! Parsed from ~/.config/hutao/instance.toml.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use hutao_ipc_protocol::endpoint::default_socket_dir;
use hutao_ipc_protocol::{Endpoint, DEFAULT_ENDPOINT_NAME};

use crate::expand_tilde;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceConfig {
    #[serde(default)]
    pub endpoint: EndpointSection,
    #[serde(default)]
    pub timeouts: TimeoutSection,
    #[serde(default)]
    pub activation: ActivationSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointSection {
    #[serde(default = "default_endpoint_name")]
    pub name: String,
    /// Directory for the socket file (Unix only).
    pub socket_dir: Option<String>,
}

impl Default for EndpointSection {
    fn default() -> Self {
        Self {
            name: default_endpoint_name(),
            socket_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutSection {
    #[serde(default = "default_connect_ms")]
    pub connect_ms: u64,
    #[serde(default = "default_read_ms")]
    pub read_ms: u64,
    #[serde(default = "default_bind_retry_attempts")]
    pub bind_retry_attempts: u32,
    #[serde(default = "default_bind_retry_delay_ms")]
    pub bind_retry_delay_ms: u64,
}

impl Default for TimeoutSection {
    fn default() -> Self {
        Self {
            connect_ms: default_connect_ms(),
            read_ms: default_read_ms(),
            bind_retry_attempts: default_bind_retry_attempts(),
            bind_retry_delay_ms: default_bind_retry_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationSection {
    #[serde(default = "default_protocol_scheme")]
    pub protocol_scheme: String,
}

impl Default for ActivationSection {
    fn default() -> Self {
        Self {
            protocol_scheme: default_protocol_scheme(),
        }
    }
}

/// Bounded waits for every blocking step of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Single connect attempt. Absence of a server is the common case, so
    /// this stays short.
    pub connect: Duration,
    /// Each packet read.
    pub read: Duration,
    pub bind_retry_attempts: u32,
    pub bind_retry_delay: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        TimeoutSection::default().into()
    }
}

impl From<TimeoutSection> for Timeouts {
    fn from(section: TimeoutSection) -> Self {
        Self {
            connect: Duration::from_millis(section.connect_ms),
            read: Duration::from_millis(section.read_ms),
            bind_retry_attempts: section.bind_retry_attempts,
            bind_retry_delay: Duration::from_millis(section.bind_retry_delay_ms),
        }
    }
}

// Default value functions
fn default_endpoint_name() -> String {
    DEFAULT_ENDPOINT_NAME.into()
}
fn default_connect_ms() -> u64 {
    200
}
fn default_read_ms() -> u64 {
    500
}
fn default_bind_retry_attempts() -> u32 {
    10
}
fn default_bind_retry_delay_ms() -> u64 {
    50
}
fn default_protocol_scheme() -> String {
    "hutao".into()
}

impl InstanceConfig {
    /// Load config from file, or use defaults if missing.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: InstanceConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// The endpoint both roles are constructed with.
    pub fn endpoint(&self) -> Endpoint {
        let socket_dir = self
            .endpoint
            .socket_dir
            .as_deref()
            .map(expand_tilde)
            .unwrap_or_else(default_socket_dir);
        Endpoint::new(self.endpoint.name.clone()).with_socket_dir(socket_dir)
    }

    pub fn timeouts(&self) -> Timeouts {
        self.timeouts.clone().into()
    }
}
