//! Session configuration

use crate::error::ObdError;
use crate::protocol::ObdProtocol;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default bound on how long the gate waits for a prompt
const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 2000;

/// Adapter and connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Bus protocol selected during the handshake (default: auto)
    pub protocol: ObdProtocol,
    /// ELM327 adaptive timing level, 0-2 (default: 2, most aggressive)
    pub adaptive_timing: u8,
    /// Adapter-side maximum wait per query in milliseconds (default: 40)
    pub adapter_timeout_ms: u64,
    /// Report a missing prompt after this many milliseconds; the gate is
    /// released after a second period without one (default: 2000)
    pub command_timeout_ms: u64,
    /// Capacity of the parser event channel
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            protocol: ObdProtocol::Auto,
            adaptive_timing: 2,
            adapter_timeout_ms: 40,
            command_timeout_ms: DEFAULT_COMMAND_TIMEOUT_MS,
            event_capacity: 64,
        }
    }
}

impl SessionConfig {
    /// Load from an optional file plus `OBD_*` environment overrides
    /// (e.g. `OBD_COMMAND_TIMEOUT_MS=500`). Missing keys keep their defaults.
    pub fn load(path: Option<&str>) -> Result<Self, ObdError> {
        load_with_prefix(path, "OBD")
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// The handshake commands for these settings
    pub fn handshake(&self) -> Vec<String> {
        crate::protocol::handshake_commands(
            self.adaptive_timing,
            self.adapter_timeout_ms,
            self.protocol,
        )
    }
}

/// Deserialize any config struct from an optional file plus prefixed
/// environment variables. Nested keys use `__` in variable names.
pub fn load_with_prefix<T: serde::de::DeserializeOwned>(
    path: Option<&str>,
    env_prefix: &str,
) -> Result<T, ObdError> {
    let mut builder = config::Config::builder();
    if let Some(path) = path {
        builder = builder.add_source(config::File::with_name(path).required(false));
    }
    let settings = builder
        .add_source(
            config::Environment::with_prefix(env_prefix)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;
    Ok(settings.try_deserialize()?)
}
