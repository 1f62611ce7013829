//! Bridge configuration parsing and validation.

use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;

use serde::Deserialize;

use crate::bridge::environ::overrides_from_table;
use crate::bridge::mux::MultiplexerChoice;
use crate::{AppError, Result};

fn default_buffer_size() -> usize {
    64 * 1024
}

fn default_max_header_line() -> usize {
    1_048_576
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8000))
}

fn default_server_name() -> String {
    "localhost".into()
}

/// Settings for the HTTP host that fronts the bridge.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ServerConfig {
    /// Listen address.
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    /// Value exported as `SERVER_NAME`.
    #[serde(default = "default_server_name")]
    pub server_name: String,
    /// Value exported as `SCRIPT_NAME`; request paths are passed as `PATH_INFO`.
    #[serde(default)]
    pub script_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            server_name: default_server_name(),
            script_name: String::new(),
        }
    }
}

/// Bridge configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct BridgeConfig {
    /// Command line of the CGI program. Split on whitespace; no quoting.
    pub command: String,
    /// Send the child's stderr into its stdout instead of the error sink.
    #[serde(default)]
    pub merge_stderr: bool,
    /// Output demultiplexing strategy.
    #[serde(default)]
    pub multiplexer: MultiplexerChoice,
    /// Chunk size for stdin copies and stdout/stderr reads.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Longest header line accepted from the child, in bytes.
    #[serde(default = "default_max_header_line")]
    pub max_header_line: usize,
    /// Extra variables exported to the child; they win over request values.
    #[serde(default)]
    pub env: toml::Table,
    /// HTTP host settings.
    #[serde(default)]
    pub server: ServerConfig,
}

impl BridgeConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// The `[env]` table as a flat string map.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if any value is not a string.
    pub fn overrides(&self) -> Result<HashMap<String, String>> {
        overrides_from_table(&self.env)
    }

    fn validate(&self) -> Result<()> {
        if self.command.split_whitespace().next().is_none() {
            return Err(AppError::Config("command must not be empty".into()));
        }

        if self.buffer_size == 0 {
            return Err(AppError::Config(
                "buffer_size must be greater than zero".into(),
            ));
        }

        if self.max_header_line == 0 {
            return Err(AppError::Config(
                "max_header_line must be greater than zero".into(),
            ));
        }

        self.overrides()?;
        Ok(())
    }
}
