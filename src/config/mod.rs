//! Configuration management
//!
//! Values come from built-in defaults, an optional TOML file and
//! `MESHCALL__SECTION__KEY` environment variables, in that order.

use crate::domain::shared::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub relay: RelayConfig,
    pub session: SessionConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// 0 disables the limit; a full mesh gets expensive quickly
    pub max_participants_per_room: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Bound on the Offering/Answering states
    pub negotiation_timeout_secs: u64,
    /// How often stalled negotiations are checked
    pub timeout_check_interval_ms: u64,
    /// Chat lines kept in the conference view
    pub chat_history_limit: usize,
    pub ice_servers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive, overridden by `RUST_LOG`
    pub filter: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_participants_per_room: 16,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            negotiation_timeout_secs: 30,
            timeout_check_interval_ms: 1000,
            chat_history_limit: 200,
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "meshcall=info,tower_http=info".to_string(),
        }
    }
}

impl SessionConfig {
    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation_timeout_secs)
    }

    pub fn timeout_check_interval(&self) -> Duration {
        Duration::from_millis(self.timeout_check_interval_ms.max(1))
    }
}

impl Config {
    /// Load configuration from an optional file plus environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("MESHCALL")
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("session.ice_servers")
                .try_parsing(true),
        );

        let config = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Parse configuration from TOML text (defaults fill the gaps)
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::from_str(text, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
