//! Server configuration
//!
//! Read from environment variables (a `.env` file is loaded first by `main`).

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use super::call::CallSettings;
use super::esl::{constants::COMMAND_TIMEOUT_SECS, OverflowPolicy};
use super::routing::{RoutingError, RoutingTable};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value:?} ({reason})")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("Routing table: {0}")]
    Routes(#[from] RoutingError),
}

/// Host and port checked by the health endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeTarget {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for ProbeTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the outbound listener binds to
    pub bind_address: String,

    /// Port the media engine connects to
    pub bind_port: u16,

    /// Calls handled at once
    pub max_connections: usize,

    /// What happens to connections beyond `max_connections`
    pub overflow_policy: OverflowPolicy,

    /// Bound on each read from a control connection
    pub command_timeout: Duration,

    /// Pause between answer and bridge
    pub answer_grace: Duration,

    /// How long shutdown waits for calls in progress
    pub shutdown_drain: Duration,

    /// Health endpoint port, 0 disables it
    pub health_port: u16,

    /// JSON routing table; built-in table when unset
    pub routes_file: Option<String>,

    /// Media engine control port to probe from the health endpoint
    pub freeswitch: Option<ProbeTarget>,

    /// Relational store to probe from the health endpoint
    pub database_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            bind_port: 5002,
            max_connections: 10,
            overflow_policy: OverflowPolicy::Queue,
            command_timeout: Duration::from_secs(COMMAND_TIMEOUT_SECS),
            answer_grace: Duration::from_millis(500),
            shutdown_drain: Duration::from_secs(10),
            health_port: 5001,
            routes_file: None,
            freeswitch: None,
            database_url: None,
        }
    }
}

impl ServerConfig {
    /// Create config from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Create config from any variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let overflow_policy = match var("ESL_OVERFLOW_POLICY") {
            Some(value) => value.parse::<OverflowPolicy>().map_err(|reason| ConfigError::Invalid {
                name: "ESL_OVERFLOW_POLICY",
                value,
                reason,
            })?,
            None => defaults.overflow_policy,
        };

        let freeswitch = match var("FS_HOST") {
            Some(host) => Some(ProbeTarget {
                host,
                port: parse_var(&var, "FS_PORT", 8021)?,
            }),
            None => None,
        };

        let config = Self {
            bind_address: var("ESL_BIND_ADDRESS").unwrap_or(defaults.bind_address),
            bind_port: parse_var(&var, "ESL_BIND_PORT", defaults.bind_port)?,
            max_connections: parse_var(&var, "ESL_MAX_CONNECTIONS", defaults.max_connections)?,
            overflow_policy,
            command_timeout: Duration::from_secs(parse_var(
                &var,
                "ESL_COMMAND_TIMEOUT_SECS",
                COMMAND_TIMEOUT_SECS,
            )?),
            answer_grace: Duration::from_millis(parse_var(&var, "ESL_ANSWER_GRACE_MS", 500)?),
            shutdown_drain: Duration::from_secs(parse_var(&var, "SHUTDOWN_DRAIN_SECS", 10)?),
            health_port: parse_var(&var, "HEALTH_PORT", defaults.health_port)?,
            routes_file: var("ROUTES_FILE"),
            freeswitch,
            database_url: var("DATABASE_URL"),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid {
                name: "ESL_MAX_CONNECTIONS",
                value: "0".to_string(),
                reason: "at least one connection is required".to_string(),
            });
        }
        if self.max_connections > (u32::MAX as usize).min(tokio::sync::Semaphore::MAX_PERMITS) {
            return Err(ConfigError::Invalid {
                name: "ESL_MAX_CONNECTIONS",
                value: self.max_connections.to_string(),
                reason: "too large".to_string(),
            });
        }
        if self.command_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                name: "ESL_COMMAND_TIMEOUT_SECS",
                value: "0".to_string(),
                reason: "a zero timeout fails every command".to_string(),
            });
        }
        if self.health_port != 0 && self.health_port == self.bind_port {
            return Err(ConfigError::Invalid {
                name: "HEALTH_PORT",
                value: self.health_port.to_string(),
                reason: "must differ from ESL_BIND_PORT".to_string(),
            });
        }
        Ok(())
    }

    /// `address:port` of the outbound listener
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.bind_port)
    }

    pub fn call_settings(&self) -> CallSettings {
        CallSettings {
            answer_grace: self.answer_grace,
            ..CallSettings::default()
        }
    }

    /// Load the configured routing table, or the built-in one
    pub fn load_routes(&self) -> Result<RoutingTable, ConfigError> {
        match &self.routes_file {
            Some(path) => Ok(RoutingTable::from_file(path)?),
            None => Ok(RoutingTable::builtin()),
        }
    }
}

fn parse_var<T, F>(var: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match var(name) {
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            reason: e.to_string(),
            value,
        }),
        None => Ok(default),
    }
}
