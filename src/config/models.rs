//! Configuration data structures for fetchgate.
//!
//! These types map directly to TOML (also JSON / YAML) configuration files.
//! Every section has defaults so an empty file is a valid configuration.
//! Durations are humantime strings such as `"500ms"`, `"5s"` or `"1m"`.
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    core::fetch_engine::FetchLimits,
    utils::admission_gate::AdmissionGateConfig,
};

/// Parse a humantime duration string, naming the field on failure.
pub fn parse_duration(field: &str, value: &str) -> Result<Duration, String> {
    humantime::parse_duration(value).map_err(|e| format!("invalid duration for {field} '{value}': {e}"))
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default)]
    pub admission: AdmissionConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            admission: AdmissionConfig::default(),
            fetch: FetchConfig::default(),
            shutdown: ShutdownConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Inbound connection admission
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Maximum simultaneously open inbound connections
    pub max_connections: usize,
    /// How long an accept may wait for a free slot; unset waits forever
    pub accept_timeout: Option<String>,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            accept_timeout: Some("5s".to_string()),
        }
    }
}

impl AdmissionConfig {
    pub fn accept_timeout(&self) -> Result<Option<Duration>, String> {
        self.accept_timeout
            .as_deref()
            .map(|value| parse_duration("admission.accept_timeout", value))
            .transpose()
    }

    /// Build the gate parameters. The error callback is left to the caller.
    pub fn gate_config(&self) -> Result<AdmissionGateConfig, String> {
        let mut config = AdmissionGateConfig::new(self.max_connections);
        config.accept_timeout = self.accept_timeout()?;
        Ok(config)
    }
}

/// Outbound fan-out per inbound request
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct FetchConfig {
    /// Largest accepted `urls` list
    pub max_urls: usize,
    /// Fetches in flight per request
    pub max_concurrency: usize,
    /// Bound on a single fetch
    pub fetch_timeout: String,
    /// Bound on the whole batch; expiry cancels outstanding fetches
    pub request_deadline: String,
    /// Outer bound on joining the batch's tasks
    pub join_timeout: String,
    pub max_body_bytes: usize,
    pub user_agent: Option<String>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_urls: 20,
            max_concurrency: 4,
            fetch_timeout: "1s".to_string(),
            request_deadline: "10s".to_string(),
            join_timeout: "30s".to_string(),
            max_body_bytes: 10 * 1024 * 1024,
            user_agent: None,
        }
    }
}

impl FetchConfig {
    pub fn fetch_timeout(&self) -> Result<Duration, String> {
        parse_duration("fetch.fetch_timeout", &self.fetch_timeout)
    }

    pub fn request_deadline(&self) -> Result<Duration, String> {
        parse_duration("fetch.request_deadline", &self.request_deadline)
    }

    pub fn join_timeout(&self) -> Result<Duration, String> {
        parse_duration("fetch.join_timeout", &self.join_timeout)
    }

    pub fn limits(&self) -> Result<FetchLimits, String> {
        Ok(FetchLimits {
            max_concurrency: self.max_concurrency,
            fetch_timeout: self.fetch_timeout()?,
            join_timeout: self.join_timeout()?,
            max_body_bytes: self.max_body_bytes,
        })
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Deadline for the graceful close of server and gate
    pub timeout: String,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout: "5s".to_string(),
        }
    }
}

impl ShutdownConfig {
    pub fn timeout(&self) -> Result<Duration, String> {
        parse_duration("shutdown.timeout", &self.timeout)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive; `RUST_LOG` wins when set
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.listen_addr, "0.0.0.0:8080");
        assert_eq!(config.admission.max_connections, 100);
        assert_eq!(config.fetch.max_urls, 20);

        let limits = config.fetch.limits().unwrap();
        assert_eq!(limits.max_concurrency, 4);
        assert_eq!(limits.fetch_timeout, Duration::from_secs(1));
        assert_eq!(limits.join_timeout, Duration::from_secs(30));
        assert_eq!(config.fetch.request_deadline().unwrap(), Duration::from_secs(10));
        assert_eq!(config.shutdown.timeout().unwrap(), Duration::from_secs(5));
    }

    #[test]
    fn test_gate_config_from_admission() {
        let admission = AdmissionConfig {
            max_connections: 3,
            accept_timeout: None,
        };
        let gate = admission.gate_config().unwrap();
        assert_eq!(gate.limit, 3);
        assert!(gate.accept_timeout.is_none());
    }

    #[test]
    fn test_bad_duration_names_field() {
        let fetch = FetchConfig {
            fetch_timeout: "soon".to_string(),
            ..FetchConfig::default()
        };
        let err = fetch.fetch_timeout().unwrap_err();
        assert!(err.contains("fetch.fetch_timeout"));
    }
}
