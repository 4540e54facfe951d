//! Route emitter configuration
//!
//! Loaded from a JSON file; every field has a default so the file only
//! needs to name what differs. Durations use humantime syntax ("30s", "1m").

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Deserializer};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
}

/// Where TCP route mappings are posted
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct RoutingApiConfig {
    pub uri: String,
    pub port: u16,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bbs_address: String,
    pub bbs_ca_cert_file: Option<PathBuf>,
    pub bbs_client_cert_file: Option<PathBuf>,
    pub bbs_client_key_file: Option<PathBuf>,

    /// Restrict emitting to endpoints on this cell
    pub cell_id: Option<String>,
    /// Report route counts per cell after every sync
    pub local_mode: bool,

    #[serde(deserialize_with = "duration")]
    pub communication_timeout: Duration,

    /// Comma separated NATS URLs
    pub nats_addresses: String,
    pub nats_username: String,
    pub nats_password: String,

    pub route_emitting_workers: usize,
    #[serde(deserialize_with = "duration")]
    pub sync_interval: Duration,

    pub healthcheck_address: String,

    pub routing_api: Option<RoutingApiConfig>,

    pub log_level: String,
    /// "json" or "text"
    pub log_format: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bbs_address: "https://bbs.service.cf.internal:8889".to_string(),
            bbs_ca_cert_file: None,
            bbs_client_cert_file: None,
            bbs_client_key_file: None,
            cell_id: None,
            local_mode: false,
            communication_timeout: Duration::from_secs(30),
            nats_addresses: "nats://127.0.0.1:4222".to_string(),
            nats_username: "nats".to_string(),
            nats_password: "nats".to_string(),
            route_emitting_workers: 20,
            sync_interval: Duration::from_secs(60),
            healthcheck_address: "127.0.0.1:17011".to_string(),
            routing_api: None,
            log_level: "info".to_string(),
            log_format: "json".to_string(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("loading config file {}", path.display()))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw).context("parsing config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.route_emitting_workers == 0 {
            bail!("route_emitting_workers must be at least 1");
        }
        if self.sync_interval.is_zero() {
            bail!("sync_interval must be greater than zero");
        }
        if self.bbs_address.is_empty() {
            bail!("bbs_address is required");
        }
        if self.nats_addresses.trim().is_empty() {
            bail!("nats_addresses is required");
        }
        self.healthcheck_address()?;
        match self.log_format.as_str() {
            "json" | "text" => {}
            other => bail!("unknown log_format: {}", other),
        }
        Ok(())
    }

    pub fn healthcheck_address(&self) -> Result<SocketAddr> {
        self.healthcheck_address
            .parse()
            .with_context(|| format!("invalid healthcheck_address {}", self.healthcheck_address))
    }

    /// Empty credentials mean an anonymous connection
    pub fn nats_credentials(&self) -> (Option<String>, Option<String>) {
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
        (non_empty(&self.nats_username), non_empty(&self.nats_password))
    }
}
