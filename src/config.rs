//! Daemon configuration: serde defaults, environment overrides, validation.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{Error, Result};

pub const DEFAULT_PORT: u16 = 5338;

/// Effective daemon configuration.
///
/// Built from defaults, then environment (`PERCY_*`), then CLI flags.
/// `validate()` must pass before the daemon starts. Serializes with the
/// camelCase keys SDK clients read off the healthcheck endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// API token. Required unless the remote API is skipped (`PERCY_API`
    /// pointing at a local stub still requires a placeholder token).
    #[serde(skip_serializing)]
    #[serde(default)]
    pub token: String,

    /// Control-server port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Whether to run the local control server at all.
    #[serde(default = "default_true")]
    pub server: bool,

    /// Remote API base URL.
    #[serde(default = "default_api_url")]
    pub api_url: String,

    #[serde(default)]
    pub snapshot: SnapshotConfig,

    #[serde(default)]
    pub discovery: DiscoveryConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Parallel build coordination, from `PERCY_PARALLEL_NONCE` / `_TOTAL`.
    #[serde(default)]
    pub parallel_nonce: Option<String>,
    #[serde(default)]
    pub parallel_total: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotConfig {
    /// Default widths for snapshots that don't specify their own.
    #[serde(default = "default_widths")]
    pub widths: Vec<u32>,

    /// Minimum page height used during discovery.
    #[serde(default = "default_min_height")]
    pub min_height: u32,

    /// CSS appended to every captured DOM as a trailing `<style>` element.
    #[serde(default, rename = "percyCSS")]
    pub percy_css: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryConfig {
    /// Maximum snapshots discovered concurrently.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Hostname globs captured in addition to the snapshot's own origin.
    #[serde(default)]
    pub allowed_hostnames: Vec<String>,

    /// Hostname globs whose requests are aborted outright.
    #[serde(default)]
    pub disallowed_hostnames: Vec<String>,

    /// Quiet window that counts as network idle, in milliseconds.
    #[serde(default = "default_network_idle_timeout")]
    pub network_idle_timeout: u64,

    /// Disable the cross-snapshot response cache.
    #[serde(default)]
    pub disable_asset_cache: bool,

    /// Response-cache byte budget.
    #[serde(default = "default_cache_bytes")]
    pub asset_cache_bytes: usize,

    /// Headers sent with every discovery request, merged under per-snapshot
    /// headers.
    #[serde(default)]
    pub request_headers: HashMap<String, String>,

    /// Explicit browser executable; probed locations are used when empty.
    #[serde(default)]
    pub browser_executable: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutConfig {
    /// Browser launch readiness, in seconds.
    #[serde(default = "default_launch_secs")]
    pub browser_launch_secs: u64,
    /// Page navigation hard deadline, in seconds.
    #[serde(default = "default_navigation_secs")]
    pub navigation_secs: u64,
    /// Response-body fetch over the protocol, in seconds (retried once).
    #[serde(default = "default_fetch_secs")]
    pub fetch_secs: u64,
    /// Remote API call deadline, in seconds.
    #[serde(default = "default_api_secs")]
    pub api_secs: u64,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_true() -> bool {
    true
}

fn default_api_url() -> String {
    "https://percy.io/api/v1".to_string()
}

fn default_widths() -> Vec<u32> {
    vec![375, 1280]
}

fn default_min_height() -> u32 {
    1024
}

fn default_concurrency() -> usize {
    5
}

fn default_network_idle_timeout() -> u64 {
    100
}

fn default_cache_bytes() -> usize {
    128 * 1024 * 1024
}

fn default_launch_secs() -> u64 {
    30
}

fn default_navigation_secs() -> u64 {
    30
}

fn default_fetch_secs() -> u64 {
    5
}

fn default_api_secs() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            token: String::new(),
            port: DEFAULT_PORT,
            server: true,
            api_url: default_api_url(),
            snapshot: SnapshotConfig::default(),
            discovery: DiscoveryConfig::default(),
            timeouts: TimeoutConfig::default(),
            parallel_nonce: None,
            parallel_total: None,
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            widths: default_widths(),
            min_height: default_min_height(),
            percy_css: String::new(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            allowed_hostnames: Vec::new(),
            disallowed_hostnames: Vec::new(),
            network_idle_timeout: default_network_idle_timeout(),
            disable_asset_cache: false,
            asset_cache_bytes: default_cache_bytes(),
            request_headers: HashMap::new(),
            browser_executable: None,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            browser_launch_secs: default_launch_secs(),
            navigation_secs: default_navigation_secs(),
            fetch_secs: default_fetch_secs(),
            api_secs: default_api_secs(),
        }
    }
}

impl Config {
    /// Apply `PERCY_*` environment overrides on top of the current values.
    pub fn apply_env(&mut self) {
        if let Ok(token) = std::env::var("PERCY_TOKEN") {
            if !token.is_empty() {
                self.token = token;
            }
        }
        if let Ok(api) = std::env::var("PERCY_API") {
            if !api.is_empty() {
                self.api_url = api;
            }
        }
        if let Ok(exe) = std::env::var("PERCY_BROWSER_EXECUTABLE") {
            if !exe.is_empty() {
                self.discovery.browser_executable = Some(exe);
            }
        }
        if let Ok(nonce) = std::env::var("PERCY_PARALLEL_NONCE") {
            if !nonce.is_empty() {
                self.parallel_nonce = Some(nonce);
            }
        }
        if let Ok(total) = std::env::var("PERCY_PARALLEL_TOTAL") {
            if let Ok(n) = total.parse() {
                self.parallel_total = Some(n);
            }
        }
    }

    /// Whether capture is disabled for this process (`PERCY_ENABLE=0`).
    pub fn capture_disabled() -> bool {
        matches!(std::env::var("PERCY_ENABLE").as_deref(), Ok("0"))
    }

    pub fn validate(&self) -> Result<()> {
        if self.token.is_empty() {
            return Err(Error::config("missing API token (set PERCY_TOKEN)"));
        }
        if self.port == 0 {
            return Err(Error::config("port must be 1-65535"));
        }
        if self.snapshot.widths.is_empty() {
            return Err(Error::config("snapshot.widths must not be empty"));
        }
        for w in &self.snapshot.widths {
            if *w == 0 || *w > 2000 {
                return Err(Error::config(format!("snapshot width {w} out of range 1-2000")));
            }
        }
        if self.snapshot.min_height == 0 || self.snapshot.min_height > 2000 {
            return Err(Error::config("snapshot.min_height out of range 1-2000"));
        }
        if self.discovery.concurrency == 0 {
            return Err(Error::config("discovery.concurrency must be at least 1"));
        }
        for pattern in self
            .discovery
            .allowed_hostnames
            .iter()
            .chain(&self.discovery.disallowed_hostnames)
        {
            if pattern.trim().is_empty() {
                return Err(Error::config("hostname patterns must not be empty"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Config {
        Config {
            token: "web_abc123".to_string(),
            ..Config::default()
        }
    }

    #[test]
    fn defaults_are_valid_with_token() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn missing_token_rejected() {
        let cfg = Config::default();
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn zero_width_rejected() {
        let mut cfg = valid();
        cfg.snapshot.widths = vec![375, 0];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn oversize_width_rejected() {
        let mut cfg = valid();
        cfg.snapshot.widths = vec![2001];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_concurrency_rejected() {
        let mut cfg = valid();
        cfg.discovery.concurrency = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn empty_hostname_pattern_rejected() {
        let mut cfg = valid();
        cfg.discovery.allowed_hostnames = vec!["*.example.com".into(), "".into()];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn token_never_serialized() {
        let cfg = valid();
        let json = serde_json::to_value(&cfg).unwrap();
        assert!(json.get("token").is_none());
        assert_eq!(json["port"], DEFAULT_PORT);
    }

    #[test]
    fn deserializes_partial_json() {
        let cfg: Config = serde_json::from_str(r#"{"port": 5999}"#).unwrap();
        assert_eq!(cfg.port, 5999);
        assert_eq!(cfg.snapshot.widths, vec![375, 1280]);
        assert_eq!(cfg.discovery.network_idle_timeout, 100);
    }
}
