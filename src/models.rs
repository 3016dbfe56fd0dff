//! Data models for snapshot capture and asset discovery.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};

use crate::config::Config;
use crate::error::{Error, Result};

/// Largest body captured as a resource. Anything bigger is skipped.
pub const MAX_RESOURCE_BYTES: usize = 15 * 1024 * 1024;

/// Lowercase hex SHA-256 of a byte string; resource identity.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// One snapshot request, as posted by an SDK.
///
/// Unknown top-level keys are ignored on deserialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotOptions {
    /// Snapshot name, unique within a build.
    pub name: String,
    /// Absolute http(s) URL of the page under capture.
    pub url: String,
    /// Viewport widths, in capture order. Defaulted from config when absent.
    #[serde(default)]
    pub widths: Vec<u32>,
    /// Minimum page height during discovery.
    #[serde(default)]
    pub min_height: Option<u32>,
    /// Extra request headers, merged over the config-level headers.
    #[serde(default)]
    pub request_headers: HashMap<String, String>,
    #[serde(default)]
    pub client_info: Option<String>,
    #[serde(default)]
    pub environment_info: Option<String>,
    /// Serialized DOM. When present the root request is fulfilled from it;
    /// when absent the page is loaded live.
    #[serde(default)]
    pub dom_snapshot: Option<String>,
    /// Defaults to false with a DOM snapshot, true without one.
    #[serde(default, rename = "enableJavaScript")]
    pub enable_javascript: Option<bool>,
    /// Control-server only: `false` makes `POST /percy/snapshot` wait for
    /// the snapshot to finish before responding.
    #[serde(default = "default_concurrent")]
    pub concurrent: bool,
}

fn default_concurrent() -> bool {
    true
}

impl SnapshotOptions {
    /// Validate the payload and fill defaults from `config`.
    pub fn normalize(mut self, config: &Config) -> Result<Self> {
        if self.name.trim().is_empty() {
            return Err(Error::snapshot("missing snapshot name"));
        }
        let url = url::Url::parse(&self.url)
            .map_err(|e| Error::snapshot(format!("invalid snapshot url: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::snapshot(format!(
                "snapshot url must be http(s), got {}",
                url.scheme()
            )));
        }
        if self.widths.is_empty() {
            self.widths = config.snapshot.widths.clone();
        }
        // Preserve order, drop duplicates.
        let mut seen = BTreeSet::new();
        self.widths.retain(|w| seen.insert(*w));
        for w in &self.widths {
            if *w == 0 || *w > 2000 {
                return Err(Error::snapshot(format!("width {w} out of range 1-2000")));
            }
        }
        let min_height = self.min_height.unwrap_or(config.snapshot.min_height);
        if min_height == 0 || min_height > 2000 {
            return Err(Error::snapshot("min_height out of range 1-2000"));
        }
        self.min_height = Some(min_height);
        if self.enable_javascript.is_none() {
            self.enable_javascript = Some(self.dom_snapshot.is_none());
        }
        // Config-level headers sit under per-snapshot ones.
        for (k, v) in &config.discovery.request_headers {
            self.request_headers
                .entry(k.clone())
                .or_insert_with(|| v.clone());
        }
        Ok(self)
    }

    pub fn javascript_enabled(&self) -> bool {
        self.enable_javascript.unwrap_or(self.dom_snapshot.is_none())
    }
}

/// A captured artifact: the root DOM or a sub-resource it needs.
#[derive(Debug, Clone)]
pub struct Resource {
    /// The URL the page requested (for redirects, the first URL in the chain).
    pub url: String,
    pub content: Vec<u8>,
    pub mimetype: String,
    /// Lowercase hex SHA-256 of `content`.
    pub sha: String,
    /// Exactly one resource per snapshot is the root (the serialized DOM).
    pub is_root: bool,
    /// Widths at which this resource was observed.
    pub for_widths: BTreeSet<u32>,
}

impl Resource {
    pub fn new(url: impl Into<String>, content: Vec<u8>, mimetype: impl Into<String>) -> Self {
        let sha = sha256_hex(&content);
        Self {
            url: url.into(),
            content,
            mimetype: mimetype.into(),
            sha,
            is_root: false,
            for_widths: BTreeSet::new(),
        }
    }

    pub fn root(url: impl Into<String>, content: Vec<u8>) -> Self {
        let mut resource = Self::new(url, content, "text/html");
        resource.is_root = true;
        resource
    }
}

/// Remote build handle returned by the API at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    pub id: String,
    pub number: u64,
    pub url: String,
}

/// Daemon lifecycle states, monotonically forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DaemonState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            token: "web_test".to_string(),
            ..Config::default()
        }
    }

    #[test]
    fn sha256_is_lowercase_hex() {
        let sha = sha256_hex(b"hello percy");
        assert_eq!(sha.len(), 64);
        assert!(sha
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn payload_ignores_unknown_keys() {
        let opts: SnapshotOptions = serde_json::from_str(
            r#"{"name": "home", "url": "http://localhost:8000/", "somethingNew": 42}"#,
        )
        .unwrap();
        assert_eq!(opts.name, "home");
        assert!(opts.concurrent);
    }

    #[test]
    fn normalize_defaults_widths_from_config() {
        let opts: SnapshotOptions =
            serde_json::from_str(r#"{"name": "home", "url": "http://localhost:8000/"}"#).unwrap();
        let opts = opts.normalize(&config()).unwrap();
        assert_eq!(opts.widths, vec![375, 1280]);
        assert_eq!(opts.min_height, Some(1024));
    }

    #[test]
    fn normalize_dedupes_widths_preserving_order() {
        let mut opts: SnapshotOptions =
            serde_json::from_str(r#"{"name": "home", "url": "http://localhost:8000/"}"#).unwrap();
        opts.widths = vec![1280, 375, 1280];
        let opts = opts.normalize(&config()).unwrap();
        assert_eq!(opts.widths, vec![1280, 375]);
    }

    #[test]
    fn javascript_defaults_follow_dom_snapshot() {
        let mut opts: SnapshotOptions =
            serde_json::from_str(r#"{"name": "a", "url": "http://localhost/"}"#).unwrap();
        assert!(opts.javascript_enabled());
        opts.dom_snapshot = Some("<html></html>".to_string());
        let opts = opts.normalize(&config()).unwrap();
        assert_eq!(opts.enable_javascript, Some(false));
    }

    #[test]
    fn non_http_url_rejected() {
        let opts: SnapshotOptions =
            serde_json::from_str(r#"{"name": "a", "url": "file:///etc/passwd"}"#).unwrap();
        assert!(opts.normalize(&config()).is_err());
    }

    #[test]
    fn snapshot_headers_win_over_config_headers() {
        let mut cfg = config();
        cfg.discovery
            .request_headers
            .insert("Authorization".to_string(), "Bearer config".to_string());
        cfg.discovery
            .request_headers
            .insert("X-Extra".to_string(), "from-config".to_string());
        let mut opts: SnapshotOptions =
            serde_json::from_str(r#"{"name": "a", "url": "http://localhost/"}"#).unwrap();
        opts.request_headers
            .insert("Authorization".to_string(), "Bearer snapshot".to_string());
        let opts = opts.normalize(&cfg).unwrap();
        assert_eq!(opts.request_headers["Authorization"], "Bearer snapshot");
        assert_eq!(opts.request_headers["X-Extra"], "from-config");
    }

    #[test]
    fn root_resource_shape() {
        let r = Resource::root("http://localhost/", b"<html></html>".to_vec());
        assert!(r.is_root);
        assert_eq!(r.mimetype, "text/html");
        assert_eq!(r.sha, sha256_hex(b"<html></html>"));
    }
}
