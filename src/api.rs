//! Remote build API client.
//!
//! Speaks the JSON:API dialect the visual-testing service expects: one build
//! per daemon lifetime, one snapshot per capture, resource bodies uploaded
//! by sha. Transport and 5xx failures retry with exponential backoff; 4xx
//! responses fail immediately with the service's message.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::models::{Build, Resource, SnapshotOptions};

/// Retry policy for remote calls.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts including the first try.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    /// No real waiting; for tests.
    pub fn instant() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }
}

pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    retry: RetryConfig,
}

impl ApiClient {
    pub fn new(config: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeouts.api_secs))
            .build()
            .map_err(|e| Error::api(None, format!("http client: {e}")))?;
        Ok(Self {
            http,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            retry: RetryConfig::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Create the build this daemon's snapshots belong to.
    pub async fn create_build(&self, config: &Config) -> Result<Build> {
        let mut attributes = json!({});
        if let Some(nonce) = &config.parallel_nonce {
            attributes["parallel-nonce"] = json!(nonce);
        }
        if let Some(total) = &config.parallel_total {
            attributes["parallel-total-shards"] = json!(total);
        }
        let body = json!({
            "data": { "type": "builds", "attributes": attributes }
        });
        let data = self.post("/builds", &body).await?;
        let id = data["data"]["id"]
            .as_str()
            .ok_or_else(|| Error::api(None, "build response missing id"))?
            .to_string();
        let number = data["data"]["attributes"]["build-number"]
            .as_u64()
            .unwrap_or(0);
        let url = data["data"]["attributes"]["web-url"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        debug!(build = %id, number, "created build");
        Ok(Build { id, number, url })
    }

    /// Upload resource bodies, then register the snapshot referencing them.
    pub async fn create_snapshot(
        &self,
        build: &Build,
        snapshot: &SnapshotOptions,
        resources: &[Resource],
    ) -> Result<String> {
        for resource in resources {
            self.upload_resource(build, resource).await?;
        }

        let resource_refs: Vec<Value> = resources
            .iter()
            .map(|r| {
                json!({
                    "type": "resources",
                    "id": r.sha,
                    "attributes": {
                        "resource-url": r.url,
                        "mimetype": r.mimetype,
                        "is-root": r.is_root,
                        "for-widths": r.for_widths.iter().collect::<Vec<_>>(),
                    }
                })
            })
            .collect();

        let body = json!({
            "data": {
                "type": "snapshots",
                "attributes": {
                    "name": snapshot.name,
                    "widths": snapshot.widths,
                    "minimum-height": snapshot.min_height,
                    "enable-javascript": snapshot.javascript_enabled(),
                    "client-info": snapshot.client_info,
                    "environment-info": snapshot.environment_info,
                },
                "relationships": {
                    "resources": { "data": resource_refs }
                }
            }
        });
        let data = self
            .post(&format!("/builds/{}/snapshots", build.id), &body)
            .await?;
        let id = data["data"]["id"].as_str().unwrap_or_default().to_string();
        debug!(snapshot = %snapshot.name, id = %id, "created snapshot");
        Ok(id)
    }

    async fn upload_resource(&self, build: &Build, resource: &Resource) -> Result<()> {
        let body = json!({
            "data": {
                "type": "resources",
                "id": resource.sha,
                "attributes": {
                    "base64-content": BASE64.encode(&resource.content),
                }
            }
        });
        self.post(&format!("/builds/{}/resources", build.id), &body)
            .await?;
        Ok(())
    }

    pub async fn finalize_build(&self, build: &Build) -> Result<()> {
        self.post(&format!("/builds/{}/finalize", build.id), &json!({}))
            .await?;
        Ok(())
    }

    /// POST with backoff. Only retryable failures (transport, 5xx) retry.
    async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        let mut delay = self.retry.initial_delay;
        let mut last_err = Error::api(None, "no attempts made");
        for attempt in 1..=self.retry.max_attempts {
            match self.post_once(&url, body).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if !e.is_retryable() || attempt == self.retry.max_attempts {
                        return Err(e);
                    }
                    warn!(url = %url, attempt, error = %e, "API call failed, retrying");
                    last_err = e;
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.retry.max_delay);
                }
            }
        }
        Err(last_err)
    }

    async fn post_once(&self, url: &str, body: &Value) -> Result<Value> {
        let response = self
            .http
            .post(url)
            .header("Authorization", format!("Token token={}", self.token))
            .json(body)
            .send()
            .await
            .map_err(|e| Error::api(None, e.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Error::api(Some(status.as_u16()), e.to_string()))?;
        if !status.is_success() {
            let message = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|v| {
                    v["errors"][0]["detail"]
                        .as_str()
                        .map(str::to_string)
                })
                .unwrap_or_else(|| format!("unexpected status {status}"));
            return Err(Error::api(Some(status.as_u16()), message));
        }
        if text.is_empty() {
            return Ok(json!({}));
        }
        serde_json::from_str(&text).map_err(|e| Error::api(None, format!("invalid response: {e}")))
    }
}
