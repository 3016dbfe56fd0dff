//! Asset discovery: drive the browser across widths, capture every resource
//! the snapshot needs, deduplicate by content hash.

mod routing;

pub use routing::{accepted_mimetype, hostname_matches, route, urls_equal, Routing};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};
use url::Url;

use crate::browser::{
    BrowserController, NetworkEvent, Page, PageOptions, RequestDecision, RequestInfo,
};
use crate::cache::{CachedResponse, ResponseCache};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::models::{sha256_hex, Resource, SnapshotOptions, MAX_RESOURCE_BYTES};

/// Discovers the resource set of one snapshot. Stateless between snapshots;
/// borrows the shared browser and response cache for the duration of a run.
pub struct AssetDiscoverer<'a> {
    browser: &'a BrowserController,
    cache: Arc<ResponseCache>,
    config: &'a Config,
    /// Captured bodies are spilled here once per sha for the uploader.
    resources_dir: &'a Path,
}

impl<'a> AssetDiscoverer<'a> {
    pub fn new(
        browser: &'a BrowserController,
        cache: Arc<ResponseCache>,
        config: &'a Config,
        resources_dir: &'a Path,
    ) -> Self {
        Self {
            browser,
            cache,
            config,
            resources_dir,
        }
    }

    /// Run discovery across all widths and return the deduplicated resource
    /// list: root first, then sub-resources in ascending sha order.
    pub async fn run(&self, snapshot: &SnapshotOptions) -> Result<Vec<Resource>> {
        let root_url = Url::parse(&snapshot.url)
            .map_err(|e| Error::snapshot(format!("invalid snapshot url: {e}")))?;

        let dom = snapshot
            .dom_snapshot
            .as_deref()
            .map(|dom| Arc::new(with_percy_css(dom, &self.config.snapshot.percy_css)));

        let mut state = DiscoveryState::default();
        if let Some(dom) = &dom {
            let mut root = Resource::root(root_url.to_string(), dom.as_bytes().to_vec());
            root.for_widths = snapshot.widths.iter().copied().collect();
            state.root = Some(root);
        }

        for &width in &snapshot.widths {
            self.discover_width(snapshot, width, &root_url, dom.clone(), &mut state)
                .await
                .map_err(|e| match e {
                    // A dead browser fails every queued snapshot, not just
                    // this one; keep the kind intact.
                    Error::BrowserLaunch(_) => e,
                    other => Error::discovery(&snapshot.name, other.to_string()),
                })?;
        }

        let root = state.root.ok_or_else(|| {
            Error::discovery(&snapshot.name, "root resource was never captured")
        })?;
        self.spill(&root).await;

        let mut resources: Vec<Resource> = state.by_sha.into_values().collect();
        resources.sort_by(|a, b| a.sha.cmp(&b.sha));
        resources.insert(0, root);
        Ok(resources)
    }

    async fn discover_width(
        &self,
        snapshot: &SnapshotOptions,
        width: u32,
        root_url: &Url,
        dom: Option<Arc<String>>,
        state: &mut DiscoveryState,
    ) -> Result<()> {
        let intercept = self.intercept_hook(root_url.clone(), dom.clone());
        let mut page = self
            .browser
            .page(PageOptions {
                width,
                height: snapshot.min_height.unwrap_or(1024),
                request_headers: snapshot.request_headers.clone(),
                network_idle_timeout: Duration::from_millis(
                    self.config.discovery.network_idle_timeout,
                ),
                navigation_timeout: Duration::from_secs(self.config.timeouts.navigation_secs),
                fetch_timeout: Duration::from_secs(self.config.timeouts.fetch_secs),
                enable_javascript: snapshot.javascript_enabled(),
                intercept,
            })
            .await?;
        let events = page.take_events();

        let navigated = self.drive(&page, snapshot, dom.as_deref()).await;
        if let Err(e) = navigated {
            warn!(snapshot = %snapshot.name, width, error = %e, "root navigation failed");
            page.close().await;
            return Err(e);
        }

        // Network is idle, so every lifecycle event is already queued.
        self.drain_events(&page, events, snapshot, width, root_url, state)
            .await;
        page.close().await;
        Ok(())
    }

    async fn drive(
        &self,
        page: &Page,
        snapshot: &SnapshotOptions,
        dom: Option<&String>,
    ) -> Result<()> {
        page.goto(&snapshot.url).await?;
        if let Some(dom) = dom {
            page.evaluate(inject_dom_script(dom)).await?;
        }
        page.wait_for_network_idle().await?;
        Ok(())
    }

    async fn drain_events(
        &self,
        page: &Page,
        mut events: mpsc::UnboundedReceiver<NetworkEvent>,
        snapshot: &SnapshotOptions,
        width: u32,
        root_url: &Url,
        state: &mut DiscoveryState,
    ) {
        while let Ok(event) = events.try_recv() {
            match event {
                NetworkEvent::Finished {
                    request_id,
                    url,
                    mimetype,
                    status,
                    resource_type,
                    headers,
                } => {
                    let is_prefetch = matches!(
                        resource_type,
                        chromiumoxide::cdp::browser_protocol::network::ResourceType::Prefetch
                    );
                    match route(
                        &url,
                        root_url,
                        is_prefetch,
                        &self.config.discovery.allowed_hostnames,
                        &self.config.discovery.disallowed_hostnames,
                    ) {
                        Routing::Root => {
                            self.capture_root(page, &request_id, &url, width, state)
                                .await;
                        }
                        Routing::Capture => {
                            if status >= 400 {
                                debug!(url = %url, status, "skipping error response");
                                continue;
                            }
                            self.capture(page, &request_id, &url, &mimetype, headers, width, state)
                                .await;
                        }
                        Routing::Skip | Routing::Abort => {}
                    }
                }
                NetworkEvent::Failed { url, error } => {
                    debug!(snapshot = %snapshot.name, url = %url, error = %error, "request failed");
                }
            }
        }
    }

    /// Record the root resource. With a DOM snapshot the body is already
    /// known; a live load captures it off the wire with percy_css appended.
    async fn capture_root(
        &self,
        page: &Page,
        request_id: &chromiumoxide::cdp::browser_protocol::network::RequestId,
        url: &str,
        width: u32,
        state: &mut DiscoveryState,
    ) {
        if let Some(root) = &mut state.root {
            root.for_widths.insert(width);
            return;
        }
        let body = match page.response_body(request_id).await {
            Ok(body) => body,
            Err(e) => {
                debug!(url = %url, error = %e, "root body unavailable");
                return;
            }
        };
        let html = String::from_utf8_lossy(&body);
        let mut root = Resource::root(
            url.to_string(),
            with_percy_css(&html, &self.config.snapshot.percy_css).into_bytes(),
        );
        root.for_widths.insert(width);
        state.root = Some(root);
    }

    async fn capture(
        &self,
        page: &Page,
        request_id: &chromiumoxide::cdp::browser_protocol::network::RequestId,
        url: &str,
        mimetype: &str,
        headers: HashMap<String, String>,
        width: u32,
        state: &mut DiscoveryState,
    ) {
        // Same URL at a later width: refresh the width set, skip the fetch.
        if let Some(sha) = state.by_url.get(url) {
            if let Some(resource) = state.by_sha.get_mut(sha) {
                resource.for_widths.insert(width);
            }
            return;
        }

        let cached = match self.cache.get(url) {
            Some(hit) => hit,
            None => {
                let body = match page.response_body(request_id).await {
                    Ok(body) => body,
                    Err(e) => {
                        debug!(url = %url, error = %e, "dropping resource, body fetch failed");
                        return;
                    }
                };
                if body.len() > MAX_RESOURCE_BYTES {
                    debug!(
                        url = %url,
                        "Skipping - Max file size exceeded [{:.1}MB]",
                        body.len() as f64 / (1024.0 * 1024.0)
                    );
                    return;
                }
                let mimetype = if mimetype.is_empty() {
                    "application/octet-stream".to_string()
                } else {
                    mimetype.to_string()
                };
                if !accepted_mimetype(&mimetype) {
                    debug!(url = %url, mimetype = %mimetype, "skipping unsupported mimetype");
                    return;
                }
                let entry = CachedResponse {
                    sha: sha256_hex(&body),
                    mimetype,
                    content: body,
                    headers,
                };
                self.cache.put(url, entry.clone());
                entry
            }
        };

        let mut resource = Resource::new(url, cached.content, cached.mimetype);
        resource.for_widths.insert(width);
        self.spill(&resource).await;
        state.by_url.insert(url.to_string(), resource.sha.clone());
        state
            .by_sha
            .entry(resource.sha.clone())
            .and_modify(|existing| {
                existing.for_widths.insert(width);
            })
            .or_insert(resource);
    }

    /// Write the body to `<tmp>/percy/<sha>`, once per sha.
    async fn spill(&self, resource: &Resource) {
        let path: PathBuf = self.resources_dir.join(&resource.sha);
        if path.exists() {
            return;
        }
        if let Err(e) = tokio::fs::write(&path, &resource.content).await {
            debug!(path = %path.display(), error = %e, "resource spill failed");
        }
    }

    /// The per-request routing decision installed on every discovery page.
    /// Capturable URLs already in the response cache are answered locally,
    /// which is what makes re-navigation at a wider width (or a repeat
    /// snapshot of the same page) cost no outbound fetches.
    fn intercept_hook(
        &self,
        root_url: Url,
        dom: Option<Arc<String>>,
    ) -> Arc<dyn Fn(&RequestInfo) -> RequestDecision + Send + Sync> {
        let allowed = self.config.discovery.allowed_hostnames.clone();
        let disallowed = self.config.discovery.disallowed_hostnames.clone();
        let cache = Arc::clone(&self.cache);
        Arc::new(move |request: &RequestInfo| {
            let is_prefetch = matches!(
                request.resource_type,
                chromiumoxide::cdp::browser_protocol::network::ResourceType::Prefetch
            );
            match route(&request.url, &root_url, is_prefetch, &allowed, &disallowed) {
                Routing::Abort => RequestDecision::Abort,
                Routing::Root => match &dom {
                    Some(dom) => RequestDecision::Fulfill {
                        body: dom.as_bytes().to_vec(),
                        content_type: "text/html".to_string(),
                    },
                    None => RequestDecision::Continue,
                },
                Routing::Capture => match cache.get(&request.url) {
                    Some(hit) => RequestDecision::Fulfill {
                        body: hit.content,
                        content_type: hit.mimetype,
                    },
                    None => RequestDecision::Continue,
                },
                Routing::Skip => RequestDecision::Continue,
            }
        })
    }
}

#[derive(Default)]
struct DiscoveryState {
    root: Option<Resource>,
    /// sha → resource; the per-snapshot dedup map.
    by_sha: HashMap<String, Resource>,
    /// url → sha, to skip refetching a URL seen at an earlier width.
    by_url: HashMap<String, String>,
}

/// Append the configured CSS to a serialized DOM as a trailing style element.
fn with_percy_css(dom: &str, percy_css: &str) -> String {
    if percy_css.is_empty() {
        return dom.to_string();
    }
    let style = format!("<style data-percy-css>{percy_css}</style>");
    match dom.rfind("</body>") {
        Some(idx) => {
            let mut out = String::with_capacity(dom.len() + style.len());
            out.push_str(&dom[..idx]);
            out.push_str(&style);
            out.push_str(&dom[idx..]);
            out
        }
        None => format!("{dom}{style}"),
    }
}

/// Script that rewrites the live document to the serialized DOM.
fn inject_dom_script(dom: &str) -> String {
    // `</` must not appear literally inside the script element Chrome wraps
    // evaluate calls in; `\/` is a valid escape in both JSON and JS strings.
    let encoded = serde_json::to_string(dom)
        .unwrap_or_else(|_| "\"\"".to_string())
        .replace("</", "<\\/");
    format!(
        "(function() {{ document.open(); document.write({encoded}); document.close(); }})()"
    )
}
