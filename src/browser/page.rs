//! Page handle: scoped browser target with request interception.
//!
//! Every request the page makes is paused at the Fetch domain, handed to the
//! installed hook for a synchronous routing decision, and resumed with the
//! matching protocol command. Finished and failed requests are surfaced to
//! the page owner over a channel so body capture can happen out of band.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chromiumoxide::cdp::browser_protocol::emulation::{
    SetDeviceMetricsOverrideParams, SetScriptExecutionDisabledParams,
};
use chromiumoxide::cdp::browser_protocol::fetch::{
    ContinueRequestParams, EnableParams as FetchEnableParams, EventRequestPaused,
    FailRequestParams, FulfillRequestParams, HeaderEntry, RequestPattern, RequestStage,
};
use chromiumoxide::cdp::browser_protocol::network::{
    EnableParams as NetworkEnableParams, ErrorReason, EventLoadingFailed, EventLoadingFinished,
    EventRequestWillBeSent, EventResponseReceived, GetResponseBodyParams, Headers, RequestId,
    ResourceType, SetCacheDisabledParams, SetExtraHttpHeadersParams,
};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, trace};

use crate::error::{Error, Result};

/// What the interception hook decides for a paused request.
#[derive(Debug, Clone)]
pub enum RequestDecision {
    /// Let the request through to the network.
    Continue,
    /// Abort the request at the browser.
    Abort,
    /// Answer the request locally with the given body.
    Fulfill { body: Vec<u8>, content_type: String },
}

/// The slice of a paused request the hook gets to see.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub url: String,
    pub resource_type: ResourceType,
    /// True for the document request of the page itself.
    pub is_navigation: bool,
}

/// Synchronous per-request routing decision.
pub type InterceptHook = Arc<dyn Fn(&RequestInfo) -> RequestDecision + Send + Sync>;

/// Network lifecycle events delivered to the page owner.
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    Finished {
        request_id: RequestId,
        /// First URL of the request chain; redirects keep the original.
        url: String,
        mimetype: String,
        status: i64,
        resource_type: ResourceType,
        headers: HashMap<String, String>,
    },
    Failed {
        url: String,
        error: String,
    },
}

/// Options for opening a page.
pub struct PageOptions {
    pub width: u32,
    pub height: u32,
    pub request_headers: HashMap<String, String>,
    pub network_idle_timeout: Duration,
    pub navigation_timeout: Duration,
    pub fetch_timeout: Duration,
    pub enable_javascript: bool,
    pub intercept: InterceptHook,
}

#[derive(Clone)]
struct ResponseMeta {
    mimetype: String,
    status: i64,
    resource_type: ResourceType,
    headers: HashMap<String, String>,
}

#[derive(Default)]
struct NetworkTracker {
    inflight: HashSet<RequestId>,
    first_url: HashMap<RequestId, String>,
    responses: HashMap<RequestId, ResponseMeta>,
    last_activity: Option<Instant>,
}

impl NetworkTracker {
    fn touch(&mut self) {
        self.last_activity = Some(Instant::now());
    }
}

/// A scoped page. Closed on every exit path by the discoverer.
pub struct Page {
    page: chromiumoxide::page::Page,
    tracker: Arc<Mutex<NetworkTracker>>,
    events: Option<mpsc::UnboundedReceiver<NetworkEvent>>,
    pumps: Vec<JoinHandle<()>>,
    idle_window: Duration,
    navigation_timeout: Duration,
    fetch_timeout: Duration,
}

impl Page {
    pub(crate) async fn setup(
        page: chromiumoxide::page::Page,
        opts: PageOptions,
    ) -> Result<Self> {
        let proto = |e: chromiumoxide::error::CdpError| Error::protocol(e.to_string());

        page.execute(SetDeviceMetricsOverrideParams::new(
            opts.width as i64,
            opts.height as i64,
            1.0,
            false,
        ))
        .await
        .map_err(proto)?;

        if !opts.enable_javascript {
            page.execute(SetScriptExecutionDisabledParams::new(true))
                .await
                .map_err(proto)?;
        }

        page.execute(NetworkEnableParams::default())
            .await
            .map_err(proto)?;
        // The response cache replaces the browser cache so every request is
        // observable at every width.
        page.execute(SetCacheDisabledParams::new(true))
            .await
            .map_err(proto)?;

        if !opts.request_headers.is_empty() {
            let headers = serde_json::to_value(&opts.request_headers)
                .unwrap_or_else(|_| serde_json::json!({}));
            page.execute(SetExtraHttpHeadersParams::new(Headers::new(headers)))
                .await
                .map_err(proto)?;
        }

        let mut pattern = RequestPattern::default();
        pattern.url_pattern = Some("*".to_string());
        pattern.request_stage = Some(RequestStage::Request);
        let mut fetch_enable = FetchEnableParams::default();
        fetch_enable.patterns = Some(vec![pattern]);
        page.execute(fetch_enable).await.map_err(proto)?;

        let tracker = Arc::new(Mutex::new(NetworkTracker::default()));
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let pumps = vec![
            spawn_intercept_pump(&page, opts.intercept.clone()).await?,
            spawn_network_pump(&page, Arc::clone(&tracker), event_tx).await?,
        ];

        Ok(Self {
            page,
            tracker,
            events: Some(event_rx),
            pumps,
            idle_window: opts.network_idle_timeout,
            navigation_timeout: opts.navigation_timeout,
            fetch_timeout: opts.fetch_timeout,
        })
    }

    /// Take the network event stream. Yields each finished or failed request
    /// exactly once; the channel closes when the page closes.
    pub fn take_events(&mut self) -> mpsc::UnboundedReceiver<NetworkEvent> {
        self.events.take().expect("network events already taken")
    }

    /// Navigate and wait for the load event; the network-idle wait is a
    /// separate call so the owner can inject a DOM in between.
    pub async fn goto(&self, url: &str) -> Result<()> {
        {
            let mut tracker = self.tracker.lock().unwrap();
            tracker.touch();
        }
        timeout(self.navigation_timeout, async {
            self.page
                .goto(url)
                .await
                .map_err(|e| Error::navigation(url, e.to_string()))?;
            // Load may have settled before we start waiting; a miss is fine.
            let _ = self.page.wait_for_navigation().await;
            Ok::<_, Error>(())
        })
        .await
        .map_err(|_| Error::navigation(url, "navigation timed out"))??;
        Ok(())
    }

    /// Run a script in page context.
    pub async fn evaluate(&self, script: String) -> Result<()> {
        self.page
            .evaluate(script)
            .await
            .map_err(|e| Error::protocol(e.to_string()))?;
        Ok(())
    }

    /// Resolve once no request has been in flight for the idle window.
    pub async fn wait_for_network_idle(&self) -> Result<()> {
        let poll = Duration::from_millis(10).max(self.idle_window / 4);
        let deadline = Instant::now() + self.navigation_timeout;
        loop {
            {
                let tracker = self.tracker.lock().unwrap();
                let quiet_since = tracker.last_activity.unwrap_or_else(Instant::now);
                if tracker.inflight.is_empty() && quiet_since.elapsed() >= self.idle_window {
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                return Err(Error::protocol("network never went idle"));
            }
            sleep(poll).await;
        }
    }

    /// Fetch a finished request's body over the protocol. One retry.
    pub async fn response_body(&self, request_id: &RequestId) -> Result<Vec<u8>> {
        let mut last_err = String::new();
        for attempt in 0..2 {
            if attempt > 0 {
                trace!(?request_id, "retrying response body fetch");
            }
            let call = self
                .page
                .execute(GetResponseBodyParams::new(request_id.clone()));
            match timeout(self.fetch_timeout, call).await {
                Ok(Ok(resp)) => {
                    let bytes = if resp.base64_encoded {
                        BASE64
                            .decode(resp.body.as_bytes())
                            .map_err(|e| Error::protocol(format!("invalid body encoding: {e}")))?
                    } else {
                        resp.body.as_bytes().to_vec()
                    };
                    return Ok(bytes);
                }
                Ok(Err(e)) => last_err = e.to_string(),
                Err(_) => last_err = "body fetch timed out".to_string(),
            }
        }
        Err(Error::protocol(format!("response body unavailable: {last_err}")))
    }

    /// Close the target. Safe to call once on any exit path.
    pub async fn close(mut self) {
        for pump in &self.pumps {
            pump.abort();
        }
        if let Err(e) = self.page.close().await {
            debug!(error = %e, "page close failed");
        }
        self.pumps.clear();
    }
}

/// Pause every request, ask the hook, resume with the matching command.
async fn spawn_intercept_pump(
    page: &chromiumoxide::page::Page,
    hook: InterceptHook,
) -> Result<JoinHandle<()>> {
    let mut paused = page
        .event_listener::<EventRequestPaused>()
        .await
        .map_err(|e| Error::protocol(e.to_string()))?;
    let page = page.clone();
    Ok(tokio::spawn(async move {
        while let Some(event) = paused.next().await {
            let info = RequestInfo {
                url: event.request.url.clone(),
                resource_type: event.resource_type.clone(),
                is_navigation: event.resource_type == ResourceType::Document,
            };
            let request_id = event.request_id.clone();
            let result = match hook(&info) {
                RequestDecision::Continue => {
                    page.execute(ContinueRequestParams::new(request_id))
                        .await
                        .map(|_| ())
                }
                RequestDecision::Abort => page
                    .execute(FailRequestParams::new(request_id, ErrorReason::Aborted))
                    .await
                    .map(|_| ()),
                RequestDecision::Fulfill { body, content_type } => {
                    let mut fulfill = FulfillRequestParams::new(request_id, 200);
                    fulfill.response_headers = Some(vec![HeaderEntry {
                        name: "content-type".to_string(),
                        value: content_type,
                    }]);
                    fulfill.body = Some(BASE64.encode(&body).into());
                    page.execute(fulfill).await.map(|_| ())
                }
            };
            // A request can vanish mid-decision (page teardown, renderer
            // abort). That only affects this request.
            if let Err(e) = result {
                debug!(url = %info.url, error = %e, "interception resume failed");
            }
        }
    }))
}

/// Track request lifecycles: in-flight set for the idle wait, first-URL map
/// for redirect chains, response metadata for capture.
async fn spawn_network_pump(
    page: &chromiumoxide::page::Page,
    tracker: Arc<Mutex<NetworkTracker>>,
    events: mpsc::UnboundedSender<NetworkEvent>,
) -> Result<JoinHandle<()>> {
    let proto = |e: chromiumoxide::error::CdpError| Error::protocol(e.to_string());
    let mut sent = page
        .event_listener::<EventRequestWillBeSent>()
        .await
        .map_err(proto)?;
    let mut received = page
        .event_listener::<EventResponseReceived>()
        .await
        .map_err(proto)?;
    let mut finished = page
        .event_listener::<EventLoadingFinished>()
        .await
        .map_err(proto)?;
    let mut failed = page
        .event_listener::<EventLoadingFailed>()
        .await
        .map_err(proto)?;

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(event) = sent.next() => {
                    let mut tracker = tracker.lock().unwrap();
                    tracker.inflight.insert(event.request_id.clone());
                    tracker
                        .first_url
                        .entry(event.request_id.clone())
                        .or_insert_with(|| event.request.url.clone());
                    tracker.touch();
                }
                Some(event) = received.next() => {
                    let headers = header_map(&event.response.headers);
                    let mut tracker = tracker.lock().unwrap();
                    tracker.responses.insert(event.request_id.clone(), ResponseMeta {
                        mimetype: event.response.mime_type.clone(),
                        status: event.response.status,
                        resource_type: event.r#type.clone(),
                        headers,
                    });
                    tracker.touch();
                }
                Some(event) = finished.next() => {
                    let emitted = {
                        let mut tracker = tracker.lock().unwrap();
                        tracker.inflight.remove(&event.request_id);
                        tracker.touch();
                        let url = tracker.first_url.get(&event.request_id).cloned();
                        let meta = tracker.responses.get(&event.request_id).cloned();
                        url.zip(meta)
                    };
                    if let Some((url, meta)) = emitted {
                        let _ = events.send(NetworkEvent::Finished {
                            request_id: event.request_id.clone(),
                            url,
                            mimetype: meta.mimetype,
                            status: meta.status,
                            resource_type: meta.resource_type,
                            headers: meta.headers,
                        });
                    }
                }
                Some(event) = failed.next() => {
                    let url = {
                        let mut tracker = tracker.lock().unwrap();
                        tracker.inflight.remove(&event.request_id);
                        tracker.touch();
                        tracker.first_url.get(&event.request_id).cloned()
                    };
                    let _ = events.send(NetworkEvent::Failed {
                        url: url.unwrap_or_default(),
                        error: event.error_text.clone(),
                    });
                }
                else => break,
            }
        }
    }))
}

fn header_map(headers: &Headers) -> HashMap<String, String> {
    let value = serde_json::to_value(headers).unwrap_or_default();
    match value {
        serde_json::Value::Object(map) => map
            .into_iter()
            .map(|(k, v)| {
                let v = match v {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                (k, v)
            })
            .collect(),
        _ => HashMap::new(),
    }
}
