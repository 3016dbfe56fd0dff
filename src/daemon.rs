//! Daemon lifecycle: build creation, snapshot queueing, teardown.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::api::ApiClient;
use crate::browser::{BrowserController, LaunchOptions};
use crate::cache::ResponseCache;
use crate::config::Config;
use crate::discovery::AssetDiscoverer;
use crate::error::{Error, Result};
use crate::logging::LevelHandle;
use crate::models::{Build, DaemonState, SnapshotOptions};
use crate::queue::SnapshotQueue;
use crate::server::{self, ServerHandle};

/// Resolves with the outcome of one queued snapshot.
#[derive(Debug)]
pub struct SnapshotHandle {
    rx: oneshot::Receiver<Result<()>>,
}

impl SnapshotHandle {
    pub async fn wait(self) -> Result<()> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::Cancelled),
        }
    }
}

/// The daemon core. Owns the browser, response cache, snapshot queue,
/// control server and API client; shared behind an `Arc` with the control
/// server's handlers.
pub struct PercyDaemon {
    config: Config,
    state: Mutex<DaemonState>,
    build: Mutex<Option<Build>>,
    loglevel: Mutex<String>,
    queue: SnapshotQueue,
    cache: Arc<ResponseCache>,
    browser: Arc<BrowserController>,
    api: ApiClient,
    server: tokio::sync::Mutex<Option<ServerHandle>>,
    /// Serializes start/stop transitions.
    lifecycle: tokio::sync::Mutex<()>,
    resources_dir: PathBuf,
    level_handle: Option<LevelHandle>,
}

impl PercyDaemon {
    /// Validate config and assemble an idle daemon.
    pub fn new(config: Config, level_handle: Option<LevelHandle>) -> Result<Arc<Self>> {
        config.validate()?;
        let cache = Arc::new(ResponseCache::new(
            config.discovery.asset_cache_bytes,
            config.discovery.disable_asset_cache,
        ));
        let browser = Arc::new(BrowserController::new(LaunchOptions {
            executable: config.discovery.browser_executable.as_ref().map(PathBuf::from),
            launch_timeout: std::time::Duration::from_secs(config.timeouts.browser_launch_secs),
            ..LaunchOptions::default()
        }));
        let api = ApiClient::new(&config)?;
        let queue = SnapshotQueue::new(config.discovery.concurrency);
        let resources_dir = std::env::temp_dir().join("percy");
        Ok(Arc::new(Self {
            config,
            state: Mutex::new(DaemonState::Idle),
            build: Mutex::new(None),
            loglevel: Mutex::new("info".to_string()),
            queue,
            cache,
            browser,
            api,
            server: tokio::sync::Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
            resources_dir,
            level_handle,
        }))
    }

    /// Create the remote build and start the control server. Idempotent:
    /// a running daemon returns its existing build.
    pub async fn start(self: &Arc<Self>) -> Result<Build> {
        let _guard = self.lifecycle.lock().await;
        match self.state() {
            DaemonState::Running => {
                return self
                    .build()
                    .ok_or_else(|| Error::api(None, "running without a build"));
            }
            DaemonState::Stopping | DaemonState::Stopped => return Err(Error::NotRunning),
            DaemonState::Idle => {}
        }

        tokio::fs::create_dir_all(&self.resources_dir).await?;
        let build = self.api.create_build(&self.config).await?;
        *self.build.lock().unwrap() = Some(build.clone());

        if self.config.server {
            let handle = server::start(Arc::clone(self), self.config.port).await?;
            info!(port = handle.port, "control server listening");
            *self.server.lock().await = Some(handle);
        }

        *self.state.lock().unwrap() = DaemonState::Running;
        info!(build = %build.id, url = %build.url, "percyd running");
        Ok(build)
    }

    /// Enqueue a snapshot. Returns as soon as the job is queued.
    pub fn snapshot(self: &Arc<Self>, payload: SnapshotOptions) -> Result<SnapshotHandle> {
        if self.state() != DaemonState::Running {
            return Err(Error::NotRunning);
        }
        let opts = payload.normalize(&self.config)?;
        let daemon = Arc::clone(self);
        let name = opts.name.clone();
        let rx = self.queue.push(async move {
            let result = daemon.process_snapshot(&opts).await;
            if let Err(e) = &result {
                warn!(snapshot = %name, error = %e, "snapshot failed");
            }
            result
        })?;
        Ok(SnapshotHandle { rx })
    }

    async fn process_snapshot(&self, opts: &SnapshotOptions) -> Result<()> {
        info!(snapshot = %opts.name, widths = ?opts.widths, "discovering");
        let discoverer = AssetDiscoverer::new(
            &self.browser,
            Arc::clone(&self.cache),
            &self.config,
            &self.resources_dir,
        );
        let resources = discoverer.run(opts).await?;
        let build = self.build().ok_or(Error::NotRunning)?;
        self.api.create_snapshot(&build, opts, &resources).await?;
        info!(snapshot = %opts.name, resources = resources.len(), "uploaded");
        Ok(())
    }

    /// Resolve when no snapshot is queued or in flight.
    pub async fn idle(&self) {
        self.queue.idle().await;
    }

    /// Drain, finalize, tear down. Idempotent; fine without a prior start.
    pub async fn stop(self: &Arc<Self>) {
        let _guard = self.lifecycle.lock().await;
        match self.state() {
            DaemonState::Stopped => return,
            DaemonState::Idle => {
                *self.state.lock().unwrap() = DaemonState::Stopped;
                return;
            }
            _ => {}
        }
        *self.state.lock().unwrap() = DaemonState::Stopping;

        self.queue.stop(true).await;

        if let Some(build) = self.build() {
            if let Err(e) = self.api.finalize_build(&build).await {
                warn!(build = %build.id, error = %e, "build finalize failed");
            } else {
                info!(build = %build.id, "build finalized");
            }
        }

        self.browser.close().await;

        if let Some(server) = self.server.lock().await.take() {
            server.shutdown();
        }

        if let Err(e) = tokio::fs::remove_dir_all(&self.resources_dir).await {
            debug!(error = %e, "resource dir cleanup failed");
        }
        self.cache.clear();
        *self.state.lock().unwrap() = DaemonState::Stopped;
        info!("percyd stopped");
    }

    /// Retarget the shared log filter.
    pub fn set_loglevel(&self, level: &str) -> Result<()> {
        if let Some(handle) = &self.level_handle {
            handle.set(level)?;
        }
        *self.loglevel.lock().unwrap() = level.to_string();
        Ok(())
    }

    pub fn state(&self) -> DaemonState {
        *self.state.lock().unwrap()
    }

    pub fn build(&self) -> Option<Build> {
        self.build.lock().unwrap().clone()
    }

    pub fn loglevel(&self) -> String {
        self.loglevel.lock().unwrap().clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}
