//! Browser controller: one headless Chromium shared by all discovery jobs.
//!
//! The process is launched lazily on first use and kept for the daemon's
//! lifetime. Pages are independent targets; once created they operate in
//! parallel over the shared protocol connection.

use std::path::PathBuf;
use std::time::Duration;

use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::fetcher::{BrowserFetcher, BrowserFetcherOptions};
use futures::StreamExt;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::page::{Page, PageOptions};
use crate::error::{Error, Result};

/// Browser launch configuration, fixed at daemon start.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    /// Explicit executable path; probed locations are used when `None`.
    pub executable: Option<PathBuf>,
    /// Readiness deadline for the whole launch.
    pub launch_timeout: Duration,
    /// Where a pinned revision is downloaded when nothing is installed.
    pub download_dir: PathBuf,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            executable: None,
            launch_timeout: Duration::from_secs(30),
            download_dir: default_download_dir(),
        }
    }
}

fn default_download_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("percyd")
        .join("chromium")
}

struct BrowserHandle {
    browser: Browser,
    event_pump: JoinHandle<()>,
}

/// Owns the headless browser process. `launch` is idempotent; `close` tears
/// everything down and is safe to call without a prior launch.
pub struct BrowserController {
    opts: LaunchOptions,
    handle: RwLock<Option<BrowserHandle>>,
}

impl BrowserController {
    pub fn new(opts: LaunchOptions) -> Self {
        Self {
            opts,
            handle: RwLock::new(None),
        }
    }

    /// Ensure the browser process is up. Subsequent calls are no-ops.
    pub async fn launch(&self) -> Result<()> {
        if self.handle.read().await.is_some() {
            return Ok(());
        }
        let mut slot = self.handle.write().await;
        if slot.is_none() {
            *slot = Some(self.launch_inner().await?);
        }
        Ok(())
    }

    async fn launch_inner(&self) -> Result<BrowserHandle> {
        let executable = self.resolve_executable().await?;
        info!(executable = %executable.display(), "launching headless browser");

        let mut builder = BrowserConfig::builder();
        if needs_no_sandbox() {
            builder = builder.no_sandbox();
        }
        let config = builder
            .chrome_executable(executable.clone())
            .viewport(None)
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--hide-scrollbars")
            .arg("--mute-audio")
            .arg("--disable-background-timer-throttling")
            .arg("--disable-breakpad")
            .arg("--disable-default-apps")
            .arg("--disable-extensions")
            .arg("--disable-hang-monitor")
            .arg("--disable-popup-blocking")
            .arg("--disable-prompt-on-repost")
            .arg("--disable-renderer-backgrounding")
            .arg("--disable-sync")
            .arg("--disable-translate")
            .arg("--metrics-recording-only")
            .arg("--no-first-run")
            .arg("--password-store=basic")
            .build()
            .map_err(Error::BrowserLaunch)?;

        let (browser, mut handler) = timeout(self.opts.launch_timeout, Browser::launch(config))
            .await
            .map_err(|_| Error::launch("browser did not become ready in time"))?
            .map_err(|e| Error::launch(e.to_string()))?;

        // Drain protocol events for the browser's lifetime.
        let event_pump = tokio::spawn(async move { while handler.next().await.is_some() {} });

        Ok(BrowserHandle {
            browser,
            event_pump,
        })
    }

    /// Open a new page configured for discovery at one viewport.
    pub async fn page(&self, opts: PageOptions) -> Result<Page> {
        self.launch().await?;
        let guard = self.handle.read().await;
        let handle = guard.as_ref().ok_or_else(|| Error::launch("browser gone"))?;
        let page = handle
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| Error::protocol(format!("new page failed: {e}")))?;
        Page::setup(page, opts).await
    }

    /// Close the browser. Idempotent; a never-launched controller is a no-op.
    pub async fn close(&self) {
        let mut slot = self.handle.write().await;
        if let Some(mut handle) = slot.take() {
            if let Err(e) = handle.browser.close().await {
                warn!(error = %e, "browser close failed");
            }
            let _ = handle.browser.wait().await;
            handle.event_pump.abort();
        }
    }

    /// Find a usable Chromium: explicit path, well-known install locations,
    /// Playwright/puppeteer caches, else a pinned download.
    async fn resolve_executable(&self) -> Result<PathBuf> {
        if let Some(path) = &self.opts.executable {
            if path.exists() {
                return Ok(path.clone());
            }
            return Err(Error::launch(format!(
                "configured browser executable not found: {}",
                path.display()
            )));
        }

        if let Some(path) = find_system_browser() {
            debug!(path = %path.display(), "found system browser");
            return Ok(path);
        }
        if let Some(path) = find_cached_browser() {
            debug!(path = %path.display(), "found cached browser");
            return Ok(path);
        }

        info!(dir = %self.opts.download_dir.display(), "no browser found, downloading pinned revision");
        tokio::fs::create_dir_all(&self.opts.download_dir)
            .await
            .map_err(|e| Error::launch(format!("cannot create download dir: {e}")))?;
        let fetcher = BrowserFetcher::new(
            BrowserFetcherOptions::builder()
                .with_path(&self.opts.download_dir)
                .build()
                .map_err(|e| Error::launch(e.to_string()))?,
        );
        let revision = fetcher
            .fetch()
            .await
            .map_err(|e| Error::launch(format!("browser download failed: {e}")))?;
        Ok(revision.executable_path)
    }
}

/// Chromium refuses to start its sandbox as root, and CI containers often
/// lack the kernel support for it. Everywhere else the sandbox stays on.
fn needs_no_sandbox() -> bool {
    if std::env::var_os("CI").is_some() {
        return true;
    }
    unsafe { libc::geteuid() == 0 }
}

fn find_system_browser() -> Option<PathBuf> {
    let candidates = [
        "/usr/bin/google-chrome",
        "/usr/bin/google-chrome-stable",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
        "/snap/bin/chromium",
        "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
        "/Applications/Chromium.app/Contents/MacOS/Chromium",
    ];
    candidates
        .iter()
        .map(PathBuf::from)
        .find(|path| path.exists())
}

/// Walk the Playwright and puppeteer download caches, newest revision first.
fn find_cached_browser() -> Option<PathBuf> {
    let home = dirs::home_dir()?;
    let caches = [
        home.join(".cache/ms-playwright"),
        home.join("Library/Caches/ms-playwright"),
        home.join(".cache/puppeteer/chrome"),
    ];
    for cache in caches {
        let Ok(entries) = std::fs::read_dir(&cache) else {
            continue;
        };
        let mut revisions: Vec<_> = entries.filter_map(|e| e.ok()).collect();
        revisions.sort_by_key(|e| std::cmp::Reverse(e.file_name()));
        for revision in revisions {
            for sub in [
                "chrome-linux/chrome",
                "chrome-linux64/chrome",
                "chrome-headless-shell-linux64/chrome-headless-shell",
                "chrome-headless-shell-mac-arm64/chrome-headless-shell",
                "chrome-headless-shell-mac-x64/chrome-headless-shell",
            ] {
                let binary = revision.path().join(sub);
                if binary.exists() {
                    return Some(binary);
                }
            }
        }
    }
    None
}
