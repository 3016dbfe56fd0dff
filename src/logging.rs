//! Tracing setup with a runtime-adjustable level.
//!
//! The subscriber is installed once at startup; the returned handle is
//! threaded through the daemon so `set_loglevel` can retarget the filter
//! without touching a global.

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::reload;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Registry;

use crate::error::{Error, Result};

pub const LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Clonable handle to the live log filter.
#[derive(Clone)]
pub struct LevelHandle {
    handle: reload::Handle<EnvFilter, Registry>,
}

impl LevelHandle {
    pub fn set(&self, level: &str) -> Result<()> {
        if !LEVELS.contains(&level) {
            return Err(Error::config(format!("unknown log level '{level}'")));
        }
        self.handle
            .reload(filter_for(level))
            .map_err(|e| Error::config(format!("log filter reload failed: {e}")))
    }
}

fn filter_for(level: &str) -> EnvFilter {
    // Keep the protocol crates quiet unless tracing.
    let directives = if level == "trace" {
        format!("percyd={level},chromiumoxide=debug")
    } else {
        format!("percyd={level},chromiumoxide=warn")
    };
    EnvFilter::new(directives)
}

/// Install the process-wide subscriber. `PERCY_LOGLEVEL` wins over the
/// passed default. Returns the reload handle, or `None` when a subscriber
/// was already installed (tests).
pub fn init(default_level: &str) -> Option<LevelHandle> {
    let level = std::env::var("PERCY_LOGLEVEL").unwrap_or_else(|_| default_level.to_string());
    let level = if LEVELS.contains(&level.as_str()) {
        level
    } else {
        "info".to_string()
    };
    let (filter, handle) = reload::Layer::new(filter_for(&level));
    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok();
    installed.then_some(LevelHandle { handle })
}
