//! percyd - visual-snapshot asset-discovery daemon.
//!
//! Drives a headless Chromium over the DevTools protocol to surface every
//! resource a DOM snapshot needs, deduplicates them by content hash, and
//! uploads the bundle to the remote visual-testing API. SDK clients talk to
//! the daemon over the local control server.

pub mod api;
pub mod browser;
pub mod cache;
pub mod config;
pub mod daemon;
pub mod discovery;
pub mod error;
pub mod logging;
pub mod models;
pub mod queue;
pub mod server;

pub use config::Config;
pub use daemon::{PercyDaemon, SnapshotHandle};
pub use error::{Error, Result};
pub use models::{Build, Resource, SnapshotOptions};
