//! Headless-browser control over the Chrome DevTools Protocol.

mod client;
mod page;

pub use client::{BrowserController, LaunchOptions};
pub use page::{
    InterceptHook, NetworkEvent, Page, PageOptions, RequestDecision, RequestInfo,
};
