//! Error taxonomy for the render-and-extract pipeline.
//!
//! Only a browser that cannot be launched is fatal. Everything else is
//! recovered by the step that hit it: navigation failures and block pages
//! feed the proxy fallback, render timeouts are logged and skipped, and
//! extraction failures are isolated per script.

use std::time::Duration;

use crate::detector::BlockReason;

#[derive(Debug, thiserror::Error)]
pub enum ScrapeError {
    /// Chrome could not be started or the first tab could not be opened.
    #[error("browser failed to launch: {0}")]
    Launch(String),

    /// Timeout, DNS failure, refused connection or similar.
    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },

    #[error("page blocked: {0}")]
    Blocked(BlockReason),

    /// A bounded readiness wait ran out of time.
    #[error("{step} wait timed out after {waited:?}")]
    RenderTimeout { step: &'static str, waited: Duration },

    /// An in-page extraction script threw or returned malformed data.
    #[error("extraction script '{script}' failed: {reason}")]
    Extraction { script: &'static str, reason: String },

    #[error("promotions navigation failed: {0}")]
    PromoNavigation(String),

    /// Any other browser/CDP call failure.
    #[error("browser call failed: {0}")]
    Browser(String),

    #[error("download failed: {0}")]
    Download(String),

    #[error("invalid url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("invalid proxy descriptor: {0}")]
    Proxy(String),
}

impl ScrapeError {
    /// Whether the error must be surfaced to the caller instead of being
    /// recovered inside the pipeline.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ScrapeError::Launch(_))
    }

    pub(crate) fn browser(err: impl std::fmt::Display) -> Self {
        ScrapeError::Browser(err.to_string())
    }
}
