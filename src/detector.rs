//! Block / geo-restriction detection.
//!
//! Looks at what the browser actually rendered (size, title, text, final
//! domain) and decides whether the attempt hit a block page instead of the
//! real site.

use std::fmt;

use reqwest::Url;
use serde::Serialize;

use crate::browser::PageDriver;

/// Why a page was judged to be a block page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum BlockReason {
    /// The HTML right after commit (or after load) was implausibly small.
    EmptyShell { bytes: usize },
    /// No title, no images and almost no text.
    NothingRendered,
    /// The page ended up on another site (ISP / regulator intercept).
    DomainMismatch { expected: String, actual: String },
    /// Title or body text matched a known block-page phrase.
    BlockPhrase(String),
    NavigationFailed(String),
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockReason::EmptyShell { bytes } => write!(f, "empty HTML shell ({} bytes)", bytes),
            BlockReason::NothingRendered => write!(f, "no title, images or text rendered"),
            BlockReason::DomainMismatch { expected, actual } => {
                write!(f, "redirected from {} to {}", expected, actual)
            }
            BlockReason::BlockPhrase(phrase) => write!(f, "block page phrase '{}'", phrase),
            BlockReason::NavigationFailed(reason) => write!(f, "navigation failed: {}", reason),
        }
    }
}

/// Thresholds and phrase list used by [`BlockDetector`].
#[derive(Debug, Clone)]
pub struct BlockRules {
    /// Max HTML size right after commit that still counts as an empty shell.
    pub early_shell_bytes: usize,
    /// Min HTML size after full load.
    pub loaded_min_bytes: usize,
    /// Body text length below which a title-less, image-less page is empty.
    pub min_body_text: usize,
    /// Body text length (chars) up to which the body is searched for block
    /// phrases. Longer pages are only matched on their title.
    pub max_wall_text: usize,
    /// Lowercase phrases found on geo walls, bot challenges and regulator
    /// intercept pages.
    pub phrases: Vec<String>,
}

impl Default for BlockRules {
    fn default() -> Self {
        Self {
            early_shell_bytes: 200,
            loaded_min_bytes: 1000,
            min_body_text: 200,
            max_wall_text: 2000,
            phrases: [
                // geo restriction
                "not available in your country",
                "not available in your region",
                "not available in your location",
                "unavailable in your country",
                "restricted in your country",
                "access from your country",
                "your country is not supported",
                "geo-restricted",
                // bot walls
                "checking your browser",
                "verify you are human",
                "verify you are a human",
                "are you a robot",
                "complete the captcha",
                "solve the captcha",
                "captcha to continue",
                "please complete the security check",
                "just a moment...",
                "attention required",
                "unusual traffic",
                "access denied",
                "request blocked",
                "pardon our interruption",
                // regulator / ISP intercepts
                "internet positif",
                "internetpositif",
                "trustpositif",
                "kominfo",
                "blocked by order",
                "this website has been blocked",
                "site has been blocked",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

/// Facts about the loaded page used for the block decision.
#[derive(Debug, Clone, Default)]
pub struct PageSnapshot {
    pub requested_url: String,
    pub final_url: String,
    pub html_len: usize,
    pub title: String,
    pub body_text: String,
    pub image_count: usize,
}

impl PageSnapshot {
    /// Read the current page state from the driver. Failing accessors are
    /// treated as empty values.
    pub fn capture(driver: &dyn PageDriver, requested_url: &str) -> Self {
        let html_len = driver.content().map(|c| c.len()).unwrap_or(0);
        let title = driver.title().unwrap_or_default();
        let state = driver
            .evaluate(
                "JSON.stringify({ text: document.body ? document.body.innerText : '', images: document.images.length })",
            )
            .ok()
            .and_then(|v| match v {
                serde_json::Value::String(s) => serde_json::from_str::<serde_json::Value>(&s).ok(),
                other => Some(other),
            })
            .unwrap_or(serde_json::Value::Null);

        Self {
            requested_url: requested_url.to_string(),
            final_url: driver.url(),
            html_len,
            title,
            body_text: state["text"].as_str().unwrap_or_default().to_string(),
            image_count: state["images"].as_u64().unwrap_or(0) as usize,
        }
    }
}

pub struct BlockDetector {
    rules: BlockRules,
}

impl Default for BlockDetector {
    fn default() -> Self {
        Self::new(BlockRules::default())
    }
}

impl BlockDetector {
    pub fn new(rules: BlockRules) -> Self {
        Self { rules }
    }

    /// Check the HTML size right after the navigation committed.
    pub fn check_early_shell(&self, html_len: usize) -> Option<BlockReason> {
        (html_len <= self.rules.early_shell_bytes).then_some(BlockReason::EmptyShell { bytes: html_len })
    }

    /// Inspect a fully loaded page.
    pub fn inspect(&self, page: &PageSnapshot) -> Option<BlockReason> {
        if page.html_len < self.rules.loaded_min_bytes {
            return Some(BlockReason::EmptyShell { bytes: page.html_len });
        }

        let title = page.title.trim();
        let text = page.body_text.trim();
        if title.is_empty() && page.image_count == 0 && text.chars().count() < self.rules.min_body_text {
            return Some(BlockReason::NothingRendered);
        }

        if let Some(reason) = domain_mismatch(&page.requested_url, &page.final_url) {
            return Some(reason);
        }

        // Full pages carry footers like "protected by reCAPTCHA"; walls are short
        let haystack = if text.chars().count() <= self.rules.max_wall_text {
            format!("{}\n{}", title, text).to_lowercase()
        } else {
            title.to_lowercase()
        };
        self.rules
            .phrases
            .iter()
            .find(|p| haystack.contains(p.as_str()))
            .map(|p| BlockReason::BlockPhrase(p.clone()))
    }
}

fn host_of(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.trim_start_matches("www.").to_lowercase()))
}

/// `www.` is ignored and subdomain moves in either direction
/// (`example.com` → `en.example.com`) are not a mismatch.
fn domain_mismatch(requested: &str, actual: &str) -> Option<BlockReason> {
    let (expected, found) = (host_of(requested)?, host_of(actual)?);
    let related = expected == found
        || found.ends_with(&format!(".{}", expected))
        || expected.ends_with(&format!(".{}", found));
    (!related).then(|| BlockReason::DomainMismatch {
        expected,
        actual: found,
    })
}
