//! Headless Chrome banner extractor.
//!
//! Renders a site's home page the way a local visitor would see it, walks its
//! carousels, follows the promotions link and returns the banner images of
//! both pages. Sessions that are blocked or come back empty are retried once
//! through a residential proxy.

pub mod api;
pub mod browser;
pub mod classifier;
pub mod config;
pub mod controller;
pub mod crawler;
pub mod dedup;
pub mod detector;
pub mod discovery;
pub mod download;
pub mod error;
pub mod observer;
pub mod proxy;
pub mod render;
pub mod stealth;

pub use browser::{ChromeLauncher, ConnectionMode, PageDriver, SessionLauncher, SessionPlan, WaitUntil};
pub use classifier::{BannerClassifier, ClassifierRules};
pub use config::{GeoProfile, GeoTable, RenderTimings, ScrapeConfig};
pub use controller::{AttemptOutcome, ConnectionController, ScrapeReport};
pub use crawler::{BannerCandidate, Category, PageLabel, ScrapeResult};
pub use error::ScrapeError;
pub use proxy::ProxyDescriptor;
