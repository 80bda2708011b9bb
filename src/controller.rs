//! Connection strategy: direct first, proxy on failure.
//!
//! Each attempt owns a fresh browser session, judges it Success, Empty or
//! Blocked, and tears the session down before the next attempt starts.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use utoipa::ToSchema;

use crate::browser::{wait_for_predicate, ConnectionMode, PageDriver, SessionLauncher, SessionPlan, WaitUntil};
use crate::classifier::BannerClassifier;
use crate::config::ScrapeConfig;
use crate::crawler::{scrape_current_page, PageLabel, ScrapeResult};
use crate::dedup::merge_pages;
use crate::detector::{BlockDetector, BlockReason, PageSnapshot};
use crate::discovery::PromoDiscovery;
use crate::error::ScrapeError;
use crate::proxy::ProxyDescriptor;
use crate::render::RenderOrchestrator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum AttemptOutcome {
    Success,
    Empty,
    Blocked,
}

/// Per-attempt summary kept in the report.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct AttemptSummary {
    pub mode: ConnectionMode,
    pub outcome: AttemptOutcome,
    pub homepage_banners: usize,
    pub promotion_banners: usize,
    pub block_reason: Option<String>,
}

/// The selected result plus how it was obtained.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ScrapeReport {
    pub result: ScrapeResult,
    pub mode: ConnectionMode,
    pub outcome: AttemptOutcome,
    pub attempts: Vec<AttemptSummary>,
}

struct Attempt {
    mode: ConnectionMode,
    outcome: AttemptOutcome,
    result: ScrapeResult,
    block_reason: Option<BlockReason>,
}

impl Attempt {
    fn blocked(mode: ConnectionMode, reason: BlockReason) -> Self {
        Self {
            mode,
            outcome: AttemptOutcome::Blocked,
            result: ScrapeResult {
                blocked: true,
                ..Default::default()
            },
            block_reason: Some(reason),
        }
    }

    fn summary(&self) -> AttemptSummary {
        AttemptSummary {
            mode: self.mode,
            outcome: self.outcome,
            homepage_banners: self.result.homepage.len(),
            promotion_banners: self.result.promotions.len(),
            block_reason: self.block_reason.as_ref().map(|r| r.to_string()),
        }
    }
}

pub struct ConnectionController {
    launcher: Arc<dyn SessionLauncher>,
    classifier: BannerClassifier,
    detector: BlockDetector,
    discovery: PromoDiscovery,
    progress: Option<UnboundedSender<String>>,
}

impl ConnectionController {
    pub fn new(launcher: Arc<dyn SessionLauncher>) -> Self {
        Self {
            launcher,
            classifier: BannerClassifier::default(),
            detector: BlockDetector::default(),
            discovery: PromoDiscovery::default(),
            progress: None,
        }
    }

    pub fn with_classifier(mut self, classifier: BannerClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_detector(mut self, detector: BlockDetector) -> Self {
        self.detector = detector;
        self
    }

    pub fn with_discovery(mut self, discovery: PromoDiscovery) -> Self {
        self.discovery = discovery;
        self
    }

    /// Send human-readable progress lines to `tx` as the scrape advances.
    pub fn with_progress(mut self, tx: UnboundedSender<String>) -> Self {
        self.progress = Some(tx);
        self
    }

    /// Scrape `config.url`: direct, then through the proxy if the direct
    /// attempt was empty or blocked and a proxy is available.
    ///
    /// Only a browser launch failure is returned as an error.
    pub async fn run(&self, config: &ScrapeConfig) -> Result<ScrapeReport, ScrapeError> {
        self.emit(format!("Scraping {} ({})", config.url, config.geo.code));

        let direct = self.attempt(ConnectionMode::Direct, config, None).await?;
        let mut attempts = vec![direct.summary()];

        if direct.outcome == AttemptOutcome::Success {
            return Ok(Self::report(direct, attempts));
        }

        let Some(proxy) = config.fallback_proxy() else {
            self.emit(format!("Direct attempt {:?}; no proxy configured", direct.outcome));
            return Ok(Self::report(direct, attempts));
        };

        self.emit(format!(
            "Direct attempt {:?}, retrying through proxy {}",
            direct.outcome,
            proxy.server()
        ));
        let proxied = self
            .attempt(ConnectionMode::Proxied, config, Some(proxy.clone()))
            .await?;
        attempts.push(proxied.summary());

        let selected = select_attempt(direct, proxied);
        Ok(Self::report(selected, attempts))
    }

    fn report(attempt: Attempt, attempts: Vec<AttemptSummary>) -> ScrapeReport {
        ScrapeReport {
            result: attempt.result,
            mode: attempt.mode,
            outcome: attempt.outcome,
            attempts,
        }
    }

    async fn attempt(
        &self,
        mode: ConnectionMode,
        config: &ScrapeConfig,
        proxy: Option<ProxyDescriptor>,
    ) -> Result<Attempt, ScrapeError> {
        let plan = SessionPlan::new(mode, config.geo.clone(), proxy, config.headless);
        self.emit(format!("Launching {:?} browser session", mode));

        let driver = match self.launcher.launch(&plan) {
            Ok(driver) => driver,
            Err(e) if e.is_fatal() => {
                tracing::error!("❌ Browser launch failed: {}", e);
                return Err(e);
            }
            Err(e) => {
                tracing::warn!("Session setup failed: {}", e);
                return Ok(self.finish(Attempt::blocked(mode, BlockReason::NavigationFailed(e.to_string()))));
            }
        };

        let driven = self.drive(driver.as_ref(), mode, config).await;

        if let Err(e) = driver.close() {
            tracing::warn!("Session close failed: {}", e);
        }
        drop(driver);

        let attempt = match driven {
            Ok(attempt) => attempt,
            Err(e) if e.is_fatal() => return Err(e),
            Err(ScrapeError::Blocked(reason)) => Attempt::blocked(mode, reason),
            Err(e) => Attempt::blocked(mode, BlockReason::NavigationFailed(e.to_string())),
        };
        Ok(self.finish(attempt))
    }

    fn finish(&self, attempt: Attempt) -> Attempt {
        let mode = attempt.mode;
        match &attempt.block_reason {
            Some(reason) => self.emit(format!("{:?} attempt blocked: {}", mode, reason)),
            None => self.emit(format!(
                "{:?} attempt {:?}: {} homepage / {} promotions banners",
                mode,
                attempt.outcome,
                attempt.result.homepage.len(),
                attempt.result.promotions.len()
            )),
        }
        attempt
    }

    /// Run one page visit. Block pages come back as `ScrapeError::Blocked`;
    /// any other error ends the attempt as well.
    async fn drive(
        &self,
        driver: &dyn PageDriver,
        mode: ConnectionMode,
        config: &ScrapeConfig,
    ) -> Result<Attempt, ScrapeError> {
        let timings = &config.timings;

        self.emit(format!("Navigating to {}", config.url));
        driver.navigate(&config.url, WaitUntil::Commit, config.navigation_timeout)?;

        // Early exit on an empty shell right after first byte
        if let Err(e) = wait_for_predicate(
            driver,
            "document.body && document.body.innerHTML.length > 0",
            "shell",
            timings.shell_wait,
            timings.poll_interval,
        )
        .await
        {
            tracing::debug!("{}", e);
        }
        let shell_len = driver.content().map(|c| c.len()).unwrap_or(0);
        if let Some(reason) = self.detector.check_early_shell(shell_len) {
            return Err(ScrapeError::Blocked(reason));
        }

        if let Err(e) = wait_for_predicate(
            driver,
            "document.readyState === 'complete'",
            "load",
            config.load_timeout,
            timings.poll_interval,
        )
        .await
        {
            tracing::warn!("⏳ {}; inspecting partially loaded page", e);
        }

        let snapshot = PageSnapshot::capture(driver, &config.url);
        if let Some(reason) = self.detector.inspect(&snapshot) {
            return Err(ScrapeError::Blocked(reason));
        }

        let orchestrator = RenderOrchestrator::new(timings.clone());

        self.emit("Scraping homepage");
        let homepage = scrape_current_page(driver, PageLabel::Homepage, &orchestrator, &self.classifier).await;
        self.emit(format!("Homepage: {} banners", homepage.len()));

        self.emit("Looking for promotions page");
        let home_url = if snapshot.final_url.is_empty() {
            config.url.clone()
        } else {
            snapshot.final_url.clone()
        };
        let promotions = match self.discovery.find_promo_link(driver, &home_url) {
            Some(link) => {
                self.emit(format!("Opening promotions page {}", link.href));
                match self
                    .discovery
                    .navigate_to_promo(driver, &link, timings, config.navigation_timeout)
                    .await
                {
                    Ok(()) => {
                        let banners =
                            scrape_current_page(driver, PageLabel::Promotions, &orchestrator, &self.classifier).await;
                        self.emit(format!("Promotions: {} banners", banners.len()));
                        banners
                    }
                    Err(e) => {
                        tracing::warn!("{}", e);
                        self.emit("Promotions page could not be opened");
                        Vec::new()
                    }
                }
            }
            None => {
                self.emit("No promotions link found");
                Vec::new()
            }
        };

        let (homepage, promotions) = merge_pages(homepage, promotions);
        let result = ScrapeResult {
            homepage,
            promotions,
            blocked: false,
        };
        let outcome = if result.is_empty() {
            AttemptOutcome::Empty
        } else {
            AttemptOutcome::Success
        };

        Ok(Attempt {
            mode,
            outcome,
            result,
            block_reason: None,
        })
    }

    fn emit(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!("{}", message);
        if let Some(tx) = &self.progress {
            let _ = tx.send(message);
        }
    }
}

/// Success wins; otherwise Empty beats Blocked, and a tie goes to the
/// proxied attempt. Results are never merged across attempts.
fn select_attempt(direct: Attempt, proxied: Attempt) -> Attempt {
    match (direct.outcome, proxied.outcome) {
        (_, AttemptOutcome::Success) => proxied,
        (AttemptOutcome::Success, _) => direct,
        (AttemptOutcome::Empty, AttemptOutcome::Blocked) => direct,
        _ => proxied,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GeoTable;

    struct FailingLauncher(fn() -> ScrapeError);

    impl SessionLauncher for FailingLauncher {
        fn launch(&self, _plan: &SessionPlan) -> Result<Box<dyn PageDriver>, ScrapeError> {
            Err((self.0)())
        }
    }

    fn direct_only() -> ScrapeConfig {
        ScrapeConfig::new("https://shop.example.com", "US", &GeoTable::default()).with_proxy(None)
    }

    #[tokio::test]
    async fn test_launch_failure_is_surfaced() {
        let controller = ConnectionController::new(Arc::new(FailingLauncher(|| ScrapeError::Launch("no chrome".into()))));
        assert!(matches!(controller.run(&direct_only()).await, Err(ScrapeError::Launch(_))));
    }

    #[tokio::test]
    async fn test_non_fatal_setup_failure_ends_attempt() {
        let controller = ConnectionController::new(Arc::new(FailingLauncher(|| {
            ScrapeError::Browser("Emulation.setLocaleOverride failed".into())
        })));
        let report = controller.run(&direct_only()).await.unwrap();
        assert_eq!(report.outcome, AttemptOutcome::Blocked);
        assert!(report.result.blocked);
        assert_eq!(report.attempts.len(), 1);
    }

    fn attempt(mode: ConnectionMode, outcome: AttemptOutcome) -> Attempt {
        match outcome {
            AttemptOutcome::Blocked => Attempt::blocked(mode, BlockReason::NothingRendered),
            _ => Attempt {
                mode,
                outcome,
                result: ScrapeResult::default(),
                block_reason: None,
            },
        }
    }

    #[test]
    fn test_selection_rules() {
        use AttemptOutcome::*;
        use ConnectionMode::*;

        let pick = |d, p| select_attempt(attempt(Direct, d), attempt(Proxied, p)).mode;
        assert_eq!(pick(Blocked, Success), Proxied);
        assert_eq!(pick(Empty, Success), Proxied);
        assert_eq!(pick(Empty, Blocked), Direct);
        assert_eq!(pick(Blocked, Empty), Proxied);
        assert_eq!(pick(Blocked, Blocked), Proxied);
        assert_eq!(pick(Empty, Empty), Proxied);
    }

    #[test]
    fn test_blocked_attempt_carries_nothing() {
        let blocked = Attempt::blocked(ConnectionMode::Direct, BlockReason::EmptyShell { bytes: 150 });
        assert!(blocked.result.blocked);
        assert!(blocked.result.is_empty());
        let summary = blocked.summary();
        assert_eq!(summary.outcome, AttemptOutcome::Blocked);
        assert_eq!(summary.block_reason.as_deref(), Some("empty HTML shell (150 bytes)"));
    }
}
