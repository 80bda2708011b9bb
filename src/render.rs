//! Render orchestration.
//!
//! Makes a dynamic page reveal its real content before extraction: wait for
//! hydration and a hero image, clear consent/age overlays, scroll to trigger
//! lazy loading, cycle carousels, scroll again, then wait for images. Every
//! step returns its own `Result`; `prepare` logs failures and moves on.

use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use tokio::time::sleep;

use crate::browser::{evaluate_json, wait_for_predicate, PageDriver};
use crate::config::RenderTimings;
use crate::error::ScrapeError;

/// Attribute used to hand an overlay button found by script to the native
/// click path.
const OVERLAY_MARKER: &str = "data-bc-overlay-target";

/// Cookie-consent and age-gate buttons, most specific first.
const OVERLAY_SELECTORS: &[&str] = &[
    // OneTrust
    "#onetrust-accept-btn-handler",
    "#accept-recommended-btn-handler",
    // Cookiebot
    "#CybotCookiebotDialogBodyLevelButtonLevelOptinAllowAll",
    "#CybotCookiebotDialogBodyButtonAccept",
    // Generic accept-all
    "button[id*='accept-all']",
    "button[class*='accept-all']",
    "button[data-testid*='accept']",
    "#cookie-accept",
    ".cc-allow",
    ".cc-btn.cc-dismiss",
    ".cookie-consent button",
    "button[id*='accept']",
    "button[class*='accept']",
    // Age gates
    "[class*='age-gate'] button[class*='yes']",
    "[class*='age-gate'] button[class*='confirm']",
    "[id*='age-gate'] button",
    "[class*='age-verification'] button",
    "button[class*='confirm-age']",
];

/// "Next" controls of common carousel libraries.
const CAROUSEL_NEXT_SELECTORS: &[&str] = &[
    ".slick-next",
    ".swiper-button-next",
    ".splide__arrow--next",
    ".flickity-prev-next-button.next",
    ".owl-next",
    ".carousel-control-next",
    "[data-slide='next']",
    "[data-direction='next']",
    ".glide__arrow--right",
    "[data-glide-dir='>']",
    ".bx-next",
    ".flex-next",
    ".slider-next",
    ".next-arrow",
    ".arrow-right",
    "button[aria-label='Next']",
    "button[aria-label='next']",
    "button[aria-label='Next slide']",
];

/// What happened during one `prepare` run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderReport {
    pub hydrated: bool,
    pub hero_ready: bool,
    /// Selector of the overlay button that was clicked.
    pub overlay_dismissed: Option<String>,
    pub carousel_controls: usize,
    pub carousel_clicks: u32,
    pub post_cycle_ready: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CarouselOutcome {
    controls: usize,
    clicks: u32,
}

pub struct RenderOrchestrator {
    timings: RenderTimings,
}

impl RenderOrchestrator {
    pub fn new(timings: RenderTimings) -> Self {
        Self { timings }
    }

    /// Run the full sequence. Never fails: each step's error is logged and
    /// reflected in the report.
    pub async fn prepare(&self, driver: &dyn PageDriver) -> RenderReport {
        let mut report = RenderReport::default();

        match self.wait_for_hydration(driver).await {
            Ok(()) => report.hydrated = true,
            Err(e) => tracing::warn!("⏳ {}; continuing", e),
        }

        match self.wait_for_hero_image(driver).await {
            Ok(()) => report.hero_ready = true,
            Err(e) => tracing::warn!("⏳ {}; used fixed fallback pause", e),
        }

        match self.dismiss_overlay(driver).await {
            Ok(dismissed) => report.overlay_dismissed = dismissed,
            Err(e) => tracing::warn!("Overlay dismissal failed: {}", e),
        }

        if let Err(e) = self.scroll_pass(driver, &[0.25, 0.5, 0.75, 1.0]).await {
            tracing::warn!("Scroll pass 1 failed: {}", e);
        }

        match self.cycle_carousels(driver).await {
            Ok((controls, clicks)) => {
                report.carousel_controls = controls;
                report.carousel_clicks = clicks;
            }
            Err(e) => tracing::warn!("Carousel cycling failed: {}", e),
        }

        if let Err(e) = self.scroll_pass(driver, &[0.5, 1.0]).await {
            tracing::warn!("Scroll pass 2 failed: {}", e);
        }

        match self.wait_for_post_cycle_images(driver).await {
            Ok(()) => report.post_cycle_ready = true,
            Err(e) => tracing::warn!("⏳ {}; background-only page?", e),
        }

        tracing::debug!("Render report: {:?}", report);
        report
    }

    /// Enough anchors or body text to consider the SPA hydrated.
    pub async fn wait_for_hydration(&self, driver: &dyn PageDriver) -> Result<(), ScrapeError> {
        let predicate = format!(
            "Array.from(document.querySelectorAll('a')).filter(a => (a.textContent || '').trim().length > 0).length > {} \
             || (document.body && (document.body.innerText || '').length > {})",
            self.timings.hydration_min_anchors, self.timings.hydration_min_text
        );
        wait_for_predicate(
            driver,
            &predicate,
            "hydration",
            self.timings.hydration_timeout,
            self.timings.poll_interval,
        )
        .await
    }

    /// Some `<img>` decoded wider than the hero threshold. Sleeps the fixed
    /// fallback on timeout (CSS-background-only pages have no signal).
    pub async fn wait_for_hero_image(&self, driver: &dyn PageDriver) -> Result<(), ScrapeError> {
        let result = wait_for_predicate(
            driver,
            &natural_width_predicate(self.timings.hero_min_natural_width),
            "hero-image",
            self.timings.hero_timeout,
            self.timings.poll_interval,
        )
        .await;
        if result.is_err() {
            sleep(self.timings.hero_fallback).await;
        }
        result
    }

    /// Click at most one visible consent / age-gate button.
    pub async fn dismiss_overlay(&self, driver: &dyn PageDriver) -> Result<Option<String>, ScrapeError> {
        let selectors = serde_json::to_string(OVERLAY_SELECTORS).map_err(ScrapeError::browser)?;
        let script = format!(
            r#"
            (() => {{
                const marker = '{marker}';
                document.querySelectorAll('[' + marker + ']').forEach(el => el.removeAttribute(marker));
                const visible = el => {{
                    const cs = window.getComputedStyle(el);
                    const r = el.getBoundingClientRect();
                    return cs.display !== 'none' && cs.visibility !== 'hidden' && r.width > 0 && r.height > 0;
                }};
                for (const sel of {selectors}) {{
                    let nodes = [];
                    try {{ nodes = document.querySelectorAll(sel); }} catch (e) {{ continue; }}
                    for (const el of nodes) {{
                        if (visible(el)) {{
                            el.setAttribute(marker, '1');
                            return JSON.stringify({{ selector: sel }});
                        }}
                    }}
                }}
                const words = /^(accept all|accept all cookies|accept|allow all|i agree|agree|got it|yes,? i am (over )?18|i am (over )?18|i'm over 18|enter)$/i;
                for (const el of document.querySelectorAll('button, [role="button"], a.btn')) {{
                    if (words.test((el.textContent || '').trim()) && visible(el)) {{
                        el.setAttribute(marker, '1');
                        return JSON.stringify({{ selector: 'text:' + (el.textContent || '').trim() }});
                    }}
                }}
                return JSON.stringify({{ selector: null }});
            }})()
            "#,
            marker = OVERLAY_MARKER,
            selectors = selectors,
        );

        #[derive(Deserialize)]
        struct Found {
            selector: Option<String>,
        }
        let found: Found = evaluate_json(driver, &script, "overlay-scan")?;
        let Some(selector) = found.selector else {
            return Ok(None);
        };

        let target = format!("[{}]", OVERLAY_MARKER);
        if let Err(e) = driver.click(&target, Duration::from_secs(2)) {
            tracing::debug!("Native overlay click failed ({}), using script click", e);
            driver.evaluate(&format!(
                "(() => {{ const el = document.querySelector('{}'); if (el) {{ el.click(); return true; }} return false; }})()",
                target
            ))?;
        }
        tracing::info!("🍪 Dismissed overlay via {}", selector);
        sleep(self.timings.overlay_settle).await;
        Ok(Some(selector))
    }

    /// Scroll to each fraction of the document height, then back to top.
    pub async fn scroll_pass(&self, driver: &dyn PageDriver, fractions: &[f64]) -> Result<(), ScrapeError> {
        for fraction in fractions {
            driver.evaluate(&format!(
                "window.scrollTo(0, Math.max(document.body ? document.body.scrollHeight : 0, document.documentElement.scrollHeight) * {})",
                fraction
            ))?;
            sleep(self.scroll_pause()).await;
        }
        driver.evaluate("window.scrollTo(0, 0)")?;
        sleep(self.timings.scroll_top_settle).await;
        Ok(())
    }

    /// Click every distinct "next" control a bounded number of times.
    /// Returns `(controls, clicks)`.
    pub async fn cycle_carousels(&self, driver: &dyn PageDriver) -> Result<(usize, u32), ScrapeError> {
        let selectors = serde_json::to_string(CAROUSEL_NEXT_SELECTORS).map_err(ScrapeError::browser)?;
        let script = format!(
            r#"
            (async () => {{
                const delay = ms => new Promise(res => setTimeout(res, ms));
                const clicked = new Set();
                let controls = 0;
                let clicks = 0;
                for (const sel of {selectors}) {{
                    let nodes = [];
                    try {{ nodes = document.querySelectorAll(sel); }} catch (e) {{ continue; }}
                    for (const btn of nodes) {{
                        if (clicked.has(btn) || controls >= {max_controls}) continue;
                        clicked.add(btn);
                        controls++;
                        for (let i = 0; i < {clicks}; i++) {{
                            try {{ btn.click(); clicks++; }} catch (e) {{ break; }}
                            await delay({gap});
                        }}
                    }}
                }}
                return JSON.stringify({{ controls, clicks }});
            }})()
            "#,
            selectors = selectors,
            max_controls = self.timings.carousel_max_controls,
            clicks = self.timings.carousel_clicks,
            gap = self.timings.carousel_click_gap_ms,
        );

        let outcome: CarouselOutcome = evaluate_json(driver, &script, "carousel-cycle")?;
        if outcome.controls > 0 {
            tracing::info!("🎠 Cycled {} carousel controls ({} clicks)", outcome.controls, outcome.clicks);
            sleep(self.timings.carousel_settle).await;
        }
        Ok((outcome.controls, outcome.clicks))
    }

    pub async fn wait_for_post_cycle_images(&self, driver: &dyn PageDriver) -> Result<(), ScrapeError> {
        wait_for_predicate(
            driver,
            &natural_width_predicate(self.timings.post_cycle_min_natural_width),
            "post-cycle-image",
            self.timings.post_cycle_timeout,
            self.timings.poll_interval,
        )
        .await
    }

    fn scroll_pause(&self) -> Duration {
        jitter(self.timings.scroll_pause_ms)
    }
}

/// Uniform pause in a millisecond range.
pub(crate) fn jitter((lo, hi): (u64, u64)) -> Duration {
    if hi <= lo {
        return Duration::from_millis(lo);
    }
    Duration::from_millis(rand::thread_rng().gen_range(lo..=hi))
}

fn natural_width_predicate(min_width: u32) -> String {
    format!("Array.from(document.images).some(img => img.naturalWidth > {})", min_width)
}
