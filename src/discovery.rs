//! Promotions page discovery.
//!
//! Scores the home page's same-site anchors for promotional intent and
//! follows the best one the way a visitor would: a real click first, a
//! direct navigation if the click does not take.

use std::time::Duration;

use reqwest::Url;
use scraper::{Html, Selector};
use tokio::time::sleep;

use crate::browser::{wait_for_predicate, PageDriver, WaitUntil};
use crate::config::RenderTimings;
use crate::error::ScrapeError;
use crate::render::jitter;

/// A scored promotions link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromoLinkCandidate {
    /// Absolute URL.
    pub href: String,
    /// The `href` attribute as written in the page, used to locate the
    /// element for clicking.
    pub raw_href: String,
    pub anchor_text: String,
    pub path: String,
    pub score: i32,
}

#[derive(Debug, Clone)]
pub struct DiscoveryRules {
    /// Keywords looked for in the path and anchor text.
    pub keywords: Vec<String>,
    /// Path fragments of game/category pages that often mention bonuses.
    pub excluded_paths: Vec<String>,
    pub path_score: i32,
    pub exact_text_score: i32,
    pub partial_text_score: i32,
}

impl Default for DiscoveryRules {
    fn default() -> Self {
        Self {
            keywords: [
                "promotions", "promotion", "promos", "promo", "bonuses", "bonus", "offers", "offer", "deals",
                "deal", "rewards", "reward", "campaigns", "campaign", "specials", "welcome", "cashback",
                "free-bet", "freebet",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            excluded_paths: [
                "/games/", "/game/", "/slots/", "/slot/", "/live-casino/", "/live-dealer/", "/table-games/",
                "/jackpots/", "/providers/",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            path_score: 10,
            exact_text_score: 5,
            partial_text_score: 2,
        }
    }
}

pub struct PromoDiscovery {
    rules: DiscoveryRules,
}

impl Default for PromoDiscovery {
    fn default() -> Self {
        Self::new(DiscoveryRules::default())
    }
}

impl PromoDiscovery {
    pub fn new(rules: DiscoveryRules) -> Self {
        Self { rules }
    }

    /// Best promotions link among the anchors of the current page.
    pub fn find_promo_link(&self, driver: &dyn PageDriver, home_url: &str) -> Option<PromoLinkCandidate> {
        let html = match driver.content() {
            Ok(html) => html,
            Err(e) => {
                tracing::warn!("Cannot read home page DOM for promo discovery: {}", e);
                return None;
            }
        };
        self.find_in_html(&html, home_url)
    }

    /// Score every anchor in `html` and keep the best. Ties keep the first.
    pub fn find_in_html(&self, html: &str, home_url: &str) -> Option<PromoLinkCandidate> {
        let home = Url::parse(home_url).ok()?;
        let home_host = bare_host(&home)?;
        let document = Html::parse_document(html);
        let selector = Selector::parse("a[href]").ok()?;

        let mut best: Option<PromoLinkCandidate> = None;
        for el in document.select(&selector) {
            let Some(raw_href) = el.value().attr("href") else { continue };
            let text = el.text().collect::<Vec<_>>().join(" ");
            let Some(candidate) = self.score_anchor(&home, &home_host, raw_href, &text) else {
                continue;
            };
            if candidate.score > best.as_ref().map_or(0, |b| b.score) {
                best = Some(candidate);
            }
        }

        if let Some(link) = &best {
            tracing::info!("🎯 Promo link \"{}\" -> {} (score {})", link.anchor_text, link.href, link.score);
        }
        best
    }

    fn score_anchor(&self, home: &Url, home_host: &str, raw_href: &str, text: &str) -> Option<PromoLinkCandidate> {
        let raw_href = raw_href.trim();
        let lower = raw_href.to_lowercase();
        if raw_href.is_empty() || lower.starts_with("javascript:") || lower.starts_with("mailto:") || lower.starts_with("tel:") {
            return None;
        }

        let url = home.join(raw_href).ok()?;
        if !matches!(url.scheme(), "http" | "https") {
            return None;
        }
        if bare_host(&url)? != home_host {
            return None;
        }
        // In-page anchors of the home page itself
        if url.path() == home.path() && url.query() == home.query() {
            return None;
        }

        let path = url.path().to_lowercase();
        let path_with_slash = format!("{}/", path.trim_end_matches('/'));
        if self.rules.excluded_paths.iter().any(|p| path_with_slash.contains(p.as_str())) {
            return None;
        }

        let anchor_text = text.split_whitespace().collect::<Vec<_>>().join(" ");
        let text_lower = anchor_text.to_lowercase();

        let mut score = 0;
        if self.rules.keywords.iter().any(|k| path.contains(k.as_str())) {
            score += self.rules.path_score;
        }
        if self.rules.keywords.iter().any(|k| text_lower == *k) {
            score += self.rules.exact_text_score;
        } else if self.rules.keywords.iter().any(|k| text_lower.contains(k.as_str())) {
            score += self.rules.partial_text_score;
        }
        if score == 0 {
            return None;
        }

        Some(PromoLinkCandidate {
            href: url.to_string(),
            raw_href: raw_href.to_string(),
            anchor_text,
            path,
            score,
        })
    }

    /// Click the link (or navigate to it) and wait for the page to settle.
    pub async fn navigate_to_promo(
        &self,
        driver: &dyn PageDriver,
        link: &PromoLinkCandidate,
        timings: &RenderTimings,
        navigation_timeout: Duration,
    ) -> Result<(), ScrapeError> {
        let before = driver.url();
        let selector = format!("a[href=\"{}\"]", css_attr_escape(&link.raw_href));

        let clicked = match driver.click(&selector, timings.promo_click_timeout) {
            Ok(()) => {
                sleep(Duration::from_secs(2).min(timings.promo_dom_timeout)).await;
                driver.url() != before
            }
            Err(e) => {
                tracing::debug!("Promo link click failed: {}", e);
                false
            }
        };

        if !clicked {
            tracing::info!("↪️ Navigating directly to {}", link.href);
            driver
                .navigate(&link.href, WaitUntil::DomContentLoaded, navigation_timeout)
                .map_err(|e| ScrapeError::PromoNavigation(e.to_string()))?;
        }

        wait_for_predicate(
            driver,
            "document.readyState === 'interactive' || document.readyState === 'complete'",
            "promo-dom",
            timings.promo_dom_timeout,
            timings.poll_interval,
        )
        .await
        .map_err(|e| ScrapeError::PromoNavigation(e.to_string()))?;

        // Many SPA promo pages never go idle
        if let Err(e) = driver.wait_for_network_idle(timings.promo_idle_allowance) {
            tracing::debug!("Promo page not idle: {}", e);
        }
        sleep(jitter(timings.promo_settle_ms)).await;
        Ok(())
    }
}

fn bare_host(url: &Url) -> Option<String> {
    url.host_str().map(|h| h.trim_start_matches("www.").to_lowercase())
}

fn css_attr_escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOME: &str = "https://www.casino.example.com/";

    #[test]
    fn test_game_paths_excluded() {
        let html = r#"
            <nav>
              <a href="/games/bonus-buy">Bonus Buy</a>
              <a href="/promotions">Promotions</a>
            </nav>
        "#;
        let link = PromoDiscovery::default().find_in_html(html, HOME).unwrap();
        assert_eq!(link.path, "/promotions");
        assert_eq!(link.href, "https://www.casino.example.com/promotions");
        assert_eq!(link.score, 15);
    }

    #[test]
    fn test_path_keyword_dominates_text() {
        let html = r#"
            <a href="/help">Bonus terms</a>
            <a href="/en/offers/">See more</a>
        "#;
        let link = PromoDiscovery::default().find_in_html(html, HOME).unwrap();
        assert_eq!(link.path, "/en/offers/");
        assert_eq!(link.score, 10);
    }

    #[test]
    fn test_ties_keep_first_and_cross_domain_skipped() {
        let html = r##"
            <a href="https://affiliate.other-site.com/promo">Promo</a>
            <a href="#promo">Promo</a>
            <a href="https://casino.example.com/promo/weekly">Weekly</a>
            <a href="/promo/daily">Daily</a>
            <a href="javascript:void(0)">Bonus</a>
        "##;
        let link = PromoDiscovery::default().find_in_html(html, HOME).unwrap();
        assert_eq!(link.href, "https://casino.example.com/promo/weekly");
        assert_eq!(link.score, 10);
    }

    #[test]
    fn test_text_only_match() {
        let html = r#"<a href="/p/123">Latest deals for you</a><a href="/p/456">News</a>"#;
        let link = PromoDiscovery::default().find_in_html(html, HOME).unwrap();
        assert_eq!(link.raw_href, "/p/123");
        assert_eq!(link.score, 2);
        assert!(PromoDiscovery::default().find_in_html("<a href='/about'>About</a>", HOME).is_none());
    }
}
