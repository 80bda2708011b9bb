//! Browser abstraction.
//!
//! `SessionLauncher` creates one isolated browser session per connection
//! attempt and `PageDriver` is the single page that session owns. The Chrome
//! implementation wraps `headless_chrome`; tests drive the pipeline through
//! in-memory implementations of the same traits.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use headless_chrome::{Browser, LaunchOptions, Tab};
use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use tokio::time::sleep;

use crate::config::GeoProfile;
use crate::error::ScrapeError;
use crate::proxy::{generate_proxy_auth_extension, AuthExtension, ProxyDescriptor, GEO_LOCATION_HEADER};

static USER_AGENTS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Edge/123.0.0.0 Safari/537.36",
    ]
});

/// Pick a desktop Chrome user agent.
pub fn random_user_agent() -> String {
    use rand::seq::SliceRandom;
    USER_AGENTS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36")
        .to_string()
}

/// How far a navigation must progress before `navigate` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitUntil {
    /// Return as soon as the navigation is committed (first byte).
    Commit,
    DomContentLoaded,
    Load,
    NetworkIdle,
}

/// Connection mode of an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    Direct,
    Proxied,
}

/// Everything a launcher needs to build one session.
#[derive(Debug, Clone)]
pub struct SessionPlan {
    pub mode: ConnectionMode,
    pub geo: GeoProfile,
    pub proxy: Option<ProxyDescriptor>,
    pub headless: bool,
    pub user_agent: String,
    pub viewport: (u32, u32),
}

impl SessionPlan {
    pub fn new(mode: ConnectionMode, geo: GeoProfile, proxy: Option<ProxyDescriptor>, headless: bool) -> Self {
        Self {
            mode,
            geo,
            proxy,
            headless,
            user_agent: random_user_agent(),
            viewport: (1920, 1080),
        }
    }
}

/// The single page of a browser session.
pub trait PageDriver: Send + Sync {
    /// Navigate and block until `wait` is reached or `timeout` elapses.
    fn navigate(&self, url: &str, wait: WaitUntil, timeout: Duration) -> Result<(), ScrapeError>;

    /// Evaluate a script (awaiting a returned promise) and return its value.
    fn evaluate(&self, script: &str) -> Result<serde_json::Value, ScrapeError>;

    /// Click the first element matching `selector`, waiting up to `timeout`
    /// for it to appear.
    fn click(&self, selector: &str, timeout: Duration) -> Result<(), ScrapeError>;

    /// Block until no new network resources load for a short quiet window.
    fn wait_for_network_idle(&self, timeout: Duration) -> Result<(), ScrapeError>;

    fn title(&self) -> Result<String, ScrapeError>;

    fn url(&self) -> String;

    /// Serialized current DOM.
    fn content(&self) -> Result<String, ScrapeError>;

    /// Tear the page down. Called exactly once before the session is dropped.
    fn close(&self) -> Result<(), ScrapeError>;
}

/// Creates browser sessions. Each call returns an independent session.
pub trait SessionLauncher: Send + Sync {
    fn launch(&self, plan: &SessionPlan) -> Result<Box<dyn PageDriver>, ScrapeError>;
}

/// Evaluate a script that returns `JSON.stringify(...)` and deserialize it.
/// Plain JSON values are accepted too.
pub fn evaluate_json<T: DeserializeOwned>(
    driver: &dyn PageDriver,
    script: &str,
    name: &'static str,
) -> Result<T, ScrapeError> {
    let value = driver.evaluate(script)?;
    let parsed = match value {
        serde_json::Value::String(text) => serde_json::from_str(&text),
        other => serde_json::from_value(other),
    };
    parsed.map_err(|e| ScrapeError::Extraction {
        script: name,
        reason: e.to_string(),
    })
}

/// Poll a boolean JS expression until it is true or `timeout` elapses.
/// Evaluation errors during polling (e.g. mid-navigation) are tolerated.
pub async fn wait_for_predicate(
    driver: &dyn PageDriver,
    predicate: &str,
    step: &'static str,
    timeout: Duration,
    poll: Duration,
) -> Result<(), ScrapeError> {
    let script = format!("(() => {{ try {{ return !!({}); }} catch (e) {{ return false; }} }})()", predicate);
    let started = Instant::now();
    loop {
        if let Ok(serde_json::Value::Bool(true)) = driver.evaluate(&script) {
            return Ok(());
        }
        if started.elapsed() >= timeout {
            return Err(ScrapeError::RenderTimeout {
                step,
                waited: started.elapsed(),
            });
        }
        sleep(poll).await;
    }
}

// ============================================================================
// Headless Chrome implementation
// ============================================================================

/// Launches a fresh Chrome process per session.
#[derive(Debug, Default, Clone)]
pub struct ChromeLauncher;

impl ChromeLauncher {
    pub fn new() -> Self {
        Self
    }

    /// Launch arguments plus the auth extension they point at, if any.
    fn launch_args(plan: &SessionPlan) -> Result<(Vec<String>, Option<AuthExtension>), ScrapeError> {
        let mut args = vec![
            "--disable-blink-features=AutomationControlled".to_string(),
            "--no-sandbox".to_string(),
            "--disable-dev-shm-usage".to_string(),
            "--disable-infobars".to_string(),
            "--window-position=0,0".to_string(),
            "--ignore-certificate-errors".to_string(),
            "--ignore-certificate-errors-spki-list".to_string(),
            format!("--user-agent={}", plan.user_agent),
            format!("--lang={}", plan.geo.locale),
        ];
        if plan.headless {
            args.push("--headless=new".to_string());
        }

        let mut extension = None;
        if let Some(proxy) = &plan.proxy {
            args.push(format!("--proxy-server={}", proxy.to_chrome_arg()));
            if let (Some(user), Some(pass)) = (&proxy.username, &proxy.password) {
                let ext = generate_proxy_auth_extension(user, pass)?;
                args.push(format!("--load-extension={}", ext.path().display()));
                tracing::info!("🔐 Proxy auth extension loaded");
                extension = Some(ext);
            }
        }
        // Extensions are disabled in incognito windows
        if extension.is_none() {
            args.push("--incognito".to_string());
        }
        Ok((args, extension))
    }
}

impl SessionLauncher for ChromeLauncher {
    fn launch(&self, plan: &SessionPlan) -> Result<Box<dyn PageDriver>, ScrapeError> {
        let (args, extension) = Self::launch_args(plan).map_err(|e| ScrapeError::Launch(e.to_string()))?;

        let browser = Browser::new(LaunchOptions {
            headless: false, // Use new headless mode via args
            window_size: Some(plan.viewport),
            args: args.iter().map(OsStr::new).collect(),
            idle_browser_timeout: Duration::from_secs(300),
            ..Default::default()
        })
        .map_err(|e| ScrapeError::Launch(e.to_string()))?;

        let tab = browser.new_tab().map_err(|e| ScrapeError::Launch(e.to_string()))?;

        let session = ChromeSession {
            _browser: browser,
            tab,
            _extension: extension,
        };
        if let Err(e) = session.prepare(plan) {
            let _ = session.close();
            return Err(ScrapeError::Launch(e.to_string()));
        }
        Ok(Box::new(session))
    }
}

/// One Chrome process and its single tab. Dropping it kills the process,
/// then removes the session's auth extension.
pub struct ChromeSession {
    _browser: Browser,
    tab: Arc<Tab>,
    _extension: Option<AuthExtension>,
}

impl ChromeSession {
    /// Stealth injection, geo overrides and extra headers, before first navigation.
    fn prepare(&self, plan: &SessionPlan) -> Result<(), ScrapeError> {
        let stealth_script = crate::stealth::get_stealth_script(&plan.geo);
        self.tab.enable_debugger().map_err(ScrapeError::browser)?;
        self.tab
            .call_method(headless_chrome::protocol::cdp::Page::AddScriptToEvaluateOnNewDocument {
                source: stealth_script,
                world_name: None,
                include_command_line_api: None,
                run_immediately: None,
            })
            .map_err(ScrapeError::browser)?;

        // Timezone/locale must match the exit IP
        if let Err(e) = crate::stealth::apply_stealth_settings(&self.tab, &plan.geo.timezone, &plan.geo.locale) {
            tracing::warn!("Failed to apply stealth settings: {}", e);
        }

        let accept_language = plan.geo.accept_language();
        let mut headers: HashMap<&str, &str> = HashMap::new();
        headers.insert("Accept-Language", &accept_language);
        headers.insert("DNT", "1");
        headers.insert("Upgrade-Insecure-Requests", "1");
        if let Some(country) = plan.proxy.as_ref().and_then(|p| p.country.as_deref()) {
            headers.insert(GEO_LOCATION_HEADER, country);
        }
        self.tab.set_extra_http_headers(headers).map_err(ScrapeError::browser)?;
        Ok(())
    }

    fn resource_count(&self) -> Option<u64> {
        self.tab
            .evaluate("performance.getEntriesByType('resource').length", false)
            .ok()
            .and_then(|r| r.value)
            .and_then(|v| v.as_u64())
    }
}

impl PageDriver for ChromeSession {
    fn navigate(&self, url: &str, wait: WaitUntil, timeout: Duration) -> Result<(), ScrapeError> {
        let nav_err = |e: anyhow::Error| ScrapeError::Navigation {
            url: url.to_string(),
            reason: e.to_string(),
        };

        self.tab.set_default_timeout(timeout);
        self.tab.navigate_to(url).map_err(nav_err)?;

        match wait {
            WaitUntil::Commit => Ok(()),
            WaitUntil::DomContentLoaded => self
                .tab
                .wait_for_element_with_custom_timeout("body", timeout)
                .map(|_| ())
                .map_err(nav_err),
            WaitUntil::Load => self.tab.wait_until_navigated().map(|_| ()).map_err(nav_err),
            WaitUntil::NetworkIdle => {
                self.tab.wait_until_navigated().map_err(nav_err)?;
                self.wait_for_network_idle(timeout)
            }
        }
    }

    fn evaluate(&self, script: &str) -> Result<serde_json::Value, ScrapeError> {
        let result = self.tab.evaluate(script, true).map_err(ScrapeError::browser)?;
        Ok(result.value.unwrap_or(serde_json::Value::Null))
    }

    fn click(&self, selector: &str, timeout: Duration) -> Result<(), ScrapeError> {
        let element = self
            .tab
            .wait_for_element_with_custom_timeout(selector, timeout)
            .map_err(ScrapeError::browser)?;
        element.scroll_into_view().map_err(ScrapeError::browser)?;
        if let Err(e) = crate::stealth::move_mouse_to_element(&self.tab, selector) {
            tracing::debug!("Pointer approach skipped for {}: {}", selector, e);
        }
        element.click().map_err(ScrapeError::browser)?;
        Ok(())
    }

    fn wait_for_network_idle(&self, timeout: Duration) -> Result<(), ScrapeError> {
        // Idle = resource count unchanged across a 500ms quiet window
        let quiet = Duration::from_millis(500);
        let started = Instant::now();
        let mut last = self.resource_count();
        while started.elapsed() < timeout {
            std::thread::sleep(quiet);
            let current = self.resource_count();
            if current.is_some() && current == last {
                return Ok(());
            }
            last = current;
        }
        Err(ScrapeError::RenderTimeout {
            step: "network-idle",
            waited: started.elapsed(),
        })
    }

    fn title(&self) -> Result<String, ScrapeError> {
        self.tab.get_title().map_err(ScrapeError::browser)
    }

    fn url(&self) -> String {
        self.tab.get_url()
    }

    fn content(&self) -> Result<String, ScrapeError> {
        self.tab.get_content().map_err(ScrapeError::browser)
    }

    fn close(&self) -> Result<(), ScrapeError> {
        self.tab.close(false).map(|_| ()).map_err(ScrapeError::browser)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GeoTable;

    #[test]
    fn test_launch_args_direct() {
        let geo = GeoTable::default().resolve("DE");
        let plan = SessionPlan::new(ConnectionMode::Direct, geo, None, true);
        let (args, extension) = ChromeLauncher::launch_args(&plan).unwrap();
        assert!(extension.is_none());
        assert!(args.iter().any(|a| a == "--incognito"));
        assert!(args.iter().any(|a| a == "--headless=new"));
        assert!(args.iter().any(|a| a == "--lang=de-DE"));
        assert!(!args.iter().any(|a| a.starts_with("--proxy-server")));
    }

    #[test]
    fn test_launch_args_proxied_headed() {
        let geo = GeoTable::default().resolve("US");
        let proxy = ProxyDescriptor::parse("http://proxy.example.com:8080").unwrap();
        let plan = SessionPlan::new(ConnectionMode::Proxied, geo, Some(proxy), false);
        let (args, _) = ChromeLauncher::launch_args(&plan).unwrap();
        assert!(args.iter().any(|a| a == "--proxy-server=http://proxy.example.com:8080"));
        assert!(!args.iter().any(|a| a == "--headless=new"));
        // No credentials, no extension
        assert!(!args.iter().any(|a| a.starts_with("--load-extension")));
    }

    #[test]
    fn test_launch_args_with_credentials_own_their_extension() {
        let geo = GeoTable::default().resolve("US");
        let proxy = ProxyDescriptor::parse("http://user:pw@proxy.example.com:8080").unwrap();
        let plan = SessionPlan::new(ConnectionMode::Proxied, geo, Some(proxy), true);

        let (first_args, first) = ChromeLauncher::launch_args(&plan).unwrap();
        let (_, second) = ChromeLauncher::launch_args(&plan).unwrap();
        let (first, second) = (first.unwrap(), second.unwrap());
        assert_ne!(first.path(), second.path());
        assert!(first_args.contains(&format!("--load-extension={}", first.path().display())));
        assert!(!first_args.iter().any(|a| a == "--incognito"));

        let dir = first.path().to_path_buf();
        drop(first);
        assert!(!dir.exists());
        assert!(second.path().join("manifest.json").exists());
    }

    #[test]
    fn test_random_user_agent_is_chrome() {
        assert!(random_user_agent().contains("Chrome/"));
    }
}
