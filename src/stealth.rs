//! Stealth & Obfuscation Module
//!
//! This module provides:
//! - The init script injected before any page script runs
//! - Geo-consistent navigator overrides (languages, geolocation)
//! - CDP timezone/locale overrides
//! - Native human-like pointer movement before clicks

use std::sync::Arc;
use std::time::Duration;

use headless_chrome::protocol::cdp::Emulation::{SetLocaleOverride, SetTimezoneOverride};
use headless_chrome::protocol::cdp::Input::{
    DispatchMouseEvent, DispatchMouseEventPointer_TypeOption, DispatchMouseEventTypeOption,
};
use headless_chrome::Tab;
use rand::Rng;

use crate::config::GeoProfile;

/// Generate the stealth injection script for a geo profile.
/// This script runs before any other script on the page (via Page.addScriptToEvaluateOnNewDocument)
pub fn get_stealth_script(geo: &GeoProfile) -> String {
    let base_script = r#"
        // 1. Unmasking: Remove `navigator.webdriver`
        Object.defineProperty(navigator, 'webdriver', {
            get: () => undefined,
        });

        // 2. Hardware Concurrency Spoofing
        Object.defineProperty(navigator, 'hardwareConcurrency', {
            get: () => 8,
        });

        // 3. Chrome Runtime Mocking (Essential for "headless" checks)
        window.chrome = {
            runtime: {
                connect: function() {
                    return {
                        onMessage: { addListener: function() {}, removeListener: function() {} },
                        postMessage: function() {},
                        disconnect: function() {}
                    };
                },
                sendMessage: function() {},
                onMessage: { addListener: function() {}, removeListener: function() {} }
            },
            app: { isInstalled: false },
            csi: function() {},
            loadTimes: function() { return {}; }
        };

        // 4. Permission Mocking (Notifications = default/denied, not 'prompt')
        const originalQuery = window.navigator.permissions.query;
        window.navigator.permissions.query = (parameters) => (
            parameters.name === 'notifications' ?
            Promise.resolve({ state: Notification.permission }) :
            parameters.name === 'geolocation' ?
            Promise.resolve({ state: 'granted' }) :
            originalQuery(parameters)
        );

        // 5. WebGL Vendor Spoofing
        const getParameter = WebGLRenderingContext.prototype.getParameter;
        WebGLRenderingContext.prototype.getParameter = function(parameter) {
            if (parameter === 37445) return 'Intel Inc.';
            if (parameter === 37446) return 'Intel Iris OpenGL Engine';
            return getParameter.apply(this, [parameter]);
        };

        // 6. Spoof Plugins (Standard Chrome Set)
        Object.defineProperty(navigator, 'plugins', {
            get: () => {
                const pdf = {
                    0: { type: "application/x-google-chrome-pdf", suffixes: "pdf", description: "Portable Document Format" },
                    description: "Portable Document Format",
                    filename: "internal-pdf-viewer",
                    length: 1,
                    name: "Chrome PDF Plugin"
                };
                const p = [pdf, pdf, pdf, pdf, pdf];
                Object.setPrototypeOf(p, PluginArray.prototype);
                return p;
            }
        });
    "#;

    // Languages and geolocation must agree with the timezone/locale overrides
    let geo_script = format!(
        r#"
        Object.defineProperty(navigator, 'languages', {{
            get: () => ['{locale}', 'en'],
        }});

        const __geoPosition = {{
            coords: {{
                latitude: {lat}, longitude: {lon}, accuracy: 50,
                altitude: null, altitudeAccuracy: null, heading: null, speed: null
            }},
            timestamp: Date.now()
        }};
        if (navigator.geolocation) {{
            navigator.geolocation.getCurrentPosition = function(success) {{
                setTimeout(() => success(__geoPosition), 10);
            }};
            navigator.geolocation.watchPosition = function(success) {{
                setTimeout(() => success(__geoPosition), 10);
                return 1;
            }};
        }}
    "#,
        locale = geo.locale.replace('\'', ""),
        lat = geo.latitude,
        lon = geo.longitude,
    );

    format!("{}\n{}", base_script, geo_script)
}

/// Apply fingerprint overrides (Timezone, Locale) to match the exit IP
pub fn apply_stealth_settings(tab: &Arc<Tab>, timezone_id: &str, locale: &str) -> anyhow::Result<()> {
    tab.call_method(SetTimezoneOverride {
        timezone_id: timezone_id.to_string(),
    })?;

    tab.call_method(SetLocaleOverride {
        locale: Some(locale.to_string()),
    })?;

    Ok(())
}

#[derive(Debug, Clone, Copy)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Calculate a point on a cubic Bezier curve
fn cubic_bezier(t: f64, p0: Point, p1: Point, p2: Point, p3: Point) -> Point {
    let cx = 3.0 * (p1.x - p0.x);
    let bx = 3.0 * (p2.x - p1.x) - cx;
    let ax = p3.x - p0.x - cx - bx;

    let cy = 3.0 * (p1.y - p0.y);
    let by = 3.0 * (p2.y - p1.y) - cy;
    let ay = p3.y - p0.y - cy - by;

    let x = (ax * t.powi(3)) + (bx * t.powi(2)) + (cx * t) + p0.x;
    let y = (ay * t.powi(3)) + (by * t.powi(2)) + (cy * t) + p0.y;
    Point { x, y }
}

/// Move the pointer along a randomized arc using trusted CDP events.
pub fn move_mouse_human(tab: &Arc<Tab>, start: Point, end: Point) -> anyhow::Result<()> {
    let steps = 20;
    let variance = 80.0;
    let (p1, p2) = {
        let mut rng = rand::thread_rng();
        let p1 = Point::new(
            start.x + (end.x - start.x) * rng.gen_range(0.2..0.8) + rng.gen_range(-variance..variance),
            start.y + (end.y - start.y) * rng.gen_range(0.2..0.8) + rng.gen_range(-variance..variance),
        );
        let p2 = Point::new(
            start.x + (end.x - start.x) * rng.gen_range(0.2..0.8) + rng.gen_range(-variance..variance),
            start.y + (end.y - start.y) * rng.gen_range(0.2..0.8) + rng.gen_range(-variance..variance),
        );
        (p1, p2)
    };

    for i in 0..=steps {
        let t = i as f64 / steps as f64;
        let p = cubic_bezier(t, start, p1, p2, end);

        tab.call_method(DispatchMouseEvent {
            x: p.x,
            y: p.y,
            Type: DispatchMouseEventTypeOption::MouseMoved,
            button: None,
            buttons: None,
            modifiers: None,
            timestamp: None,
            delta_x: None,
            delta_y: None,
            pointer_Type: Some(DispatchMouseEventPointer_TypeOption::Mouse),
            force: None,
            tangential_pressure: None,
            tilt_x: None,
            tilt_y: None,
            twist: None,
            click_count: None,
        })?;

        let delay = rand::thread_rng().gen_range(5..15);
        std::thread::sleep(Duration::from_millis(delay));
    }

    Ok(())
}

/// Move the pointer from a resting position to the centre of `selector`.
pub fn move_mouse_to_element(tab: &Arc<Tab>, selector: &str) -> anyhow::Result<()> {
    let element = tab.find_element(selector)?;
    let box_model = element.get_box_model()?;

    let content = &box_model.content;
    let center_x = (content.top_left.x + content.top_right.x + content.bottom_right.x + content.bottom_left.x) / 4.0;
    let center_y = (content.top_left.y + content.top_right.y + content.bottom_right.y + content.bottom_left.y) / 4.0;

    move_mouse_human(tab, Point::new(100.0, 100.0), Point::new(center_x, center_y))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GeoTable;

    #[test]
    fn test_stealth_script_generation() {
        let geo = GeoTable::default().resolve("JP");
        let script = get_stealth_script(&geo);
        assert!(script.contains("Object.defineProperty(navigator, 'webdriver'"));
        assert!(script.contains("window.chrome = {"));
        assert!(script.contains("['ja-JP', 'en']"));
        assert!(script.contains("latitude: 35.6762"));
        // Image natural sizes drive readiness waits and must stay untouched
        assert!(!script.contains("naturalWidth"));
    }

    #[test]
    fn test_bezier_endpoints() {
        let p0 = Point::new(0.0, 0.0);
        let p3 = Point::new(100.0, 50.0);
        let c = Point::new(30.0, 80.0);
        let start = cubic_bezier(0.0, p0, c, c, p3);
        let end = cubic_bezier(1.0, p0, c, c, p3);
        assert!((start.x - 0.0).abs() < 1e-9 && (start.y - 0.0).abs() < 1e-9);
        assert!((end.x - 100.0).abs() < 1e-9 && (end.y - 50.0).abs() < 1e-9);
    }
}
