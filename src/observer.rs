//! Image and background observation.
//!
//! The in-page scripts only collect raw attribute and geometry data; source
//! selection, URL resolution and carousel detection happen here so they are
//! identical for the live page and for the static HTML fallback.

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;

use crate::browser::{evaluate_json, PageDriver};
use crate::error::ScrapeError;

static CAROUSEL_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)slider|carousel|swiper|slick|owl|splide|glide|flickity|banner|promo").ok());

static CSS_URL: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r#"url\(\s*["']?([^"')]+?)["']?\s*\)"#).ok());

/// Lazy-load attributes holding the real image URL, in priority order.
const LAZY_SRC_ATTRS: [&str; 4] = ["data-src", "data-lazy-src", "data-original", "data-lazy"];

/// Lazy-load attributes holding a background image URL, in priority order.
const LAZY_BG_ATTRS: [&str; 5] = [
    "data-bg",
    "data-background",
    "data-bg-src",
    "data-background-image",
    "data-image-src",
];

/// How many ancestor levels contribute class names.
const ANCESTOR_DEPTH: usize = 3;

/// Raw per-`<img>` snapshot, resolved and typed.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageObservation {
    pub resolved_src: String,
    pub alt: String,
    pub width: u32,
    pub height: u32,
    pub own_classes: String,
    pub ancestor_classes: String,
    pub visible: bool,
    pub in_carousel: bool,
}

/// An element painted with a CSS (or lazy data-attribute) background image.
#[derive(Debug, Clone, PartialEq)]
pub struct BackgroundObservation {
    pub resolved_url: String,
    pub width: u32,
    pub height: u32,
    pub visible: bool,
}

// ============================================================================
// In-page collection
// ============================================================================

const IMAGE_SCRIPT: &str = r#"
    (() => {
        const attr = (el, name) => el.getAttribute(name) || '';
        const images = [];
        document.querySelectorAll('img').forEach(img => {
            const rect = img.getBoundingClientRect();
            const cs = window.getComputedStyle(img);
            const ancestors = [];
            let p = img.parentElement;
            for (let i = 0; i < 3 && p; i++) {
                const cls = typeof p.className === 'string' ? p.className : attr(p, 'class');
                ancestors.push(cls || '');
                p = p.parentElement;
            }
            images.push({
                currentSrc: img.currentSrc || '',
                src: img.src || '',
                lazy: {
                    'data-src': attr(img, 'data-src'),
                    'data-lazy-src': attr(img, 'data-lazy-src'),
                    'data-original': attr(img, 'data-original'),
                    'data-lazy': attr(img, 'data-lazy')
                },
                srcset: attr(img, 'srcset'),
                dataSrcset: attr(img, 'data-srcset'),
                alt: img.alt || '',
                rectWidth: rect.width || 0,
                rectHeight: rect.height || 0,
                naturalWidth: img.naturalWidth || 0,
                naturalHeight: img.naturalHeight || 0,
                attrWidth: parseFloat(attr(img, 'width')) || 0,
                attrHeight: parseFloat(attr(img, 'height')) || 0,
                className: typeof img.className === 'string' ? img.className : attr(img, 'class'),
                ancestorClasses: ancestors,
                display: cs.display,
                visibility: cs.visibility
            });
        });
        return JSON.stringify(images);
    })()
"#;

const BACKGROUND_SCRIPT: &str = r#"
    (() => {
        const lazyAttrs = ['data-bg', 'data-background', 'data-bg-src', 'data-background-image', 'data-image-src'];
        const found = [];
        document.querySelectorAll('*').forEach(el => {
            const style = window.getComputedStyle(el);
            const computed = style.backgroundImage || 'none';
            const lazy = {};
            let hasLazy = false;
            for (const name of lazyAttrs) {
                const v = el.getAttribute(name);
                if (v) { lazy[name] = v; hasLazy = true; }
            }
            if (computed === 'none' && !hasLazy) return;
            if (computed !== 'none' && computed.indexOf('url(') === -1 && !hasLazy) return;
            const rect = el.getBoundingClientRect();
            found.push({
                computed: computed,
                lazy: lazy,
                rectWidth: rect.width || 0,
                rectHeight: rect.height || 0,
                display: style.display,
                visibility: style.visibility
            });
        });
        return JSON.stringify(found);
    })()
"#;

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawImage {
    current_src: String,
    src: String,
    lazy: std::collections::HashMap<String, String>,
    srcset: String,
    data_srcset: String,
    alt: String,
    rect_width: f64,
    rect_height: f64,
    natural_width: f64,
    natural_height: f64,
    attr_width: f64,
    attr_height: f64,
    class_name: String,
    ancestor_classes: Vec<String>,
    display: String,
    visibility: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawBackground {
    computed: String,
    lazy: std::collections::HashMap<String, String>,
    rect_width: f64,
    rect_height: f64,
    display: String,
    visibility: String,
}

/// Observe every `<img>` on the current page.
pub fn observe_images(driver: &dyn PageDriver) -> Result<Vec<ImageObservation>, ScrapeError> {
    let raw: Vec<RawImage> = evaluate_json(driver, IMAGE_SCRIPT, "images")?;
    let base = Url::parse(&driver.url()).ok();
    Ok(raw.into_iter().map(|img| img.resolve(base.as_ref())).collect())
}

/// Observe every element carrying a background image on the current page.
pub fn observe_backgrounds(driver: &dyn PageDriver) -> Result<Vec<BackgroundObservation>, ScrapeError> {
    let raw: Vec<RawBackground> = evaluate_json(driver, BACKGROUND_SCRIPT, "backgrounds")?;
    let base = Url::parse(&driver.url()).ok();
    Ok(raw.into_iter().filter_map(|bg| bg.resolve(base.as_ref())).collect())
}

impl RawImage {
    fn resolve(self, base: Option<&Url>) -> ImageObservation {
        let lazy: Vec<&str> = LAZY_SRC_ATTRS
            .iter()
            .map(|name| self.lazy.get(*name).map(String::as_str).unwrap_or(""))
            .collect();
        let resolved_src = select_image_source(
            base,
            &[self.srcset.as_str(), self.data_srcset.as_str()],
            &[&[self.current_src.as_str(), self.src.as_str()][..], &lazy[..]].concat(),
        );

        let ancestor_classes = self.ancestor_classes.join(" ").trim().to_string();
        let in_carousel = is_carousel_context(&self.class_name, &ancestor_classes);
        let visible = self.display != "none"
            && self.visibility != "hidden"
            && self.rect_width > 0.0
            && self.rect_height > 0.0;

        ImageObservation {
            resolved_src,
            alt: self.alt,
            width: dimension(&[self.rect_width, self.natural_width, self.attr_width]),
            height: dimension(&[self.rect_height, self.natural_height, self.attr_height]),
            own_classes: self.class_name,
            ancestor_classes,
            visible,
            in_carousel,
        }
    }
}

impl RawBackground {
    fn resolve(self, base: Option<&Url>) -> Option<BackgroundObservation> {
        let from_computed = css_urls(&self.computed).into_iter().find(|u| !is_data_uri(u));
        let from_lazy = || {
            LAZY_BG_ATTRS
                .iter()
                .filter_map(|name| self.lazy.get(*name))
                .map(|v| lazy_background_value(v))
                .find(|v| !v.is_empty() && !is_data_uri(v))
        };
        let raw_url = from_computed.or_else(from_lazy)?;
        let resolved_url = absolutize(base, &raw_url)?;

        Some(BackgroundObservation {
            resolved_url,
            width: dimension(&[self.rect_width]),
            height: dimension(&[self.rect_height]),
            visible: self.display != "none"
                && self.visibility != "hidden"
                && self.rect_width > 0.0
                && self.rect_height > 0.0,
        })
    }
}

// ============================================================================
// Resolution helpers
// ============================================================================

/// Pick the image URL: widest `srcset` candidate first, then the first
/// usable entry of `chain`. `data:` placeholders are only returned when
/// nothing else exists.
fn select_image_source(base: Option<&Url>, srcsets: &[&str], chain: &[&str]) -> String {
    let widest = srcsets.iter().find_map(|s| widest_srcset_candidate(s));
    let mut placeholder = None;

    for candidate in widest.iter().map(String::as_str).chain(chain.iter().copied()) {
        let candidate = candidate.trim();
        if candidate.is_empty() {
            continue;
        }
        if is_data_uri(candidate) {
            placeholder.get_or_insert_with(|| candidate.to_string());
            continue;
        }
        if let Some(url) = absolutize(base, candidate) {
            return url;
        }
    }
    placeholder.unwrap_or_default()
}

/// The largest candidate of a `srcset` value, compared by `w` descriptor
/// first and `x` density second. Ties keep the first candidate.
pub fn widest_srcset_candidate(srcset: &str) -> Option<String> {
    let mut best: Option<(u8, f64, &str)> = None;

    for entry in srcset.split(',') {
        let mut parts = entry.split_whitespace();
        let Some(url) = parts.next() else { continue };
        let descriptor = parts.next().unwrap_or("1x");

        let (kind, value) = if let Some(w) = descriptor.strip_suffix('w') {
            (1u8, w.parse::<f64>().unwrap_or(0.0))
        } else if let Some(x) = descriptor.strip_suffix('x') {
            (0u8, x.parse::<f64>().unwrap_or(1.0))
        } else {
            (0u8, 1.0)
        };

        let better = match best {
            None => true,
            Some((best_kind, best_value, _)) => (kind, value) > (best_kind, best_value),
        };
        if better {
            best = Some((kind, value, url));
        }
    }

    best.map(|(_, _, url)| url.to_string())
}

/// Every `url(...)` value inside a CSS `background-image`, gradient layers
/// ignored.
pub fn css_urls(value: &str) -> Vec<String> {
    let Some(re) = CSS_URL.as_ref() else {
        return Vec::new();
    };
    re.captures_iter(value)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|u| !u.is_empty())
        .collect()
}

fn lazy_background_value(value: &str) -> String {
    css_urls(value)
        .into_iter()
        .next()
        .unwrap_or_else(|| value.trim().to_string())
}

/// Own + ancestor classes mention a slider/carousel/promo container.
pub fn is_carousel_context(own_classes: &str, ancestor_classes: &str) -> bool {
    CAROUSEL_PATTERN
        .as_ref()
        .map_or(false, |re| re.is_match(own_classes) || re.is_match(ancestor_classes))
}

/// Resolve `raw` against the page URL. `data:` URIs pass through untouched.
pub fn absolutize(base: Option<&Url>, raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if is_data_uri(raw) {
        return Some(raw.to_string());
    }
    match Url::parse(raw) {
        Ok(url) => Some(url.to_string()),
        Err(_) => base.and_then(|b| b.join(raw).ok()).map(|u| u.to_string()),
    }
}

pub fn is_data_uri(url: &str) -> bool {
    url.trim_start().get(..5).map_or(false, |p| p.eq_ignore_ascii_case("data:"))
}

fn dimension(values: &[f64]) -> u32 {
    values
        .iter()
        .copied()
        .filter(|v| v.is_finite() && *v > 0.0)
        .fold(0.0_f64, f64::max)
        .round() as u32
}

// ============================================================================
// Static HTML fallback
// ============================================================================

/// Derive observations from serialized HTML. Geometry comes from `width`/
/// `height` attributes only and visibility from inline hints.
pub fn observe_html(html: &str, page_url: &str) -> (Vec<ImageObservation>, Vec<BackgroundObservation>) {
    let document = Html::parse_document(html);
    let base = Url::parse(page_url).ok();

    let images = match Selector::parse("img") {
        Ok(selector) => document
            .select(&selector)
            .map(|el| static_image(el, base.as_ref()))
            .collect(),
        Err(_) => Vec::new(),
    };

    let backgrounds = match Selector::parse("[style], [data-bg], [data-background], [data-bg-src], [data-background-image], [data-image-src]") {
        Ok(selector) => document
            .select(&selector)
            .filter(|el| el.value().name() != "img")
            .filter_map(|el| static_background(el, base.as_ref()))
            .collect(),
        Err(_) => Vec::new(),
    };

    (images, backgrounds)
}

fn static_image(el: ElementRef<'_>, base: Option<&Url>) -> ImageObservation {
    let attr = |name: &str| el.value().attr(name).unwrap_or("");
    let lazy: Vec<&str> = LAZY_SRC_ATTRS.iter().map(|name| attr(*name)).collect();
    let resolved_src = select_image_source(
        base,
        &[attr("srcset"), attr("data-srcset")],
        &[&[attr("src")][..], &lazy[..]].concat(),
    );

    let own_classes = attr("class").to_string();
    let ancestor_classes = el
        .ancestors()
        .filter_map(ElementRef::wrap)
        .take(ANCESTOR_DEPTH)
        .filter_map(|a| a.value().attr("class"))
        .collect::<Vec<_>>()
        .join(" ");
    let in_carousel = is_carousel_context(&own_classes, &ancestor_classes);

    ImageObservation {
        resolved_src,
        alt: attr("alt").to_string(),
        width: dimension(&[attr("width").trim().parse().unwrap_or(0.0)]),
        height: dimension(&[attr("height").trim().parse().unwrap_or(0.0)]),
        own_classes,
        ancestor_classes,
        visible: !inline_hidden(el),
        in_carousel,
    }
}

fn static_background(el: ElementRef<'_>, base: Option<&Url>) -> Option<BackgroundObservation> {
    let style = el.value().attr("style").unwrap_or("");
    let inline = style
        .split(';')
        .filter_map(|decl| decl.split_once(':'))
        .filter(|(prop, _)| matches!(prop.trim().to_ascii_lowercase().as_str(), "background" | "background-image"))
        .flat_map(|(_, value)| css_urls(value))
        .find(|u| !is_data_uri(u));

    let raw_url = inline.or_else(|| {
        LAZY_BG_ATTRS
            .iter()
            .filter_map(|name| el.value().attr(name))
            .map(lazy_background_value)
            .find(|v| !v.is_empty() && !is_data_uri(v))
    })?;

    Some(BackgroundObservation {
        resolved_url: absolutize(base, &raw_url)?,
        width: dimension(&[el.value().attr("width").and_then(|w| w.trim().parse().ok()).unwrap_or(0.0)]),
        height: dimension(&[el.value().attr("height").and_then(|h| h.trim().parse().ok()).unwrap_or(0.0)]),
        visible: !inline_hidden(el),
    })
}

fn inline_hidden(el: ElementRef<'_>) -> bool {
    if el.value().attr("hidden").is_some() {
        return true;
    }
    let style: String = el
        .value()
        .attr("style")
        .unwrap_or("")
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_lowercase();
    style.contains("display:none") || style.contains("visibility:hidden")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_widest_srcset_by_width_descriptor() {
        let srcset = "/b-480.jpg 480w, /b-1920.jpg 1920w, /b-960.jpg 960w";
        assert_eq!(widest_srcset_candidate(srcset).as_deref(), Some("/b-1920.jpg"));
    }

    #[test]
    fn test_widest_srcset_by_density() {
        let srcset = "/b.jpg, /b@3x.jpg 3x, /b@2x.jpg 2x";
        assert_eq!(widest_srcset_candidate(srcset).as_deref(), Some("/b@3x.jpg"));
        assert!(widest_srcset_candidate("").is_none());
    }

    #[test]
    fn test_source_chain_skips_placeholders() {
        let base = Url::parse("https://casino.example.com/en/").ok();
        let src = select_image_source(
            base.as_ref(),
            &["", ""],
            &["", "data:image/gif;base64,R0lGOD", "", "/img/hero.webp"],
        );
        assert_eq!(src, "https://casino.example.com/img/hero.webp");

        let only_placeholder = select_image_source(base.as_ref(), &[""], &["data:image/gif;base64,AAA"]);
        assert!(only_placeholder.starts_with("data:"));
    }

    #[test]
    fn test_srcset_preferred_over_current_src() {
        let base = Url::parse("https://shop.example.com/").ok();
        let src = select_image_source(
            base.as_ref(),
            &["hero-800.jpg 800w, hero-1600.jpg 1600w"],
            &["https://shop.example.com/hero-800.jpg"],
        );
        assert_eq!(src, "https://shop.example.com/hero-1600.jpg");
    }

    #[test]
    fn test_css_urls_ignore_gradients() {
        let value = r#"linear-gradient(rgba(0,0,0,.5), transparent), url("https://cdn.example.com/bg.jpg")"#;
        assert_eq!(css_urls(value), vec!["https://cdn.example.com/bg.jpg".to_string()]);
        assert!(css_urls("linear-gradient(red, blue)").is_empty());
    }

    #[test]
    fn test_raw_image_resolution() {
        let raw = RawImage {
            src: "https://site.example.com/banner.jpg".into(),
            alt: "Welcome bonus".into(),
            rect_width: 1280.4,
            rect_height: 400.0,
            natural_width: 1920.0,
            natural_height: 600.0,
            class_name: "slide-img".into(),
            ancestor_classes: vec!["slick-slide".into(), "slick-track".into(), "".into()],
            display: "block".into(),
            visibility: "visible".into(),
            ..Default::default()
        };
        let obs = raw.resolve(None);
        assert_eq!(obs.width, 1920);
        assert_eq!(obs.height, 600);
        assert!(obs.visible);
        assert!(obs.in_carousel);
        assert_eq!(obs.ancestor_classes, "slick-slide slick-track");
    }

    #[test]
    fn test_raw_background_prefers_computed_then_lazy() {
        let base = Url::parse("https://site.example.com/").ok();
        let mut lazy = std::collections::HashMap::new();
        lazy.insert("data-bg".to_string(), "/lazy.jpg".to_string());

        let computed = RawBackground {
            computed: "url(\"/hero-bg.jpg\")".into(),
            lazy: lazy.clone(),
            rect_width: 1400.0,
            rect_height: 500.0,
            display: "block".into(),
            visibility: "visible".into(),
        };
        let obs = computed.resolve(base.as_ref()).unwrap();
        assert_eq!(obs.resolved_url, "https://site.example.com/hero-bg.jpg");
        assert!(obs.visible);

        let data_only = RawBackground {
            computed: "url(\"data:image/png;base64,AAAA\")".into(),
            lazy,
            ..Default::default()
        };
        let obs = data_only.resolve(base.as_ref()).unwrap();
        assert_eq!(obs.resolved_url, "https://site.example.com/lazy.jpg");
        assert!(!obs.visible);
    }

    #[test]
    fn test_observe_html() {
        let html = r#"
            <html><body>
              <div class="hero-slider"><div class="slide"><div class="inner">
                <img src="/placeholder.gif" data-src="/promo/welcome.jpg" width="1600" height="500" alt="Welcome">
              </div></div></div>
              <footer><img src="/icon-visa.svg" width="40" height="40" style="display: none"></footer>
              <section style="background-image: url('/bg/summer.jpg'); min-height: 400px" width="1400" height="400"></section>
              <div data-bg="url(/bg/lazy.jpg)"></div>
            </body></html>
        "#;
        let (images, backgrounds) = observe_html(html, "https://casino.example.com/");
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].resolved_src, "https://casino.example.com/placeholder.gif");
        assert!(images[0].in_carousel);
        assert_eq!(images[0].width, 1600);
        assert!(!images[1].visible);

        assert_eq!(backgrounds.len(), 2);
        assert_eq!(backgrounds[0].resolved_url, "https://casino.example.com/bg/summer.jpg");
        assert_eq!(backgrounds[0].width, 1400);
        assert_eq!(backgrounds[1].resolved_url, "https://casino.example.com/bg/lazy.jpg");
    }
}
