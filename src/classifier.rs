//! Two-stage banner classification.
//!
//! Stage 1 excludes logos, icons, payment/social badges and site chrome.
//! Stage 2 admits what is left on size, aspect ratio or a promotional
//! keyword. Exclusion always runs first, carousel members included.

use crate::crawler::Category;
use crate::observer::{BackgroundObservation, ImageObservation};

/// Keyword tables used by [`BannerClassifier`]. Immutable once built.
#[derive(Debug, Clone)]
pub struct ClassifierRules {
    /// Substrings of src/alt/classes that disqualify an image outright.
    pub exclusion_terms: Vec<String>,
    /// Ancestor class tokens marking navigation, footer or logo containers.
    pub chrome_tokens: Vec<String>,
    /// Ancestor class fragments with the same meaning (`site-footer__inner`).
    pub chrome_fragments: Vec<String>,
    pub promo_keywords: Vec<String>,
    pub image_extensions: Vec<String>,
}

fn owned(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

impl Default for ClassifierRules {
    fn default() -> Self {
        Self {
            exclusion_terms: owned(&[
                "logo", "icon", "badge", "flag", "avatar", "sprite", "spinner", "loader",
                // payment brands
                "visa", "mastercard", "maestro", "paypal", "skrill", "neteller", "paysafe",
                "applepay", "apple-pay", "googlepay", "google-pay", "trustly", "interac", "astropay",
                // responsible gaming
                "gamcare", "gambleaware", "begambleaware", "gamstop", "18plus", "18+", "responsible-gaming",
                "responsiblegaming", "responsible-gambling",
                // social
                "facebook", "twitter", "instagram", "youtube", "telegram", "tiktok", "whatsapp", "linkedin",
                "pinterest", "discord",
                // game tiles and overlays
                "game-tile", "game_tile", "gametile", "game-thumb", "mini-game", "minigame", "popup", "modal",
            ]),
            chrome_tokens: owned(&[
                "nav", "navbar", "navigation", "menu", "footer", "breadcrumb", "breadcrumbs", "sidebar",
            ]),
            chrome_fragments: owned(&[
                "footer", "navbar", "navigation", "nav-menu", "main-menu", "site-logo", "header-logo",
                "header__logo", "payment-methods", "payment-providers",
            ]),
            promo_keywords: owned(&[
                "banner", "hero", "slider", "carousel", "promo", "bonus", "deposit", "welcome", "free-spin",
                "freespin", "free_spin", "cashback", "campaign", "jumbotron", "masthead", "billboard",
                "spotlight", "featured",
            ]),
            image_extensions: owned(&["jpg", "jpeg", "png", "gif", "webp", "avif", "svg", "bmp"]),
        }
    }
}

/// Why an observation was not admitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    Excluded(String),
    ChromeAncestor(String),
    SmallSvg,
    /// Zero-sized and without an image extension.
    Placeholder,
    NoBannerSignal,
    Hidden,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accept(Category),
    Reject(RejectReason),
}

impl Verdict {
    pub fn category(&self) -> Option<Category> {
        match self {
            Verdict::Accept(category) => Some(*category),
            Verdict::Reject(_) => None,
        }
    }
}

pub struct BannerClassifier {
    rules: ClassifierRules,
}

impl Default for BannerClassifier {
    fn default() -> Self {
        Self::new(ClassifierRules::default())
    }
}

impl BannerClassifier {
    pub fn new(rules: ClassifierRules) -> Self {
        Self { rules }
    }

    /// Classify one `<img>` observation.
    pub fn classify(&self, obs: &ImageObservation, in_carousel: bool) -> Verdict {
        let src = obs.resolved_src.to_lowercase();
        let alt = obs.alt.to_lowercase();
        let own = obs.own_classes.to_lowercase();
        let ancestors = obs.ancestor_classes.to_lowercase();
        let combined = format!("{} {} {} {}", src, alt, own, ancestors);

        // Stage 1: exclusion
        if let Some(term) = self.rules.exclusion_terms.iter().find(|t| combined.contains(t.as_str())) {
            return Verdict::Reject(RejectReason::Excluded(term.clone()));
        }
        if let Some(token) = self.chrome_ancestor(&ancestors) {
            return Verdict::Reject(RejectReason::ChromeAncestor(token));
        }

        let path = strip_query(&src);
        let ratio = aspect_ratio(obs.width, obs.height);
        if path.ends_with(".svg") && (obs.width < 600 || ratio < 2.0) {
            return Verdict::Reject(RejectReason::SmallSvg);
        }
        if obs.width == 0 && obs.height == 0 && !self.has_image_extension(path) {
            return Verdict::Reject(RejectReason::Placeholder);
        }

        // Stage 2: inclusion
        let accepted = if in_carousel {
            // Ancestor classes carry the carousel signal itself, so only the
            // element's own text may count as a keyword hit.
            let restricted = format!("{} {} {}", src, alt, own);
            (ratio > 1.3 && obs.width > 600) || obs.width > 1000 || self.has_promo_keyword(&restricted)
        } else {
            (ratio > 2.5 && obs.width > 600)
                || (ratio > 1.8 && obs.width > 900)
                || (ratio > 1.5 && obs.width > 950)
                || obs.width > 1200
                || self.has_promo_keyword(&combined)
        };

        if !accepted {
            return Verdict::Reject(RejectReason::NoBannerSignal);
        }
        if in_carousel {
            Verdict::Accept(Category::CarouselBanner)
        } else {
            Verdict::Accept(Category::ImageBanner)
        }
    }

    /// Backgrounds are judged on size alone.
    pub fn classify_background(&self, obs: &BackgroundObservation) -> Verdict {
        if !obs.visible {
            return Verdict::Reject(RejectReason::Hidden);
        }
        if obs.width > 800 || aspect_ratio(obs.width, obs.height) > 2.0 {
            Verdict::Accept(Category::BackgroundBanner)
        } else {
            Verdict::Reject(RejectReason::NoBannerSignal)
        }
    }

    fn chrome_ancestor(&self, ancestors: &str) -> Option<String> {
        ancestors.split_whitespace().find_map(|token| {
            let exact = self.rules.chrome_tokens.iter().any(|t| t == token);
            let fragment = self.rules.chrome_fragments.iter().any(|f| token.contains(f.as_str()));
            (exact || fragment).then(|| token.to_string())
        })
    }

    fn has_promo_keyword(&self, text: &str) -> bool {
        self.rules.promo_keywords.iter().any(|k| text.contains(k.as_str()))
    }

    fn has_image_extension(&self, path: &str) -> bool {
        path.rsplit_once('.')
            .map(|(_, ext)| self.rules.image_extensions.iter().any(|e| e == ext))
            .unwrap_or(false)
    }
}

fn strip_query(url: &str) -> &str {
    url.split(['?', '#']).next().unwrap_or(url)
}

fn aspect_ratio(width: u32, height: u32) -> f64 {
    if height == 0 {
        0.0
    } else {
        width as f64 / height as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(src: &str, width: u32, height: u32) -> ImageObservation {
        ImageObservation {
            resolved_src: src.to_string(),
            alt: String::new(),
            width,
            height,
            own_classes: String::new(),
            ancestor_classes: String::new(),
            visible: true,
            in_carousel: false,
        }
    }

    #[test]
    fn test_exclusion_beats_size() {
        let classifier = BannerClassifier::default();
        let mut obs = image("https://site.example.com/assets/cards.png", 1400, 300);
        obs.alt = "VISA logo".into();
        assert_eq!(
            classifier.classify(&obs, false),
            Verdict::Reject(RejectReason::Excluded("logo".into()))
        );
        // Carousel membership does not bypass exclusion
        assert!(matches!(classifier.classify(&obs, true), Verdict::Reject(_)));
    }

    #[test]
    fn test_zero_size_without_extension_rejected() {
        let classifier = BannerClassifier::default();
        let obs = image("https://site.example.com/cdn/asset?id=42", 0, 0);
        assert_eq!(classifier.classify(&obs, false), Verdict::Reject(RejectReason::Placeholder));

        // Extension present but still zero-sized: falls through to stage 2
        let mut named = image("https://site.example.com/img/welcome-offer.jpg?v=3", 0, 0);
        named.alt = "Welcome".into();
        assert_eq!(classifier.classify(&named, false), Verdict::Accept(Category::ImageBanner));
    }

    #[test]
    fn test_ratio_boundaries_are_strict() {
        let classifier = BannerClassifier::default();
        assert_eq!(
            classifier.classify(&image("https://site.example.com/a.jpg", 600, 240), false),
            Verdict::Reject(RejectReason::NoBannerSignal)
        );
        assert_eq!(
            classifier.classify(&image("https://site.example.com/a.jpg", 601, 239), false),
            Verdict::Accept(Category::ImageBanner)
        );
    }

    #[test]
    fn test_thumbnail_tier_needs_higher_width() {
        let classifier = BannerClassifier::default();
        // ratio 1.6: rejected at 940 wide, accepted at 960
        assert!(matches!(
            classifier.classify(&image("https://news.example.com/a.jpg", 940, 587), false),
            Verdict::Reject(_)
        ));
        assert_eq!(
            classifier.classify(&image("https://news.example.com/a.jpg", 960, 600), false),
            Verdict::Accept(Category::ImageBanner)
        );
        assert!(classifier.classify(&image("https://news.example.com/a.jpg", 1201, 1201), false).category().is_some());
    }

    #[test]
    fn test_carousel_ignores_ancestor_keywords() {
        let classifier = BannerClassifier::default();
        let mut obs = image("https://site.example.com/slides/7.jpg", 400, 400);
        obs.ancestor_classes = "promo-slider hero-banner".into();
        obs.in_carousel = true;
        assert_eq!(classifier.classify(&obs, true), Verdict::Reject(RejectReason::NoBannerSignal));

        obs.own_classes = "promo-image".into();
        assert_eq!(classifier.classify(&obs, true), Verdict::Accept(Category::CarouselBanner));
    }

    #[test]
    fn test_carousel_relaxed_thresholds() {
        let classifier = BannerClassifier::default();
        let obs = image("https://site.example.com/slides/7.jpg", 700, 500);
        assert_eq!(classifier.classify(&obs, true), Verdict::Accept(Category::CarouselBanner));
        assert!(matches!(classifier.classify(&obs, false), Verdict::Reject(_)));
    }

    #[test]
    fn test_small_svg_and_chrome_ancestors() {
        let classifier = BannerClassifier::default();
        assert_eq!(
            classifier.classify(&image("https://site.example.com/brand.svg", 1400, 1000), false),
            Verdict::Reject(RejectReason::SmallSvg)
        );
        let mut obs = image("https://site.example.com/a.jpg", 1600, 400);
        obs.ancestor_classes = "site-footer__inner row".into();
        assert_eq!(
            classifier.classify(&obs, false),
            Verdict::Reject(RejectReason::ChromeAncestor("site-footer__inner".into()))
        );
    }

    #[test]
    fn test_background_size_rules() {
        let classifier = BannerClassifier::default();
        let bg = |width, height, visible| BackgroundObservation {
            resolved_url: "https://site.example.com/bg.jpg".into(),
            width,
            height,
            visible,
        };
        assert_eq!(classifier.classify_background(&bg(1200, 700, true)), Verdict::Accept(Category::BackgroundBanner));
        assert_eq!(classifier.classify_background(&bg(500, 200, true)), Verdict::Accept(Category::BackgroundBanner));
        assert!(matches!(classifier.classify_background(&bg(500, 400, true)), Verdict::Reject(_)));
        assert_eq!(classifier.classify_background(&bg(1200, 700, false)), Verdict::Reject(RejectReason::Hidden));
    }
}
