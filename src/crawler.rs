use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::browser::PageDriver;
use crate::classifier::{BannerClassifier, Verdict};
use crate::dedup::dedup;
use crate::observer::{
    is_data_uri, observe_backgrounds, observe_html, observe_images, BackgroundObservation, ImageObservation,
};
use crate::render::RenderOrchestrator;

// ============================================================================
// Result Data Structures
// ============================================================================

/// Banner category, serialized with the display names consumers expect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub enum Category {
    #[serde(rename = "Banner Image")]
    ImageBanner,
    #[serde(rename = "Carousel Banner")]
    CarouselBanner,
    #[serde(rename = "Background Banner")]
    BackgroundBanner,
}

/// Logical page a banner was found on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub enum PageLabel {
    Homepage,
    Promotions,
}

impl std::fmt::Display for PageLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PageLabel::Homepage => write!(f, "Homepage"),
            PageLabel::Promotions => write!(f, "Promotions"),
        }
    }
}

/// One extracted banner. `src` is absolute, never empty and never `data:`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, ToSchema)]
pub struct BannerCandidate {
    pub src: String,
    pub alt: String,
    pub width: u32,
    pub height: u32,
    #[serde(rename = "type")]
    pub category: Category,
    pub page: PageLabel,
}

/// Banners of one connection attempt, split by page.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, ToSchema)]
pub struct ScrapeResult {
    pub homepage: Vec<BannerCandidate>,
    pub promotions: Vec<BannerCandidate>,
    /// The attempt that produced this result hit a block page.
    pub blocked: bool,
}

impl ScrapeResult {
    pub fn total(&self) -> usize {
        self.homepage.len() + self.promotions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

const DEFAULT_IMAGE_ALT: &str = "Banner image";
const DEFAULT_BACKGROUND_ALT: &str = "Background banner image";

// ============================================================================
// Page Pipeline
// ============================================================================

/// Render, observe, classify and dedup the page the driver is showing.
///
/// Image and background extraction fail independently; when the in-page
/// scripts fail the serialized DOM is observed instead.
pub async fn scrape_current_page(
    driver: &dyn PageDriver,
    label: PageLabel,
    orchestrator: &RenderOrchestrator,
    classifier: &BannerClassifier,
) -> Vec<BannerCandidate> {
    tracing::info!("🖼️ Preparing {} for extraction...", label);
    orchestrator.prepare(driver).await;

    let mut static_fallback: Option<(Vec<ImageObservation>, Vec<BackgroundObservation>)> = None;
    let mut fallback = |driver: &dyn PageDriver| -> (Vec<ImageObservation>, Vec<BackgroundObservation>) {
        static_fallback
            .get_or_insert_with(|| match driver.content() {
                Ok(html) => observe_html(&html, &driver.url()),
                Err(e) => {
                    tracing::warn!("Static fallback unavailable: {}", e);
                    (Vec::new(), Vec::new())
                }
            })
            .clone()
    };

    let images = match observe_images(driver) {
        Ok(images) => images,
        Err(e) => {
            tracing::warn!("Image extraction failed on {}: {}; observing static DOM", label, e);
            fallback(driver).0
        }
    };
    let backgrounds = match observe_backgrounds(driver) {
        Ok(backgrounds) => backgrounds,
        Err(e) => {
            tracing::warn!("Background extraction failed on {}: {}; observing static DOM", label, e);
            fallback(driver).1
        }
    };

    tracing::info!(
        "Found {} images and {} backgrounds on {}",
        images.len(),
        backgrounds.len(),
        label
    );

    let banners = classify_observations(&images, &backgrounds, label, classifier);
    tracing::info!("✅ {} banners from {}", banners.len(), label);
    banners
}

/// Turn raw observations into deduplicated banner candidates.
pub fn classify_observations(
    images: &[ImageObservation],
    backgrounds: &[BackgroundObservation],
    label: PageLabel,
    classifier: &BannerClassifier,
) -> Vec<BannerCandidate> {
    let mut banners = Vec::new();

    for img in images {
        if img.resolved_src.trim().is_empty() || is_data_uri(&img.resolved_src) {
            continue;
        }
        // Hidden slides are still banners when they sit in a carousel
        if !img.visible && !img.in_carousel {
            continue;
        }
        match classifier.classify(img, img.in_carousel) {
            Verdict::Accept(category) => banners.push(BannerCandidate {
                src: img.resolved_src.clone(),
                alt: if img.alt.trim().is_empty() {
                    DEFAULT_IMAGE_ALT.to_string()
                } else {
                    img.alt.trim().to_string()
                },
                width: img.width,
                height: img.height,
                category,
                page: label,
            }),
            Verdict::Reject(reason) => tracing::debug!("Rejected {}: {:?}", img.resolved_src, reason),
        }
    }

    for bg in backgrounds {
        if bg.resolved_url.trim().is_empty() || is_data_uri(&bg.resolved_url) {
            continue;
        }
        if let Verdict::Accept(category) = classifier.classify_background(bg) {
            banners.push(BannerCandidate {
                src: bg.resolved_url.clone(),
                alt: DEFAULT_BACKGROUND_ALT.to_string(),
                width: bg.width,
                height: bg.height,
                category,
                page: label,
            });
        }
    }

    dedup(banners)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn img(src: &str, width: u32, height: u32) -> ImageObservation {
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
    fn test_hero_kept_visa_dropped() {
        let classifier = BannerClassifier::default();
        let out = classify_observations(
            &[
                img("https://shop.example.com/hero.jpg", 1600, 500),
                img("https://shop.example.com/icon-visa.svg", 40, 40),
            ],
            &[],
            PageLabel::Homepage,
            &classifier,
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].category, Category::ImageBanner);
        assert_eq!(out[0].alt, "Banner image");
    }

    #[test]
    fn test_hidden_images_need_carousel() {
        let classifier = BannerClassifier::default();
        let mut hidden = img("https://shop.example.com/slide-2.jpg", 1600, 500);
        hidden.visible = false;
        let mut hidden_slide = hidden.clone();
        hidden_slide.resolved_src = "https://shop.example.com/slide-3.jpg".into();
        hidden_slide.in_carousel = true;
        hidden_slide.ancestor_classes = "swiper-slide".into();

        let out = classify_observations(&[hidden, hidden_slide], &[], PageLabel::Promotions, &classifier);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].category, Category::CarouselBanner);
        assert_eq!(out[0].page, PageLabel::Promotions);
    }

    #[test]
    fn test_data_uris_and_duplicates_dropped() {
        let classifier = BannerClassifier::default();
        let bg = BackgroundObservation {
            resolved_url: "https://shop.example.com/hero.jpg?w=2000".into(),
            width: 1400,
            height: 500,
            visible: true,
        };
        let out = classify_observations(
            &[
                img("data:image/gif;base64,R0lGODlhAQABAAAAACw=", 1600, 500),
                img("https://shop.example.com/hero.jpg", 1600, 500),
            ],
            &[bg],
            PageLabel::Homepage,
            &classifier,
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].src, "https://shop.example.com/hero.jpg");
    }

    #[test]
    fn test_result_json_shape() {
        let result = ScrapeResult {
            homepage: vec![BannerCandidate {
                src: "https://shop.example.com/bg.jpg".into(),
                alt: "Background banner image".into(),
                width: 1400,
                height: 500,
                category: Category::BackgroundBanner,
                page: PageLabel::Homepage,
            }],
            promotions: vec![],
            blocked: false,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["homepage"][0]["type"], "Background Banner");
        assert_eq!(json["homepage"][0]["page"], "Homepage");
        assert_eq!(json["blocked"], false);
    }
}
