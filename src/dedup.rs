//! URL-keyed deduplication of banner candidates.

use std::collections::HashSet;

use crate::crawler::BannerCandidate;

/// Dedup key: the URL without query string or fragment.
pub fn normalize_key(url: &str) -> &str {
    url.split(['?', '#']).next().unwrap_or(url)
}

/// Keep the first candidate per normalized URL. The kept candidate retains
/// its original, unstripped URL.
pub fn dedup(candidates: Vec<BannerCandidate>) -> Vec<BannerCandidate> {
    let mut seen = HashSet::new();
    dedup_with(candidates, &mut seen)
}

/// Merge homepage and promotions lists: homepage entries win, and a banner
/// already seen on the homepage is dropped from promotions.
pub fn merge_pages(
    homepage: Vec<BannerCandidate>,
    promotions: Vec<BannerCandidate>,
) -> (Vec<BannerCandidate>, Vec<BannerCandidate>) {
    let mut seen = HashSet::new();
    let homepage = dedup_with(homepage, &mut seen);
    let promotions = dedup_with(promotions, &mut seen);
    (homepage, promotions)
}

fn dedup_with(candidates: Vec<BannerCandidate>, seen: &mut HashSet<String>) -> Vec<BannerCandidate> {
    candidates
        .into_iter()
        .filter(|c| seen.insert(normalize_key(&c.src).to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::{Category, PageLabel};

    fn banner(src: &str, page: PageLabel) -> BannerCandidate {
        BannerCandidate {
            src: src.to_string(),
            alt: "Banner image".to_string(),
            width: 1600,
            height: 500,
            category: Category::ImageBanner,
            page,
        }
    }

    #[test]
    fn test_query_variants_collapse_to_first() {
        let out = dedup(vec![
            banner("https://cdn.example.com/banner.jpg?w=1920", PageLabel::Homepage),
            banner("https://cdn.example.com/banner.jpg?w=800", PageLabel::Homepage),
            banner("https://cdn.example.com/banner.jpg#slide-2", PageLabel::Homepage),
            banner("https://cdn.example.com/other.jpg", PageLabel::Homepage),
        ]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].src, "https://cdn.example.com/banner.jpg?w=1920");
    }

    #[test]
    fn test_dedup_is_idempotent() {
        let input = vec![
            banner("https://cdn.example.com/a.jpg?x=1", PageLabel::Homepage),
            banner("https://cdn.example.com/b.jpg", PageLabel::Homepage),
            banner("https://cdn.example.com/a.jpg?x=2", PageLabel::Homepage),
        ];
        let once = dedup(input);
        let twice = dedup(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_merge_prefers_homepage() {
        let (home, promos) = merge_pages(
            vec![banner("https://cdn.example.com/hero.jpg", PageLabel::Homepage)],
            vec![
                banner("https://cdn.example.com/hero.jpg?ref=promo", PageLabel::Promotions),
                banner("https://cdn.example.com/weekly.jpg", PageLabel::Promotions),
            ],
        );
        assert_eq!(home.len(), 1);
        assert_eq!(promos.len(), 1);
        assert_eq!(promos[0].src, "https://cdn.example.com/weekly.jpg");
    }
}
