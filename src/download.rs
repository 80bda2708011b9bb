//! Banner image download with proxy fallback.
//!
//! Geo-restricted CDNs often answer a direct request with an HTML notice
//! instead of the image, so a non-`image/*` response counts as a failure and
//! is retried through the configured proxy.

use std::net::IpAddr;
use std::time::Duration;

use reqwest::Url;

use crate::browser::random_user_agent;
use crate::error::ScrapeError;
use crate::proxy::{ProxyDescriptor, GEO_LOCATION_HEADER};

#[derive(Debug, Clone)]
pub struct DownloadedImage {
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub via_proxy: bool,
}

pub struct ImageDownloader {
    proxy: Option<ProxyDescriptor>,
    timeout: Duration,
}

impl ImageDownloader {
    pub fn new(proxy: Option<ProxyDescriptor>) -> Self {
        Self {
            proxy,
            timeout: Duration::from_secs(30),
        }
    }

    /// Fetch `url` directly, falling back to the proxy when the direct
    /// request fails or does not return an image.
    pub async fn fetch(&self, url: &str) -> Result<DownloadedImage, ScrapeError> {
        let parsed = Url::parse(url).map_err(|e| ScrapeError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ScrapeError::InvalidUrl {
                url: url.to_string(),
                reason: format!("unsupported scheme '{}'", parsed.scheme()),
            });
        }
        if is_internal_host(&parsed) {
            return Err(ScrapeError::InvalidUrl {
                url: url.to_string(),
                reason: "local and private hosts are not fetched".to_string(),
            });
        }

        let direct = self.fetch_once(&parsed, None).await;
        let err = match direct {
            Ok(image) => return Ok(image),
            Err(e) => e,
        };

        let Some(proxy) = &self.proxy else {
            return Err(err);
        };
        tracing::warn!("Direct download of {} failed ({}), retrying through proxy", url, err);
        self.fetch_once(&parsed, Some(proxy)).await
    }

    async fn fetch_once(&self, url: &Url, proxy: Option<&ProxyDescriptor>) -> Result<DownloadedImage, ScrapeError> {
        let mut builder = reqwest::Client::builder()
            .user_agent(random_user_agent())
            .redirect(reqwest::redirect::Policy::limited(10))
            .timeout(self.timeout);
        if let Some(proxy) = proxy {
            builder = builder.proxy(proxy.to_reqwest()?);
        }
        let client = builder.build().map_err(|e| ScrapeError::Download(e.to_string()))?;

        let mut request = client
            .get(url.clone())
            .header("Accept", "image/avif,image/webp,image/apng,image/*,*/*;q=0.8")
            .header("Referer", origin_of(url));
        if let Some(country) = proxy.and_then(|p| p.country.as_deref()) {
            request = request.header(GEO_LOCATION_HEADER, country);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| ScrapeError::Download(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(ScrapeError::Download(format!("HTTP {}", resp.status())));
        }

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        if !is_image_content_type(&content_type) {
            return Err(ScrapeError::Download(format!(
                "expected an image, got '{}'",
                content_type
            )));
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| ScrapeError::Download(e.to_string()))?;
        tracing::info!("⬇️ Downloaded {} ({} bytes, {})", url, bytes.len(), content_type);

        Ok(DownloadedImage {
            bytes: bytes.to_vec(),
            content_type,
            via_proxy: proxy.is_some(),
        })
    }
}

/// Loopback, private, link-local and unspecified addresses, plus `localhost`.
/// Host names are not resolved.
fn is_internal_host(url: &Url) -> bool {
    let Some(host) = url.host_str() else {
        return true;
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            ip.is_loopback() || ip.is_private() || ip.is_link_local() || ip.is_unspecified() || ip.is_broadcast()
        }
        Ok(IpAddr::V6(ip)) => {
            if let Some(v4) = ip.to_ipv4_mapped() {
                return v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.is_unspecified();
            }
            let first = ip.segments()[0];
            ip.is_loopback()
                || ip.is_unspecified()
                // fc00::/7 unique local, fe80::/10 link-local
                || (first & 0xfe00) == 0xfc00
                || (first & 0xffc0) == 0xfe80
        }
        Err(_) => {
            let domain = host.trim_end_matches('.').to_ascii_lowercase();
            domain == "localhost" || domain.ends_with(".localhost")
        }
    }
}

pub fn is_image_content_type(content_type: &str) -> bool {
    content_type.trim().to_ascii_lowercase().starts_with("image/")
}

fn origin_of(url: &Url) -> String {
    format!("{}/", url.origin().ascii_serialization())
}

/// A safe attachment filename: the requested one if given, else the last
/// path segment of the URL.
pub fn attachment_filename(url: &str, requested: Option<&str>) -> String {
    let from_url = || {
        Url::parse(url)
            .ok()
            .and_then(|u| u.path_segments().and_then(|s| s.last().map(|p| p.to_string())))
            .filter(|s| !s.is_empty())
    };
    let raw = requested
        .map(str::to_string)
        .filter(|s| !s.trim().is_empty())
        .or_else(from_url)
        .unwrap_or_else(|| "banner.jpg".to_string());

    let cleaned: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect();
    if cleaned.trim_matches(['.', '_']).is_empty() {
        "banner.jpg".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_content_types() {
        assert!(is_image_content_type("image/webp"));
        assert!(is_image_content_type("Image/JPEG; charset=binary"));
        assert!(!is_image_content_type("text/html; charset=utf-8"));
        assert!(!is_image_content_type(""));
    }

    #[test]
    fn test_attachment_filename() {
        assert_eq!(attachment_filename("https://cdn.example.com/a/hero.webp?w=10", None), "hero.webp");
        assert_eq!(attachment_filename("https://cdn.example.com/x.jpg", Some("my banner.jpg")), "my_banner.jpg");
        assert_eq!(attachment_filename("https://cdn.example.com/", None), "banner.jpg");
        assert_eq!(attachment_filename("https://cdn.example.com/x.jpg", Some("../")), "banner.jpg");
    }

    #[test]
    fn test_referer_is_origin() {
        let url = Url::parse("https://cdn.example.com:8443/img/a.png").unwrap();
        assert_eq!(origin_of(&url), "https://cdn.example.com:8443/");
    }

    #[test]
    fn test_internal_hosts() {
        let internal = |u: &str| is_internal_host(&Url::parse(u).unwrap());
        assert!(internal("http://localhost:8080/a.png"));
        assert!(internal("http://127.0.0.1/a.png"));
        assert!(internal("http://10.0.0.5/a.png"));
        assert!(internal("http://192.168.1.20/a.png"));
        assert!(internal("http://169.254.169.254/latest/meta-data"));
        assert!(internal("http://[::1]/a.png"));
        assert!(internal("http://[fd00::1]/a.png"));
        assert!(!internal("https://cdn.example.com/a.png"));
        assert!(!internal("https://93.184.216.34/a.png"));
    }

    #[tokio::test]
    async fn test_rejects_internal_hosts_before_fetching() {
        let downloader = ImageDownloader::new(None);
        assert!(matches!(
            downloader.fetch("http://169.254.169.254/latest/meta-data").await,
            Err(ScrapeError::InvalidUrl { .. })
        ));
    }

    #[tokio::test]
    async fn test_rejects_non_http_urls() {
        let downloader = ImageDownloader::new(None);
        assert!(matches!(
            downloader.fetch("ftp://cdn.example.com/a.png").await,
            Err(ScrapeError::InvalidUrl { .. })
        ));
        assert!(matches!(
            downloader.fetch("not a url").await,
            Err(ScrapeError::InvalidUrl { .. })
        ));
    }
}
