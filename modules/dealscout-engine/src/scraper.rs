use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use spider_transformations::transformation::content::{
    transform_content_input, ReturnFormat, TransformConfig, TransformInput,
};
use tracing::{info, warn};

// --- PageScraper trait ---

#[async_trait]
pub trait PageScraper: Send + Sync {
    /// Readability-extracted main content, stripped of navigation chrome.
    async fn scrape(&self, url: &str) -> Result<String>;
    /// Raw HTML, for harvesting links from the page structure.
    async fn scrape_raw(&self, url: &str) -> Result<String>;
}

// --- HTTP + Readability scraper ---

const USER_AGENT: &str = "dealscout/0.1 (+research pipeline)";

/// Plain reqwest fetcher with Readability extraction. Candidate homepages
/// are static corporate sites; no JS rendering needed.
pub struct HttpScraper {
    client: reqwest::Client,
}

impl HttpScraper {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .user_agent(USER_AGENT)
                .build()
                .expect("Failed to build HTTP client"),
        }
    }

    async fn fetch(&self, url: &str) -> Result<String> {
        let parsed = url::Url::parse(url).context("Invalid URL")?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            anyhow::bail!("Only http/https URLs are allowed, got: {}", parsed.scheme());
        }

        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Page request failed")?
            .error_for_status()
            .context("Page returned error status")?;

        response.text().await.context("Failed to read page body")
    }
}

#[async_trait]
impl PageScraper for HttpScraper {
    async fn scrape(&self, url: &str) -> Result<String> {
        let html = self.fetch(url).await?;

        if html.is_empty() {
            warn!(url, "Empty HTML response");
            return Ok(String::new());
        }

        let parsed_url = url::Url::parse(url).ok();
        let config = TransformConfig {
            readability: true,
            main_content: true,
            return_format: ReturnFormat::Markdown,
            filter_images: true,
            filter_svg: true,
            clean_html: true,
        };
        let input = TransformInput {
            url: parsed_url.as_ref(),
            content: html.as_bytes(),
            screenshot_bytes: None,
            encoding: None,
            selector_config: None,
            ignore_tags: None,
        };

        let text = transform_content_input(input, &config);

        if text.trim().is_empty() {
            warn!(url, "Empty content after Readability extraction");
            return Ok(String::new());
        }

        info!(url, bytes = text.len(), "Scraped successfully");
        Ok(text)
    }

    async fn scrape_raw(&self, url: &str) -> Result<String> {
        let html = self.fetch(url).await?;
        info!(url, bytes = html.len(), "Raw HTML scraped");
        Ok(html)
    }
}

// --- Sub-page discovery ---

/// Link-text and href keywords that mark a company "about" page.
/// Includes Nordic variants: much of the candidate universe is Norwegian.
pub const ABOUT_KEYWORDS: &[&str] = &[
    "about",
    "about-us",
    "aboutus",
    "who-we-are",
    "company",
    "om oss",
    "om-oss",
    "om_oss",
];

/// Keywords that mark a products/services page.
pub const PRODUCT_KEYWORDS: &[&str] = &[
    "product",
    "products",
    "services",
    "solutions",
    "produkter",
    "tjenester",
    "losninger",
    "løsninger",
];

/// Find the first anchor whose href or link text matches one of `keywords`.
/// Relative hrefs are resolved against `base_url`; fragment-only, mailto and
/// tel links are skipped.
pub fn find_subpage_link(html: &str, base_url: &str, keywords: &[&str]) -> Option<String> {
    let anchor_re =
        regex::Regex::new(r#"(?is)<a[^>]*href\s*=\s*["']([^"']+)["'][^>]*>(.*?)</a>"#)
            .expect("valid regex");
    let base = url::Url::parse(base_url).ok();

    for cap in anchor_re.captures_iter(html) {
        let href = cap[1].trim();
        if href.starts_with('#') || href.starts_with("mailto:") || href.starts_with("tel:") {
            continue;
        }

        let text = cap[2].to_lowercase();
        let href_lower = href.to_lowercase();
        let matched = keywords
            .iter()
            .any(|kw| href_lower.contains(kw) || text.contains(kw));
        if !matched {
            continue;
        }

        if href.starts_with("http://") || href.starts_with("https://") {
            return Some(href.to_string());
        }
        if let Some(ref b) = base {
            if let Ok(resolved) = b.join(href) {
                return Some(resolved.to_string());
            }
        }
    }

    None
}

// --- WebSearcher trait ---

#[derive(Debug, Clone)]
pub struct SearchResult {
    pub url: String,
    pub title: String,
    pub snippet: String,
}

#[async_trait]
pub trait WebSearcher: Send + Sync {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchResult>>;
}

// --- Serper (Google Search) ---

pub struct SerperSearcher {
    api_key: String,
    client: reqwest::Client,
}

#[derive(Debug, serde::Deserialize)]
struct SerperResponse {
    #[serde(default)]
    organic: Vec<SerperHit>,
}

#[derive(Debug, serde::Deserialize)]
struct SerperHit {
    #[serde(default)]
    link: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    snippet: String,
}

impl SerperSearcher {
    pub fn new(api_key: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("Failed to build HTTP client"),
        }
    }
}

#[async_trait]
impl WebSearcher for SerperSearcher {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchResult>> {
        info!(query, max_results, "Serper search");

        let body = serde_json::json!({
            "q": query,
            "num": max_results,
        });

        let resp = self
            .client
            .post("https://google.serper.dev/search")
            .header("X-API-KEY", &self.api_key)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .context("Serper API request failed")?;

        let data: SerperResponse = resp
            .json()
            .await
            .context("Failed to parse Serper response")?;

        let results: Vec<SearchResult> = data
            .organic
            .into_iter()
            .take(max_results)
            .map(|hit| SearchResult {
                url: hit.link,
                title: hit.title,
                snippet: hit.snippet,
            })
            .collect();

        info!(query, count = results.len(), "Serper search complete");
        Ok(results)
    }
}
