//! Research stage: concurrent external signal gathering.
//!
//! One task per candidate, bounded by the stage concurrency cap. Within a
//! candidate task the homepage scrape and the web search run concurrently
//! and fail independently; every candidate yields a record no matter what.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tracing::{info, warn};

use dealscout_common::{CandidateIdentity, ResearchRecord, SearchSnippet};

use crate::scraper::{
    find_subpage_link, PageScraper, WebSearcher, ABOUT_KEYWORDS, PRODUCT_KEYWORDS,
};

pub const DEFAULT_RESEARCH_CONCURRENCY: usize = 10;

const HOMEPAGE_CHAR_BUDGET: usize = 6_000;
const SUBPAGE_CHAR_BUDGET: usize = 3_000;
const SNIPPETS_PER_QUERY: usize = 3;
const QUERY_DELAY: Duration = Duration::from_millis(400);

pub struct ResearchStage {
    scraper: Arc<dyn PageScraper>,
    searcher: Option<Arc<dyn WebSearcher>>,
}

impl ResearchStage {
    pub fn new(scraper: Arc<dyn PageScraper>, searcher: Option<Arc<dyn WebSearcher>>) -> Self {
        Self { scraper, searcher }
    }

    /// Research every candidate, at most `max_concurrent` in flight.
    /// Returns exactly one record per candidate; failures surface as false
    /// success flags, never as missing records. A crashed task is downgraded
    /// to an empty record for that candidate.
    pub async fn research_batch(
        &self,
        candidates: &[CandidateIdentity],
        max_concurrent: usize,
        cancel: &Arc<AtomicBool>,
    ) -> Vec<ResearchRecord> {
        info!(
            candidates = candidates.len(),
            max_concurrent, "Research stage starting"
        );

        let records: Vec<ResearchRecord> = stream::iter(candidates.iter().cloned().map(|identity| {
            let scraper = self.scraper.clone();
            let searcher = self.searcher.clone();
            let cancel = cancel.clone();
            async move {
                let fallback = identity.clone();
                let handle = tokio::spawn(async move {
                    research_candidate(identity, scraper, searcher, cancel).await
                });
                match handle.await {
                    Ok(record) => record,
                    Err(e) => {
                        warn!(key = %fallback.key, error = %e, "Research task crashed");
                        ResearchRecord::empty(fallback.key, fallback.homepage_url)
                    }
                }
            }
        }))
        .buffer_unordered(max_concurrent.max(1))
        .collect()
        .await;

        let gathered = records.iter().filter(|r| r.scrape_ok || r.search_ok).count();
        info!(
            records = records.len(),
            with_signal = gathered,
            "Research stage complete"
        );

        records
    }
}

async fn research_candidate(
    identity: CandidateIdentity,
    scraper: Arc<dyn PageScraper>,
    searcher: Option<Arc<dyn WebSearcher>>,
    cancel: Arc<AtomicBool>,
) -> ResearchRecord {
    if cancel.load(Ordering::Relaxed) {
        return ResearchRecord::empty(identity.key, identity.homepage_url);
    }

    let (scrape, search) = tokio::join!(
        scrape_candidate(&identity, scraper.as_ref(), &cancel),
        search_candidate(&identity, searcher.as_deref(), &cancel),
    );

    let mut record = ResearchRecord {
        key: identity.key,
        homepage_url: identity.homepage_url,
        homepage_text: scrape.homepage_text,
        about_text: scrape.about_text,
        products_text: scrape.products_text,
        search_snippets: search.snippets,
        scrape_ok: scrape.ok,
        search_ok: search.ok,
        digital_score: 0,
    };
    record.digital_score = digital_score(&record);
    record
}

// --- Scrape sub-task ---

#[derive(Default)]
struct ScrapeFindings {
    homepage_text: Option<String>,
    about_text: Option<String>,
    products_text: Option<String>,
    ok: bool,
}

async fn scrape_candidate(
    identity: &CandidateIdentity,
    scraper: &dyn PageScraper,
    cancel: &AtomicBool,
) -> ScrapeFindings {
    let mut findings = ScrapeFindings::default();

    let Some(url) = identity.homepage_url.as_deref() else {
        return findings;
    };

    let text = match scraper.scrape(url).await {
        Ok(text) => text,
        Err(e) => {
            warn!(key = %identity.key, url, error = %e, "Homepage scrape failed");
            return findings;
        }
    };
    if text.trim().is_empty() {
        warn!(key = %identity.key, url, "Homepage yielded no content");
        return findings;
    }
    findings.homepage_text = Some(truncate_chars(&text, HOMEPAGE_CHAR_BUDGET));
    findings.ok = true;

    if cancel.load(Ordering::Relaxed) {
        return findings;
    }

    // Sub-page discovery needs the raw link structure, not extracted text
    let html = match scraper.scrape_raw(url).await {
        Ok(html) => html,
        Err(e) => {
            warn!(key = %identity.key, url, error = %e, "Raw HTML fetch failed, skipping sub-pages");
            return findings;
        }
    };

    if let Some(about_url) = find_subpage_link(&html, url, ABOUT_KEYWORDS) {
        if !cancel.load(Ordering::Relaxed) {
            match scraper.scrape(&about_url).await {
                Ok(text) if !text.trim().is_empty() => {
                    findings.about_text = Some(truncate_chars(&text, SUBPAGE_CHAR_BUDGET));
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(key = %identity.key, url = about_url.as_str(), error = %e, "About page scrape failed")
                }
            }
        }
    }

    if let Some(products_url) = find_subpage_link(&html, url, PRODUCT_KEYWORDS) {
        if !cancel.load(Ordering::Relaxed) {
            match scraper.scrape(&products_url).await {
                Ok(text) if !text.trim().is_empty() => {
                    findings.products_text = Some(truncate_chars(&text, SUBPAGE_CHAR_BUDGET));
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(key = %identity.key, url = products_url.as_str(), error = %e, "Products page scrape failed")
                }
            }
        }
    }

    findings
}

// --- Search sub-task ---

struct SearchFindings {
    snippets: BTreeMap<String, Vec<SearchSnippet>>,
    ok: bool,
}

/// Templated queries for one candidate. Deterministic: same name, same
/// queries, same order.
fn research_queries(name: &str) -> Vec<String> {
    vec![
        format!("{name} products services"),
        format!("{name} business model"),
    ]
}

async fn search_candidate(
    identity: &CandidateIdentity,
    searcher: Option<&dyn WebSearcher>,
    cancel: &AtomicBool,
) -> SearchFindings {
    let mut findings = SearchFindings {
        snippets: BTreeMap::new(),
        ok: false,
    };

    let Some(searcher) = searcher else {
        return findings;
    };

    findings.ok = true;
    for (i, query) in research_queries(&identity.name).into_iter().enumerate() {
        if cancel.load(Ordering::Relaxed) {
            findings.ok = false;
            break;
        }
        if i > 0 {
            // Space queries out to respect the provider's rate limit
            tokio::time::sleep(QUERY_DELAY).await;
        }

        match searcher.search(&query, SNIPPETS_PER_QUERY).await {
            Ok(results) => {
                let snippets: Vec<SearchSnippet> = results
                    .into_iter()
                    .map(|r| SearchSnippet {
                        title: r.title,
                        url: r.url,
                        snippet: r.snippet,
                    })
                    .collect();
                findings.snippets.insert(query, snippets);
            }
            Err(e) => {
                warn!(key = %identity.key, query = query.as_str(), error = %e, "Search query failed");
                findings.ok = false;
            }
        }
    }

    findings
}

// --- Digital score ---

/// Additive signal-coverage heuristic, capped at 100.
pub fn digital_score(record: &ResearchRecord) -> u8 {
    let mut score = 0u32;
    if record.homepage_url.is_some() {
        score += 10;
    }
    if record.homepage_text.is_some() {
        score += 25;
    }
    if record.about_text.is_some() {
        score += 15;
    }
    if record.products_text.is_some() {
        score += 15;
    }
    if record.search_snippets.values().any(|s| !s.is_empty()) {
        score += 15;
    }
    if record.scrape_ok {
        score += 10;
    }
    if record.search_ok {
        score += 10;
    }
    score.min(100) as u8
}

/// Truncate on a char boundary at or below `budget` bytes.
fn truncate_chars(text: &str, budget: usize) -> String {
    if text.len() <= budget {
        return text.to_string();
    }
    let mut end = budget;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{identity, CountingScraper, MockScraper, MockSearcher};

    fn cancel_flag() -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(false))
    }

    #[tokio::test]
    async fn one_record_per_candidate_even_when_everything_fails() {
        let scraper = Arc::new(MockScraper::failing());
        let searcher: Arc<dyn WebSearcher> = Arc::new(MockSearcher::failing());
        let stage = ResearchStage::new(scraper, Some(searcher));

        let candidates = vec![
            identity("911111111", "Alpha AS", Some("https://alpha.no")),
            identity("922222222", "Beta AS", None),
            identity("933333333", "Gamma AS", Some("https://gamma.no")),
        ];

        let records = stage
            .research_batch(&candidates, DEFAULT_RESEARCH_CONCURRENCY, &cancel_flag())
            .await;

        assert_eq!(records.len(), candidates.len());
        for record in &records {
            assert!(!record.scrape_ok);
            assert!(!record.search_ok);
        }
    }

    #[tokio::test]
    async fn successful_scrape_and_search_fill_the_record() {
        let scraper = Arc::new(
            MockScraper::new()
                .with_page("https://alpha.no", "Alpha builds valves for fish farms.")
                .with_raw(
                    "https://alpha.no",
                    r#"<a href="/om-oss">Om oss</a><a href="/produkter">Produkter</a>"#,
                )
                .with_page("https://alpha.no/om-oss", "Family owned since 1987.")
                .with_page("https://alpha.no/produkter", "Valves, pumps, service."),
        );
        let searcher: Arc<dyn WebSearcher> = Arc::new(MockSearcher::with_hits(2));
        let stage = ResearchStage::new(scraper, Some(searcher));

        let candidates = vec![identity("911111111", "Alpha AS", Some("https://alpha.no"))];
        let records = stage.research_batch(&candidates, 4, &cancel_flag()).await;

        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert!(record.scrape_ok);
        assert!(record.search_ok);
        assert_eq!(record.homepage_text.as_deref(), Some("Alpha builds valves for fish farms."));
        assert_eq!(record.about_text.as_deref(), Some("Family owned since 1987."));
        assert_eq!(record.products_text.as_deref(), Some("Valves, pumps, service."));
        assert_eq!(record.search_snippets.len(), 2);
        assert_eq!(record.digital_score, 100);
    }

    #[tokio::test]
    async fn search_failure_does_not_poison_the_scrape() {
        let scraper = Arc::new(
            MockScraper::new()
                .with_page("https://alpha.no", "Alpha content.")
                .with_raw("https://alpha.no", "<p>no links</p>"),
        );
        let searcher: Arc<dyn WebSearcher> = Arc::new(MockSearcher::failing());
        let stage = ResearchStage::new(scraper, Some(searcher));

        let candidates = vec![identity("911111111", "Alpha AS", Some("https://alpha.no"))];
        let records = stage.research_batch(&candidates, 4, &cancel_flag()).await;

        let record = &records[0];
        assert!(record.scrape_ok);
        assert!(!record.search_ok);
        assert!(record.homepage_text.is_some());
        assert!(record.search_snippets.is_empty());
    }

    #[tokio::test]
    async fn no_searcher_means_search_not_attempted() {
        let scraper = Arc::new(MockScraper::new().with_page("https://alpha.no", "Alpha."));
        let stage = ResearchStage::new(scraper, None);

        let candidates = vec![identity("911111111", "Alpha AS", Some("https://alpha.no"))];
        let records = stage.research_batch(&candidates, 4, &cancel_flag()).await;

        assert!(!records[0].search_ok);
        assert!(records[0].search_snippets.is_empty());
    }

    #[tokio::test]
    async fn concurrency_stays_under_the_cap() {
        let scraper = Arc::new(CountingScraper::new(Duration::from_millis(30)));
        let stage = ResearchStage::new(scraper.clone(), None);

        let candidates: Vec<_> = (0..20)
            .map(|i| {
                identity(
                    &format!("9{i:08}"),
                    &format!("Company {i}"),
                    Some(&format!("https://c{i}.no")),
                )
            })
            .collect();

        let cap = 4;
        let records = stage.research_batch(&candidates, cap, &cancel_flag()).await;

        assert_eq!(records.len(), 20);
        assert!(
            scraper.peak() <= cap,
            "peak in-flight {} exceeded cap {}",
            scraper.peak(),
            cap
        );
    }

    #[tokio::test]
    async fn cancelled_batch_returns_promptly_with_empty_records() {
        let scraper = Arc::new(MockScraper::new().with_page("https://alpha.no", "Alpha."));
        let stage = ResearchStage::new(scraper, None);

        let cancel = Arc::new(AtomicBool::new(true));
        let candidates = vec![
            identity("911111111", "Alpha AS", Some("https://alpha.no")),
            identity("922222222", "Beta AS", Some("https://beta.no")),
        ];

        let records = stage.research_batch(&candidates, 4, &cancel).await;

        assert_eq!(records.len(), 2);
        for record in &records {
            assert!(!record.scrape_ok);
            assert!(record.homepage_text.is_none());
        }
    }

    #[test]
    fn digital_score_is_additive_and_capped() {
        let mut record = ResearchRecord::empty("911111111".into(), None);
        assert_eq!(digital_score(&record), 0);

        record.homepage_url = Some("https://alpha.no".to_string());
        assert_eq!(digital_score(&record), 10);

        record.homepage_text = Some("text".to_string());
        record.scrape_ok = true;
        assert_eq!(digital_score(&record), 45);

        record.about_text = Some("about".to_string());
        record.products_text = Some("products".to_string());
        record.search_snippets.insert(
            "q".to_string(),
            vec![SearchSnippet {
                title: "t".into(),
                url: "u".into(),
                snippet: "s".into(),
            }],
        );
        record.search_ok = true;
        assert_eq!(digital_score(&record), 100);
    }

    #[test]
    fn empty_search_hits_score_no_points() {
        let mut record = ResearchRecord::empty("911111111".into(), None);
        record.search_snippets.insert("q".to_string(), Vec::new());
        record.search_ok = true;
        // Sub-task succeeded but found nothing: flag points only
        assert_eq!(digital_score(&record), 10);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let text = "æøå".repeat(100);
        let truncated = truncate_chars(&text, 7);
        assert!(truncated.len() <= 7);
        assert!(text.starts_with(&truncated));
    }

    #[test]
    fn queries_are_deterministic() {
        assert_eq!(
            research_queries("Alpha AS"),
            research_queries("Alpha AS"),
        );
        assert_eq!(
            research_queries("Alpha AS")[0],
            "Alpha AS products services"
        );
    }
}
