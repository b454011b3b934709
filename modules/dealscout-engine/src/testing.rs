//! Test support: mocks for every trait seam plus fixture builders.
//!
//! Tests follow MOCK → FUNCTION → OUTPUT: set up doubles, call the real
//! code, assert on what came out.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use uuid::Uuid;

use dealscout_common::{
    AnalysisListing, AnalysisRecord, CandidateContext, CandidateIdentity, CandidateKey, Company,
    CompanyFinancials, FilterCriteria, Recommendation, ResearchRecord, Run,
};
use dealscout_store::filter_sql::validate_clause;
use dealscout_store::Store;

use crate::analyzer::CandidateAnalyzer;
use crate::scraper::{PageScraper, SearchResult, WebSearcher};

// ---------------------------------------------------------------------------
// Fixture builders
// ---------------------------------------------------------------------------

pub fn identity(key: &str, name: &str, homepage: Option<&str>) -> CandidateIdentity {
    CandidateIdentity {
        key: key.into(),
        name: name.to_string(),
        homepage_url: homepage.map(str::to_string),
    }
}

pub fn financials(
    revenue: i64,
    operating_margin: Option<f64>,
    revenue_growth: Option<f64>,
) -> CompanyFinancials {
    CompanyFinancials {
        revenue,
        operating_margin,
        revenue_growth,
        employees: Some(25),
        industry_code: Some("28.140".to_string()),
    }
}

pub fn context(identity: CandidateIdentity) -> CandidateContext {
    CandidateContext {
        identity,
        financials: financials(20_000_000, Some(0.10), Some(0.15)),
        research: None,
    }
}

pub fn context_with_research(
    identity: CandidateIdentity,
    financials: CompanyFinancials,
    research: Option<ResearchRecord>,
) -> CandidateContext {
    CandidateContext {
        identity,
        financials,
        research,
    }
}

pub fn company(key: &str, name: &str, revenue: i64, growth: Option<f64>) -> Company {
    Company {
        org_number: key.into(),
        name: name.to_string(),
        homepage_url: None,
        industry_code: Some("28.140".to_string()),
        revenue,
        operating_margin: Some(0.10),
        revenue_growth: growth,
        employees: Some(25),
    }
}

// ---------------------------------------------------------------------------
// MockScraper: canned pages keyed by URL
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MockScraper {
    pages: HashMap<String, String>,
    raw: HashMap<String, String>,
}

impl MockScraper {
    pub fn new() -> Self {
        Self::default()
    }

    /// A scraper with no fixtures: every fetch errors.
    pub fn failing() -> Self {
        Self::default()
    }

    pub fn with_page(mut self, url: &str, text: &str) -> Self {
        self.pages.insert(url.to_string(), text.to_string());
        self
    }

    pub fn with_raw(mut self, url: &str, html: &str) -> Self {
        self.raw.insert(url.to_string(), html.to_string());
        self
    }
}

#[async_trait]
impl PageScraper for MockScraper {
    async fn scrape(&self, url: &str) -> Result<String> {
        self.pages
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow!("no page fixture for {url}"))
    }

    async fn scrape_raw(&self, url: &str) -> Result<String> {
        self.raw
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow!("no raw fixture for {url}"))
    }
}

// ---------------------------------------------------------------------------
// CountingScraper: instruments peak in-flight scrapes
// ---------------------------------------------------------------------------

pub struct CountingScraper {
    delay: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl CountingScraper {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Highest number of scrapes observed in flight at once.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PageScraper for CountingScraper {
    async fn scrape(&self, _url: &str) -> Result<String> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(current, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok("fixture content".to_string())
    }

    async fn scrape_raw(&self, _url: &str) -> Result<String> {
        Ok(String::new())
    }
}

// ---------------------------------------------------------------------------
// MockSearcher
// ---------------------------------------------------------------------------

pub struct MockSearcher {
    hits_per_query: usize,
    fail: bool,
}

impl MockSearcher {
    pub fn with_hits(hits_per_query: usize) -> Self {
        Self {
            hits_per_query,
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            hits_per_query: 0,
            fail: true,
        }
    }
}

#[async_trait]
impl WebSearcher for MockSearcher {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchResult>> {
        if self.fail {
            return Err(anyhow!("synthetic search failure"));
        }
        Ok((0..self.hits_per_query.min(max_results))
            .map(|i| SearchResult {
                url: format!("https://results.example/{i}"),
                title: format!("Result {i} for {query}"),
                snippet: format!("Snippet {i}"),
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// MockAnalyzer
// ---------------------------------------------------------------------------

pub struct MockAnalyzer {
    fail_keys: HashSet<String>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl MockAnalyzer {
    pub fn new() -> Self {
        Self {
            fail_keys: HashSet::new(),
            delay: None,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn failing_for(mut self, key: &str) -> Self {
        self.fail_keys.insert(key.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl Default for MockAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CandidateAnalyzer for MockAnalyzer {
    async fn analyze(&self, context: &CandidateContext) -> Result<AnalysisRecord> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(current, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let key = &context.identity.key;
        if self.fail_keys.contains(key.as_str()) {
            return Err(anyhow!("synthetic analysis failure"));
        }

        Ok(AnalysisRecord {
            key: key.clone(),
            business_model: "Makes and services industrial equipment.".to_string(),
            market_position: "Niche regional player.".to_string(),
            strengths: vec!["Recurring service revenue".to_string()],
            weaknesses: vec!["Key-person dependency".to_string()],
            opportunities: vec!["Adjacent markets".to_string()],
            threats: vec!["Larger consolidators".to_string()],
            fit_score: 7,
            recommendation: Recommendation::Pursue,
            rationale: "Solid margins in a defensible niche.".to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// MemoryStore: in-memory Store with the same filter semantics as Postgres
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryInner {
    companies: Vec<Company>,
    runs: HashMap<Uuid, Run>,
    research: HashMap<(Uuid, String), ResearchRecord>,
    analyses: HashMap<(Uuid, String), AnalysisRecord>,
    fail_candidate_queries: bool,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_company(&self, company: Company) {
        self.inner.lock().unwrap().companies.push(company);
    }

    /// Make candidate search and count fail, to exercise the fatal filter
    /// path.
    pub fn fail_candidate_queries(&self) {
        self.inner.lock().unwrap().fail_candidate_queries = true;
    }

    fn matched(&self, criteria: &FilterCriteria) -> Result<Vec<Company>> {
        for clause in &criteria.extra_clauses {
            validate_clause(clause)?;
        }

        let inner = self.inner.lock().unwrap();
        let mut matched: Vec<Company> = inner
            .companies
            .iter()
            .filter(|c| {
                if criteria.min_revenue > 0 && c.revenue < criteria.min_revenue {
                    return false;
                }
                if let Some(min) = criteria.min_margin {
                    if c.operating_margin.map_or(true, |v| v < min) {
                        return false;
                    }
                }
                if let Some(min) = criteria.min_growth {
                    if c.revenue_growth.map_or(true, |v| v < min) {
                        return false;
                    }
                }
                if !criteria.industry_codes.is_empty() {
                    let in_set = c
                        .industry_code
                        .as_ref()
                        .is_some_and(|code| criteria.industry_codes.contains(code));
                    if !in_set {
                        return false;
                    }
                }
                true
            })
            .cloned()
            .collect();

        matched.sort_by(|a, b| {
            let ga = a.revenue_growth.unwrap_or(f64::NEG_INFINITY);
            let gb = b.revenue_growth.unwrap_or(f64::NEG_INFINITY);
            gb.partial_cmp(&ga)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.revenue.cmp(&a.revenue))
                .then_with(|| a.org_number.0.cmp(&b.org_number.0))
        });

        Ok(matched)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn search_candidates(&self, criteria: &FilterCriteria) -> Result<Vec<CandidateKey>> {
        if self.inner.lock().unwrap().fail_candidate_queries {
            return Err(anyhow!("synthetic query failure"));
        }
        let matched = self.matched(criteria)?;
        let cap = criteria.max_results.max(0) as usize;
        Ok(matched
            .into_iter()
            .take(cap)
            .map(|c| c.org_number)
            .collect())
    }

    async fn count_candidates(&self, criteria: &FilterCriteria) -> Result<i64> {
        if self.inner.lock().unwrap().fail_candidate_queries {
            return Err(anyhow!("synthetic query failure"));
        }
        Ok(self.matched(criteria)?.len() as i64)
    }

    async fn companies_by_keys(&self, keys: &[CandidateKey]) -> Result<Vec<Company>> {
        let wanted: HashSet<&str> = keys.iter().map(|k| k.as_str()).collect();
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .companies
            .iter()
            .filter(|c| wanted.contains(c.org_number.as_str()))
            .cloned()
            .collect())
    }

    async fn upsert_company(&self, company: &Company) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .companies
            .retain(|c| c.org_number != company.org_number);
        inner.companies.push(company.clone());
        Ok(())
    }

    async fn insert_run(&self, run: &Run) -> Result<()> {
        self.inner.lock().unwrap().runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn update_run(&self, run: &Run) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.runs.contains_key(&run.id) {
            return Err(anyhow!("run {} not found", run.id));
        }
        inner.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>> {
        Ok(self.inner.lock().unwrap().runs.get(&run_id).cloned())
    }

    async fn list_runs(&self, limit: i64) -> Result<Vec<Run>> {
        let inner = self.inner.lock().unwrap();
        let mut runs: Vec<Run> = inner.runs.values().cloned().collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit.max(0) as usize);
        Ok(runs)
    }

    async fn upsert_research_record(&self, run_id: Uuid, record: &ResearchRecord) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .research
            .insert((run_id, record.key.0.clone()), record.clone());
        Ok(())
    }

    async fn get_research_record(
        &self,
        run_id: Uuid,
        key: &CandidateKey,
    ) -> Result<Option<ResearchRecord>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .research
            .get(&(run_id, key.0.clone()))
            .cloned())
    }

    async fn insert_analysis_record(&self, run_id: Uuid, record: &AnalysisRecord) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let slot = (run_id, record.key.0.clone());
        if inner.analyses.contains_key(&slot) {
            return Err(anyhow!(
                "analysis record for {} already exists in run {run_id}",
                record.key
            ));
        }
        inner.analyses.insert(slot, record.clone());
        Ok(())
    }

    async fn list_analyses(
        &self,
        run_id: Uuid,
        recommendation: Option<Recommendation>,
    ) -> Result<Vec<AnalysisListing>> {
        let inner = self.inner.lock().unwrap();
        let names: HashMap<&str, &str> = inner
            .companies
            .iter()
            .map(|c| (c.org_number.as_str(), c.name.as_str()))
            .collect();

        let mut listings: Vec<AnalysisListing> = inner
            .analyses
            .iter()
            .filter(|((rid, _), _)| *rid == run_id)
            .filter(|(_, record)| {
                recommendation.map_or(true, |want| record.recommendation == want)
            })
            .map(|((_, key), record)| AnalysisListing {
                company_name: names.get(key.as_str()).unwrap_or(&key.as_str()).to_string(),
                record: record.clone(),
            })
            .collect();

        listings.sort_by(|a, b| {
            b.record
                .fit_score
                .cmp(&a.record.fit_score)
                .then_with(|| a.record.key.0.cmp(&b.record.key.0))
        });
        Ok(listings)
    }
}
