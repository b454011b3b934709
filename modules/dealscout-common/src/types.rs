use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DealScoutError;

// --- Candidate identity ---

/// Stable company identifier: the organization registration number.
/// Used as the join key across every per-candidate record in a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CandidateKey(pub String);

impl CandidateKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CandidateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CandidateKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// --- Filter criteria ---

/// Structured screening criteria. Built once per run attempt and stored as
/// the run's criteria snapshot. `min_revenue <= 0` disables the revenue
/// clause; `None` disables the margin/growth clauses; an empty industry list
/// disables the industry clause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterCriteria {
    pub min_revenue: i64,
    pub min_margin: Option<f64>,
    pub min_growth: Option<f64>,
    #[serde(default)]
    pub industry_codes: Vec<String>,
    /// Pre-vetted SQL predicate fragments ANDed into the filter.
    /// Fragments containing statement terminators or comment tokens are
    /// rejected at predicate-build time.
    #[serde(default)]
    pub extra_clauses: Vec<String>,
    pub max_results: i64,
}

impl Default for FilterCriteria {
    fn default() -> Self {
        Self {
            min_revenue: 0,
            min_margin: None,
            min_growth: None,
            industry_codes: Vec::new(),
            extra_clauses: Vec::new(),
            max_results: 100,
        }
    }
}

// --- Company directory types ---

/// A row in the company directory, as much of it as filtering and the
/// pipeline need.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Company {
    pub org_number: CandidateKey,
    pub name: String,
    pub homepage_url: Option<String>,
    pub industry_code: Option<String>,
    pub revenue: i64,
    pub operating_margin: Option<f64>,
    pub revenue_growth: Option<f64>,
    pub employees: Option<i32>,
}

impl Company {
    pub fn identity(&self) -> CandidateIdentity {
        CandidateIdentity {
            key: self.org_number.clone(),
            name: self.name.clone(),
            homepage_url: self.homepage_url.clone(),
        }
    }

    pub fn financials(&self) -> CompanyFinancials {
        CompanyFinancials {
            revenue: self.revenue,
            operating_margin: self.operating_margin,
            revenue_growth: self.revenue_growth,
            employees: self.employees,
            industry_code: self.industry_code.clone(),
        }
    }
}

/// What the research stage needs to know about a candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateIdentity {
    pub key: CandidateKey,
    pub name: String,
    pub homepage_url: Option<String>,
}

/// Financial attributes fed into the analysis prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanyFinancials {
    pub revenue: i64,
    pub operating_margin: Option<f64>,
    pub revenue_growth: Option<f64>,
    pub employees: Option<i32>,
    pub industry_code: Option<String>,
}

/// Everything the analysis stage has for one candidate.
#[derive(Debug, Clone)]
pub struct CandidateContext {
    pub identity: CandidateIdentity,
    pub financials: CompanyFinancials,
    pub research: Option<ResearchRecord>,
}

// --- Research records ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSnippet {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

/// External signals gathered for one candidate. Always one per candidate per
/// run, whether or not any source succeeded; the success flags and the
/// digital score say how much was actually found.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchRecord {
    pub key: CandidateKey,
    pub homepage_url: Option<String>,
    pub homepage_text: Option<String>,
    pub about_text: Option<String>,
    pub products_text: Option<String>,
    /// Search query → top result snippets for that query.
    #[serde(default)]
    pub search_snippets: BTreeMap<String, Vec<SearchSnippet>>,
    pub scrape_ok: bool,
    pub search_ok: bool,
    /// Additive 0-100 heuristic for how much digital signal was gathered.
    pub digital_score: u8,
}

impl ResearchRecord {
    /// Record for a candidate where nothing was gathered.
    pub fn empty(key: CandidateKey, homepage_url: Option<String>) -> Self {
        Self {
            key,
            homepage_url,
            homepage_text: None,
            about_text: None,
            products_text: None,
            search_snippets: BTreeMap::new(),
            scrape_ok: false,
            search_ok: false,
            digital_score: 0,
        }
    }
}

// --- Analysis records ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Pursue,
    Watch,
    Pass,
}

impl fmt::Display for Recommendation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recommendation::Pursue => write!(f, "pursue"),
            Recommendation::Watch => write!(f, "watch"),
            Recommendation::Pass => write!(f, "pass"),
        }
    }
}

impl FromStr for Recommendation {
    type Err = DealScoutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pursue" => Ok(Recommendation::Pursue),
            "watch" => Ok(Recommendation::Watch),
            "pass" => Ok(Recommendation::Pass),
            other => Err(DealScoutError::Validation(format!(
                "unknown recommendation: {other}"
            ))),
        }
    }
}

/// The model's qualitative verdict on one candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub key: CandidateKey,
    pub business_model: String,
    pub market_position: String,
    pub strengths: Vec<String>,
    pub weaknesses: Vec<String>,
    pub opportunities: Vec<String>,
    pub threats: Vec<String>,
    /// Acquisition attractiveness, 1-10.
    pub fit_score: i16,
    pub recommendation: Recommendation,
    pub rationale: String,
}

// --- Run aggregate ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Complete,
    CompletedWithErrors,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Complete => "complete",
            RunStatus::CompletedWithErrors => "completed_with_errors",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Complete | RunStatus::CompletedWithErrors | RunStatus::Failed
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = DealScoutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "complete" => Ok(RunStatus::Complete),
            "completed_with_errors" => Ok(RunStatus::CompletedWithErrors),
            "failed" => Ok(RunStatus::Failed),
            other => Err(DealScoutError::Validation(format!(
                "unknown run status: {other}"
            ))),
        }
    }
}

/// The stage the run last checkpointed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Filter,
    Research,
    Analysis,
    Done,
}

impl RunStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStage::Filter => "filter",
            RunStage::Research => "research",
            RunStage::Analysis => "analysis",
            RunStage::Done => "done",
        }
    }
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RunStage {
    type Err = DealScoutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "filter" => Ok(RunStage::Filter),
            "research" => Ok(RunStage::Research),
            "analysis" => Ok(RunStage::Analysis),
            "done" => Ok(RunStage::Done),
            other => Err(DealScoutError::Validation(format!(
                "unknown run stage: {other}"
            ))),
        }
    }
}

/// The run aggregate. Mutated only by the orchestrator, at stage
/// checkpoints; stage counts never increase from one stage to the next.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub criteria: FilterCriteria,
    pub status: RunStatus,
    pub stage: RunStage,
    pub stage1_count: i32,
    pub stage2_count: i32,
    pub stage3_count: i32,
    pub initiator: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// What `start_run` hands back to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub stage1_count: i32,
    pub stage2_count: i32,
    pub stage3_count: i32,
}

impl From<&Run> for RunResult {
    fn from(run: &Run) -> Self {
        Self {
            run_id: run.id,
            status: run.status,
            stage1_count: run.stage1_count,
            stage2_count: run.stage2_count,
            stage3_count: run.stage3_count,
        }
    }
}

/// Read-only status projection for polling clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStatusView {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub stage: RunStage,
    pub stage1_count: i32,
    pub stage2_count: i32,
    pub stage3_count: i32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl From<Run> for RunStatusView {
    fn from(run: Run) -> Self {
        Self {
            run_id: run.id,
            status: run.status,
            stage: run.stage,
            stage1_count: run.stage1_count,
            stage2_count: run.stage2_count,
            stage3_count: run.stage3_count,
            started_at: run.started_at,
            completed_at: run.completed_at,
            error_message: run.error_message,
        }
    }
}

/// An analysis record joined with the company's display name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisListing {
    pub company_name: String,
    #[serde(flatten)]
    pub record: AnalysisRecord,
}

/// Preview of what a filter would return, without creating a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterPreview {
    pub total_matches: i64,
    pub will_return: i64,
}
