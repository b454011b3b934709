//! Postgres persistence for the pipeline: the company directory, run
//! aggregates, and per-candidate stage records.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, QueryBuilder};
use uuid::Uuid;

use dealscout_common::{
    AnalysisListing, AnalysisRecord, CandidateKey, Company, FilterCriteria, Recommendation,
    ResearchRecord, Run, RunStage, RunStatus, SearchSnippet,
};

use crate::filter_sql::{push_criteria, push_order_and_limit};

/// Persistence seam for the pipeline. One implementation talks to Postgres;
/// tests swap in an in-memory double.
#[async_trait]
pub trait Store: Send + Sync {
    // Company directory
    async fn search_candidates(&self, criteria: &FilterCriteria) -> Result<Vec<CandidateKey>>;
    async fn count_candidates(&self, criteria: &FilterCriteria) -> Result<i64>;
    async fn companies_by_keys(&self, keys: &[CandidateKey]) -> Result<Vec<Company>>;
    async fn upsert_company(&self, company: &Company) -> Result<()>;

    // Runs
    async fn insert_run(&self, run: &Run) -> Result<()>;
    async fn update_run(&self, run: &Run) -> Result<()>;
    async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>>;
    async fn list_runs(&self, limit: i64) -> Result<Vec<Run>>;

    // Per-candidate stage records
    async fn upsert_research_record(&self, run_id: Uuid, record: &ResearchRecord) -> Result<()>;
    async fn get_research_record(
        &self,
        run_id: Uuid,
        key: &CandidateKey,
    ) -> Result<Option<ResearchRecord>>;
    async fn insert_analysis_record(&self, run_id: Uuid, record: &AnalysisRecord) -> Result<()>;
    async fn list_analyses(
        &self,
        run_id: Uuid,
        recommendation: Option<Recommendation>,
    ) -> Result<Vec<AnalysisListing>>;
}

// ---------------------------------------------------------------------------
// PgStore
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn search_candidates(&self, criteria: &FilterCriteria) -> Result<Vec<CandidateKey>> {
        let mut qb = QueryBuilder::new("SELECT org_number FROM companies");
        push_criteria(&mut qb, criteria)?;
        push_order_and_limit(&mut qb, criteria.max_results);

        let rows: Vec<(String,)> = qb
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .context("Candidate search query failed")?;

        Ok(rows.into_iter().map(|(key,)| CandidateKey(key)).collect())
    }

    async fn count_candidates(&self, criteria: &FilterCriteria) -> Result<i64> {
        let mut qb = QueryBuilder::new("SELECT COUNT(*) FROM companies");
        push_criteria(&mut qb, criteria)?;

        let (count,): (i64,) = qb
            .build_query_as()
            .fetch_one(&self.pool)
            .await
            .context("Candidate count query failed")?;

        Ok(count)
    }

    async fn companies_by_keys(&self, keys: &[CandidateKey]) -> Result<Vec<Company>> {
        let raw_keys: Vec<String> = keys.iter().map(|k| k.0.clone()).collect();

        let rows = sqlx::query_as::<_, CompanyRow>(
            r#"
            SELECT org_number, name, homepage_url, industry_code,
                   revenue, operating_margin, revenue_growth, employees
            FROM companies
            WHERE org_number = ANY($1)
            "#,
        )
        .bind(&raw_keys)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Company::from).collect())
    }

    async fn upsert_company(&self, company: &Company) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO companies
                (org_number, name, homepage_url, industry_code,
                 revenue, operating_margin, revenue_growth, employees, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, now())
            ON CONFLICT (org_number) DO UPDATE SET
                name = EXCLUDED.name,
                homepage_url = EXCLUDED.homepage_url,
                industry_code = EXCLUDED.industry_code,
                revenue = EXCLUDED.revenue,
                operating_margin = EXCLUDED.operating_margin,
                revenue_growth = EXCLUDED.revenue_growth,
                employees = EXCLUDED.employees,
                updated_at = now()
            "#,
        )
        .bind(&company.org_number.0)
        .bind(&company.name)
        .bind(&company.homepage_url)
        .bind(&company.industry_code)
        .bind(company.revenue)
        .bind(company.operating_margin)
        .bind(company.revenue_growth)
        .bind(company.employees)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn insert_run(&self, run: &Run) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO runs
                (id, criteria, status, stage, stage1_count, stage2_count, stage3_count,
                 initiator, started_at, completed_at, error_message)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(run.id)
        .bind(serde_json::to_value(&run.criteria)?)
        .bind(run.status.as_str())
        .bind(run.stage.as_str())
        .bind(run.stage1_count)
        .bind(run.stage2_count)
        .bind(run.stage3_count)
        .bind(&run.initiator)
        .bind(run.started_at)
        .bind(run.completed_at)
        .bind(&run.error_message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_run(&self, run: &Run) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE runs SET
                status = $2,
                stage = $3,
                stage1_count = $4,
                stage2_count = $5,
                stage3_count = $6,
                completed_at = $7,
                error_message = $8
            WHERE id = $1
            "#,
        )
        .bind(run.id)
        .bind(run.status.as_str())
        .bind(run.stage.as_str())
        .bind(run.stage1_count)
        .bind(run.stage2_count)
        .bind(run.stage3_count)
        .bind(run.completed_at)
        .bind(&run.error_message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>> {
        let row = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT id, criteria, status, stage, stage1_count, stage2_count, stage3_count,
                   initiator, started_at, completed_at, error_message
            FROM runs
            WHERE id = $1
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Run::try_from).transpose()
    }

    async fn list_runs(&self, limit: i64) -> Result<Vec<Run>> {
        let rows = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT id, criteria, status, stage, stage1_count, stage2_count, stage3_count,
                   initiator, started_at, completed_at, error_message
            FROM runs
            ORDER BY started_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Run::try_from).collect()
    }

    async fn upsert_research_record(&self, run_id: Uuid, record: &ResearchRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO research_records
                (run_id, candidate_key, homepage_url, homepage_text, about_text,
                 products_text, search_snippets, scrape_ok, search_ok, digital_score)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (run_id, candidate_key) DO UPDATE SET
                homepage_url = EXCLUDED.homepage_url,
                homepage_text = EXCLUDED.homepage_text,
                about_text = EXCLUDED.about_text,
                products_text = EXCLUDED.products_text,
                search_snippets = EXCLUDED.search_snippets,
                scrape_ok = EXCLUDED.scrape_ok,
                search_ok = EXCLUDED.search_ok,
                digital_score = EXCLUDED.digital_score,
                created_at = now()
            "#,
        )
        .bind(run_id)
        .bind(&record.key.0)
        .bind(&record.homepage_url)
        .bind(&record.homepage_text)
        .bind(&record.about_text)
        .bind(&record.products_text)
        .bind(serde_json::to_value(&record.search_snippets)?)
        .bind(record.scrape_ok)
        .bind(record.search_ok)
        .bind(record.digital_score as i16)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_research_record(
        &self,
        run_id: Uuid,
        key: &CandidateKey,
    ) -> Result<Option<ResearchRecord>> {
        let row = sqlx::query_as::<_, ResearchRow>(
            r#"
            SELECT candidate_key, homepage_url, homepage_text, about_text,
                   products_text, search_snippets, scrape_ok, search_ok, digital_score
            FROM research_records
            WHERE run_id = $1 AND candidate_key = $2
            "#,
        )
        .bind(run_id)
        .bind(&key.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ResearchRecord::try_from).transpose()
    }

    async fn insert_analysis_record(&self, run_id: Uuid, record: &AnalysisRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO analysis_records
                (run_id, candidate_key, business_model, market_position,
                 strengths, weaknesses, opportunities, threats,
                 fit_score, recommendation, rationale)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(run_id)
        .bind(&record.key.0)
        .bind(&record.business_model)
        .bind(&record.market_position)
        .bind(&record.strengths)
        .bind(&record.weaknesses)
        .bind(&record.opportunities)
        .bind(&record.threats)
        .bind(record.fit_score)
        .bind(record.recommendation.to_string())
        .bind(&record.rationale)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_analyses(
        &self,
        run_id: Uuid,
        recommendation: Option<Recommendation>,
    ) -> Result<Vec<AnalysisListing>> {
        let mut qb = QueryBuilder::new(
            r#"
            SELECT a.candidate_key, c.name AS company_name, a.business_model,
                   a.market_position, a.strengths, a.weaknesses, a.opportunities,
                   a.threats, a.fit_score, a.recommendation, a.rationale
            FROM analysis_records a
            JOIN companies c ON c.org_number = a.candidate_key
            WHERE a.run_id = "#,
        );
        qb.push_bind(run_id);
        if let Some(rec) = recommendation {
            qb.push(" AND a.recommendation = ").push_bind(rec.to_string());
        }
        qb.push(" ORDER BY a.fit_score DESC, a.candidate_key ASC");

        let rows: Vec<AnalysisRow> = qb.build_query_as().fetch_all(&self.pool).await?;

        rows.into_iter().map(AnalysisListing::try_from).collect()
    }
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(sqlx::FromRow)]
struct CompanyRow {
    org_number: String,
    name: String,
    homepage_url: Option<String>,
    industry_code: Option<String>,
    revenue: i64,
    operating_margin: Option<f64>,
    revenue_growth: Option<f64>,
    employees: Option<i32>,
}

impl From<CompanyRow> for Company {
    fn from(row: CompanyRow) -> Self {
        Company {
            org_number: CandidateKey(row.org_number),
            name: row.name,
            homepage_url: row.homepage_url,
            industry_code: row.industry_code,
            revenue: row.revenue,
            operating_margin: row.operating_margin,
            revenue_growth: row.revenue_growth,
            employees: row.employees,
        }
    }
}

#[derive(sqlx::FromRow)]
struct RunRow {
    id: Uuid,
    criteria: serde_json::Value,
    status: String,
    stage: String,
    stage1_count: i32,
    stage2_count: i32,
    stage3_count: i32,
    initiator: String,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
}

impl TryFrom<RunRow> for Run {
    type Error = anyhow::Error;

    fn try_from(row: RunRow) -> Result<Self> {
        Ok(Run {
            id: row.id,
            criteria: serde_json::from_value(row.criteria)
                .context("Invalid criteria snapshot in runs row")?,
            status: row.status.parse::<RunStatus>()?,
            stage: row.stage.parse::<RunStage>()?,
            stage1_count: row.stage1_count,
            stage2_count: row.stage2_count,
            stage3_count: row.stage3_count,
            initiator: row.initiator,
            started_at: row.started_at,
            completed_at: row.completed_at,
            error_message: row.error_message,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ResearchRow {
    candidate_key: String,
    homepage_url: Option<String>,
    homepage_text: Option<String>,
    about_text: Option<String>,
    products_text: Option<String>,
    search_snippets: serde_json::Value,
    scrape_ok: bool,
    search_ok: bool,
    digital_score: i16,
}

impl TryFrom<ResearchRow> for ResearchRecord {
    type Error = anyhow::Error;

    fn try_from(row: ResearchRow) -> Result<Self> {
        let search_snippets: BTreeMap<String, Vec<SearchSnippet>> =
            serde_json::from_value(row.search_snippets)
                .context("Invalid search_snippets in research_records row")?;

        Ok(ResearchRecord {
            key: CandidateKey(row.candidate_key),
            homepage_url: row.homepage_url,
            homepage_text: row.homepage_text,
            about_text: row.about_text,
            products_text: row.products_text,
            search_snippets,
            scrape_ok: row.scrape_ok,
            search_ok: row.search_ok,
            digital_score: row.digital_score.clamp(0, 100) as u8,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AnalysisRow {
    candidate_key: String,
    company_name: String,
    business_model: String,
    market_position: String,
    strengths: Vec<String>,
    weaknesses: Vec<String>,
    opportunities: Vec<String>,
    threats: Vec<String>,
    fit_score: i16,
    recommendation: String,
    rationale: String,
}

impl TryFrom<AnalysisRow> for AnalysisListing {
    type Error = anyhow::Error;

    fn try_from(row: AnalysisRow) -> Result<Self> {
        Ok(AnalysisListing {
            company_name: row.company_name,
            record: AnalysisRecord {
                key: CandidateKey(row.candidate_key),
                business_model: row.business_model,
                market_position: row.market_position,
                strengths: row.strengths,
                weaknesses: row.weaknesses,
                opportunities: row.opportunities,
                threats: row.threats,
                fit_score: row.fit_score,
                recommendation: row.recommendation.parse::<Recommendation>()?,
                rationale: row.rationale,
            },
        })
    }
}
