//! Idempotent schema setup, run at startup.

use anyhow::Result;
use sqlx::PgPool;
use tracing::info;

const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS companies (
        org_number       TEXT PRIMARY KEY,
        name             TEXT NOT NULL,
        homepage_url     TEXT,
        industry_code    TEXT,
        revenue          BIGINT NOT NULL DEFAULT 0,
        operating_margin DOUBLE PRECISION,
        revenue_growth   DOUBLE PRECISION,
        employees        INTEGER,
        updated_at       TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS runs (
        id             UUID PRIMARY KEY,
        criteria       JSONB NOT NULL,
        status         TEXT NOT NULL,
        stage          TEXT NOT NULL,
        stage1_count   INTEGER NOT NULL DEFAULT 0,
        stage2_count   INTEGER NOT NULL DEFAULT 0,
        stage3_count   INTEGER NOT NULL DEFAULT 0,
        initiator      TEXT NOT NULL,
        started_at     TIMESTAMPTZ NOT NULL,
        completed_at   TIMESTAMPTZ,
        error_message  TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS research_records (
        run_id          UUID NOT NULL REFERENCES runs(id),
        candidate_key   TEXT NOT NULL,
        homepage_url    TEXT,
        homepage_text   TEXT,
        about_text      TEXT,
        products_text   TEXT,
        search_snippets JSONB NOT NULL DEFAULT '{}'::jsonb,
        scrape_ok       BOOLEAN NOT NULL DEFAULT FALSE,
        search_ok       BOOLEAN NOT NULL DEFAULT FALSE,
        digital_score   SMALLINT NOT NULL DEFAULT 0,
        created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (run_id, candidate_key)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS analysis_records (
        run_id          UUID NOT NULL REFERENCES runs(id),
        candidate_key   TEXT NOT NULL,
        business_model  TEXT NOT NULL,
        market_position TEXT NOT NULL,
        strengths       TEXT[] NOT NULL DEFAULT '{}',
        weaknesses      TEXT[] NOT NULL DEFAULT '{}',
        opportunities   TEXT[] NOT NULL DEFAULT '{}',
        threats         TEXT[] NOT NULL DEFAULT '{}',
        fit_score       SMALLINT NOT NULL,
        recommendation  TEXT NOT NULL,
        rationale       TEXT NOT NULL,
        created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (run_id, candidate_key)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_runs_started_at ON runs (started_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_companies_growth ON companies (revenue_growth DESC NULLS LAST, revenue DESC)",
    "CREATE INDEX IF NOT EXISTS idx_analysis_recommendation ON analysis_records (run_id, recommendation)",
];

/// Create tables and indexes if they don't exist yet.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    for statement in STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
    }
    info!("Schema migration complete");
    Ok(())
}
