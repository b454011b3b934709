use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use dealscout_common::{Company, Config, FilterCriteria, Recommendation, RunStatusView};
use dealscout_engine::analysis::AnalysisStage;
use dealscout_engine::analyzer::{CandidateAnalyzer, ClaudeAnalyzer};
use dealscout_engine::filter::FilterStage;
use dealscout_engine::research::ResearchStage;
use dealscout_engine::scraper::{HttpScraper, PageScraper, SerperSearcher, WebSearcher};
use dealscout_engine::Orchestrator;
use dealscout_store::{migrate, PgStore, Store};

#[derive(Parser)]
#[command(name = "dealscout", about = "Acquisition candidate sourcing and triage")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct CriteriaArgs {
    /// Minimum annual revenue in NOK (0 disables the clause)
    #[arg(long, default_value_t = 0)]
    min_revenue: i64,

    /// Minimum operating margin as a fraction, e.g. 0.05
    #[arg(long)]
    min_margin: Option<f64>,

    /// Minimum revenue growth as a fraction, e.g. 0.10
    #[arg(long)]
    min_growth: Option<f64>,

    /// Industry code filter, repeatable
    #[arg(long = "industry")]
    industry_codes: Vec<String>,

    /// Extra SQL predicate fragment, repeatable, pre-vetted
    #[arg(long = "where", value_name = "SQL")]
    extra_clauses: Vec<String>,

    /// Hard cap on candidates entering the pipeline
    #[arg(long, default_value_t = 100)]
    max_results: i64,
}

impl From<CriteriaArgs> for FilterCriteria {
    fn from(args: CriteriaArgs) -> Self {
        FilterCriteria {
            min_revenue: args.min_revenue,
            min_margin: args.min_margin,
            min_growth: args.min_growth,
            industry_codes: args.industry_codes,
            extra_clauses: args.extra_clauses,
            max_results: args.max_results,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Run the full three-stage pipeline to completion
    Run {
        #[command(flatten)]
        criteria: CriteriaArgs,
        #[arg(long, default_value = "cli")]
        initiator: String,
    },
    /// Preview how many companies the criteria would match
    Preview {
        #[command(flatten)]
        criteria: CriteriaArgs,
    },
    /// Show one run's status and stage counts
    Status { run_id: Uuid },
    /// List a run's candidate analyses, optionally by recommendation
    Results {
        run_id: Uuid,
        #[arg(long)]
        recommendation: Option<Recommendation>,
    },
    /// List recent runs
    Runs {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Load companies into the directory from a JSON file
    Seed { file: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = Config::from_env();
    config.log_redacted();

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to Postgres")?;
    migrate(&pool).await?;
    let store: Arc<dyn Store> = Arc::new(PgStore::new(pool));

    match cli.command {
        Command::Run {
            criteria,
            initiator,
        } => {
            let orchestrator = build_orchestrator(store, &config);
            let result = orchestrator.start_run(criteria.into(), &initiator).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Preview { criteria } => {
            let preview = FilterStage::new(store).stats(&criteria.into()).await?;
            println!("{}", serde_json::to_string_pretty(&preview)?);
        }
        Command::Status { run_id } => match store.get_run(run_id).await? {
            Some(run) => {
                let view = RunStatusView::from(run);
                println!("{}", serde_json::to_string_pretty(&view)?);
            }
            None => anyhow::bail!("No run with id {run_id}"),
        },
        Command::Results {
            run_id,
            recommendation,
        } => {
            let listings = store.list_analyses(run_id, recommendation).await?;
            println!("{}", serde_json::to_string_pretty(&listings)?);
        }
        Command::Runs { limit } => {
            let runs = store.list_runs(limit).await?;
            for run in runs {
                println!(
                    "{}  {:<22} {:>4}/{:<4}/{:<4} started {}",
                    run.id,
                    run.status.to_string(),
                    run.stage1_count,
                    run.stage2_count,
                    run.stage3_count,
                    run.started_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        Command::Seed { file } => {
            let raw = tokio::fs::read(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let companies: Vec<Company> =
                serde_json::from_slice(&raw).context("Invalid company JSON")?;
            let total = companies.len();
            for company in &companies {
                store.upsert_company(company).await?;
            }
            info!(companies = total, "Company directory seeded");
        }
    }

    Ok(())
}

fn build_orchestrator(store: Arc<dyn Store>, config: &Config) -> Orchestrator {
    let scraper: Arc<dyn PageScraper> = Arc::new(HttpScraper::new(Duration::from_secs(
        config.scrape_timeout_secs,
    )));
    let searcher: Option<Arc<dyn WebSearcher>> = config
        .serper_api_key
        .as_deref()
        .map(|key| Arc::new(SerperSearcher::new(key)) as Arc<dyn WebSearcher>);
    let research = ResearchStage::new(scraper, searcher);

    let analyzer: Arc<dyn CandidateAnalyzer> = Arc::new(ClaudeAnalyzer::new(
        &config.anthropic_api_key,
        &config.analysis_model,
    ));
    let analysis = AnalysisStage::new(analyzer);

    Orchestrator::new(
        store,
        research,
        analysis,
        config.research_concurrency,
        config.analysis_concurrency,
    )
}
