//! Workflow orchestrator: drives the three stages for one run and owns the
//! run's persisted state machine.
//!
//! `pending → running → {complete, completed_with_errors, failed}`. The
//! orchestrator is the only writer of a Run; stages never touch it. Stage
//! counts are checkpointed after each stage so polling clients see progress.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use dealscout_common::{
    error::AnalysisFailure, AnalysisListing, CandidateContext, CandidateKey, DealScoutError,
    FilterCriteria, FilterPreview, Recommendation, ResearchRecord, Run, RunResult, RunStage,
    RunStatus, RunStatusView,
};
use dealscout_store::Store;

use crate::analysis::AnalysisStage;
use crate::filter::FilterStage;
use crate::research::ResearchStage;

pub struct Orchestrator {
    store: Arc<dyn Store>,
    filter: FilterStage,
    research: ResearchStage,
    analysis: AnalysisStage,
    research_concurrency: usize,
    analysis_concurrency: usize,
    cancel: Arc<AtomicBool>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        research: ResearchStage,
        analysis: AnalysisStage,
        research_concurrency: usize,
        analysis_concurrency: usize,
    ) -> Self {
        Self {
            filter: FilterStage::new(store.clone()),
            store,
            research,
            analysis,
            research_concurrency,
            analysis_concurrency,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shared flag observed by in-flight per-candidate tasks. Set it to
    /// abort the current run promptly on shutdown.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Run the full pipeline to completion. Synchronous from the caller's
    /// point of view: wrap in a background task if needed.
    ///
    /// Only filter failures and orchestrator-boundary failures surface as
    /// errors; per-candidate failures inside the stages are folded into the
    /// run's status and error summary.
    pub async fn start_run(
        &self,
        criteria: FilterCriteria,
        initiator: &str,
    ) -> Result<RunResult, DealScoutError> {
        let mut run = Run {
            id: Uuid::new_v4(),
            criteria: criteria.clone(),
            status: RunStatus::Running,
            stage: RunStage::Filter,
            stage1_count: 0,
            stage2_count: 0,
            stage3_count: 0,
            initiator: initiator.to_string(),
            started_at: Utc::now(),
            completed_at: None,
            error_message: None,
        };
        self.store
            .insert_run(&run)
            .await
            .map_err(|e| DealScoutError::Database(e.to_string()))?;
        info!(run_id = %run.id, initiator, "Run started");

        // Stage 1: filter. Fatal on failure.
        let keys = match self.filter.filter(&criteria).await {
            Ok(keys) => keys,
            Err(e) => {
                self.fail_run(&mut run, format!("Filter stage failed: {e}"))
                    .await;
                return Err(e);
            }
        };
        run.stage1_count = keys.len() as i32;

        if keys.is_empty() {
            run.status = RunStatus::Complete;
            run.stage = RunStage::Done;
            run.completed_at = Some(Utc::now());
            self.store
                .update_run(&run)
                .await
                .map_err(|e| DealScoutError::Database(e.to_string()))?;
            info!(run_id = %run.id, "No candidates matched, run complete");
            return Ok(RunResult::from(&run));
        }

        // Stages 2 and 3. Anything not already absorbed by a stage fails
        // the whole run.
        match self.execute_stages(&mut run, &keys).await {
            Ok(()) => Ok(RunResult::from(&run)),
            Err(e) => {
                error!(run_id = %run.id, error = %e, "Run aborted");
                self.fail_run(&mut run, format!("Run aborted: {e}")).await;
                Err(DealScoutError::Orchestrator(e.to_string()))
            }
        }
    }

    async fn execute_stages(&self, run: &mut Run, keys: &[CandidateKey]) -> Result<()> {
        run.stage = RunStage::Research;
        self.store
            .update_run(run)
            .await
            .context("Failed to checkpoint run before research")?;

        let companies = self
            .store
            .companies_by_keys(keys)
            .await
            .context("Failed to load candidate context")?;
        let companies: HashMap<CandidateKey, _> = companies
            .into_iter()
            .map(|c| (c.org_number.clone(), c))
            .collect();
        let identities: Vec<_> = keys
            .iter()
            .filter_map(|key| companies.get(key).map(|c| c.identity()))
            .collect();

        // Stage 2: research. One record per candidate by construction.
        let records = self
            .research
            .research_batch(&identities, self.research_concurrency, &self.cancel)
            .await;
        for record in &records {
            self.store
                .upsert_research_record(run.id, record)
                .await
                .context("Failed to persist research record")?;
        }
        run.stage2_count = records.len() as i32;
        run.stage = RunStage::Analysis;
        self.store
            .update_run(run)
            .await
            .context("Failed to checkpoint run before analysis")?;

        let empty_research: Vec<CandidateKey> = records
            .iter()
            .filter(|r| !r.scrape_ok && !r.search_ok)
            .map(|r| r.key.clone())
            .collect();
        let research_by_key: HashMap<CandidateKey, ResearchRecord> = records
            .into_iter()
            .map(|r| (r.key.clone(), r))
            .collect();

        // Stage 3: analysis. Failed candidates are omitted, not padded.
        let contexts: Vec<CandidateContext> = identities
            .iter()
            .filter_map(|identity| {
                companies.get(&identity.key).map(|company| CandidateContext {
                    identity: identity.clone(),
                    financials: company.financials(),
                    research: research_by_key.get(&identity.key).cloned(),
                })
            })
            .collect();
        let (analyses, failures) = self
            .analysis
            .analyze_batch(contexts, self.analysis_concurrency, &self.cancel)
            .await;
        for record in &analyses {
            self.store
                .insert_analysis_record(run.id, record)
                .await
                .context("Failed to persist analysis record")?;
        }
        run.stage3_count = analyses.len() as i32;

        run.stage = RunStage::Done;
        run.completed_at = Some(Utc::now());
        run.error_message = error_summary(&empty_research, &failures);
        run.status = if failures.is_empty() {
            RunStatus::Complete
        } else {
            RunStatus::CompletedWithErrors
        };
        self.store
            .update_run(run)
            .await
            .context("Failed to finalize run")?;

        info!(
            run_id = %run.id,
            status = %run.status,
            stage1 = run.stage1_count,
            stage2 = run.stage2_count,
            stage3 = run.stage3_count,
            "Run finished"
        );
        Ok(())
    }

    async fn fail_run(&self, run: &mut Run, message: String) {
        run.status = RunStatus::Failed;
        run.stage = RunStage::Done;
        run.completed_at = Some(Utc::now());
        run.error_message = Some(message);
        if let Err(e) = self.store.update_run(run).await {
            warn!(run_id = %run.id, error = %e, "Failed to persist failed run state");
        }
    }

    // --- Read-only projections ---

    pub async fn get_run_status(
        &self,
        run_id: Uuid,
    ) -> Result<Option<RunStatusView>, DealScoutError> {
        let run = self
            .store
            .get_run(run_id)
            .await
            .map_err(|e| DealScoutError::Database(e.to_string()))?;
        Ok(run.map(RunStatusView::from))
    }

    pub async fn list_candidate_analyses(
        &self,
        run_id: Uuid,
        recommendation: Option<Recommendation>,
    ) -> Result<Vec<AnalysisListing>, DealScoutError> {
        self.store
            .list_analyses(run_id, recommendation)
            .await
            .map_err(|e| DealScoutError::Database(e.to_string()))
    }

    /// Count matches for criteria without creating a run.
    pub async fn preview_filter_stats(
        &self,
        criteria: &FilterCriteria,
    ) -> Result<FilterPreview, DealScoutError> {
        self.filter.stats(criteria).await
    }

    pub async fn list_runs(&self, limit: i64) -> Result<Vec<Run>, DealScoutError> {
        self.store
            .list_runs(limit)
            .await
            .map_err(|e| DealScoutError::Database(e.to_string()))
    }
}

/// Human-readable summary of which candidates failed at which stage.
/// Present even on a `complete` run when research came back empty for some
/// candidates.
fn error_summary(
    empty_research: &[CandidateKey],
    analysis_failures: &[AnalysisFailure],
) -> Option<String> {
    let mut parts = Vec::new();

    if !empty_research.is_empty() {
        let keys: Vec<&str> = empty_research.iter().map(|k| k.as_str()).collect();
        parts.push(format!(
            "research gathered nothing for {} candidate(s): {}",
            keys.len(),
            keys.join(", ")
        ));
    }
    if !analysis_failures.is_empty() {
        let details: Vec<String> = analysis_failures
            .iter()
            .map(|f| format!("{} ({})", f.key, f.reason))
            .collect();
        parts.push(format!(
            "analysis failed for {} candidate(s): {}",
            details.len(),
            details.join("; ")
        ));
    }

    if parts.is_empty() {
        None
    } else {
        Some(parts.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::AnalysisStage;
    use crate::research::ResearchStage;
    use crate::testing::{company, MemoryStore, MockAnalyzer, MockScraper, MockSearcher};

    fn orchestrator_with(
        store: Arc<MemoryStore>,
        analyzer: MockAnalyzer,
    ) -> Orchestrator {
        let searcher: Arc<dyn crate::scraper::WebSearcher> =
            Arc::new(MockSearcher::with_hits(1));
        let research = ResearchStage::new(Arc::new(MockScraper::new()), Some(searcher));
        let analysis = AnalysisStage::new(Arc::new(analyzer));
        Orchestrator::new(store, research, analysis, 4, 2)
    }

    fn seeded_store() -> Arc<MemoryStore> {
        let store = MemoryStore::new();
        store.add_company(company("900000001", "Alpha AS", 30_000_000, Some(0.30)));
        store.add_company(company("900000002", "Beta AS", 20_000_000, Some(0.20)));
        store.add_company(company("900000003", "Gamma AS", 50_000_000, Some(0.12)));
        store.add_company(company("900000004", "Delta AS", 15_000_000, Some(0.08)));
        store.add_company(company("900000005", "Epsilon AS", 8_000_000, Some(0.40)));
        store.add_company(company("900000006", "Zeta AS", 12_000_000, Some(0.06)));
        Arc::new(store)
    }

    fn criteria(min_growth: f64, max_results: i64) -> FilterCriteria {
        FilterCriteria {
            min_revenue: 10_000_000,
            min_growth: Some(min_growth),
            max_results,
            ..FilterCriteria::default()
        }
    }

    #[tokio::test]
    async fn zero_matches_completes_immediately_with_zero_counts() {
        let store = seeded_store();
        let orch = orchestrator_with(store.clone(), MockAnalyzer::new());

        let result = orch
            .start_run(criteria(0.99, 50), "test")
            .await
            .unwrap();

        assert_eq!(result.status, RunStatus::Complete);
        assert_eq!(result.stage1_count, 0);
        assert_eq!(result.stage2_count, 0);
        assert_eq!(result.stage3_count, 0);

        let view = orch.get_run_status(result.run_id).await.unwrap().unwrap();
        assert_eq!(view.status, RunStatus::Complete);
        assert!(view.completed_at.is_some());
    }

    #[tokio::test]
    async fn happy_path_reaches_complete_with_equal_counts() {
        let store = seeded_store();
        let orch = orchestrator_with(store.clone(), MockAnalyzer::new());

        let result = orch
            .start_run(criteria(0.10, 50), "test")
            .await
            .unwrap();

        assert_eq!(result.status, RunStatus::Complete);
        assert_eq!(result.stage1_count, 3);
        assert_eq!(result.stage2_count, 3);
        assert_eq!(result.stage3_count, 3);

        // Every candidate has a persisted research record
        for key in ["900000001", "900000002", "900000003"] {
            let record = store
                .get_research_record(result.run_id, &key.into())
                .await
                .unwrap();
            assert!(record.is_some(), "missing research record for {key}");
        }

        let listings = orch
            .list_candidate_analyses(result.run_id, None)
            .await
            .unwrap();
        assert_eq!(listings.len(), 3);
    }

    #[tokio::test]
    async fn filter_ordering_is_growth_desc() {
        let store = seeded_store();
        let orch = orchestrator_with(store.clone(), MockAnalyzer::new());

        // Matches: Alpha 0.30, Beta 0.20, Gamma 0.12 (Delta and Zeta below
        // growth, Epsilon below revenue)
        let stage = FilterStage::new(store);
        let keys = stage.filter(&criteria(0.10, 50)).await.unwrap();
        let ordered: Vec<&str> = keys.iter().map(|k| k.as_str()).collect();
        assert_eq!(ordered, vec!["900000001", "900000002", "900000003"]);

        // Same criteria, unchanged snapshot: identical ordering
        let again = stage.filter(&criteria(0.10, 50)).await.unwrap();
        assert_eq!(keys, again);
    }

    #[tokio::test]
    async fn max_results_caps_the_candidate_list() {
        let store = seeded_store();
        let keys = FilterStage::new(store.clone())
            .filter(&criteria(0.10, 2))
            .await
            .unwrap();
        assert_eq!(keys.len(), 2);

        let preview = FilterStage::new(store)
            .stats(&criteria(0.10, 2))
            .await
            .unwrap();
        assert_eq!(preview.total_matches, 3);
        assert_eq!(preview.will_return, 2);
    }

    #[tokio::test]
    async fn two_of_five_analysis_failures_complete_with_errors() {
        let store = seeded_store();
        let analyzer = MockAnalyzer::new()
            .failing_for("900000001")
            .failing_for("900000003");
        let orch = orchestrator_with(store.clone(), analyzer);

        // min_growth 0.05 matches Alpha, Beta, Gamma, Delta, Zeta
        let result = orch
            .start_run(criteria(0.05, 50), "test")
            .await
            .unwrap();

        assert_eq!(result.status, RunStatus::CompletedWithErrors);
        assert_eq!(result.stage1_count, 5);
        assert_eq!(result.stage2_count, 5);
        assert_eq!(result.stage3_count, 3);

        let view = orch.get_run_status(result.run_id).await.unwrap().unwrap();
        let message = view.error_message.unwrap();
        assert!(message.contains("900000001"));
        assert!(message.contains("900000003"));
        assert!(!message.contains("900000002"));
    }

    #[tokio::test]
    async fn filter_failure_fails_the_run_with_no_stage_counts() {
        let store = seeded_store();
        store.fail_candidate_queries();
        let orch = orchestrator_with(store.clone(), MockAnalyzer::new());

        let err = orch
            .start_run(criteria(0.10, 50), "test")
            .await
            .unwrap_err();
        assert!(matches!(err, DealScoutError::Filter(_)));

        let runs = store.list_runs(10).await.unwrap();
        assert_eq!(runs.len(), 1);
        let run = &runs[0];
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.stage2_count, 0);
        assert_eq!(run.stage3_count, 0);
        assert!(run.error_message.as_deref().unwrap().contains("Filter stage failed"));
    }

    #[tokio::test]
    async fn stage_counts_never_increase_across_stages() {
        let store = seeded_store();
        let analyzer = MockAnalyzer::new().failing_for("900000002");
        let orch = orchestrator_with(store.clone(), analyzer);

        let result = orch
            .start_run(criteria(0.10, 50), "test")
            .await
            .unwrap();

        assert!(result.stage1_count >= result.stage2_count);
        assert!(result.stage2_count >= result.stage3_count);
    }

    #[tokio::test]
    async fn preview_does_not_create_a_run() {
        let store = seeded_store();
        let orch = orchestrator_with(store.clone(), MockAnalyzer::new());

        let preview = orch
            .preview_filter_stats(&criteria(0.10, 50))
            .await
            .unwrap();
        assert_eq!(preview.total_matches, 3);
        assert_eq!(preview.will_return, 3);

        assert!(store.list_runs(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn recommendation_filter_narrows_the_listing() {
        let store = seeded_store();
        // MockAnalyzer recommends pursue for every candidate
        let orch = orchestrator_with(store.clone(), MockAnalyzer::new());

        let result = orch
            .start_run(criteria(0.10, 50), "test")
            .await
            .unwrap();

        let pursue = orch
            .list_candidate_analyses(result.run_id, Some(Recommendation::Pursue))
            .await
            .unwrap();
        assert_eq!(pursue.len(), 3);

        let pass = orch
            .list_candidate_analyses(result.run_id, Some(Recommendation::Pass))
            .await
            .unwrap();
        assert!(pass.is_empty());
    }

    #[test]
    fn error_summary_names_stages_and_keys() {
        let summary = error_summary(
            &["911111111".into()],
            &[AnalysisFailure::new("922222222".into(), "rate limited")],
        )
        .unwrap();
        assert!(summary.contains("research gathered nothing"));
        assert!(summary.contains("911111111"));
        assert!(summary.contains("analysis failed"));
        assert!(summary.contains("922222222 (rate limited)"));

        assert!(error_summary(&[], &[]).is_none());
    }
}
