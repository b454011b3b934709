//! Analysis stage: concurrent model calls, one per candidate.
//!
//! Same bounded fan-out as the research stage but a tighter default cap:
//! the model provider is rate- and cost-limited. Unlike research, a failed
//! candidate yields no record: it is reported as a failure instead.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::{info, warn};

use dealscout_common::{error::AnalysisFailure, AnalysisRecord, CandidateContext};

use crate::analyzer::CandidateAnalyzer;

pub const DEFAULT_ANALYSIS_CONCURRENCY: usize = 5;

pub struct AnalysisStage {
    analyzer: Arc<dyn CandidateAnalyzer>,
}

impl AnalysisStage {
    pub fn new(analyzer: Arc<dyn CandidateAnalyzer>) -> Self {
        Self { analyzer }
    }

    /// Analyze every candidate, at most `max_concurrent` in flight.
    /// Returns the successful records plus a failure entry for every
    /// candidate that didn't make it; the two partitions always add up to
    /// the input.
    pub async fn analyze_batch(
        &self,
        contexts: Vec<CandidateContext>,
        max_concurrent: usize,
        cancel: &Arc<AtomicBool>,
    ) -> (Vec<AnalysisRecord>, Vec<AnalysisFailure>) {
        let total = contexts.len();
        info!(candidates = total, max_concurrent, "Analysis stage starting");

        let outcomes: Vec<Result<AnalysisRecord, AnalysisFailure>> =
            stream::iter(contexts.into_iter().map(|context| {
                let analyzer = self.analyzer.clone();
                let cancel = cancel.clone();
                async move {
                    let key = context.identity.key.clone();
                    if cancel.load(Ordering::Relaxed) {
                        return Err(AnalysisFailure::new(key, "run cancelled"));
                    }

                    let handle =
                        tokio::spawn(async move { analyzer.analyze(&context).await });
                    match handle.await {
                        Ok(Ok(record)) => Ok(record),
                        Ok(Err(e)) => {
                            warn!(key = %key, error = %e, "Candidate analysis failed");
                            Err(AnalysisFailure::new(key, e.to_string()))
                        }
                        Err(e) => {
                            warn!(key = %key, error = %e, "Analysis task crashed");
                            Err(AnalysisFailure::new(key, format!("task crashed: {e}")))
                        }
                    }
                }
            }))
            .buffer_unordered(max_concurrent.max(1))
            .collect()
            .await;

        let mut records = Vec::new();
        let mut failures = Vec::new();
        for outcome in outcomes {
            match outcome {
                Ok(record) => records.push(record),
                Err(failure) => failures.push(failure),
            }
        }

        info!(
            analyzed = records.len(),
            failed = failures.len(),
            "Analysis stage complete"
        );

        (records, failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{context, identity, MockAnalyzer};
    use dealscout_common::Recommendation;
    use std::time::Duration;

    fn cancel_flag() -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(false))
    }

    fn contexts(n: usize) -> Vec<CandidateContext> {
        (0..n)
            .map(|i| context(identity(&format!("9{i:08}"), &format!("Company {i}"), None)))
            .collect()
    }

    #[tokio::test]
    async fn all_successes_analyze_every_candidate() {
        let stage = AnalysisStage::new(Arc::new(MockAnalyzer::new()));
        let (records, failures) = stage
            .analyze_batch(contexts(5), DEFAULT_ANALYSIS_CONCURRENCY, &cancel_flag())
            .await;

        assert_eq!(records.len(), 5);
        assert!(failures.is_empty());
        for record in &records {
            assert!((1..=10).contains(&record.fit_score));
            assert!(matches!(
                record.recommendation,
                Recommendation::Pursue | Recommendation::Watch | Recommendation::Pass
            ));
        }
    }

    #[tokio::test]
    async fn failed_candidates_are_omitted_and_reported() {
        let analyzer = MockAnalyzer::new()
            .failing_for("900000001")
            .failing_for("900000003");
        let stage = AnalysisStage::new(Arc::new(analyzer));

        let (records, failures) = stage.analyze_batch(contexts(5), 3, &cancel_flag()).await;

        assert_eq!(records.len(), 3);
        assert_eq!(failures.len(), 2);
        let failed_keys: Vec<&str> = failures.iter().map(|f| f.key.as_str()).collect();
        assert!(failed_keys.contains(&"900000001"));
        assert!(failed_keys.contains(&"900000003"));
        // No placeholder records for the failed candidates
        assert!(records.iter().all(|r| !failed_keys.contains(&r.key.as_str())));
    }

    #[tokio::test]
    async fn concurrency_stays_under_the_cap() {
        let analyzer = Arc::new(MockAnalyzer::new().with_delay(Duration::from_millis(30)));
        let stage = AnalysisStage::new(analyzer.clone());

        let cap = 3;
        let (records, failures) = stage.analyze_batch(contexts(12), cap, &cancel_flag()).await;

        assert_eq!(records.len() + failures.len(), 12);
        assert!(
            analyzer.peak() <= cap,
            "peak in-flight {} exceeded cap {}",
            analyzer.peak(),
            cap
        );
    }

    #[tokio::test]
    async fn cancelled_batch_reports_every_candidate_as_failed() {
        let stage = AnalysisStage::new(Arc::new(MockAnalyzer::new()));
        let cancel = Arc::new(AtomicBool::new(true));

        let (records, failures) = stage.analyze_batch(contexts(4), 2, &cancel).await;

        assert!(records.is_empty());
        assert_eq!(failures.len(), 4);
        assert!(failures.iter().all(|f| f.reason.contains("cancelled")));
    }
}
