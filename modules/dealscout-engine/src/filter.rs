//! Filter stage: deterministic relational screening.
//!
//! Thin service over the store's candidate queries. Both operations run the
//! same predicate-construction path in the store, so the preview count and
//! the materialized list can never drift apart.

use std::sync::Arc;

use tracing::info;

use dealscout_common::{CandidateKey, DealScoutError, FilterCriteria, FilterPreview};
use dealscout_store::Store;

pub struct FilterStage {
    store: Arc<dyn Store>,
}

impl FilterStage {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Materialize the ranked, capped candidate list. A query failure here
    /// is fatal for the run: there are no partial results.
    pub async fn filter(
        &self,
        criteria: &FilterCriteria,
    ) -> Result<Vec<CandidateKey>, DealScoutError> {
        let keys = self
            .store
            .search_candidates(criteria)
            .await
            .map_err(|e| DealScoutError::Filter(e.to_string()))?;

        info!(matches = keys.len(), max_results = criteria.max_results, "Filter stage complete");
        Ok(keys)
    }

    /// Count matches without materializing them, for UI preview.
    pub async fn stats(
        &self,
        criteria: &FilterCriteria,
    ) -> Result<FilterPreview, DealScoutError> {
        let total_matches = self
            .store
            .count_candidates(criteria)
            .await
            .map_err(|e| DealScoutError::Filter(e.to_string()))?;

        Ok(FilterPreview {
            total_matches,
            will_return: total_matches.min(criteria.max_results.max(0)),
        })
    }
}
