use thiserror::Error;

use crate::types::CandidateKey;

#[derive(Error, Debug)]
pub enum DealScoutError {
    #[error("Filter query error: {0}")]
    Filter(String),

    #[error("Invalid filter clause: {0}")]
    InvalidClause(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Analysis error: {0}")]
    Analysis(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Run error: {0}")]
    Orchestrator(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// One candidate's analysis failed. Never crosses a stage boundary as an
/// error: collected and written into the run's error summary.
#[derive(Debug, Clone)]
pub struct AnalysisFailure {
    pub key: CandidateKey,
    pub reason: String,
}

impl AnalysisFailure {
    pub fn new(key: CandidateKey, reason: impl Into<String>) -> Self {
        Self {
            key,
            reason: reason.into(),
        }
    }
}
