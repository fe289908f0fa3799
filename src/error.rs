//! Error types for the analysis pipeline.

use crate::session::CaseState;

/// Failure of a single capability invocation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CapabilityError {
    #[error("request timed out after {0}s")]
    Timeout(u64),
    #[error("capability unavailable: {0}")]
    Unavailable(String),
    #[error("model API error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("response did not match the expected schema: {0}")]
    Schema(String),
}

/// Errors surfaced to callers of the integration engine and case session.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PipelineError {
    #[error("insufficient evidence: every initial analysis failed")]
    InsufficientEvidence,
    #[error("integration failed: {0}")]
    Integration(#[from] CapabilityError),
    #[error("cannot {action} while case is {state}")]
    InvalidTransition {
        action: &'static str,
        state: CaseState,
    },
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

/// Errors raised by a case store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("case not found: {0}")]
    NotFound(String),
    #[error("invalid case id: {0:?}")]
    InvalidCaseId(String),
    #[error("status for case {case_id} is already terminal ({status})")]
    TerminalStatus {
        case_id: String,
        status: crate::models::AnalysisStatus,
    },
    #[error("failed to access case store: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to (de)serialize case data: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Failure of a background case analysis.
#[derive(Debug, thiserror::Error)]
pub enum AnalysisTaskError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("analysis task aborted: {0}")]
    Join(String),
}
