// Error taxonomy for the ingestion pipeline
// Row-level problems are values (RejectReason); only PipelineError aborts a batch.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::batch::BatchStatus;

/// Systemic failures. Any of these aborts the in-flight batch.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("ledger store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("ledger store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("taxonomy error: {0}")]
    Taxonomy(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("batch not found: {0}")]
    BatchNotFound(String),

    #[error("invalid batch transition {from} -> {to}")]
    InvalidTransition { from: BatchStatus, to: BatchStatus },

    #[error("batch {batch_id} is {status}; only failed batches can be retried")]
    NotRetryable { batch_id: String, status: BatchStatus },

    #[error("batch {batch_id} was already retried as {retry_batch_id}")]
    AlreadyRetried { batch_id: String, retry_batch_id: String },

    #[error("batch {0} has no unprocessed rows to retry")]
    NothingToRetry(String),

    #[error("batch cancelled")]
    Cancelled,

    #[error("batch worker terminated unexpectedly: {0}")]
    WorkerPanicked(String),
}

impl PipelineError {
    /// Store/taxonomy failures abort a batch; caller mistakes do not.
    pub fn is_systemic(&self) -> bool {
        !matches!(
            self,
            PipelineError::BatchNotFound(_)
                | PipelineError::InvalidTransition { .. }
                | PipelineError::NotRetryable { .. }
                | PipelineError::AlreadyRetried { .. }
                | PipelineError::NothingToRetry(_)
        )
    }

    pub(crate) fn poisoned<T>(_: T) -> Self {
        PipelineError::StoreUnavailable("connection lock poisoned".to_string())
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Why a single source row was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum RejectReason {
    #[error("incomplete record: missing {field}")]
    IncompleteRecord { field: String },

    #[error("invalid amount: {value:?}")]
    InvalidAmount { value: String },

    #[error("invalid date: {value:?}")]
    InvalidDate { value: String },

    #[error("invalid currency: {value:?}")]
    InvalidCurrency { value: String },
}

impl RejectReason {
    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::IncompleteRecord { .. } => "incomplete_record",
            RejectReason::InvalidAmount { .. } => "invalid_amount",
            RejectReason::InvalidDate { .. } => "invalid_date",
            RejectReason::InvalidCurrency { .. } => "invalid_currency",
        }
    }

    pub fn incomplete(field: &str) -> Self {
        RejectReason::IncompleteRecord {
            field: field.to_string(),
        }
    }
}
