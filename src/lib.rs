// Ledger ETL - Core Library
// Exposes all modules for use in CLI, API server, and tests

pub mod batch;          // Upload batch state machine + persistence
pub mod classifier;     // Categorization engine + taxonomy handle
pub mod config;
pub mod db;
pub mod error;
pub mod fingerprint;    // Content-addressed dedup key
pub mod kpi;            // KPI projection (transfers excluded)
pub mod loader;         // Sole writer of the fact ledger
pub mod logging;
pub mod normalizer;
pub mod orchestrator;   // One worker per batch
pub mod query;          // Non-KPI transaction listing
pub mod reclassify;
pub mod rules;          // Classification rules as data
pub mod source;         // Source row sum type + CSV adapter
pub mod staging;
pub mod taxonomy;

// Re-export commonly used types
pub use batch::{BatchCounts, BatchResult, BatchSnapshot, BatchStatus, RowFailure};
pub use classifier::{normalize_merchant, Classification, Classifier, TaxonomyHandle};
pub use config::PipelineConfig;
pub use db::{
    distinct_fingerprint_count, fact_count, get_events_for_entity, insert_event, setup_database,
    Event, LedgerDb,
};
pub use error::{PipelineError, PipelineResult, RejectReason};
pub use fingerprint::{fingerprint, FingerprintKey};
pub use kpi::{KpiCursor, KpiFilter, KpiRow, KpiSummary, KpiView, MonthTotals};
pub use loader::{LedgerLoader, LoadAbort, LoadResult, RowOutcome};
pub use logging::init_tracing;
pub use normalizer::{normalize, RejectedRow, StagingRecord};
pub use orchestrator::{BatchHandle, BatchOrchestrator};
pub use query::{LedgerQuery, LedgerRow, SortField, SortOrder, TransactionFilter, TransactionPage};
pub use reclassify::{ReclassifyReport, Reclassifier};
pub use rules::{ClassificationRule, RuleEngine};
pub use source::{
    CsvRowProducer, Direction, EmailExtract, RowProducer, SourceKind, SourceRow, StatementLine,
    TabularRow,
};
pub use taxonomy::{Category, CategoryKind, Subcategory, Taxonomy};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
