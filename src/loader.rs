// 📥 Ledger Loader - the only write path into fact_transactions
//
// Each staged row is loaded in its own SQLite transaction: fingerprint,
// insert-or-skip on the unique fingerprint, classify, write enrichment, mark
// the staging row and bump the batch counters. A crash between rows leaves
// earlier rows committed and later rows pending in staging.

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::batch;
use crate::classifier::{read_enrichment, write_enrichment, Classifier};
use crate::db::{insert_event, now_rfc3339, Event, LedgerDb};
use crate::error::{PipelineError, PipelineResult};
use crate::fingerprint::fingerprint;
use crate::normalizer::StagingRecord;
use crate::staging::{self, StagedRow, StagingState};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadResult {
    pub inserted: u64,
    pub skipped_duplicate: u64,
    /// Duplicates whose stale enrichment was re-derived
    pub refreshed: u64,
    /// Staged rows left unprocessed by an abort or cancellation
    pub failed: u64,
}

/// A load that stopped early. Rows counted in `partial` are committed.
#[derive(Debug)]
pub struct LoadAbort {
    pub partial: LoadResult,
    pub cause: PipelineError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowOutcome {
    Inserted { transaction_id: String },
    Duplicate { transaction_id: String, refreshed: bool },
}

pub struct LedgerLoader {
    db: LedgerDb,
    classifier: Arc<Classifier>,
}

impl LedgerLoader {
    /// `classifier` is the taxonomy snapshot used for the whole load
    pub fn new(db: LedgerDb, classifier: Arc<Classifier>) -> Self {
        LedgerLoader { db, classifier }
    }

    /// Load every pending staged row of `batch_id`.
    ///
    /// Cancellation is checked between rows, never inside one.
    #[instrument(skip(self, cancel), fields(taxonomy_version = self.classifier.version()))]
    pub fn load(&self, batch_id: &str, cancel: &CancellationToken) -> Result<LoadResult, LoadAbort> {
        let rows = self
            .db
            .with_conn(|conn| staging::pending_rows(conn, batch_id))
            .map_err(|cause| LoadAbort {
                partial: LoadResult::default(),
                cause,
            })?;

        let total = rows.len() as u64;
        let mut result = LoadResult::default();

        for (done, row) in rows.into_iter().enumerate() {
            if cancel.is_cancelled() {
                result.failed = total - done as u64;
                warn!(batch_id, remaining = result.failed, "load cancelled");
                return Err(LoadAbort {
                    partial: result,
                    cause: PipelineError::Cancelled,
                });
            }

            match self.load_row(batch_id, &row) {
                Ok(RowOutcome::Inserted { .. }) => result.inserted += 1,
                Ok(RowOutcome::Duplicate { refreshed, .. }) => {
                    result.skipped_duplicate += 1;
                    if refreshed {
                        result.refreshed += 1;
                    }
                }
                Err(cause) => {
                    result.failed = total - done as u64;
                    warn!(batch_id, row = %row.record.row_ref, error = %cause, "load aborted");
                    return Err(LoadAbort {
                        partial: result,
                        cause,
                    });
                }
            }
        }

        info!(
            batch_id,
            inserted = result.inserted,
            skipped_duplicate = result.skipped_duplicate,
            refreshed = result.refreshed,
            "load finished"
        );
        Ok(result)
    }

    /// Insert-or-skip one staged row, atomically with its bookkeeping
    pub fn load_row(&self, batch_id: &str, row: &StagedRow) -> PipelineResult<RowOutcome> {
        let key = fingerprint(&row.record);

        self.db.with_tx(|tx| {
            let outcome = match insert_fact(tx, key.as_str(), batch_id, &row.record)? {
                Some(transaction_id) => {
                    let classification = self.classifier.classify_record(&row.record);
                    write_enrichment(tx, &transaction_id, &classification)?;
                    insert_event(
                        tx,
                        &Event::new(
                            "transaction_ingested",
                            "transaction",
                            &transaction_id,
                            serde_json::json!({
                                "batch_id": batch_id,
                                "fingerprint": key.as_str(),
                                "row_ref": row.record.row_ref,
                                "category": classification.category_code,
                            }),
                            "ledger_loader",
                        ),
                    )?;
                    debug!(batch_id, fingerprint = %key, %transaction_id, "inserted");
                    RowOutcome::Inserted { transaction_id }
                }
                None => {
                    let transaction_id = existing_transaction_id(tx, key.as_str())?;
                    let refreshed = self.refresh_if_stale(tx, &transaction_id)?;
                    debug!(batch_id, fingerprint = %key, %transaction_id, refreshed, "duplicate");
                    RowOutcome::Duplicate {
                        transaction_id,
                        refreshed,
                    }
                }
            };

            let inserted = matches!(outcome, RowOutcome::Inserted { .. });
            let state = if inserted {
                StagingState::Loaded
            } else {
                StagingState::Duplicate
            };
            staging::mark_state(tx, row.staging_id, state)?;
            batch::record_outcome(tx, batch_id, inserted)?;
            Ok(outcome)
        })
    }

    /// Re-derive enrichment for an existing fact when it is missing or was
    /// produced by another taxonomy version. The fact row is never touched.
    fn refresh_if_stale(&self, conn: &Connection, transaction_id: &str) -> PipelineResult<bool> {
        let current = self.classifier.version();
        let stale = match read_enrichment(conn, transaction_id)? {
            Some(existing) => existing.taxonomy_version != current,
            None => true,
        };
        if !stale {
            return Ok(false);
        }

        let (description, counterparty) = fact_text(conn, transaction_id)?;
        let classification = self.classifier.classify(&description, counterparty.as_deref());
        write_enrichment(conn, transaction_id, &classification)?;
        Ok(true)
    }
}

/// `Some(id)` when this call created the row, `None` when the fingerprint
/// already existed. The unique constraint makes the check-and-insert atomic.
fn insert_fact(
    conn: &Connection,
    fingerprint: &str,
    batch_id: &str,
    record: &StagingRecord,
) -> PipelineResult<Option<String>> {
    let transaction_id = uuid::Uuid::new_v4().to_string();
    let changed = conn.execute(
        "INSERT INTO fact_transactions (
            transaction_id, fingerprint, amount, direction, currency, txn_date,
            description, counterparty, account_ref, source_kind, batch_id, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        ON CONFLICT(fingerprint) DO NOTHING",
        params![
            transaction_id,
            fingerprint,
            record.amount.to_string(),
            record.direction.as_str(),
            record.currency,
            record.date.format("%Y-%m-%d").to_string(),
            record.description,
            record.counterparty,
            record.account_ref,
            record.source_kind.as_str(),
            batch_id,
            now_rfc3339(),
        ],
    )?;

    Ok((changed == 1).then_some(transaction_id))
}

fn existing_transaction_id(conn: &Connection, fingerprint: &str) -> PipelineResult<String> {
    conn.query_row(
        "SELECT transaction_id FROM fact_transactions WHERE fingerprint = ?1",
        params![fingerprint],
        |row| row.get(0),
    )
    .optional()?
    .ok_or_else(|| {
        PipelineError::StoreUnavailable(format!(
            "fingerprint {} conflicted but no fact row exists",
            fingerprint
        ))
    })
}

fn fact_text(conn: &Connection, transaction_id: &str) -> PipelineResult<(String, Option<String>)> {
    Ok(conn.query_row(
        "SELECT description, counterparty FROM fact_transactions WHERE transaction_id = ?1",
        params![transaction_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?)
}
