// 📦 Upload batches - lifecycle state machine and persistence
//
// pending → processing → {completed, completed_with_errors, failed}
// pending → failed is allowed for a batch cancelled before its worker started.

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::db::{now_rfc3339, parse_timestamp};
use crate::error::{PipelineError, PipelineResult};
use crate::normalizer::RejectedRow;
use crate::source::SourceKind;
use chrono::{DateTime, Utc};

// ============================================================================
// STATUS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Processing,
    Completed,
    CompletedWithErrors,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Processing => "processing",
            BatchStatus::Completed => "completed",
            BatchStatus::CompletedWithErrors => "completed_with_errors",
            BatchStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Completed | BatchStatus::CompletedWithErrors | BatchStatus::Failed
        )
    }

    pub fn can_transition_to(&self, next: BatchStatus) -> bool {
        use BatchStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Failed)
                | (Processing, Completed)
                | (Processing, CompletedWithErrors)
                | (Processing, Failed)
        )
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BatchStatus::Pending),
            "processing" => Ok(BatchStatus::Processing),
            "completed" => Ok(BatchStatus::Completed),
            "completed_with_errors" => Ok(BatchStatus::CompletedWithErrors),
            "failed" => Ok(BatchStatus::Failed),
            other => Err(PipelineError::StoreUnavailable(format!(
                "corrupt batch status {:?}",
                other
            ))),
        }
    }
}

// ============================================================================
// SNAPSHOT TYPES
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCounts {
    pub received: u64,
    /// Rows accounted for so far: inserted + skipped + rejected
    pub processed: u64,
    pub inserted: u64,
    pub skipped_duplicate: u64,
    pub rejected: u64,
}

/// One entry of a batch's ordered error summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowFailure {
    pub row_ref: String,
    pub code: String,
    pub reason: String,
}

/// Pollable view of one batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSnapshot {
    pub batch_id: String,
    pub source_kind: SourceKind,
    pub status: BatchStatus,
    pub counts: BatchCounts,
    pub errors: Vec<RowFailure>,
    pub retry_of: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What a submitter gets back
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult {
    pub batch_id: String,
    pub inserted: u64,
    pub skipped_duplicate: u64,
    pub rejected: u64,
    pub status: BatchStatus,
    /// Systemic failure or cancellation message for `failed` batches
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&BatchSnapshot> for BatchResult {
    fn from(snapshot: &BatchSnapshot) -> Self {
        BatchResult {
            batch_id: snapshot.batch_id.clone(),
            inserted: snapshot.counts.inserted,
            skipped_duplicate: snapshot.counts.skipped_duplicate,
            rejected: snapshot.counts.rejected,
            status: snapshot.status,
            error: None,
        }
    }
}

/// Code used in the error summary for batch-level (non-row) failures
pub const BATCH_ROW_REF: &str = "batch";

// ============================================================================
// PERSISTENCE
// ============================================================================

pub(crate) fn create_batch(
    conn: &Connection,
    batch_id: &str,
    source_kind: SourceKind,
    rows_received: u64,
    retry_of: Option<&str>,
) -> PipelineResult<()> {
    let now = now_rfc3339();
    conn.execute(
        "INSERT INTO upload_batches (
            batch_id, source_kind, status, rows_received, retry_of, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
        params![
            batch_id,
            source_kind.as_str(),
            BatchStatus::Pending.as_str(),
            rows_received as i64,
            retry_of,
            now,
        ],
    )?;
    Ok(())
}

pub fn batch_status(conn: &Connection, batch_id: &str) -> PipelineResult<BatchStatus> {
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM upload_batches WHERE batch_id = ?1",
            params![batch_id],
            |row| row.get(0),
        )
        .optional()?;

    status
        .ok_or_else(|| PipelineError::BatchNotFound(batch_id.to_string()))?
        .parse()
}

/// Move a batch to `to`, enforcing the state machine. Returns the old status.
pub(crate) fn transition(
    conn: &Connection,
    batch_id: &str,
    to: BatchStatus,
) -> PipelineResult<BatchStatus> {
    let from = batch_status(conn, batch_id)?;
    if !from.can_transition_to(to) {
        return Err(PipelineError::InvalidTransition { from, to });
    }

    conn.execute(
        "UPDATE upload_batches SET status = ?1, updated_at = ?2 WHERE batch_id = ?3",
        params![to.as_str(), now_rfc3339(), batch_id],
    )?;
    tracing::debug!(batch_id, from = %from, to = %to, "batch transition");
    Ok(from)
}

/// Append rejected rows to the error summary and count them as processed
pub(crate) fn record_rejects(
    conn: &Connection,
    batch_id: &str,
    rejects: &[RejectedRow],
) -> PipelineResult<()> {
    if rejects.is_empty() {
        return Ok(());
    }

    let now = now_rfc3339();
    {
        let mut stmt = conn.prepare(
            "INSERT INTO batch_errors (batch_id, row_ref, code, reason, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for reject in rejects {
            stmt.execute(params![
                batch_id,
                reject.row_ref,
                reject.reason.code(),
                reject.reason.to_string(),
                now,
            ])?;
        }
    }

    let n = rejects.len() as i64;
    conn.execute(
        "UPDATE upload_batches
         SET rows_rejected = rows_rejected + ?1, rows_processed = rows_processed + ?1,
             updated_at = ?2
         WHERE batch_id = ?3",
        params![n, now, batch_id],
    )?;
    Ok(())
}

/// Batch-level entry in the error summary (systemic failure, cancellation)
pub(crate) fn record_batch_error(
    conn: &Connection,
    batch_id: &str,
    code: &str,
    reason: &str,
) -> PipelineResult<()> {
    conn.execute(
        "INSERT INTO batch_errors (batch_id, row_ref, code, reason, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![batch_id, BATCH_ROW_REF, code, reason, now_rfc3339()],
    )?;
    Ok(())
}

/// One loaded row: bump processed and either inserted or skipped
pub(crate) fn record_outcome(
    conn: &Connection,
    batch_id: &str,
    inserted: bool,
) -> PipelineResult<()> {
    let (ins, skip) = if inserted { (1, 0) } else { (0, 1) };
    conn.execute(
        "UPDATE upload_batches
         SET rows_inserted = rows_inserted + ?1,
             rows_skipped_duplicate = rows_skipped_duplicate + ?2,
             rows_processed = rows_processed + 1,
             updated_at = ?3
         WHERE batch_id = ?4",
        params![ins, skip, now_rfc3339(), batch_id],
    )?;
    Ok(())
}

pub(crate) fn set_received(conn: &Connection, batch_id: &str, received: u64) -> PipelineResult<()> {
    conn.execute(
        "UPDATE upload_batches SET rows_received = ?1 WHERE batch_id = ?2",
        params![received as i64, batch_id],
    )?;
    Ok(())
}

/// The batch created by retrying `batch_id`, if any
pub fn retried_as(conn: &Connection, batch_id: &str) -> PipelineResult<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT batch_id FROM upload_batches WHERE retry_of = ?1 LIMIT 1",
            params![batch_id],
            |row| row.get(0),
        )
        .optional()?)
}

fn batch_errors(conn: &Connection, batch_id: &str) -> PipelineResult<Vec<RowFailure>> {
    let mut stmt = conn.prepare(
        "SELECT row_ref, code, reason FROM batch_errors WHERE batch_id = ?1 ORDER BY id",
    )?;
    let rows = stmt
        .query_map(params![batch_id], |row| {
            Ok(RowFailure {
                row_ref: row.get(0)?,
                code: row.get(1)?,
                reason: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

struct BatchRow {
    batch_id: String,
    source_kind: String,
    status: String,
    counts: BatchCounts,
    retry_of: Option<String>,
    created_at: String,
    updated_at: String,
}

const BATCH_COLUMNS: &str = "batch_id, source_kind, status, rows_received, rows_processed,
    rows_inserted, rows_skipped_duplicate, rows_rejected, retry_of, created_at, updated_at";

fn map_batch_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<BatchRow> {
    Ok(BatchRow {
        batch_id: row.get(0)?,
        source_kind: row.get(1)?,
        status: row.get(2)?,
        counts: BatchCounts {
            received: row.get::<_, i64>(3)? as u64,
            processed: row.get::<_, i64>(4)? as u64,
            inserted: row.get::<_, i64>(5)? as u64,
            skipped_duplicate: row.get::<_, i64>(6)? as u64,
            rejected: row.get::<_, i64>(7)? as u64,
        },
        retry_of: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

fn into_snapshot(conn: &Connection, row: BatchRow) -> PipelineResult<BatchSnapshot> {
    let source_kind = row
        .source_kind
        .parse()
        .map_err(PipelineError::StoreUnavailable)?;
    Ok(BatchSnapshot {
        errors: batch_errors(conn, &row.batch_id)?,
        status: row.status.parse()?,
        source_kind,
        counts: row.counts,
        retry_of: row.retry_of,
        created_at: parse_timestamp(&row.created_at)?,
        updated_at: parse_timestamp(&row.updated_at)?,
        batch_id: row.batch_id,
    })
}

pub fn get_batch(conn: &Connection, batch_id: &str) -> PipelineResult<BatchSnapshot> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM upload_batches WHERE batch_id = ?1", BATCH_COLUMNS),
            params![batch_id],
            map_batch_row,
        )
        .optional()?
        .ok_or_else(|| PipelineError::BatchNotFound(batch_id.to_string()))?;
    into_snapshot(conn, row)
}

/// All batches, newest first
pub fn list_batches(conn: &Connection) -> PipelineResult<Vec<BatchSnapshot>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM upload_batches ORDER BY rowid DESC",
        BATCH_COLUMNS
    ))?;
    let rows = stmt
        .query_map([], map_batch_row)?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter().map(|row| into_snapshot(conn, row)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::LedgerDb;
    use crate::error::RejectReason;

    #[test]
    fn test_state_machine() {
        use BatchStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Pending.can_transition_to(Failed));
        assert!(Processing.can_transition_to(CompletedWithErrors));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Processing));
        assert!(!Failed.can_transition_to(Processing));
        assert!(Failed.is_terminal());
        assert!(!Processing.is_terminal());
    }

    #[test]
    fn test_status_text_round_trip() {
        for status in [
            BatchStatus::Pending,
            BatchStatus::Processing,
            BatchStatus::Completed,
            BatchStatus::CompletedWithErrors,
            BatchStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<BatchStatus>().unwrap(), status);
        }
        assert_eq!(
            serde_json::to_value(BatchStatus::CompletedWithErrors).unwrap(),
            "completed_with_errors"
        );
    }

    #[test]
    fn test_create_transition_and_snapshot() {
        let db = LedgerDb::open_in_memory().unwrap();

        let snapshot = db
            .with_tx(|tx| {
                create_batch(tx, "b1", SourceKind::Csv, 3, None)?;
                transition(tx, "b1", BatchStatus::Processing)?;
                record_rejects(
                    tx,
                    "b1",
                    &[RejectedRow {
                        row_ref: "row 4".to_string(),
                        reason: RejectReason::InvalidAmount { value: "abc".into() },
                    }],
                )?;
                record_outcome(tx, "b1", true)?;
                record_outcome(tx, "b1", false)?;
                transition(tx, "b1", BatchStatus::CompletedWithErrors)?;
                get_batch(tx, "b1")
            })
            .unwrap();

        assert_eq!(snapshot.status, BatchStatus::CompletedWithErrors);
        assert_eq!(
            snapshot.counts,
            BatchCounts {
                received: 3,
                processed: 3,
                inserted: 1,
                skipped_duplicate: 1,
                rejected: 1,
            }
        );
        assert_eq!(snapshot.errors.len(), 1);
        assert_eq!(snapshot.errors[0].code, "invalid_amount");
        assert_eq!(snapshot.errors[0].row_ref, "row 4");
    }

    #[test]
    fn test_illegal_transition_is_refused() {
        let db = LedgerDb::open_in_memory().unwrap();
        db.with_conn(|conn| create_batch(conn, "b1", SourceKind::Pdf, 0, None))
            .unwrap();

        let err = db
            .with_conn(|conn| transition(conn, "b1", BatchStatus::Completed))
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::InvalidTransition {
                from: BatchStatus::Pending,
                to: BatchStatus::Completed
            }
        ));
    }

    #[test]
    fn test_missing_batch() {
        let db = LedgerDb::open_in_memory().unwrap();
        let err = db.with_conn(|conn| get_batch(conn, "nope")).unwrap_err();
        assert!(matches!(err, PipelineError::BatchNotFound(_)));
    }

    #[test]
    fn test_list_newest_first() {
        let db = LedgerDb::open_in_memory().unwrap();
        db.with_conn(|conn| {
            create_batch(conn, "first", SourceKind::Csv, 1, None)?;
            create_batch(conn, "second", SourceKind::Email, 1, Some("first"))
        })
        .unwrap();

        let batches = db.with_conn(list_batches).unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].batch_id, "second");
        assert_eq!(batches[0].retry_of.as_deref(), Some("first"));
        assert_eq!(batches[1].source_kind, SourceKind::Csv);
    }
}
