// Staging table access. Rows live here between normalization and load.

use chrono::NaiveDate;
use rusqlite::{params, Connection};
use rust_decimal::Decimal;
use std::str::FromStr;

use crate::error::{PipelineError, PipelineResult};
use crate::normalizer::StagingRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagingState {
    Pending,
    Loaded,
    Duplicate,
}

impl StagingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StagingState::Pending => "pending",
            StagingState::Loaded => "loaded",
            StagingState::Duplicate => "duplicate",
        }
    }
}

/// A staged row plus its table id
#[derive(Debug, Clone)]
pub struct StagedRow {
    pub staging_id: i64,
    pub record: StagingRecord,
}

/// Insert records under `batch_id`, whatever batch they were normalized for
pub(crate) fn stage_records(
    conn: &Connection,
    batch_id: &str,
    records: &[StagingRecord],
) -> PipelineResult<usize> {
    let mut stmt = conn.prepare(
        "INSERT INTO staging_records (
            batch_id, source_kind, row_ref, amount, direction, currency,
            txn_date, description, counterparty, account_ref
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
    )?;

    for record in records {
        stmt.execute(params![
            batch_id,
            record.source_kind.as_str(),
            record.row_ref,
            record.amount.to_string(),
            record.direction.as_str(),
            record.currency,
            record.date.format("%Y-%m-%d").to_string(),
            record.description,
            record.counterparty,
            record.account_ref,
        ])?;
    }
    Ok(records.len())
}

/// Rows not yet loaded, in staging order
pub(crate) fn pending_rows(conn: &Connection, batch_id: &str) -> PipelineResult<Vec<StagedRow>> {
    let mut stmt = conn.prepare(
        "SELECT staging_id, batch_id, source_kind, row_ref, amount, direction, currency,
                txn_date, description, counterparty, account_ref
         FROM staging_records
         WHERE batch_id = ?1 AND state = 'pending'
         ORDER BY staging_id",
    )?;

    let raw = stmt
        .query_map(params![batch_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, String>(8)?,
                row.get::<_, Option<String>>(9)?,
                row.get::<_, Option<String>>(10)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    raw.into_iter()
        .map(
            |(staging_id, batch_id, kind, row_ref, amount, direction, currency, date, description, counterparty, account_ref)| {
                let corrupt = |what: &str, value: &str| {
                    PipelineError::StoreUnavailable(format!(
                        "corrupt staging row {}: bad {} {:?}",
                        staging_id, what, value
                    ))
                };
                Ok(StagedRow {
                    staging_id,
                    record: StagingRecord {
                        source_kind: kind.parse().map_err(|_| corrupt("source kind", &kind))?,
                        amount: Decimal::from_str(&amount).map_err(|_| corrupt("amount", &amount))?,
                        direction: direction
                            .parse()
                            .map_err(|_| corrupt("direction", &direction))?,
                        date: NaiveDate::parse_from_str(&date, "%Y-%m-%d")
                            .map_err(|_| corrupt("date", &date))?,
                        batch_id,
                        row_ref,
                        currency,
                        description,
                        counterparty,
                        account_ref,
                    },
                })
            },
        )
        .collect()
}

pub(crate) fn mark_state(
    conn: &Connection,
    staging_id: i64,
    state: StagingState,
) -> PipelineResult<()> {
    conn.execute(
        "UPDATE staging_records SET state = ?1 WHERE staging_id = ?2",
        params![state.as_str(), staging_id],
    )?;
    Ok(())
}

pub fn pending_count(conn: &Connection, batch_id: &str) -> PipelineResult<u64> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM staging_records WHERE batch_id = ?1 AND state = 'pending'",
        params![batch_id],
        |row| row.get(0),
    )?;
    Ok(n as u64)
}

/// Hand the unloaded rows of a failed batch over to its retry batch
pub(crate) fn reassign_pending(conn: &Connection, from: &str, to: &str) -> PipelineResult<u64> {
    let moved = conn.execute(
        "UPDATE staging_records SET batch_id = ?1 WHERE batch_id = ?2 AND state = 'pending'",
        params![to, from],
    )?;
    Ok(moved as u64)
}

/// Drop every staging row of a batch that reached a successful terminal state
pub(crate) fn purge_batch(conn: &Connection, batch_id: &str) -> PipelineResult<u64> {
    let purged = conn.execute(
        "DELETE FROM staging_records WHERE batch_id = ?1",
        params![batch_id],
    )?;
    Ok(purged as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::create_batch;
    use crate::db::LedgerDb;
    use crate::source::{Direction, SourceKind};

    fn record(description: &str) -> StagingRecord {
        StagingRecord {
            batch_id: "ignored".to_string(),
            source_kind: SourceKind::Pdf,
            row_ref: "page 1 line 3".to_string(),
            amount: Decimal::from_str("-1250.50").unwrap(),
            direction: Direction::Debit,
            currency: "INR".to_string(),
            date: NaiveDate::from_ymd_opt(2024, 3, 9).unwrap(),
            description: description.to_string(),
            counterparty: None,
            account_ref: Some("XX99".to_string()),
        }
    }

    #[test]
    fn test_stage_and_read_back() {
        let db = LedgerDb::open_in_memory().unwrap();
        let rows = db
            .with_tx(|tx| {
                create_batch(tx, "b1", SourceKind::Pdf, 2, None)?;
                stage_records(tx, "b1", &[record("Electricity"), record("Fuel")])?;
                pending_rows(tx, "b1")
            })
            .unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].record.batch_id, "b1");
        assert_eq!(rows[0].record.amount, Decimal::from_str("-1250.50").unwrap());
        assert_eq!(rows[1].record.description, "Fuel");
        assert_eq!(rows[1].record.account_ref.as_deref(), Some("XX99"));
    }

    #[test]
    fn test_mark_reassign_purge() {
        let db = LedgerDb::open_in_memory().unwrap();
        db.with_tx(|tx| {
            create_batch(tx, "failed", SourceKind::Pdf, 3, None)?;
            create_batch(tx, "retry", SourceKind::Pdf, 0, Some("failed"))?;
            stage_records(tx, "failed", &[record("a"), record("b"), record("c")])?;

            let first = pending_rows(tx, "failed")?[0].staging_id;
            mark_state(tx, first, StagingState::Loaded)?;
            assert_eq!(pending_count(tx, "failed")?, 2);

            assert_eq!(reassign_pending(tx, "failed", "retry")?, 2);
            assert_eq!(pending_count(tx, "failed")?, 0);
            assert_eq!(pending_count(tx, "retry")?, 2);

            assert_eq!(purge_batch(tx, "retry")?, 2);
            assert_eq!(pending_count(tx, "retry")?, 0);
            Ok(())
        })
        .unwrap();
    }
}
