use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::DatabaseConfig;
use crate::error::{PipelineError, PipelineResult};

/// Shared handle to the ledger database.
///
/// Concurrent batch workers all go through this one connection; every
/// write happens inside a SQLite transaction while the lock is held, so the
/// fingerprint existence check and insert are atomic across batches.
#[derive(Clone)]
pub struct LedgerDb {
    conn: Arc<Mutex<Connection>>,
}

impl LedgerDb {
    /// Open (or create) the database file described by config
    pub fn open(config: &DatabaseConfig) -> PipelineResult<Self> {
        let conn = Connection::open(&config.path)?;
        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
        Self::from_connection(conn)
    }

    pub fn open_path(path: &Path) -> PipelineResult<Self> {
        Self::open(&DatabaseConfig {
            path: path.to_path_buf(),
            ..DatabaseConfig::default()
        })
    }

    pub fn open_in_memory() -> PipelineResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> PipelineResult<Self> {
        setup_database(&conn)?;
        Ok(LedgerDb {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a read or single-statement write against the connection
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> PipelineResult<T>,
    ) -> PipelineResult<T> {
        let conn = self.conn.lock().map_err(PipelineError::poisoned)?;
        f(&conn)
    }

    /// Run `f` inside a transaction; commits on Ok, rolls back on Err
    pub fn with_tx<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> PipelineResult<T>,
    ) -> PipelineResult<T> {
        let mut conn = self.conn.lock().map_err(PipelineError::poisoned)?;
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

/// Event for the audit trail
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

pub fn setup_database(conn: &Connection) -> PipelineResult<()> {
    // WAL for crash recovery; in-memory databases report "memory" and that's fine
    let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    conn.execute_batch(
        "
        -- One ingestion job. Never deleted by the pipeline.
        CREATE TABLE IF NOT EXISTS upload_batches (
            batch_id TEXT PRIMARY KEY,
            source_kind TEXT NOT NULL,
            status TEXT NOT NULL,
            rows_received INTEGER NOT NULL DEFAULT 0,
            rows_processed INTEGER NOT NULL DEFAULT 0,
            rows_inserted INTEGER NOT NULL DEFAULT 0,
            rows_skipped_duplicate INTEGER NOT NULL DEFAULT 0,
            rows_rejected INTEGER NOT NULL DEFAULT 0,
            retry_of TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        -- Ordered error summary per batch
        CREATE TABLE IF NOT EXISTS batch_errors (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            batch_id TEXT NOT NULL REFERENCES upload_batches(batch_id),
            row_ref TEXT NOT NULL,
            code TEXT NOT NULL,
            reason TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        -- Transient: safe to truncate once the owning batch is terminal
        CREATE TABLE IF NOT EXISTS staging_records (
            staging_id INTEGER PRIMARY KEY AUTOINCREMENT,
            batch_id TEXT NOT NULL REFERENCES upload_batches(batch_id),
            source_kind TEXT NOT NULL,
            row_ref TEXT NOT NULL,
            amount TEXT NOT NULL,
            direction TEXT NOT NULL,
            currency TEXT NOT NULL,
            txn_date TEXT NOT NULL,
            description TEXT NOT NULL,
            counterparty TEXT,
            account_ref TEXT,
            state TEXT NOT NULL DEFAULT 'pending'
        );

        -- Canonical economic events. fingerprint is the dedup key.
        CREATE TABLE IF NOT EXISTS fact_transactions (
            transaction_id TEXT PRIMARY KEY,
            fingerprint TEXT UNIQUE NOT NULL,
            amount TEXT NOT NULL,
            direction TEXT NOT NULL,
            currency TEXT NOT NULL,
            txn_date TEXT NOT NULL,
            description TEXT NOT NULL,
            counterparty TEXT,
            account_ref TEXT,
            source_kind TEXT NOT NULL,
            batch_id TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        -- 1:1 derived classification, overwritten on reclassification
        CREATE TABLE IF NOT EXISTS enriched_transactions (
            transaction_id TEXT PRIMARY KEY REFERENCES fact_transactions(transaction_id),
            category_code TEXT NOT NULL,
            subcategory_code TEXT,
            merchant TEXT,
            kpi_eligible INTEGER NOT NULL,
            needs_review INTEGER NOT NULL,
            rule_id TEXT,
            taxonomy_version INTEGER NOT NULL,
            classified_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_fact_date ON fact_transactions(txn_date, transaction_id);
        CREATE INDEX IF NOT EXISTS idx_fact_batch ON fact_transactions(batch_id);
        CREATE INDEX IF NOT EXISTS idx_enriched_category ON enriched_transactions(category_code);
        CREATE INDEX IF NOT EXISTS idx_staging_batch ON staging_records(batch_id, state);
        CREATE INDEX IF NOT EXISTS idx_batch_errors ON batch_errors(batch_id);
        CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id);

        -- Fact + enrichment for general listing
        CREATE VIEW IF NOT EXISTS vw_txn_ledger AS
        SELECT f.transaction_id, f.fingerprint, f.amount, f.direction, f.currency,
               f.txn_date, f.description, f.counterparty, f.account_ref, f.batch_id,
               e.category_code, e.subcategory_code, e.merchant,
               e.kpi_eligible, e.needs_review
        FROM fact_transactions f
        LEFT JOIN enriched_transactions e ON e.transaction_id = f.transaction_id;

        -- The only source for spend/income analytics
        CREATE VIEW IF NOT EXISTS vw_txn_kpi AS
        SELECT f.transaction_id, f.amount, f.direction, f.currency, f.txn_date,
               f.description, f.account_ref,
               e.category_code, e.subcategory_code, e.merchant
        FROM fact_transactions f
        JOIN enriched_transactions e ON e.transaction_id = f.transaction_id
        WHERE e.kpi_eligible = 1 AND e.category_code <> 'transfers';
        ",
    )?;

    Ok(())
}

/// Insert event into audit trail
pub fn insert_event(conn: &Connection, event: &Event) -> PipelineResult<()> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

/// Get events for a specific entity, newest first
pub fn get_events_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> PipelineResult<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY timestamp DESC, id DESC",
    )?;

    let rows = stmt
        .query_map(params![entity_type, entity_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(event_id, ts, event_type, entity_type, entity_id, data, actor)| {
            Ok(Event {
                event_id,
                timestamp: parse_timestamp(&ts)?,
                event_type,
                entity_type,
                entity_id,
                data: serde_json::from_str(&data)?,
                actor,
            })
        })
        .collect()
}

pub(crate) fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

pub(crate) fn parse_timestamp(value: &str) -> PipelineResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| PipelineError::StoreUnavailable(format!("corrupt timestamp {:?}: {}", value, e)))
}

/// Number of rows in the fact ledger
pub fn fact_count(conn: &Connection) -> PipelineResult<i64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM fact_transactions", [], |row| row.get(0))?)
}

/// Number of distinct fingerprints in the fact ledger
pub fn distinct_fingerprint_count(conn: &Connection) -> PipelineResult<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(DISTINCT fingerprint) FROM fact_transactions",
        [],
        |row| row.get(0),
    )?)
}
