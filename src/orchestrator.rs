// 🧭 Batch Orchestrator - one worker task per upload batch
//
// Owns the UploadBatch and staging lifecycles. Ledger writes are delegated
// to the LedgerLoader; this module only drives state and bookkeeping.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::batch::{self, BatchResult, BatchSnapshot, BatchStatus};
use crate::classifier::TaxonomyHandle;
use crate::config::{IngestConfig, PipelineConfig};
use crate::db::{insert_event, Event, LedgerDb};
use crate::error::{PipelineError, PipelineResult};
use crate::loader::LedgerLoader;
use crate::normalizer::{normalize, StagingRecord};
use crate::source::{SourceKind, SourceRow};
use crate::staging;

/// Rows handed to a worker
enum BatchInput {
    /// Adapter rows, still to be normalized
    Raw(Vec<SourceRow>),
    /// Already-normalized rows
    Staged(Vec<StagingRecord>),
    /// Rows already sitting in staging under this batch id (retry)
    Restaged,
}

/// A running batch
pub struct BatchHandle {
    pub batch_id: String,
    cancel: CancellationToken,
    join: JoinHandle<PipelineResult<BatchResult>>,
}

impl BatchHandle {
    /// Request cooperative cancellation; takes effect at the next row boundary
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn wait(self) -> PipelineResult<BatchResult> {
        self.join
            .await
            .map_err(|e| PipelineError::WorkerPanicked(e.to_string()))?
    }
}

#[derive(Clone)]
pub struct BatchOrchestrator {
    db: LedgerDb,
    taxonomy: Arc<TaxonomyHandle>,
    ingest: Arc<IngestConfig>,
    permits: Arc<Semaphore>,
    running: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl BatchOrchestrator {
    pub fn new(db: LedgerDb, taxonomy: Arc<TaxonomyHandle>, config: &PipelineConfig) -> Self {
        BatchOrchestrator {
            db,
            taxonomy,
            ingest: Arc::new(config.ingest.clone()),
            permits: Arc::new(Semaphore::new(config.workers.max_concurrent_batches)),
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn db(&self) -> &LedgerDb {
        &self.db
    }

    pub fn taxonomy(&self) -> &Arc<TaxonomyHandle> {
        &self.taxonomy
    }

    /// Create a pending batch and spawn its worker. Must be called from
    /// within a Tokio runtime.
    pub fn start(&self, kind: SourceKind, rows: Vec<SourceRow>) -> PipelineResult<BatchHandle> {
        let received = rows.len() as u64;
        self.create_and_spawn(kind, received, BatchInput::Raw(rows))
    }

    /// Same as [`start`](Self::start) for rows normalized elsewhere
    pub fn start_staged(
        &self,
        kind: SourceKind,
        records: Vec<StagingRecord>,
    ) -> PipelineResult<BatchHandle> {
        let received = records.len() as u64;
        self.create_and_spawn(kind, received, BatchInput::Staged(records))
    }

    /// Run a batch to a terminal state.
    ///
    /// `Ok` carries a result for every terminal status, `failed` included;
    /// `Err` means even the failure could not be recorded.
    pub async fn submit(&self, kind: SourceKind, rows: Vec<SourceRow>) -> PipelineResult<BatchResult> {
        self.start(kind, rows)?.wait().await
    }

    pub async fn submit_staged(
        &self,
        kind: SourceKind,
        records: Vec<StagingRecord>,
    ) -> PipelineResult<BatchResult> {
        self.start_staged(kind, records)?.wait().await
    }

    pub fn status(&self, batch_id: &str) -> PipelineResult<BatchSnapshot> {
        self.db.with_conn(|conn| batch::get_batch(conn, batch_id))
    }

    pub fn list_batches(&self) -> PipelineResult<Vec<BatchSnapshot>> {
        self.db.with_conn(batch::list_batches)
    }

    /// Cancel a running batch. `Ok(false)` when it already finished.
    pub fn cancel(&self, batch_id: &str) -> PipelineResult<bool> {
        {
            let running = self.running.lock().map_err(PipelineError::poisoned)?;
            if let Some(token) = running.get(batch_id) {
                info!(batch_id, "cancellation requested");
                token.cancel();
                return Ok(true);
            }
        }
        self.status(batch_id)?;
        Ok(false)
    }

    /// Move a failed batch's unprocessed rows into a new batch and run it.
    /// The failed batch itself is left as it is.
    pub fn retry(&self, batch_id: &str) -> PipelineResult<BatchHandle> {
        let new_id = uuid::Uuid::new_v4().to_string();

        let kind = self.db.with_tx(|tx| {
            let failed = batch::get_batch(tx, batch_id)?;
            if failed.status != BatchStatus::Failed {
                return Err(PipelineError::NotRetryable {
                    batch_id: batch_id.to_string(),
                    status: failed.status,
                });
            }
            if let Some(retry_batch_id) = batch::retried_as(tx, batch_id)? {
                return Err(PipelineError::AlreadyRetried {
                    batch_id: batch_id.to_string(),
                    retry_batch_id,
                });
            }
            if staging::pending_count(tx, batch_id)? == 0 {
                return Err(PipelineError::NothingToRetry(batch_id.to_string()));
            }

            batch::create_batch(tx, &new_id, failed.source_kind, 0, Some(batch_id))?;
            let moved = staging::reassign_pending(tx, batch_id, &new_id)?;
            batch::set_received(tx, &new_id, moved)?;
            insert_event(
                tx,
                &Event::new(
                    "batch_retried",
                    "batch",
                    batch_id,
                    serde_json::json!({ "retry_batch_id": new_id, "rows": moved }),
                    "orchestrator",
                ),
            )?;
            info!(batch_id, retry_batch_id = %new_id, rows = moved, "batch retry created");
            Ok(failed.source_kind)
        })?;

        self.spawn(new_id, kind, BatchInput::Restaged)
    }

    fn create_and_spawn(
        &self,
        kind: SourceKind,
        received: u64,
        input: BatchInput,
    ) -> PipelineResult<BatchHandle> {
        let batch_id = uuid::Uuid::new_v4().to_string();
        self.db
            .with_conn(|conn| batch::create_batch(conn, &batch_id, kind, received, None))?;
        info!(%batch_id, source_kind = %kind, rows = received, "batch created");
        self.spawn(batch_id, kind, input)
    }

    fn spawn(
        &self,
        batch_id: String,
        kind: SourceKind,
        input: BatchInput,
    ) -> PipelineResult<BatchHandle> {
        let cancel = CancellationToken::new();
        self.running
            .lock()
            .map_err(PipelineError::poisoned)?
            .insert(batch_id.clone(), cancel.clone());

        let worker = self.clone();
        let join = tokio::spawn(worker.run(batch_id.clone(), kind, input, cancel.clone()));

        Ok(BatchHandle {
            batch_id,
            cancel,
            join,
        })
    }

    #[instrument(skip(self, input, cancel), fields(source_kind = %kind))]
    async fn run(
        self,
        batch_id: String,
        kind: SourceKind,
        input: BatchInput,
        cancel: CancellationToken,
    ) -> PipelineResult<BatchResult> {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            permit = Arc::clone(&self.permits).acquire_owned() => permit.ok(),
        };

        let this = self.clone();
        let id = batch_id.clone();
        let outcome = tokio::task::spawn_blocking(move || match permit {
            Some(_permit) => this.process(&id, kind, input, &cancel),
            None => this.finish_failed(&id, PipelineError::Cancelled),
        })
        .await;

        let result = match outcome {
            Ok(result) => result,
            Err(join_error) => {
                error!(%batch_id, error = %join_error, "batch worker panicked");
                let db_handle = self.clone();
                let id = batch_id.clone();
                let cause = PipelineError::WorkerPanicked(join_error.to_string());
                tokio::task::spawn_blocking(move || db_handle.finish_failed(&id, cause))
                    .await
                    .map_err(|e| PipelineError::WorkerPanicked(e.to_string()))?
            }
        };

        if let Ok(mut running) = self.running.lock() {
            running.remove(&batch_id);
        }
        result
    }

    /// Normalize, stage, load, finalize. Runs on a blocking thread.
    fn process(
        &self,
        batch_id: &str,
        kind: SourceKind,
        input: BatchInput,
        cancel: &CancellationToken,
    ) -> PipelineResult<BatchResult> {
        if cancel.is_cancelled() {
            return self.finish_failed(batch_id, PipelineError::Cancelled);
        }

        // CPU-only, outside the store lock
        let (records, rejects) = match input {
            BatchInput::Raw(rows) => {
                let mut records = Vec::with_capacity(rows.len());
                let mut rejects = Vec::new();
                for row in &rows {
                    if row.kind() != kind {
                        warn!(batch_id, row = %row.row_ref(), row_kind = %row.kind(), "row kind differs from batch kind");
                    }
                    match normalize(row, batch_id, &self.ingest) {
                        Ok(record) => records.push(record),
                        Err(reject) => rejects.push(reject),
                    }
                }
                (records, rejects)
            }
            BatchInput::Staged(records) => (records, Vec::new()),
            BatchInput::Restaged => (Vec::new(), Vec::new()),
        };

        let staged = self.db.with_tx(|tx| {
            batch::transition(tx, batch_id, BatchStatus::Processing)?;
            staging::stage_records(tx, batch_id, &records)?;
            batch::record_rejects(tx, batch_id, &rejects)?;
            Ok(())
        });
        if let Err(cause) = staged {
            return self.finish_failed(batch_id, cause);
        }
        info!(batch_id, staged = records.len(), rejected = rejects.len(), "batch processing");

        let classifier = match self.taxonomy.snapshot() {
            Ok(classifier) => classifier,
            Err(cause) => return self.finish_failed(batch_id, cause),
        };

        match LedgerLoader::new(self.db.clone(), classifier).load(batch_id, cancel) {
            Ok(_) => self.finish_completed(batch_id),
            Err(abort) => self.finish_failed(batch_id, abort.cause),
        }
    }

    fn finish_completed(&self, batch_id: &str) -> PipelineResult<BatchResult> {
        let snapshot = self.db.with_tx(|tx| {
            let current = batch::get_batch(tx, batch_id)?;
            let status = if current.counts.rejected > 0 {
                BatchStatus::CompletedWithErrors
            } else {
                BatchStatus::Completed
            };
            batch::transition(tx, batch_id, status)?;
            staging::purge_batch(tx, batch_id)?;
            insert_event(
                tx,
                &Event::new(
                    "batch_completed",
                    "batch",
                    batch_id,
                    serde_json::json!({ "status": status, "counts": current.counts }),
                    "orchestrator",
                ),
            )?;
            batch::get_batch(tx, batch_id)
        });

        match snapshot {
            Ok(snapshot) => {
                info!(
                    batch_id,
                    status = %snapshot.status,
                    inserted = snapshot.counts.inserted,
                    skipped_duplicate = snapshot.counts.skipped_duplicate,
                    rejected = snapshot.counts.rejected,
                    "batch finished"
                );
                Ok(BatchResult::from(&snapshot))
            }
            Err(cause) => self.finish_failed(batch_id, cause),
        }
    }

    /// Mark the batch failed. Committed rows stay; unloaded rows stay staged.
    fn finish_failed(&self, batch_id: &str, cause: PipelineError) -> PipelineResult<BatchResult> {
        let code = match cause {
            PipelineError::Cancelled => "cancelled",
            _ => "systemic",
        };
        let message = cause.to_string();

        let recorded = self.db.with_tx(|tx| {
            batch::record_batch_error(tx, batch_id, code, &message)?;
            batch::transition(tx, batch_id, BatchStatus::Failed)?;
            let snapshot = batch::get_batch(tx, batch_id)?;
            insert_event(
                tx,
                &Event::new(
                    "batch_failed",
                    "batch",
                    batch_id,
                    serde_json::json!({
                        "reason": code,
                        "error": message,
                        "counts": snapshot.counts,
                        "unprocessed": staging::pending_count(tx, batch_id)?,
                    }),
                    "orchestrator",
                ),
            )?;
            Ok(snapshot)
        });

        match recorded {
            Ok(snapshot) => {
                warn!(batch_id, reason = code, error = %message, "batch failed");
                let mut result = BatchResult::from(&snapshot);
                result.error = Some(message);
                Ok(result)
            }
            Err(secondary) => {
                error!(batch_id, error = %message, secondary = %secondary, "could not record batch failure");
                Err(cause)
            }
        }
    }
}
