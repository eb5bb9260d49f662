//! Repayment spreadsheet reconciliation.
//!
//! One uploaded file is one run: download, decode, then per row resolve the
//! borrower (creating one if absent), find the borrower's most recent loan
//! (creating one if absent), recompute interest/repayment/balance, and stage
//! the write. All staged writes commit as a single transaction, after which
//! the import batch is marked processed. Any failure marks the batch
//! processed with the error attached instead, so a broken file surfaces for
//! manual remediation rather than retrying forever.

use crate::errors::{AppError, ResultExt};
use crate::handlers::AppState;
use crate::interest;
use crate::loan_store::{self, LoanWrite};
use crate::models::{Borrower, ImportBatch, Loan, LoanStatus, StorageEvent};
use crate::sheet::{self, NormalizedRow};
use crate::storage::FileStore;
use chrono::Utc;
use moka::future::Cache;
use serde::Serialize;
use sqlx::{PgConnection, PgPool};
use std::sync::Arc;
use uuid::Uuid;

/// Counters for one completed run.
#[derive(Debug, Default, Clone, Serialize)]
pub struct ImportStats {
    pub rows: usize,
    pub rows_skipped: usize,
    pub borrowers_created: usize,
    pub loans_created: usize,
    pub loans_updated: usize,
}

/// Outcome of a pipeline invocation.
#[derive(Debug)]
pub enum ImportOutcome {
    /// The batch was already marked processed; nothing was written.
    AlreadyProcessed,
    Completed(ImportStats),
}

/// Persistence operations the pipeline performs, factored out of the sqlx
/// layer so resolution and idempotency logic can be exercised against an
/// in-memory store.
#[allow(async_fn_in_trait)]
pub trait ReconcileStore {
    async fn find_batch_by_url(&mut self, url: &str) -> Result<Option<ImportBatch>, AppError>;
    async fn mark_batch_processed(
        &mut self,
        batch_id: Uuid,
        error_message: Option<&str>,
    ) -> Result<(), AppError>;
    async fn find_borrower_by_bvn(&mut self, bvn: &str) -> Result<Option<Borrower>, AppError>;
    async fn find_borrower_by_phone(&mut self, phone: &str)
        -> Result<Option<Borrower>, AppError>;
    async fn find_borrower_by_name(&mut self, name: &str) -> Result<Option<Borrower>, AppError>;
    async fn insert_borrower(
        &mut self,
        id: &str,
        name: Option<&str>,
        phone: Option<&str>,
        bvn: Option<&str>,
        email: Option<&str>,
    ) -> Result<Borrower, AppError>;
    async fn latest_loan(&mut self, borrower_id: &str) -> Result<Option<Loan>, AppError>;
    async fn insert_loan(
        &mut self,
        borrower_id: &str,
        write: &LoanWrite,
        from_import: bool,
    ) -> Result<Uuid, AppError>;
    async fn update_imported_loan(
        &mut self,
        loan_id: Uuid,
        write: &LoanWrite,
    ) -> Result<(), AppError>;
}

impl ReconcileStore for PgConnection {
    async fn find_batch_by_url(&mut self, url: &str) -> Result<Option<ImportBatch>, AppError> {
        loan_store::find_batch_by_url(&mut *self, url).await
    }

    async fn mark_batch_processed(
        &mut self,
        batch_id: Uuid,
        error_message: Option<&str>,
    ) -> Result<(), AppError> {
        loan_store::mark_batch_processed(&mut *self, batch_id, error_message).await
    }

    async fn find_borrower_by_bvn(&mut self, bvn: &str) -> Result<Option<Borrower>, AppError> {
        loan_store::find_borrower_by_bvn(&mut *self, bvn).await
    }

    async fn find_borrower_by_phone(
        &mut self,
        phone: &str,
    ) -> Result<Option<Borrower>, AppError> {
        loan_store::find_borrower_by_phone(&mut *self, phone).await
    }

    async fn find_borrower_by_name(&mut self, name: &str) -> Result<Option<Borrower>, AppError> {
        loan_store::find_borrower_by_name(&mut *self, name).await
    }

    async fn insert_borrower(
        &mut self,
        id: &str,
        name: Option<&str>,
        phone: Option<&str>,
        bvn: Option<&str>,
        email: Option<&str>,
    ) -> Result<Borrower, AppError> {
        loan_store::insert_borrower(&mut *self, id, name, phone, bvn, email).await
    }

    async fn latest_loan(&mut self, borrower_id: &str) -> Result<Option<Loan>, AppError> {
        loan_store::latest_loan(&mut *self, borrower_id).await
    }

    async fn insert_loan(
        &mut self,
        borrower_id: &str,
        write: &LoanWrite,
        from_import: bool,
    ) -> Result<Uuid, AppError> {
        loan_store::insert_loan(&mut *self, borrower_id, write, from_import).await
    }

    async fn update_imported_loan(
        &mut self,
        loan_id: Uuid,
        write: &LoanWrite,
    ) -> Result<(), AppError> {
        loan_store::update_imported_loan(&mut *self, loan_id, write).await
    }
}

/// Decision from the idempotency pre-check.
#[derive(Debug)]
pub enum BatchGuard {
    /// The batch is already marked processed; the run must not write.
    Skip,
    /// Proceed, carrying the batch record to mark afterwards (None when the
    /// upload step never recorded one).
    Proceed(Option<ImportBatch>),
}

/// Idempotency guard: a batch whose `processed` flag is already true aborts
/// the run with zero writes, which makes duplicate storage-finalize
/// deliveries harmless. A missing batch record is an anomaly (the upload
/// step should have created it) but processing proceeds best-effort.
pub async fn batch_guard<S: ReconcileStore>(
    store: &mut S,
    url: &str,
) -> Result<BatchGuard, AppError> {
    let batch = store.find_batch_by_url(url).await?;
    match batch {
        Some(batch) if batch.processed => {
            tracing::info!(
                "Import batch {} already processed, skipping {}",
                batch.id,
                url
            );
            Ok(BatchGuard::Skip)
        }
        Some(batch) => Ok(BatchGuard::Proceed(Some(batch))),
        None => {
            tracing::warn!(
                "No import batch record found for {}; proceeding without one",
                url
            );
            Ok(BatchGuard::Proceed(None))
        }
    }
}

/// Run the pipeline for one storage event.
pub async fn process_import(
    db: &PgPool,
    store: &FileStore,
    event: &StorageEvent,
) -> Result<ImportOutcome, AppError> {
    let mut conn = db.acquire().await?;
    let batch = match batch_guard(&mut *conn, &event.url).await? {
        BatchGuard::Skip => return Ok(ImportOutcome::AlreadyProcessed),
        BatchGuard::Proceed(batch) => batch,
    };
    drop(conn);

    match run(db, store, event).await {
        Ok(stats) => {
            if let Some(batch) = &batch {
                loan_store::mark_batch_processed(db, batch.id, None).await?;
            }
            tracing::info!(
                "Reconciled {}: {} rows ({} skipped), {} borrowers created, {} loans created, {} loans updated",
                event.name,
                stats.rows,
                stats.rows_skipped,
                stats.borrowers_created,
                stats.loans_created,
                stats.loans_updated
            );
            Ok(ImportOutcome::Completed(stats))
        }
        Err(e) => {
            tracing::error!("Reconciliation of {} failed: {}", event.name, e);
            match db.acquire().await {
                Ok(mut conn) => Err(record_failure(&mut *conn, batch.as_ref(), e).await),
                Err(acquire_err) => {
                    tracing::error!(
                        "Could not record failure for {}: {}",
                        event.url,
                        acquire_err
                    );
                    Err(e)
                }
            }
        }
    }
}

/// Mark the batch processed with the failure message attached, so the file
/// is never retried automatically and the message is the remediation signal.
/// A failure while marking is logged but never replaces the original error.
pub async fn record_failure<S: ReconcileStore>(
    store: &mut S,
    batch: Option<&ImportBatch>,
    error: AppError,
) -> AppError {
    if let Some(batch) = batch {
        if let Err(mark_err) = store
            .mark_batch_processed(batch.id, Some(&error.to_string()))
            .await
        {
            tracing::error!(
                "Failed to record reconciliation failure on batch {}: {}",
                batch.id,
                mark_err
            );
        }
    }
    error
}

/// Download, decode, and commit one file inside a single transaction.
async fn run(
    db: &PgPool,
    store: &FileStore,
    event: &StorageEvent,
) -> Result<ImportStats, AppError> {
    let bytes = store
        .fetch(&event.url)
        .await
        .context(format!("Fetching {}", event.url))?;

    let mapped = sheet::parse(&bytes, event.content_type.as_deref(), &event.name)?;

    let mut stats = ImportStats {
        rows: mapped.rows.len(),
        rows_skipped: mapped.skipped,
        ..Default::default()
    };

    let mut tx = db.begin().await?;
    reconcile_rows(&mut *tx, &mapped.rows, &mut stats).await?;
    tx.commit().await?;

    Ok(stats)
}

/// Reconcile mapped rows against the store, updating counters as it goes.
///
/// Rows are sequential on purpose: a later row for the same borrower must
/// see the borrower and loan staged by an earlier row.
pub async fn reconcile_rows<S: ReconcileStore>(
    store: &mut S,
    rows: &[NormalizedRow],
    stats: &mut ImportStats,
) -> Result<(), AppError> {
    for row in rows {
        let (borrower, created) = resolve_borrower(store, row).await?;
        if created {
            stats.borrowers_created += 1;
        }

        let previous = store.latest_loan(&borrower.id).await?;
        let write = merge_row(previous.as_ref(), row);

        match previous {
            Some(loan) => {
                store.update_imported_loan(loan.id, &write).await?;
                stats.loans_updated += 1;
            }
            None => {
                store.insert_loan(&borrower.id, &write, true).await?;
                stats.loans_created += 1;
            }
        }
    }
    Ok(())
}

/// Resolve a row to exactly one borrower, creating one if none exists.
///
/// Resolution order: bvn (strong key), then phone, then name. Phone and
/// name are weak keys and can merge distinct people who share a value; the
/// resolved key is logged so such merges can be audited.
async fn resolve_borrower<S: ReconcileStore>(
    store: &mut S,
    row: &NormalizedRow,
) -> Result<(Borrower, bool), AppError> {
    let existing = if let Some(bvn) = &row.bvn {
        let found = store.find_borrower_by_bvn(bvn).await?;
        if found.is_some() {
            tracing::debug!("Resolved borrower by bvn {}", bvn);
        }
        found
    } else if let Some(phone) = &row.phone {
        let found = store.find_borrower_by_phone(phone).await?;
        if found.is_some() {
            tracing::debug!("Resolved borrower by phone {} (weak key)", phone);
        }
        found
    } else if let Some(name) = &row.name {
        let found = store.find_borrower_by_name(name).await?;
        if found.is_some() {
            tracing::debug!("Resolved borrower by name {:?} (weak key)", name);
        }
        found
    } else {
        // map_rows drops keyless rows before they get here.
        None
    };

    if let Some(borrower) = existing {
        return Ok((borrower, false));
    }

    let id = new_borrower_id(row);
    let borrower = store
        .insert_borrower(
            &id,
            row.name.as_deref(),
            row.phone.as_deref(),
            row.bvn.as_deref(),
            None,
        )
        .await?;

    tracing::info!("Created borrower {} from spreadsheet row", borrower.id);
    Ok((borrower, true))
}

/// Id for a borrower created from a row: bvn when present, else phone, else
/// a millisecond-timestamp id.
pub fn new_borrower_id(row: &NormalizedRow) -> String {
    row.bvn
        .clone()
        .or_else(|| row.phone.clone())
        .unwrap_or_else(|| Utc::now().timestamp_millis().to_string())
}

/// Merge a normalized row into the target loan's fields.
///
/// Row-supplied amount and status override the previous record only when
/// present; a row-supplied amount paid replaces (never accumulates) the
/// prior figure. Rate, total repayment, and balance are always recomputed
/// from the effective principal.
pub fn merge_row(previous: Option<&Loan>, row: &NormalizedRow) -> LoanWrite {
    let principal = row
        .amount_requested
        .or_else(|| previous.map(|l| interest::money_f64(&l.amount_requested)))
        .unwrap_or(0.0);

    let amount_paid = row
        .amount_paid
        .or_else(|| previous.map(|l| interest::money_f64(&l.amount_paid)))
        .unwrap_or(0.0);

    let status = row
        .status
        .clone()
        .or_else(|| previous.map(|l| l.status.clone()))
        .unwrap_or_else(|| LoanStatus::Active.as_str().to_string());

    let rate = interest::rate(principal);
    let total = interest::total_repayment(principal);

    LoanWrite {
        amount_requested: principal,
        interest_rate: rate,
        total_repayment: total,
        amount_paid,
        balance: interest::balance(total, amount_paid),
        status,
        due_date: row.due_date.clone(),
    }
}

/// Atomically claim the in-flight slot for a file URL. Returns false when
/// another task already holds the claim.
pub async fn claim_in_flight(cache: &Cache<String, i64>, url: &str) -> bool {
    cache
        .entry(url.to_string())
        .or_insert_with(async { Utc::now().timestamp_millis() })
        .await
        .is_fresh()
}

/// Spawn the pipeline as a background job for one storage event.
///
/// The in-flight cache stops two deliveries of the same event racing before
/// the durable processed flag flips; the flag itself remains the guard
/// across restarts and instances.
pub fn spawn_import_job(state: Arc<AppState>, event: StorageEvent) {
    tokio::spawn(async move {
        let url = event.url.clone();

        if !claim_in_flight(&state.in_flight_imports, &url).await {
            tracing::info!("Import already in flight for {}, skipping trigger", url);
            return;
        }

        match process_import(&state.db, &state.store, &event).await {
            Ok(ImportOutcome::AlreadyProcessed) => {
                tracing::info!("Skipped already-processed import {}", url);
            }
            Ok(ImportOutcome::Completed(_)) => {}
            Err(e) => {
                // Already logged and persisted on the batch record.
                tracing::debug!("Import job for {} ended with error: {}", url, e);
            }
        }

        state.in_flight_imports.invalidate(&url).await;
    });
}
