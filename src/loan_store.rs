//! Database access for borrowers, loans, and import batches.
//!
//! Every function takes a `PgExecutor` so the same queries run against the
//! pool from HTTP handlers and against the open transaction from the
//! reconciliation pipeline. Within one transaction, later rows of a file see
//! the borrowers and loans staged by earlier rows.

use crate::errors::AppError;
use crate::interest;
use crate::models::{Borrower, ImportBatch, Loan, PortfolioLine, NOT_AVAILABLE};
use chrono::Utc;
use sqlx::PgExecutor;
use uuid::Uuid;

/// Monetary fields of a loan write, already recomputed.
#[derive(Debug, Clone, PartialEq)]
pub struct LoanWrite {
    pub amount_requested: f64,
    pub interest_rate: f64,
    pub total_repayment: f64,
    pub amount_paid: f64,
    pub balance: f64,
    pub status: String,
    pub due_date: Option<String>,
}

// ============ Borrowers ============

pub async fn find_borrower_by_bvn<'e, E: PgExecutor<'e>>(
    exec: E,
    bvn: &str,
) -> Result<Option<Borrower>, AppError> {
    let borrower =
        sqlx::query_as::<_, Borrower>("SELECT * FROM borrowers WHERE bvn = $1 LIMIT 1")
            .bind(bvn)
            .fetch_optional(exec)
            .await?;
    Ok(borrower)
}

pub async fn find_borrower_by_phone<'e, E: PgExecutor<'e>>(
    exec: E,
    phone: &str,
) -> Result<Option<Borrower>, AppError> {
    let borrower =
        sqlx::query_as::<_, Borrower>("SELECT * FROM borrowers WHERE phone = $1 LIMIT 1")
            .bind(phone)
            .fetch_optional(exec)
            .await?;
    Ok(borrower)
}

pub async fn find_borrower_by_name<'e, E: PgExecutor<'e>>(
    exec: E,
    name: &str,
) -> Result<Option<Borrower>, AppError> {
    let borrower =
        sqlx::query_as::<_, Borrower>("SELECT * FROM borrowers WHERE name = $1 LIMIT 1")
            .bind(name)
            .fetch_optional(exec)
            .await?;
    Ok(borrower)
}

pub async fn get_borrower<'e, E: PgExecutor<'e>>(
    exec: E,
    id: &str,
) -> Result<Option<Borrower>, AppError> {
    let borrower = sqlx::query_as::<_, Borrower>("SELECT * FROM borrowers WHERE id = $1")
        .bind(id)
        .fetch_optional(exec)
        .await?;
    Ok(borrower)
}

/// Insert a new borrower. Missing fields must already be defaulted to the
/// "N/A" placeholder by the caller; created_at is server-assigned.
pub async fn insert_borrower<'e, E: PgExecutor<'e>>(
    exec: E,
    id: &str,
    name: Option<&str>,
    phone: Option<&str>,
    bvn: Option<&str>,
    email: Option<&str>,
) -> Result<Borrower, AppError> {
    let borrower = sqlx::query_as::<_, Borrower>(
        r#"
        INSERT INTO borrowers (id, name, phone, bvn, email)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(name.unwrap_or(NOT_AVAILABLE))
    .bind(phone.unwrap_or(NOT_AVAILABLE))
    .bind(bvn.unwrap_or(NOT_AVAILABLE))
    .bind(email.unwrap_or(NOT_AVAILABLE))
    .fetch_one(exec)
    .await?;
    Ok(borrower)
}

// ============ Loans ============

/// The most-recently-created loan for a borrower, if any. Reconciliation
/// always targets this record, never a loan id from the spreadsheet.
pub async fn latest_loan<'e, E: PgExecutor<'e>>(
    exec: E,
    borrower_id: &str,
) -> Result<Option<Loan>, AppError> {
    let loan = sqlx::query_as::<_, Loan>(
        "SELECT * FROM loans WHERE borrower_id = $1 ORDER BY created_at DESC LIMIT 1",
    )
    .bind(borrower_id)
    .fetch_optional(exec)
    .await?;
    Ok(loan)
}

pub async fn get_loan<'e, E: PgExecutor<'e>>(
    exec: E,
    id: Uuid,
) -> Result<Option<Loan>, AppError> {
    let loan = sqlx::query_as::<_, Loan>("SELECT * FROM loans WHERE id = $1")
        .bind(id)
        .fetch_optional(exec)
        .await?;
    Ok(loan)
}

/// Insert a new loan row. `from_import` marks records created by the
/// spreadsheet pipeline as opposed to application intake.
pub async fn insert_loan<'e, E: PgExecutor<'e>>(
    exec: E,
    borrower_id: &str,
    write: &LoanWrite,
    from_import: bool,
) -> Result<Uuid, AppError> {
    let (id,): (Uuid,) = sqlx::query_as(
        r#"
        INSERT INTO loans (
            borrower_id, amount_requested, interest_rate, total_repayment,
            amount_paid, balance, status, due_date, from_excel_import
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        RETURNING id
        "#,
    )
    .bind(borrower_id)
    .bind(interest::money(write.amount_requested))
    .bind(write.interest_rate)
    .bind(interest::money(write.total_repayment))
    .bind(interest::money(write.amount_paid))
    .bind(interest::money(write.balance))
    .bind(&write.status)
    .bind(&write.due_date)
    .bind(from_import)
    .fetch_one(exec)
    .await?;
    Ok(id)
}

/// Overwrite an existing loan's monetary fields after recomputation. The
/// creation timestamp is untouched; updated_at is stamped and the
/// import-origin flag set.
pub async fn update_imported_loan<'e, E: PgExecutor<'e>>(
    exec: E,
    loan_id: Uuid,
    write: &LoanWrite,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        UPDATE loans
        SET amount_requested = $2,
            interest_rate = $3,
            total_repayment = $4,
            amount_paid = $5,
            balance = $6,
            status = $7,
            due_date = COALESCE($8, due_date),
            from_excel_import = true,
            updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(loan_id)
    .bind(interest::money(write.amount_requested))
    .bind(write.interest_rate)
    .bind(interest::money(write.total_repayment))
    .bind(interest::money(write.amount_paid))
    .bind(interest::money(write.balance))
    .bind(&write.status)
    .bind(&write.due_date)
    .execute(exec)
    .await?;
    Ok(())
}

pub async fn update_loan_status<'e, E: PgExecutor<'e>>(
    exec: E,
    loan_id: Uuid,
    status: &str,
) -> Result<(), AppError> {
    sqlx::query("UPDATE loans SET status = $2, updated_at = now() WHERE id = $1")
        .bind(loan_id)
        .bind(status)
        .execute(exec)
        .await?;
    Ok(())
}

pub async fn list_loans<'e, E: PgExecutor<'e>>(
    exec: E,
    status: Option<&str>,
    borrower_id: Option<&str>,
) -> Result<Vec<Loan>, AppError> {
    let loans = sqlx::query_as::<_, Loan>(
        r#"
        SELECT * FROM loans
        WHERE ($1::text IS NULL OR status = $1)
          AND ($2::text IS NULL OR borrower_id = $2)
        ORDER BY created_at DESC
        "#,
    )
    .bind(status)
    .bind(borrower_id)
    .fetch_all(exec)
    .await?;
    Ok(loans)
}

// ============ Import batches ============

pub async fn find_batch_by_url<'e, E: PgExecutor<'e>>(
    exec: E,
    file_url: &str,
) -> Result<Option<ImportBatch>, AppError> {
    let batch = sqlx::query_as::<_, ImportBatch>(
        "SELECT * FROM import_batches WHERE file_url = $1 ORDER BY uploaded_at DESC LIMIT 1",
    )
    .bind(file_url)
    .fetch_optional(exec)
    .await?;
    Ok(batch)
}

pub async fn insert_batch<'e, E: PgExecutor<'e>>(
    exec: E,
    file_url: &str,
) -> Result<ImportBatch, AppError> {
    let batch = sqlx::query_as::<_, ImportBatch>(
        r#"
        INSERT INTO import_batches (file_url, uploaded_at, processed)
        VALUES ($1, $2, false)
        RETURNING *
        "#,
    )
    .bind(file_url)
    .bind(Utc::now())
    .fetch_one(exec)
    .await?;
    Ok(batch)
}

/// Flip the processed flag, attaching an error message when the run failed.
/// The flag flips exactly once per batch; failed batches are never silently
/// retried.
pub async fn mark_batch_processed<'e, E: PgExecutor<'e>>(
    exec: E,
    batch_id: Uuid,
    error_message: Option<&str>,
) -> Result<(), AppError> {
    sqlx::query(
        "UPDATE import_batches SET processed = true, error_message = $2 WHERE id = $1",
    )
    .bind(batch_id)
    .bind(error_message)
    .execute(exec)
    .await?;
    Ok(())
}

pub async fn list_batches<'e, E: PgExecutor<'e>>(
    exec: E,
) -> Result<Vec<ImportBatch>, AppError> {
    let batches = sqlx::query_as::<_, ImportBatch>(
        "SELECT * FROM import_batches ORDER BY uploaded_at DESC",
    )
    .fetch_all(exec)
    .await?;
    Ok(batches)
}

// ============ Reports ============

/// Per-status portfolio aggregates over the same tables the pipeline writes.
pub async fn portfolio_summary<'e, E: PgExecutor<'e>>(
    exec: E,
) -> Result<Vec<PortfolioLine>, AppError> {
    let lines = sqlx::query_as::<_, PortfolioLine>(
        r#"
        SELECT status,
               COUNT(*) AS loan_count,
               COALESCE(SUM(amount_requested), 0) AS total_requested,
               COALESCE(SUM(total_repayment), 0) AS total_repayment,
               COALESCE(SUM(amount_paid), 0) AS total_paid,
               COALESCE(SUM(balance), 0) AS total_outstanding
        FROM loans
        GROUP BY status
        ORDER BY status
        "#,
    )
    .fetch_all(exec)
    .await?;
    Ok(lines)
}
