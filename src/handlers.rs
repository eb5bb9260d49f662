use crate::config::Config;
use crate::errors::AppError;
use crate::interest;
use crate::loan_store::{self, LoanWrite};
use crate::models::*;
use crate::reconcile;
use crate::storage::FileStore;
use crate::storage_webhook::constant_time_compare;
use axum::{
    extract::{Multipart, Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use moka::future::Cache;
use phonenumber::country::Id as CountryId;
use phonenumber::Mode;
use regex::Regex;
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use std::sync::OnceLock;
use uuid::Uuid;

/// Shared application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool.
    pub db: PgPool,
    /// Application configuration.
    pub config: Config,
    /// Upload store and spreadsheet download client.
    pub store: FileStore,
    /// In-flight import guard: file URL -> start timestamp. Stops duplicate
    /// trigger deliveries racing before the durable processed flag flips.
    pub in_flight_imports: Cache<String, i64>,
}

/// Health check endpoint.
pub async fn health() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "coopcredit-api",
            "version": "0.1.0"
        })),
    )
}

// ============ Admin policy ============

/// Check the caller against the configured admin allow-list.
///
/// The allow-list comes from ADMIN_ACCOUNT_IDS; admin identity is never
/// compiled in. Callers present their account id in the X-Admin-Account
/// header (upstream auth is expected to have verified it).
pub fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), AppError> {
    let account = headers
        .get("X-Admin-Account")
        .or_else(|| headers.get("x-admin-account"))
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized("Missing X-Admin-Account header".to_string()))?;

    let allowed = state
        .config
        .admin_account_ids
        .iter()
        .any(|id| constant_time_compare(account, id));

    if !allowed {
        tracing::warn!("Rejected admin action for unknown account {}", account);
        return Err(AppError::Unauthorized(
            "Account is not an administrator".to_string(),
        ));
    }

    Ok(())
}

// ============ Spreadsheet upload ============

/// POST /api/v1/imports
///
/// Accepts a multipart "file" field, writes it into the upload store under
/// the repayments prefix with a timestamp-prefixed name, records the import
/// batch with processed=false, and schedules reconciliation in the
/// background. The file write is synchronous (the caller learns whether the
/// upload itself succeeded); the reconciliation outcome is visible later on
/// the batch record.
pub async fn upload_repayment_sheet(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    require_admin(&state, &headers)?;

    let mut upload = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(format!("Invalid multipart payload: {}", e)))?
    {
        if field.name() == Some("file") {
            let file_name = field.file_name().unwrap_or("repayments.xlsx").to_string();
            let content_type = field.content_type().map(|ct| ct.to_string());
            let data = field
                .bytes()
                .await
                .map_err(|e| AppError::BadRequest(format!("Failed to read upload: {}", e)))?;
            upload = Some((file_name, content_type, data));
        }
    }

    let Some((file_name, content_type, data)) = upload else {
        return Err(AppError::BadRequest(
            "Multipart field 'file' is required".to_string(),
        ));
    };
    if data.is_empty() {
        return Err(AppError::BadRequest("Uploaded file is empty".to_string()));
    }

    let stored = state.store.save_repayment_sheet(&file_name, &data).await?;
    let batch = loan_store::insert_batch(&state.db, &stored.url).await?;

    tracing::info!(
        "Upload accepted: {} -> batch {}",
        stored.object_name,
        batch.id
    );

    let event = StorageEvent {
        name: stored.object_name,
        content_type,
        url: stored.url,
    };
    reconcile::spawn_import_job(state.clone(), event);

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "status": "uploaded",
            "batch_id": batch.id,
            "file_url": batch.file_url,
        })),
    ))
}

/// GET /api/v1/imports
///
/// Batch history with processing outcome; the only place a reconciliation
/// failure is visible to admins.
pub async fn list_import_batches(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<ImportBatch>>, AppError> {
    require_admin(&state, &headers)?;
    let batches = loan_store::list_batches(&state.db).await?;
    Ok(Json(batches))
}

// ============ Loan application intake ============

/// POST /api/v1/loans/apply
///
/// Creates (or resolves) the borrower with the same key precedence the
/// pipeline uses, then opens a loan in `processing` status with monetary
/// fields from the shared interest schedule.
pub async fn apply_for_loan(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoanApplicationRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let name = req.name.trim();
    if name.is_empty() {
        return Err(AppError::BadRequest("Name is required".to_string()));
    }
    if !req.amount_requested.is_finite() || req.amount_requested <= 0.0 {
        return Err(AppError::BadRequest(
            "Requested amount must be positive".to_string(),
        ));
    }

    let phone = req.phone.trim();
    let (phone_valid, phone_detail) = validate_ng_phone(phone);
    if !phone_valid {
        return Err(AppError::BadRequest(format!(
            "Invalid phone number: {}",
            phone_detail
        )));
    }

    let email = req.email.as_deref().map(str::trim).filter(|e| !e.is_empty());
    if let Some(email) = email {
        if !is_valid_email(email) {
            return Err(AppError::BadRequest("Invalid email address".to_string()));
        }
    }

    let bvn = req.bvn.as_deref().map(str::trim).filter(|b| !b.is_empty());

    // Same precedence as the reconciliation pipeline: bvn, then phone, then name.
    let existing = if let Some(bvn) = bvn {
        loan_store::find_borrower_by_bvn(&state.db, bvn).await?
    } else if let Some(found) = loan_store::find_borrower_by_phone(&state.db, phone).await? {
        Some(found)
    } else {
        loan_store::find_borrower_by_name(&state.db, name).await?
    };

    let borrower = match existing {
        Some(borrower) => borrower,
        None => {
            let id = bvn.map(str::to_string).unwrap_or_else(|| phone.to_string());
            loan_store::insert_borrower(&state.db, &id, Some(name), Some(phone), bvn, email)
                .await?
        }
    };

    let principal = req.amount_requested;
    let rate = interest::rate(principal);
    let total = interest::total_repayment(principal);
    let write = LoanWrite {
        amount_requested: principal,
        interest_rate: rate,
        total_repayment: total,
        amount_paid: 0.0,
        balance: total,
        status: LoanStatus::Processing.as_str().to_string(),
        due_date: None,
    };

    let loan_id = loan_store::insert_loan(&state.db, &borrower.id, &write, false).await?;

    tracing::info!(
        "Loan application {} for borrower {} (amount {})",
        loan_id,
        borrower.id,
        principal
    );

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "loan_id": loan_id,
            "borrower_id": borrower.id,
            "amount_requested": principal,
            "interest_rate": rate,
            "total_repayment": total,
            "status": LoanStatus::Processing.as_str(),
        })),
    ))
}

// ============ Admin loan lifecycle ============

/// GET /api/v1/loans
pub async fn list_loans(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<LoanListParams>,
) -> Result<Json<Vec<Loan>>, AppError> {
    require_admin(&state, &headers)?;

    let status = match params.status.as_deref() {
        Some(raw) => Some(
            LoanStatus::parse(raw)
                .ok_or_else(|| AppError::BadRequest(format!("Unknown loan status '{}'", raw)))?,
        ),
        None => None,
    };

    let loans = loan_store::list_loans(
        &state.db,
        status.map(|s| s.as_str()),
        params.borrower_id.as_deref(),
    )
    .await?;
    Ok(Json(loans))
}

/// POST /api/v1/loans/:id/status
///
/// Applies an admin lifecycle transition, rejecting anything outside the
/// permitted-transition map (completed and rejected are terminal).
pub async fn change_loan_status(
    State(state): State<Arc<AppState>>,
    Path(loan_id): Path<Uuid>,
    headers: HeaderMap,
    Json(req): Json<StatusChangeRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    require_admin(&state, &headers)?;

    let next = LoanStatus::parse(&req.status)
        .ok_or_else(|| AppError::BadRequest(format!("Unknown loan status '{}'", req.status)))?;

    let loan = loan_store::get_loan(&state.db, loan_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Loan {} not found", loan_id)))?;

    let current = LoanStatus::parse(&loan.status).ok_or_else(|| {
        AppError::BadRequest(format!(
            "Loan {} carries non-standard status '{}'",
            loan_id, loan.status
        ))
    })?;

    if !current.can_transition(next) {
        return Err(AppError::BadRequest(format!(
            "Transition {} -> {} is not permitted",
            current, next
        )));
    }

    loan_store::update_loan_status(&state.db, loan_id, next.as_str()).await?;
    tracing::info!("Loan {} status {} -> {}", loan_id, current, next);

    Ok(Json(json!({
        "loan_id": loan_id,
        "previous_status": current.as_str(),
        "status": next.as_str(),
    })))
}

/// GET /api/v1/borrowers/:id
pub async fn get_borrower(
    State(state): State<Arc<AppState>>,
    Path(borrower_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Borrower>, AppError> {
    require_admin(&state, &headers)?;
    let borrower = loan_store::get_borrower(&state.db, &borrower_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Borrower {} not found", borrower_id)))?;
    Ok(Json(borrower))
}

// ============ Calculator ============

/// GET /api/v1/calculator?amount=
///
/// Public repayment calculator. Calls the same interest schedule the
/// pipeline and the application intake use, so the three can never diverge.
pub async fn calculate_repayment(
    Query(params): Query<CalculatorParams>,
) -> Result<Json<CalculatorResponse>, AppError> {
    if !params.amount.is_finite() {
        return Err(AppError::BadRequest("Amount must be a number".to_string()));
    }

    let rate = interest::rate(params.amount);
    let total = interest::total_repayment(params.amount);

    Ok(Json(CalculatorResponse {
        amount: params.amount,
        interest_rate: rate,
        interest: total - params.amount,
        total_repayment: total,
    }))
}

// ============ Reports ============

/// GET /api/v1/reports/portfolio
///
/// Read-only aggregates over the same loans/borrowers data the pipeline
/// writes; formatting for export lives with the consumer.
pub async fn portfolio_report(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    require_admin(&state, &headers)?;

    let lines = loan_store::portfolio_summary(&state.db).await?;
    let total_loans: i64 = lines.iter().map(|l| l.loan_count).sum();

    Ok(Json(json!({
        "total_loans": total_loans,
        "by_status": lines,
    })))
}

// ============ Input validation ============

/// Validate a Nigerian phone number.
///
/// Uses the phonenumber library to parse with the NG region and check
/// validity. The raw input is what gets stored: repayment spreadsheets carry
/// phones in local format, and rewriting intake numbers to E.164 would break
/// the pipeline's phone-equality matching.
///
/// Returns: (is_valid, normalized_or_error_msg)
pub fn validate_ng_phone(raw: &str) -> (bool, String) {
    if raw.trim().is_empty() || raw.len() < 8 {
        return (false, "Phone too short".to_string());
    }

    match phonenumber::parse(Some(CountryId::NG), raw) {
        Ok(number) => {
            if phonenumber::is_valid(&number) {
                let formatted = number.format().mode(Mode::E164).to_string();
                tracing::debug!("Valid NG phone: {} ({})", raw, formatted);
                (true, formatted)
            } else {
                tracing::warn!("Invalid NG phone number: {}", raw);
                (false, "Invalid Nigerian phone number".to_string())
            }
        }
        Err(e) => {
            tracing::warn!("Failed to parse NG phone '{}': {:?}", raw, e);
            (false, format!("Parse error: {:?}", e))
        }
    }
}

static EMAIL_REGEX: OnceLock<Regex> = OnceLock::new();

/// Validate email address format (RFC 5322 simplified). The pattern is
/// compiled once and reused across calls.
pub fn is_valid_email(email: &str) -> bool {
    if email.len() < 5 || !email.contains('@') || !email.contains('.') {
        return false;
    }

    let email_regex = EMAIL_REGEX.get_or_init(|| {
        Regex::new(
            r"^[a-zA-Z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)*$",
        )
        .expect("email pattern is a valid regex")
    });

    email_regex.is_match(email)
}
