use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ============ Database Models ============

/// Placeholder stored for borrower fields the source row did not supply.
pub const NOT_AVAILABLE: &str = "N/A";

/// A member of the cooperative, identified primarily by bank verification
/// number (bvn), secondarily by phone or name.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Borrower {
    /// Natural-key id: bvn when known, else phone, else a generated id.
    pub id: String,
    /// Full name, or "N/A".
    pub name: String,
    /// Phone number, or "N/A".
    pub phone: String,
    /// Bank verification number, or "N/A".
    pub bvn: String,
    /// Email address, or "N/A".
    pub email: String,
    /// Timestamp of creation (server-assigned).
    pub created_at: DateTime<Utc>,
}

/// A borrowing record belonging to exactly one borrower.
///
/// Loans are never deleted; admin actions and the reconciliation pipeline
/// only transition status and recompute monetary fields.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Loan {
    /// Unique identifier for the loan.
    pub id: Uuid,
    /// Owning borrower.
    pub borrower_id: String,
    /// Requested principal.
    pub amount_requested: BigDecimal,
    /// Rate derived from the principal bracket, never independently set.
    pub interest_rate: f64,
    /// Principal plus interest.
    pub total_repayment: BigDecimal,
    /// Amount repaid to date.
    pub amount_paid: BigDecimal,
    /// total_repayment minus amount_paid.
    pub balance: BigDecimal,
    /// One of the fixed status set (stored lower-case).
    pub status: String,
    /// Raw due-date text carried over from the spreadsheet, if any.
    pub due_date: Option<String>,
    /// True when the record was created or last touched by a spreadsheet import.
    pub from_excel_import: bool,
    /// Timestamp of creation.
    pub created_at: DateTime<Utc>,
    /// Timestamp of last update.
    pub updated_at: DateTime<Utc>,
}

/// One uploaded reconciliation spreadsheet and its processing outcome.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ImportBatch {
    /// Unique identifier for the batch.
    pub id: Uuid,
    /// URL the uploaded file is reachable under.
    pub file_url: String,
    /// Upload timestamp.
    pub uploaded_at: DateTime<Utc>,
    /// Flips false -> true exactly once, on success or failure.
    pub processed: bool,
    /// Failure message attached when the run aborted.
    pub error_message: Option<String>,
}

// ============ Loan Status ============

/// Fixed loan lifecycle set governing permitted admin transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoanStatus {
    Processing,
    Approved,
    Active,
    Completed,
    Rejected,
    Overdue,
}

impl LoanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoanStatus::Processing => "processing",
            LoanStatus::Approved => "approved",
            LoanStatus::Active => "active",
            LoanStatus::Completed => "completed",
            LoanStatus::Rejected => "rejected",
            LoanStatus::Overdue => "overdue",
        }
    }

    /// Parse a status string (spreadsheet cells arrive already lower-cased,
    /// admin payloads may not be).
    pub fn parse(s: &str) -> Option<LoanStatus> {
        match s.trim().to_lowercase().as_str() {
            "processing" => Some(LoanStatus::Processing),
            "approved" => Some(LoanStatus::Approved),
            "active" => Some(LoanStatus::Active),
            "completed" => Some(LoanStatus::Completed),
            "rejected" => Some(LoanStatus::Rejected),
            "overdue" => Some(LoanStatus::Overdue),
            _ => None,
        }
    }

    /// Whether an admin may move a loan from `self` to `next`.
    ///
    /// completed and rejected are terminal.
    pub fn can_transition(&self, next: LoanStatus) -> bool {
        use LoanStatus::*;
        matches!(
            (self, next),
            (Processing, Approved)
                | (Processing, Rejected)
                | (Approved, Active)
                | (Active, Completed)
                | (Active, Overdue)
                | (Overdue, Active)
                | (Overdue, Completed)
        )
    }
}

impl std::fmt::Display for LoanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============ Request / Response DTOs ============

/// Body for POST /api/v1/loans/apply.
#[derive(Debug, Clone, Deserialize)]
pub struct LoanApplicationRequest {
    pub name: String,
    pub phone: String,
    pub bvn: Option<String>,
    pub email: Option<String>,
    pub amount_requested: f64,
}

/// Body for POST /api/v1/loans/:id/status.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusChangeRequest {
    pub status: String,
}

/// Query parameters for GET /api/v1/loans.
#[derive(Debug, Clone, Deserialize)]
pub struct LoanListParams {
    pub status: Option<String>,
    pub borrower_id: Option<String>,
}

/// Query parameters for GET /api/v1/calculator.
#[derive(Debug, Clone, Deserialize)]
pub struct CalculatorParams {
    pub amount: f64,
}

/// Response for GET /api/v1/calculator.
#[derive(Debug, Clone, Serialize)]
pub struct CalculatorResponse {
    pub amount: f64,
    pub interest_rate: f64,
    pub interest: f64,
    pub total_repayment: f64,
}

/// Storage-finalize event delivered to POST /api/v1/webhooks/storage.
///
/// Mirrors the fields a blob store includes in its object-finalize
/// notification; anything else in the payload is ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageEvent {
    /// Object path within the bucket, e.g. "repayments/1724900000000_august.xlsx".
    pub name: String,
    /// MIME type the object was stored with.
    #[serde(default)]
    pub content_type: Option<String>,
    /// URL the object can be downloaded from.
    #[serde(alias = "media_link")]
    pub url: String,
}

/// Per-status aggregate line in the portfolio report.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct PortfolioLine {
    pub status: String,
    pub loan_count: i64,
    pub total_requested: BigDecimal,
    pub total_repayment: BigDecimal,
    pub total_paid: BigDecimal,
    pub total_outstanding: BigDecimal,
}
