/// Store-level tests for the reconciliation pipeline: borrower-key
/// precedence, most-recent-loan targeting, the idempotency guard, failure
/// recording, and the in-flight claim — all against an in-memory store.
use chrono::{Duration, Utc};
use coopcredit_api::errors::AppError;
use coopcredit_api::interest;
use coopcredit_api::loan_store::LoanWrite;
use coopcredit_api::models::{Borrower, ImportBatch, Loan, NOT_AVAILABLE};
use coopcredit_api::reconcile::{
    self, batch_guard, claim_in_flight, reconcile_rows, record_failure, BatchGuard,
    ImportStats, ReconcileStore,
};
use coopcredit_api::sheet::NormalizedRow;
use moka::future::Cache;
use uuid::Uuid;

/// In-memory stand-in for the persistence layer. Tracks every mutation so
/// tests can assert that guarded paths stay write-free.
#[derive(Default)]
struct MemoryStore {
    borrowers: Vec<Borrower>,
    loans: Vec<Loan>,
    batches: Vec<ImportBatch>,
    writes: usize,
    fail_batch_marks: bool,
}

impl MemoryStore {
    fn seed_borrower(&mut self, id: &str, name: &str, phone: &str, bvn: &str) {
        self.borrowers.push(Borrower {
            id: id.to_string(),
            name: name.to_string(),
            phone: phone.to_string(),
            bvn: bvn.to_string(),
            email: NOT_AVAILABLE.to_string(),
            created_at: Utc::now(),
        });
    }

    fn seed_loan(&mut self, borrower_id: &str, amount: f64, age: Duration) -> Uuid {
        let id = Uuid::new_v4();
        let total = interest::total_repayment(amount);
        self.loans.push(Loan {
            id,
            borrower_id: borrower_id.to_string(),
            amount_requested: interest::money(amount),
            interest_rate: interest::rate(amount),
            total_repayment: interest::money(total),
            amount_paid: interest::money(0.0),
            balance: interest::money(total),
            status: "active".to_string(),
            due_date: None,
            from_excel_import: true,
            created_at: Utc::now() - age,
            updated_at: Utc::now() - age,
        });
        id
    }

    fn seed_batch(&mut self, url: &str, processed: bool) -> Uuid {
        let id = Uuid::new_v4();
        self.batches.push(ImportBatch {
            id,
            file_url: url.to_string(),
            uploaded_at: Utc::now(),
            processed,
            error_message: None,
        });
        id
    }
}

impl ReconcileStore for MemoryStore {
    async fn find_batch_by_url(&mut self, url: &str) -> Result<Option<ImportBatch>, AppError> {
        Ok(self.batches.iter().find(|b| b.file_url == url).cloned())
    }

    async fn mark_batch_processed(
        &mut self,
        batch_id: Uuid,
        error_message: Option<&str>,
    ) -> Result<(), AppError> {
        if self.fail_batch_marks {
            return Err(AppError::InternalError("marking unavailable".to_string()));
        }
        if let Some(batch) = self.batches.iter_mut().find(|b| b.id == batch_id) {
            batch.processed = true;
            batch.error_message = error_message.map(str::to_string);
        }
        self.writes += 1;
        Ok(())
    }

    async fn find_borrower_by_bvn(&mut self, bvn: &str) -> Result<Option<Borrower>, AppError> {
        Ok(self.borrowers.iter().find(|b| b.bvn == bvn).cloned())
    }

    async fn find_borrower_by_phone(
        &mut self,
        phone: &str,
    ) -> Result<Option<Borrower>, AppError> {
        Ok(self.borrowers.iter().find(|b| b.phone == phone).cloned())
    }

    async fn find_borrower_by_name(&mut self, name: &str) -> Result<Option<Borrower>, AppError> {
        Ok(self.borrowers.iter().find(|b| b.name == name).cloned())
    }

    async fn insert_borrower(
        &mut self,
        id: &str,
        name: Option<&str>,
        phone: Option<&str>,
        bvn: Option<&str>,
        email: Option<&str>,
    ) -> Result<Borrower, AppError> {
        let borrower = Borrower {
            id: id.to_string(),
            name: name.unwrap_or(NOT_AVAILABLE).to_string(),
            phone: phone.unwrap_or(NOT_AVAILABLE).to_string(),
            bvn: bvn.unwrap_or(NOT_AVAILABLE).to_string(),
            email: email.unwrap_or(NOT_AVAILABLE).to_string(),
            created_at: Utc::now(),
        };
        self.borrowers.push(borrower.clone());
        self.writes += 1;
        Ok(borrower)
    }

    async fn latest_loan(&mut self, borrower_id: &str) -> Result<Option<Loan>, AppError> {
        Ok(self
            .loans
            .iter()
            .filter(|l| l.borrower_id == borrower_id)
            .max_by_key(|l| l.created_at)
            .cloned())
    }

    async fn insert_loan(
        &mut self,
        borrower_id: &str,
        write: &LoanWrite,
        from_import: bool,
    ) -> Result<Uuid, AppError> {
        let id = Uuid::new_v4();
        self.loans.push(Loan {
            id,
            borrower_id: borrower_id.to_string(),
            amount_requested: interest::money(write.amount_requested),
            interest_rate: write.interest_rate,
            total_repayment: interest::money(write.total_repayment),
            amount_paid: interest::money(write.amount_paid),
            balance: interest::money(write.balance),
            status: write.status.clone(),
            due_date: write.due_date.clone(),
            from_excel_import: from_import,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        });
        self.writes += 1;
        Ok(id)
    }

    async fn update_imported_loan(
        &mut self,
        loan_id: Uuid,
        write: &LoanWrite,
    ) -> Result<(), AppError> {
        if let Some(loan) = self.loans.iter_mut().find(|l| l.id == loan_id) {
            loan.amount_requested = interest::money(write.amount_requested);
            loan.interest_rate = write.interest_rate;
            loan.total_repayment = interest::money(write.total_repayment);
            loan.amount_paid = interest::money(write.amount_paid);
            loan.balance = interest::money(write.balance);
            loan.status = write.status.clone();
            if let Some(due) = &write.due_date {
                loan.due_date = Some(due.clone());
            }
            loan.from_excel_import = true;
            loan.updated_at = Utc::now();
        }
        self.writes += 1;
        Ok(())
    }
}

fn row(bvn: Option<&str>, phone: Option<&str>, name: Option<&str>, paid: f64) -> NormalizedRow {
    NormalizedRow {
        bvn: bvn.map(str::to_string),
        phone: phone.map(str::to_string),
        name: name.map(str::to_string),
        amount_paid: Some(paid),
        ..Default::default()
    }
}

#[cfg(test)]
mod resolution_tests {
    use super::*;

    #[tokio::test]
    async fn test_bvn_match_wins_over_a_phone_match_on_another_borrower() {
        let mut store = MemoryStore::default();
        store.seed_borrower("22334455667", "Jane Doe", "08011112222", "22334455667");
        store.seed_borrower("08099998888", "Ada Obi", "08099998888", NOT_AVAILABLE);

        // The row carries Jane's bvn but Ada's phone; bvn must decide.
        let rows = vec![row(
            Some("22334455667"),
            Some("08099998888"),
            Some("Jane Doe"),
            5_000.0,
        )];
        let mut stats = ImportStats::default();
        reconcile_rows(&mut store, &rows, &mut stats).await.unwrap();

        assert_eq!(stats.borrowers_created, 0);
        assert_eq!(store.borrowers.len(), 2);
        assert_eq!(stats.loans_created, 1);
        assert_eq!(store.loans[0].borrower_id, "22334455667");
    }

    #[tokio::test]
    async fn test_reconciliation_targets_the_most_recent_loan() {
        let mut store = MemoryStore::default();
        store.seed_borrower("22334455667", "Jane Doe", "08011112222", "22334455667");
        let older = store.seed_loan("22334455667", 40_000.0, Duration::days(60));
        let newer = store.seed_loan("22334455667", 100_000.0, Duration::days(1));

        let rows = vec![row(Some("22334455667"), None, None, 20_000.0)];
        let mut stats = ImportStats::default();
        reconcile_rows(&mut store, &rows, &mut stats).await.unwrap();

        // The newer loan is updated in place; the older one stays untouched
        // and no third loan appears.
        assert_eq!(stats.loans_updated, 1);
        assert_eq!(stats.loans_created, 0);
        assert_eq!(store.loans.len(), 2);

        let updated = store.loans.iter().find(|l| l.id == newer).unwrap();
        assert_eq!(updated.amount_paid, interest::money(20_000.0));
        assert_eq!(updated.balance, interest::money(90_000.0));

        let untouched = store.loans.iter().find(|l| l.id == older).unwrap();
        assert_eq!(untouched.amount_paid, interest::money(0.0));
    }
}

#[cfg(test)]
mod idempotency_tests {
    use super::*;

    #[tokio::test]
    async fn test_processed_batch_skips_with_zero_writes() {
        let url = "http://localhost:3000/files/repayments/aug.csv";
        let mut store = MemoryStore::default();
        store.seed_borrower("22334455667", "Jane Doe", "08011112222", "22334455667");
        store.seed_batch(url, true);

        let guard = batch_guard(&mut store, url).await.unwrap();
        match guard {
            BatchGuard::Skip => {}
            BatchGuard::Proceed(_) => panic!("processed batch must not proceed"),
        }

        // The rows that would have been written never touch the store.
        assert_eq!(store.writes, 0);
        assert!(store.loans.is_empty());
    }

    #[tokio::test]
    async fn test_unprocessed_batch_proceeds_with_its_record() {
        let url = "http://localhost:3000/files/repayments/sep.csv";
        let mut store = MemoryStore::default();
        let batch_id = store.seed_batch(url, false);

        match batch_guard(&mut store, url).await.unwrap() {
            BatchGuard::Proceed(Some(batch)) => assert_eq!(batch.id, batch_id),
            other => panic!("expected Proceed with the batch record, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_batch_record_still_proceeds() {
        let mut store = MemoryStore::default();
        match batch_guard(&mut store, "http://nowhere/repayments/x.csv")
            .await
            .unwrap()
        {
            BatchGuard::Proceed(None) => {}
            other => panic!("expected Proceed without a record, got {:?}", other),
        }
    }
}

#[cfg(test)]
mod failure_recording_tests {
    use super::*;

    #[tokio::test]
    async fn test_failure_message_lands_on_the_batch() {
        let url = "http://localhost:3000/files/repayments/bad.csv";
        let mut store = MemoryStore::default();
        let batch_id = store.seed_batch(url, false);
        let batch = store.batches[0].clone();

        let original = AppError::SpreadsheetError("Workbook has no sheets".to_string());
        record_failure(&mut store, Some(&batch), original).await;

        let marked = store.batches.iter().find(|b| b.id == batch_id).unwrap();
        assert!(marked.processed);
        assert!(marked
            .error_message
            .as_deref()
            .unwrap()
            .contains("Workbook has no sheets"));
    }

    #[tokio::test]
    async fn test_marking_failure_never_replaces_the_original_error() {
        let url = "http://localhost:3000/files/repayments/bad.csv";
        let mut store = MemoryStore::default();
        store.seed_batch(url, false);
        store.fail_batch_marks = true;
        let batch = store.batches[0].clone();

        let original = AppError::SpreadsheetError("Workbook has no sheets".to_string());
        let returned = record_failure(&mut store, Some(&batch), original).await;

        match returned {
            AppError::SpreadsheetError(msg) => assert_eq!(msg, "Workbook has no sheets"),
            other => panic!("original error was replaced by {:?}", other),
        }
    }
}

#[cfg(test)]
mod in_flight_tests {
    use super::*;

    #[tokio::test]
    async fn test_in_flight_claim_is_exclusive_until_released() {
        let cache: Cache<String, i64> = Cache::builder().max_capacity(10).build();
        let url = "http://localhost:3000/files/repayments/aug.csv";

        let (first, second) = tokio::join!(
            claim_in_flight(&cache, url),
            claim_in_flight(&cache, url),
        );
        assert!(first != second, "exactly one claimant must win");

        cache.invalidate(&url.to_string()).await;
        assert!(claim_in_flight(&cache, url).await);
    }

    #[tokio::test]
    async fn test_distinct_files_claim_independently() {
        let cache: Cache<String, i64> = Cache::builder().max_capacity(10).build();
        assert!(claim_in_flight(&cache, "repayments/a.csv").await);
        assert!(claim_in_flight(&cache, "repayments/b.csv").await);
        assert!(!reconcile::claim_in_flight(&cache, "repayments/a.csv").await);
    }
}
