//! Cooperative lending API library.
//!
//! Core functionality for the coopcredit service: the repayment-spreadsheet
//! reconciliation pipeline, borrower/loan persistence, interest math shared
//! across every calculation path, and the HTTP handlers around them.
//!
//! # Modules
//!
//! - `config`: Configuration management.
//! - `db`: Database connection, pool management, migrations.
//! - `errors`: Error handling types.
//! - `handlers`: HTTP request handlers.
//! - `interest`: Bracketed interest schedule and money conversion.
//! - `loan_store`: Database access for borrowers, loans, import batches.
//! - `models`: Core data models.
//! - `reconcile`: Spreadsheet reconciliation pipeline.
//! - `sheet`: Spreadsheet decoding and header normalization.
//! - `storage`: Upload store and file download.
//! - `storage_webhook`: Storage-finalize trigger handler.

pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod interest;
pub mod loan_store;
pub mod models;
pub mod reconcile;
pub mod sheet;
pub mod storage;
pub mod storage_webhook;
