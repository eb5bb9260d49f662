//! Spreadsheet decoding and row normalization.
//!
//! Repayment sheets arrive from many admins and no two agree on column
//! naming, so headers are matched by substring rather than exact name. The
//! first row is always treated as headers; only the first sheet of an Excel
//! workbook is read. Header matching is case-insensitive and evaluated in a
//! fixed priority order, first match wins per column. Headers that match
//! nothing are carried through verbatim so no uploaded data is dropped.

use crate::errors::AppError;
use calamine::{open_workbook_auto_from_rs, Data, Reader};
use serde_json::{json, Map, Value};
use std::io::Cursor;

/// A single cell after decoding, independent of the source format.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Empty,
    Text(String),
    Number(f64),
    Bool(bool),
}

impl Cell {
    pub fn is_empty(&self) -> bool {
        match self {
            Cell::Empty => true,
            Cell::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    /// Coerce the cell to a string. Numeric cells with no fractional part
    /// print without one, so a phone or bvn typed as a number round-trips as
    /// "8011112222" rather than "8011112222.0".
    pub fn to_text(&self) -> Option<String> {
        match self {
            Cell::Empty => None,
            Cell::Text(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed.to_string())
                }
            }
            Cell::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 9.0e15 {
                    Some(format!("{}", *n as i64))
                } else {
                    Some(format!("{}", n))
                }
            }
            Cell::Bool(b) => Some(b.to_string()),
        }
    }

    /// Coerce the cell to a number. Non-numeric text yields None, which
    /// downstream treats the same as an absent cell (no range checking here).
    pub fn to_number(&self) -> Option<f64> {
        match self {
            Cell::Empty => None,
            Cell::Number(n) => Some(*n),
            Cell::Text(s) => s.trim().parse::<f64>().ok(),
            Cell::Bool(_) => None,
        }
    }

    fn to_json(&self) -> Value {
        match self {
            Cell::Empty => Value::Null,
            Cell::Text(s) => json!(s.trim()),
            Cell::Number(n) => json!(n),
            Cell::Bool(b) => json!(b),
        }
    }
}

impl From<&Data> for Cell {
    fn from(data: &Data) -> Self {
        match data {
            Data::Empty => Cell::Empty,
            Data::String(s) => Cell::Text(s.clone()),
            Data::Float(f) => Cell::Number(*f),
            Data::Int(i) => Cell::Number(*i as f64),
            Data::Bool(b) => Cell::Bool(*b),
            Data::DateTime(dt) => Cell::Number(dt.as_f64()),
            Data::DateTimeIso(s) | Data::DurationIso(s) => Cell::Text(s.clone()),
            Data::Error(e) => Cell::Text(format!("{:?}", e)),
        }
    }
}

/// Canonical fields a header can map to.
#[derive(Debug, Clone, PartialEq)]
enum Field {
    Name,
    Phone,
    Bvn,
    AmountRequested,
    AmountPaid,
    Balance,
    DueDate,
    Status,
    /// Unmatched header, preserved verbatim.
    PassThrough(String),
}

/// Classify a header (already lower-cased and trimmed). Patterns are tried
/// in a fixed priority order; the first substring hit wins.
fn classify_header(header: &str) -> Field {
    const PATTERNS: [(&str, fn() -> Field); 8] = [
        ("name", || Field::Name),
        ("phone", || Field::Phone),
        ("bvn", || Field::Bvn),
        ("amount granted", || Field::AmountRequested),
        ("amount paid", || Field::AmountPaid),
        ("balance", || Field::Balance),
        ("due date", || Field::DueDate),
        ("status", || Field::Status),
    ];

    for (pattern, field) in PATTERNS {
        if header.contains(pattern) {
            return field();
        }
    }
    Field::PassThrough(header.to_string())
}

/// One data row mapped into the canonical field set.
#[derive(Debug, Clone, Default)]
pub struct NormalizedRow {
    pub name: Option<String>,
    pub phone: Option<String>,
    pub bvn: Option<String>,
    pub amount_requested: Option<f64>,
    pub amount_paid: Option<f64>,
    pub balance: Option<f64>,
    pub due_date: Option<String>,
    pub status: Option<String>,
    /// Cells under unmatched headers, keyed by the raw header text.
    pub extra: Map<String, Value>,
}

impl NormalizedRow {
    /// A row with no bvn, phone, or name cannot be resolved to a borrower.
    pub fn has_borrower_key(&self) -> bool {
        self.bvn.is_some() || self.phone.is_some() || self.name.is_some()
    }
}

/// Result of mapping a decoded grid.
#[derive(Debug, Default)]
pub struct MappedRows {
    pub rows: Vec<NormalizedRow>,
    /// Data rows dropped because no borrower key was present.
    pub skipped: usize,
}

/// Map a decoded grid (first row = headers) into normalized rows.
///
/// Rows without any borrower key are skipped with a warning; they are never
/// fatal to the file.
pub fn map_rows(grid: &[Vec<Cell>]) -> MappedRows {
    let Some((header_row, data_rows)) = grid.split_first() else {
        return MappedRows::default();
    };

    let fields: Vec<Field> = header_row
        .iter()
        .map(|cell| {
            let header = cell.to_text().unwrap_or_default().to_lowercase();
            classify_header(header.trim())
        })
        .collect();

    let mut mapped = MappedRows::default();

    for (row_idx, cells) in data_rows.iter().enumerate() {
        // Only rows of literal empty cells skip silently; whitespace-only
        // text still reaches the key check and is counted as unresolvable.
        if cells.iter().all(|cell| matches!(cell, Cell::Empty)) {
            continue;
        }

        let mut row = NormalizedRow::default();
        for (field, cell) in fields.iter().zip(cells.iter()) {
            match field {
                Field::Name => row.name = cell.to_text().or(row.name.take()),
                Field::Phone => row.phone = cell.to_text().or(row.phone.take()),
                Field::Bvn => row.bvn = cell.to_text().or(row.bvn.take()),
                Field::AmountRequested => {
                    row.amount_requested = cell.to_number().or(row.amount_requested.take())
                }
                Field::AmountPaid => {
                    row.amount_paid = cell.to_number().or(row.amount_paid.take())
                }
                Field::Balance => row.balance = cell.to_number().or(row.balance.take()),
                Field::DueDate => row.due_date = cell.to_text().or(row.due_date.take()),
                Field::Status => {
                    row.status = cell
                        .to_text()
                        .map(|s| s.to_lowercase())
                        .or(row.status.take())
                }
                Field::PassThrough(header) => {
                    if !cell.is_empty() {
                        row.extra.insert(header.clone(), cell.to_json());
                    }
                }
            }
        }

        if row.has_borrower_key() {
            mapped.rows.push(row);
        } else {
            // Row 1 of the sheet is the header row, hence + 2.
            tracing::warn!(
                "Skipping row {}: no bvn, phone, or name to resolve a borrower",
                row_idx + 2
            );
            mapped.skipped += 1;
        }
    }

    mapped
}

/// Decode an uploaded payload into a cell grid.
///
/// CSV is detected by content type or file extension; everything else goes
/// through calamine's auto-detection (xlsx, xls, ods). Only the first sheet
/// of a workbook is read.
pub fn decode(
    bytes: &[u8],
    content_type: Option<&str>,
    object_name: &str,
) -> Result<Vec<Vec<Cell>>, AppError> {
    let is_csv = content_type
        .map(|ct| ct.contains("csv") || ct.starts_with("text/"))
        .unwrap_or(false)
        || object_name.to_lowercase().ends_with(".csv");

    if is_csv {
        decode_csv(bytes)
    } else {
        decode_workbook(bytes)
    }
}

fn decode_csv(bytes: &[u8]) -> Result<Vec<Vec<Cell>>, AppError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(bytes);

    let mut grid = Vec::new();
    for record in reader.records() {
        let record = record?;
        // CSV is untyped; keeping cells as text preserves leading zeros in
        // phone numbers. Numeric fields coerce later via to_number.
        let row = record
            .iter()
            .map(|value| {
                let trimmed = value.trim();
                if trimmed.is_empty() {
                    Cell::Empty
                } else {
                    Cell::Text(trimmed.to_string())
                }
            })
            .collect();
        grid.push(row);
    }
    Ok(grid)
}

fn decode_workbook(bytes: &[u8]) -> Result<Vec<Vec<Cell>>, AppError> {
    let cursor = Cursor::new(bytes.to_vec());
    let mut workbook = open_workbook_auto_from_rs(cursor)
        .map_err(|e| AppError::SpreadsheetError(format!("Failed to open workbook: {}", e)))?;

    let sheet_name = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or_else(|| AppError::SpreadsheetError("Workbook has no sheets".to_string()))?;

    let range = workbook
        .worksheet_range(&sheet_name)
        .map_err(|e| AppError::SpreadsheetError(format!("Failed to read sheet: {}", e)))?;

    Ok(range
        .rows()
        .map(|row| row.iter().map(Cell::from).collect())
        .collect())
}

/// Decode and map in one step; the pipeline entry point.
pub fn parse(
    bytes: &[u8],
    content_type: Option<&str>,
    object_name: &str,
) -> Result<MappedRows, AppError> {
    let grid = decode(bytes, content_type, object_name)?;
    Ok(map_rows(&grid))
}
