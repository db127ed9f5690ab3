//! Per-batch normalization ahead of the bulk insert.
//!
//! Date columns arrive as `YYYYMMDD`. The sentinels `00000000` and `0` mean
//! "no date"; anything else that does not parse is stored as null as well and
//! counted. Every other value passes through unchanged.
//!
//! The normalized batch is encoded as CSV for `COPY ... WITH (FORMAT csv)`:
//! dates become `YYYY-MM-DD` and missing values become empty unquoted fields,
//! which the store reads as null.

use crate::error::AppError;
use crate::layout::Layout;
use chrono::NaiveDate;

/// Classification of a raw date field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateField {
    Valid(NaiveDate),
    /// Empty value or one of the publisher's "no date" sentinels.
    Missing,
    /// Malformed value coerced to null.
    Coerced,
}

impl DateField {
    pub fn parse(raw: &str) -> Self {
        let value = raw.trim();
        if value.is_empty() || value == "0" || value == "00000000" {
            return DateField::Missing;
        }
        if value.len() != 8 || !value.bytes().all(|b| b.is_ascii_digit()) {
            return DateField::Coerced;
        }
        match NaiveDate::parse_from_str(value, "%Y%m%d") {
            Ok(date) => DateField::Valid(date),
            Err(_) => DateField::Coerced,
        }
    }

    pub fn date(self) -> Option<NaiveDate> {
        match self {
            DateField::Valid(date) => Some(date),
            DateField::Missing | DateField::Coerced => None,
        }
    }
}

/// Parses a `YYYYMMDD` value, mapping sentinels and malformed input to `None`.
///
/// # Examples
///
/// ```
/// use chrono::NaiveDate;
/// use receita_core::normalize::normalize_date;
///
/// assert_eq!(normalize_date("20220115"), NaiveDate::from_ymd_opt(2022, 1, 15));
/// assert_eq!(normalize_date("00000000"), None);
/// assert_eq!(normalize_date("202214XX"), None);
/// ```
pub fn normalize_date(raw: &str) -> Option<NaiveDate> {
    DateField::parse(raw).date()
}

/// A batch ready for the bulk insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedBatch {
    /// CSV payload, one record per row, in source order.
    pub payload: Vec<u8>,
    pub rows: usize,
    pub dates_coerced: u64,
}

/// Normalizes `rows` against `layout` and encodes them for the bulk insert.
///
/// Rows must already have the layout's width.
pub fn normalize_batch(layout: &Layout, rows: &[Vec<String>]) -> Result<NormalizedBatch, AppError> {
    let date_positions = layout.date_positions();
    let mut dates_coerced = 0u64;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::with_capacity(rows.len() * layout.width() * 8));
    let mut record: Vec<String> = Vec::with_capacity(layout.width());

    for row in rows {
        record.clear();
        record.extend(row.iter().cloned());
        for &pos in &date_positions {
            let field = DateField::parse(&record[pos]);
            if field == DateField::Coerced {
                dates_coerced += 1;
            }
            record[pos] = field
                .date()
                .map(|d| d.format("%Y-%m-%d").to_string())
                .unwrap_or_default();
        }
        writer
            .write_record(&record)
            .map_err(|e| AppError::Generic(format!("cannot encode batch: {}", e)))?;
    }

    let payload = writer
        .into_inner()
        .map_err(|e| AppError::Generic(format!("cannot encode batch: {}", e)))?;

    Ok(NormalizedBatch {
        payload,
        rows: rows.len(),
        dates_coerced,
    })
}
