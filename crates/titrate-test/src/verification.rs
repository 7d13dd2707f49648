//! Verification helpers for telemetry output
//!
//! Parses the CSV stream and checks column shape and number formatting.

use thiserror::Error;

/// Columns printed as fixed-point ratios.
const RATIO_COLUMNS: [&str; 2] = ["Throughput", "BufferPercentage"];

/// Decimal places of a ratio column.
const RATIO_DECIMALS: usize = 6;

/// CSV verification error types
#[derive(Error, Debug)]
pub enum CsvError {
    #[error("Telemetry stream is empty")]
    Empty,

    #[error("Header mismatch: expected '{expected}', got '{actual}'")]
    HeaderMismatch { expected: String, actual: String },

    #[error("Row {row} has {actual} columns, expected {expected}")]
    ColumnCount {
        row: usize,
        expected: usize,
        actual: usize,
    },

    #[error("Unknown column '{column}'")]
    UnknownColumn { column: String },

    #[error("Row {row}, column '{column}': cannot parse '{value}'")]
    BadValue {
        row: usize,
        column: String,
        value: String,
    },

    #[error("Row {row}, column '{column}': '{value}' is not formatted with 6 decimals")]
    Precision {
        row: usize,
        column: String,
        value: String,
    },
}

/// Result type for verification operations
pub type CsvResult<T> = Result<T, CsvError>;

/// A parsed telemetry stream.
#[derive(Debug, Clone)]
pub struct TelemetryCsv {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl TelemetryCsv {
    /// Parses `text`, requiring the first line to equal `expected_header`
    /// and every row to match its width and ratio formatting.
    pub fn parse(text: &str, expected_header: &str) -> CsvResult<Self> {
        let mut lines = text.lines();
        let header_line = lines.next().ok_or(CsvError::Empty)?;
        if header_line != expected_header {
            return Err(CsvError::HeaderMismatch {
                expected: expected_header.to_string(),
                actual: header_line.to_string(),
            });
        }

        let header: Vec<String> = header_line.split(',').map(str::to_string).collect();
        let mut rows = Vec::new();
        for (row, line) in lines.enumerate() {
            let fields: Vec<String> = line.split(',').map(str::to_string).collect();
            if fields.len() != header.len() {
                return Err(CsvError::ColumnCount {
                    row,
                    expected: header.len(),
                    actual: fields.len(),
                });
            }
            for (column, value) in header.iter().zip(&fields) {
                if RATIO_COLUMNS.contains(&column.as_str()) && !is_fixed_point(value) {
                    return Err(CsvError::Precision {
                        row,
                        column: column.clone(),
                        value: value.clone(),
                    });
                }
            }
            rows.push(fields);
        }

        Ok(Self { header, rows })
    }

    fn index(&self, column: &str) -> CsvResult<usize> {
        self.header
            .iter()
            .position(|c| c == column)
            .ok_or_else(|| CsvError::UnknownColumn {
                column: column.to_string(),
            })
    }

    /// Integer values of `column`, one per row.
    pub fn u64_column(&self, column: &str) -> CsvResult<Vec<u64>> {
        self.parsed_column(column)
    }

    /// Floating point values of `column`, one per row.
    pub fn f64_column(&self, column: &str) -> CsvResult<Vec<f64>> {
        self.parsed_column(column)
    }

    fn parsed_column<T: std::str::FromStr>(&self, column: &str) -> CsvResult<Vec<T>> {
        let index = self.index(column)?;
        self.rows
            .iter()
            .enumerate()
            .map(|(row, fields)| {
                fields[index].parse().map_err(|_| CsvError::BadValue {
                    row,
                    column: column.to_string(),
                    value: fields[index].clone(),
                })
            })
            .collect()
    }
}

fn is_fixed_point(value: &str) -> bool {
    match value.split_once('.') {
        Some((whole, fraction)) => {
            !whole.is_empty()
                && whole.trim_start_matches('-').chars().all(|c| c.is_ascii_digit())
                && fraction.len() == RATIO_DECIMALS
                && fraction.chars().all(|c| c.is_ascii_digit())
        }
        None => false,
    }
}
