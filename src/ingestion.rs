use csv::ReaderBuilder;
use serde::Serialize;

use crate::errors::{AppError, AppResult};

/// The column of place names a sheet is resolved from.
#[derive(Debug, Clone, Serialize)]
pub struct QueryColumn {
    pub heading: String,
    pub values: Vec<String>,
}

/// Reads the first column of a CSV sheet whose first row holds headings.
/// Values keep their row order, blanks included, so callers can map results
/// back onto rows.
pub fn read_query_column(bytes: &[u8]) -> AppResult<QueryColumn> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(bytes);

    let heading = reader
        .byte_headers()?
        .get(0)
        .map(|field| decode_field(field).trim_start_matches('\u{feff}').trim().to_string())
        .filter(|heading| !heading.is_empty())
        .ok_or_else(|| AppError::Parse("sheet has no heading row".into()))?;

    let mut values = Vec::new();
    for record in reader.byte_records() {
        let record = record?;
        values.push(record.get(0).map(decode_field).unwrap_or_default());
    }

    Ok(QueryColumn { heading, values })
}

fn decode_field(field: &[u8]) -> String {
    String::from_utf8_lossy(field).into_owned()
}
