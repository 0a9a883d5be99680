//! Spreadsheet normalization
//!
//! Folds raw sheet values into header-keyed rows.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::debug;

use crate::cache::Row;
use crate::drive::ValueRange;

/// Sheet title of an A1 range such as `'Q1 ''24'!A1:C9` or `Prices!A1:B3`
pub fn sheet_name(range: &str) -> String {
    let name = range.rsplit_once('!').map_or(range, |(name, _)| name);
    match name
        .strip_prefix('\'')
        .and_then(|inner| inner.strip_suffix('\''))
    {
        Some(inner) => inner.replace("''", "'"),
        None => name.to_string(),
    }
}

fn cell_text(cell: &Value) -> String {
    match cell {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Treat the first row as the header and turn every later row into a map
/// from header cell to row cell, keeping row order.
///
/// Cells past the end of the header are dropped; short rows just lack the
/// trailing keys.
pub fn transform_rows(values: &[Vec<Value>]) -> Vec<Row> {
    let Some((header, rows)) = values.split_first() else {
        return Vec::new();
    };
    let keys: Vec<String> = header.iter().map(cell_text).collect();

    rows.iter()
        .map(|row| {
            keys.iter()
                .zip(row.iter())
                .map(|(key, cell)| (key.clone(), cell_text(cell)))
                .collect()
        })
        .collect()
}

/// Rows of every returned range, keyed by sheet title
pub fn fold_tables(ranges: Vec<ValueRange>) -> BTreeMap<String, Vec<Row>> {
    ranges
        .into_iter()
        .map(|range| {
            let name = sheet_name(&range.range);
            if range.values.is_empty() {
                debug!(sheet = %name, "Sheet has no values");
            }
            (name, transform_rows(&range.values))
        })
        .collect()
}
