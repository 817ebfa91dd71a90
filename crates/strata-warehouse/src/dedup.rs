//! Dedup Resolver: keeps the most recently loaded row for each key.

use std::cmp::Ordering;

use strata_core::{RecordBatch, Value};
use tracing::{debug, warn};

use crate::WarehouseError;

/// Returns one row per distinct `primary_key` value: the one with the greatest
/// `load_marker`, the last such row in input order on ties. Rows without a key
/// are dropped. Output is ordered by key.
pub fn resolve(
    batch: RecordBatch,
    primary_key: &str,
    load_marker: &str,
) -> Result<RecordBatch, WarehouseError> {
    let key = batch
        .column_index(primary_key)
        .ok_or_else(|| WarehouseError::UnknownColumn(primary_key.to_string()))?;
    let marker = batch
        .column_index(load_marker)
        .ok_or_else(|| WarehouseError::UnknownColumn(load_marker.to_string()))?;

    let columns = batch.columns().to_vec();
    let mut rows = batch.into_rows();
    let incoming = rows.len();
    rows.retain(|row| !row[key].is_null());
    let keyless = incoming - rows.len();
    if keyless > 0 {
        warn!(primary_key, rows = keyless, "dropping rows without a key value");
    }

    // stable, so equal (key, marker) pairs keep their input order
    rows.sort_by(|a, b| {
        a[key]
            .total_cmp(&b[key])
            .then_with(|| a[marker].total_cmp(&b[marker]))
    });

    let mut latest: Vec<Vec<Value>> = Vec::with_capacity(rows.len());
    for row in rows {
        match latest.last_mut() {
            Some(last) if last[key].total_cmp(&row[key]) == Ordering::Equal => *last = row,
            _ => latest.push(row),
        }
    }

    debug!(
        primary_key,
        incoming,
        kept = latest.len(),
        "resolved duplicate keys"
    );
    Ok(RecordBatch::from_rows(columns, latest)?)
}
