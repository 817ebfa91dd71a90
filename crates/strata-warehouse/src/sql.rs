//! SQL text builders and value marshalling between [`Value`] and SQLite.
//!
//! Every identifier goes through [`quote_ident`], so column names that collide
//! with SQL keywords (`index`, `order`, `group`) stay usable.

use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Column, Executor, Row, Sqlite, SqliteConnection, Statement, TypeInfo, ValueRef};
use strata_core::{RecordBatch, Value, TIMESTAMP_FORMAT};

use crate::WarehouseError;

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn column_list(columns: &[&str]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn create_table(
    table: &str,
    columns: &[(&str, &str)],
    primary_key: Option<&str>,
    if_not_exists: bool,
) -> String {
    let mut defs: Vec<String> = columns
        .iter()
        .map(|(name, sql_type)| {
            if sql_type.is_empty() {
                quote_ident(name)
            } else {
                format!("{} {sql_type}", quote_ident(name))
            }
        })
        .collect();
    if let Some(key) = primary_key {
        defs.push(format!("PRIMARY KEY ({})", quote_ident(key)));
    }
    format!(
        "CREATE TABLE {}{} ({})",
        if if_not_exists { "IF NOT EXISTS " } else { "" },
        quote_ident(table),
        defs.join(", ")
    )
}

pub fn drop_table(table: &str) -> String {
    format!("DROP TABLE {}", quote_ident(table))
}

pub fn drop_table_if_exists(table: &str) -> String {
    format!("DROP TABLE IF EXISTS {}", quote_ident(table))
}

pub fn rename_table(from: &str, to: &str) -> String {
    format!(
        "ALTER TABLE {} RENAME TO {}",
        quote_ident(from),
        quote_ident(to)
    )
}

pub fn delete_all(table: &str) -> String {
    format!("DELETE FROM {}", quote_ident(table))
}

pub fn count_rows(table: &str) -> String {
    format!("SELECT COUNT(*) FROM {}", quote_ident(table))
}

pub fn insert_values(table: &str, columns: &[&str]) -> String {
    let placeholders = vec!["?"; columns.len()].join(", ");
    format!(
        "INSERT INTO {} ({}) VALUES ({placeholders})",
        quote_ident(table),
        column_list(columns)
    )
}

pub fn insert_select(target: &str, source: &str, columns: &[&str]) -> String {
    let list = column_list(columns);
    format!(
        "INSERT INTO {} ({list}) SELECT {list} FROM {}",
        quote_ident(target),
        quote_ident(source)
    )
}

/// `INSERT .. SELECT .. ON CONFLICT (key) DO UPDATE` over every non-key column.
/// The `WHERE true` keeps SQLite from reading `ON` as a join constraint.
pub fn upsert_select(target: &str, source: &str, columns: &[&str], key: &str) -> String {
    let list = column_list(columns);
    let updates: Vec<String> = columns
        .iter()
        .filter(|c| **c != key)
        .map(|c| format!("{0} = excluded.{0}", quote_ident(c)))
        .collect();
    let action = if updates.is_empty() {
        "NOTHING".to_string()
    } else {
        format!("UPDATE SET {}", updates.join(", "))
    };
    format!(
        "INSERT INTO {} ({list}) SELECT {list} FROM {} WHERE true ON CONFLICT ({}) DO {action}",
        quote_ident(target),
        quote_ident(source),
        quote_ident(key)
    )
}

pub fn bind_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &'q Value,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Integer(v) => query.bind(*v),
        Value::Real(v) => query.bind(*v),
        Value::Boolean(v) => query.bind(*v),
        Value::Text(v) => query.bind(v.as_str()),
        Value::Timestamp(v) => query.bind(v.format(TIMESTAMP_FORMAT).to_string()),
    }
}

fn decode_cell(row: &SqliteRow, idx: usize) -> Result<Value, sqlx::Error> {
    let type_name = {
        let raw = row.try_get_raw(idx)?;
        if raw.is_null() {
            return Ok(Value::Null);
        }
        raw.type_info().name().to_ascii_uppercase()
    };
    Ok(match type_name.as_str() {
        "INTEGER" | "INT" | "BIGINT" | "BOOLEAN" => Value::Integer(row.try_get_unchecked(idx)?),
        "REAL" => Value::Real(row.try_get_unchecked(idx)?),
        "BLOB" => Value::Text(hex::encode(row.try_get_unchecked::<Vec<u8>, _>(idx)?)),
        _ => Value::Text(row.try_get_unchecked(idx)?),
    })
}

/// Runs a read query and collects the result set, column names included even
/// when no row comes back.
pub async fn fetch_batch(
    conn: &mut SqliteConnection,
    statement: &str,
) -> Result<RecordBatch, WarehouseError> {
    let columns: Vec<String> = {
        let prepared = (&mut *conn).prepare(statement).await?;
        prepared
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect()
    };
    let rows = sqlx::query(statement).fetch_all(&mut *conn).await?;
    let values = rows
        .iter()
        .map(|row| (0..columns.len()).map(|idx| decode_cell(row, idx)).collect())
        .collect::<Result<Vec<Vec<Value>>, sqlx::Error>>()?;
    Ok(RecordBatch::from_rows(columns, values)?)
}
