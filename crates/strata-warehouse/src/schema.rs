//! Table Schema Manager: typed column definitions, lazy table creation and the
//! primary-key retrofit.

use std::fmt;

use sqlx::{Connection, SqliteConnection};
use strata_core::{RecordBatch, Value};
use tracing::{debug, info, warn};

use crate::sql;
use crate::WarehouseError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Real,
    Text,
    Boolean,
    Timestamp,
}

impl ColumnType {
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnType::Integer => "INTEGER",
            ColumnType::Real => "REAL",
            ColumnType::Text => "TEXT",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Timestamp => "TIMESTAMP",
        }
    }

    /// Maps a declared SQL type back to a column type; `None` for types this
    /// pipeline never declares.
    pub fn from_declared(declared: &str) -> Option<Self> {
        match declared.trim().to_ascii_uppercase().as_str() {
            "INTEGER" | "INT" | "BIGINT" => Some(ColumnType::Integer),
            "REAL" | "FLOAT" | "DOUBLE" => Some(ColumnType::Real),
            "TEXT" => Some(ColumnType::Text),
            "BOOLEAN" => Some(ColumnType::Boolean),
            "TIMESTAMP" | "DATETIME" => Some(ColumnType::Timestamp),
            _ => None,
        }
    }

    fn of(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Integer(_) => Some(ColumnType::Integer),
            Value::Real(_) => Some(ColumnType::Real),
            Value::Boolean(_) => Some(ColumnType::Boolean),
            Value::Text(_) => Some(ColumnType::Text),
            Value::Timestamp(_) => Some(ColumnType::Timestamp),
        }
    }

    fn widen(self, other: ColumnType) -> ColumnType {
        match (self, other) {
            (a, b) if a == b => a,
            (ColumnType::Integer, ColumnType::Real) | (ColumnType::Real, ColumnType::Integer) => {
                ColumnType::Real
            }
            _ => ColumnType::Text,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.sql_type())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
}

/// Explicit column set shared by the staging and master writes of one merge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableSchema {
    pub columns: Vec<ColumnDef>,
}

impl TableSchema {
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn sql_columns(&self) -> Vec<(&str, &str)> {
        self.columns
            .iter()
            .map(|c| (c.name.as_str(), c.column_type.sql_type()))
            .collect()
    }
}

/// Derives column types from the values present in the batch. Integers mixed
/// with reals widen to `Real`; any other mix, or a column of nulls, is `Text`.
pub fn infer_schema(batch: &RecordBatch) -> TableSchema {
    let columns = batch
        .columns()
        .iter()
        .enumerate()
        .map(|(idx, name)| {
            let inferred = batch
                .rows()
                .iter()
                .filter_map(|row| ColumnType::of(&row[idx]))
                .reduce(ColumnType::widen);
            ColumnDef {
                name: name.clone(),
                column_type: inferred.unwrap_or(ColumnType::Text),
            }
        })
        .collect();
    TableSchema { columns }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub declared_type: String,
    pub primary_key: bool,
}

/// Live shape of a stored table, read through `pragma_table_info`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
}

impl TableInfo {
    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn primary_key_columns(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.as_str())
            .collect()
    }
}

pub async fn describe_table(
    conn: &mut SqliteConnection,
    table: &str,
) -> Result<Option<TableInfo>, WarehouseError> {
    let rows: Vec<(String, String, i64)> =
        sqlx::query_as("SELECT name, type, pk FROM pragma_table_info(?) ORDER BY cid")
            .bind(table)
            .fetch_all(&mut *conn)
            .await?;
    if rows.is_empty() {
        return Ok(None);
    }
    Ok(Some(TableInfo {
        name: table.to_string(),
        columns: rows
            .into_iter()
            .map(|(name, declared_type, pk)| ColumnInfo {
                name,
                declared_type,
                primary_key: pk > 0,
            })
            .collect(),
    }))
}

/// Creates the table when absent. An existing table is left as it is, drift included.
pub async fn ensure_table(
    conn: &mut SqliteConnection,
    table: &str,
    schema: &TableSchema,
) -> Result<bool, WarehouseError> {
    if schema.is_empty() {
        return Err(WarehouseError::NoColumns(table.to_string()));
    }
    if describe_table(conn, table).await?.is_some() {
        debug!(table, "table already exists");
        return Ok(false);
    }
    sqlx::query(&sql::create_table(table, &schema.sql_columns(), None, true))
        .execute(&mut *conn)
        .await?;
    info!(table, columns = schema.columns.len(), "created table");
    Ok(true)
}

/// Progress of a primary-key retrofit. Anything short of `Migrated` rolls back
/// to `Original`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrofitState {
    Original,
    Renamed,
    Recreated,
    Migrated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimaryKeyChange {
    AlreadyPresent,
    Added { rows_copied: u64 },
}

pub fn retrofit_table_name(table: &str) -> String {
    format!("{table}__pk_retrofit")
}

/// Adds `PRIMARY KEY (column)` to an existing table by rename, recreate, copy and
/// drop inside one transaction (a savepoint when `conn` is already in one).
pub async fn add_primary_key(
    conn: &mut SqliteConnection,
    table: &str,
    column: &str,
) -> Result<PrimaryKeyChange, WarehouseError> {
    let refuse = |reason: String| WarehouseError::SchemaMigration {
        table: table.to_string(),
        column: column.to_string(),
        state: RetrofitState::Original,
        reason,
    };

    let info = describe_table(conn, table)
        .await?
        .ok_or_else(|| refuse("table does not exist".to_string()))?;
    let keys = info.primary_key_columns();
    if keys == [column] {
        debug!(table, column, "primary key already declared");
        return Ok(PrimaryKeyChange::AlreadyPresent);
    }
    if !keys.is_empty() {
        return Err(refuse(format!("table is already keyed on {}", keys.join(", "))));
    }
    if info.column(column).is_none() {
        return Err(refuse("column does not exist".to_string()));
    }

    let mut tx = conn.begin().await?;
    let mut state = RetrofitState::Original;
    match rebuild_with_key(&mut tx, &info, column, &mut state).await {
        Ok(rows_copied) => {
            tx.commit().await?;
            info!(table, column, rows = rows_copied, "primary key added");
            Ok(PrimaryKeyChange::Added { rows_copied })
        }
        Err(err) => {
            let reached = state;
            tx.rollback().await?;
            warn!(table, column, state = ?reached, error = %err, "primary key retrofit rolled back");
            Err(WarehouseError::SchemaMigration {
                table: table.to_string(),
                column: column.to_string(),
                state: reached,
                reason: err.to_string(),
            })
        }
    }
}

async fn rebuild_with_key(
    conn: &mut SqliteConnection,
    info: &TableInfo,
    column: &str,
    state: &mut RetrofitState,
) -> Result<u64, sqlx::Error> {
    let table = info.name.as_str();
    let temp = retrofit_table_name(table);
    let columns: Vec<(&str, &str)> = info
        .columns
        .iter()
        .map(|c| (c.name.as_str(), c.declared_type.as_str()))
        .collect();
    let names = info.column_names();

    sqlx::query(&sql::drop_table_if_exists(&temp))
        .execute(&mut *conn)
        .await?;
    sqlx::query(&sql::rename_table(table, &temp))
        .execute(&mut *conn)
        .await?;
    *state = RetrofitState::Renamed;

    sqlx::query(&sql::create_table(table, &columns, Some(column), false))
        .execute(&mut *conn)
        .await?;
    *state = RetrofitState::Recreated;

    let copied = sqlx::query(&sql::insert_select(table, &temp, &names))
        .execute(&mut *conn)
        .await?
        .rows_affected();
    sqlx::query(&sql::drop_table(&temp))
        .execute(&mut *conn)
        .await?;
    *state = RetrofitState::Migrated;
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn inference_widens_numbers_and_falls_back_to_text() {
        let ts = NaiveDate::from_ymd_opt(2024, 3, 10)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let batch = RecordBatch::from_rows(
            vec![
                "id".into(),
                "count".into(),
                "mixed".into(),
                "empty".into(),
                "seen_at".into(),
                "flag".into(),
            ],
            vec![
                vec![
                    Value::Integer(1),
                    Value::Integer(3),
                    Value::Integer(1),
                    Value::Null,
                    Value::Timestamp(ts),
                    Value::Boolean(true),
                ],
                vec![
                    Value::Integer(2),
                    Value::Real(2.5),
                    Value::Text("x".into()),
                    Value::Null,
                    Value::Null,
                    Value::Boolean(false),
                ],
            ],
        )
        .unwrap();

        let types: Vec<_> = infer_schema(&batch)
            .columns
            .into_iter()
            .map(|c| c.column_type)
            .collect();
        assert_eq!(
            types,
            vec![
                ColumnType::Integer,
                ColumnType::Real,
                ColumnType::Text,
                ColumnType::Text,
                ColumnType::Timestamp,
                ColumnType::Boolean,
            ]
        );
    }

    #[test]
    fn declared_types_round_trip() {
        for ty in [
            ColumnType::Integer,
            ColumnType::Real,
            ColumnType::Text,
            ColumnType::Boolean,
            ColumnType::Timestamp,
        ] {
            assert_eq!(ColumnType::from_declared(ty.sql_type()), Some(ty));
        }
        assert_eq!(ColumnType::from_declared("bigint"), Some(ColumnType::Integer));
        assert_eq!(ColumnType::from_declared("BLOB"), None);
    }
}
