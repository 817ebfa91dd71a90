//! Merge Engine: stage a batch, then fold it into its master table by append,
//! upsert or replace, all inside one transaction.

use std::fmt;

use sqlx::{Connection, SqliteConnection};
use strata_core::{JobDescriptor, LoadType, RecordBatch, LOAD_MARKER_COLUMN};
use tracing::{info, warn};

use crate::schema::{self, ColumnType, TableSchema};
use crate::{dedup, sql, WarehouseError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeStrategy {
    Append,
    Upsert { primary_key: String },
    Replace,
}

impl MergeStrategy {
    pub fn for_job(job: &JobDescriptor) -> Result<Self, WarehouseError> {
        match job.load_type {
            LoadType::Append => Ok(MergeStrategy::Append),
            LoadType::Upsert => job
                .primary_key
                .clone()
                .map(|primary_key| MergeStrategy::Upsert { primary_key })
                .ok_or_else(|| WarehouseError::MissingPrimaryKey {
                    table: job.table_name.clone(),
                }),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            MergeStrategy::Append => "append",
            MergeStrategy::Upsert { .. } => "upsert",
            MergeStrategy::Replace => "replace",
        }
    }
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub table: String,
    pub strategy: &'static str,
    pub staged_rows: u64,
    pub master_rows: u64,
    pub master_created: bool,
}

pub fn staging_table_name(table: &str) -> String {
    format!("{table}_stg")
}

/// Merges `batch` into `table`. Nothing is visible to other readers unless
/// every step succeeds.
pub async fn merge(
    conn: &mut SqliteConnection,
    table: &str,
    batch: RecordBatch,
    strategy: &MergeStrategy,
) -> Result<MergeOutcome, WarehouseError> {
    let mut tx = conn.begin().await?;
    match merge_in(&mut tx, table, batch, strategy).await {
        Ok(outcome) => {
            tx.commit().await?;
            info!(
                table,
                strategy = outcome.strategy,
                staged = outcome.staged_rows,
                total = outcome.master_rows,
                created = outcome.master_created,
                "merged batch"
            );
            Ok(outcome)
        }
        Err(err) => {
            if let Err(rollback) = tx.rollback().await {
                warn!(table, error = %rollback, "rollback after failed merge also failed");
            }
            Err(err)
        }
    }
}

async fn merge_in(
    conn: &mut SqliteConnection,
    table: &str,
    batch: RecordBatch,
    strategy: &MergeStrategy,
) -> Result<MergeOutcome, WarehouseError> {
    let batch = match strategy {
        MergeStrategy::Upsert { primary_key } => {
            dedup::resolve(batch, primary_key, LOAD_MARKER_COLUMN)?
        }
        MergeStrategy::Append | MergeStrategy::Replace => batch,
    };
    if batch.is_empty() && matches!(strategy, MergeStrategy::Upsert { .. }) {
        // without keyed rows there is no key type to create the master with
        if schema::describe_table(conn, table).await?.is_none() {
            warn!(table, "no keyed rows and no master table yet; nothing to merge");
            return Ok(MergeOutcome {
                table: table.to_string(),
                strategy: strategy.name(),
                staged_rows: 0,
                master_rows: 0,
                master_created: false,
            });
        }
    }
    let schema = schema::infer_schema(&batch);
    if schema.is_empty() {
        return Err(WarehouseError::NoColumns(table.to_string()));
    }
    if let MergeStrategy::Upsert { primary_key } = strategy {
        check_master_key(conn, table, &schema, primary_key, batch.is_empty()).await?;
    }

    let staging = staging_table_name(table);
    let staged_rows = write_staging(conn, &staging, &schema, &batch).await?;
    let master_created = schema::ensure_table(conn, table, &schema).await?;
    let columns = schema.names();

    match strategy {
        MergeStrategy::Append => {
            if let Some(info) = schema::describe_table(conn, table).await? {
                let keys = info.primary_key_columns();
                if !keys.is_empty() {
                    return Err(WarehouseError::Config(format!(
                        "table `{table}` is keyed on `{}`; configure it with load_type upsert",
                        keys.join(", ")
                    )));
                }
            }
            sqlx::query(&sql::insert_select(table, &staging, &columns))
                .execute(&mut *conn)
                .await?;
        }
        MergeStrategy::Upsert { primary_key } => {
            // key constraints go on before any row moves, new master or not
            schema::add_primary_key(conn, table, primary_key).await?;
            schema::add_primary_key(conn, &staging, primary_key).await?;
            sqlx::query(&sql::upsert_select(table, &staging, &columns, primary_key))
                .execute(&mut *conn)
                .await?;
        }
        MergeStrategy::Replace => {
            sqlx::query(&sql::delete_all(table))
                .execute(&mut *conn)
                .await?;
            sqlx::query(&sql::insert_select(table, &staging, &columns))
                .execute(&mut *conn)
                .await?;
        }
    }

    let master_rows: i64 = sqlx::query_scalar(&sql::count_rows(table))
        .fetch_one(&mut *conn)
        .await?;
    Ok(MergeOutcome {
        table: table.to_string(),
        strategy: strategy.name(),
        staged_rows,
        master_rows: master_rows.max(0) as u64,
        master_created,
    })
}

/// An existing master must agree with the incoming key: same key column, and a
/// declared key type matching what the batch carries. A batch without rows has
/// no observed key type.
async fn check_master_key(
    conn: &mut SqliteConnection,
    table: &str,
    schema: &TableSchema,
    primary_key: &str,
    no_rows: bool,
) -> Result<(), WarehouseError> {
    let incoming = schema
        .column(primary_key)
        .ok_or_else(|| WarehouseError::UnknownColumn(primary_key.to_string()))?;
    let Some(info) = schema::describe_table(conn, table).await? else {
        return Ok(());
    };
    let keys = info.primary_key_columns();
    if !keys.is_empty() && keys != [primary_key] {
        return Err(WarehouseError::Config(format!(
            "table `{table}` is keyed on `{}`, not `{primary_key}`",
            keys.join(", ")
        )));
    }
    let Some(existing) = info.column(primary_key) else {
        return Ok(());
    };
    if no_rows {
        return Ok(());
    }
    match ColumnType::from_declared(&existing.declared_type) {
        Some(declared) if declared != incoming.column_type => Err(WarehouseError::TypeMismatch {
            table: table.to_string(),
            column: primary_key.to_string(),
            existing: declared.to_string(),
            incoming: incoming.column_type.to_string(),
        }),
        _ => Ok(()),
    }
}

async fn write_staging(
    conn: &mut SqliteConnection,
    staging: &str,
    schema: &TableSchema,
    batch: &RecordBatch,
) -> Result<u64, WarehouseError> {
    sqlx::query(&sql::drop_table_if_exists(staging))
        .execute(&mut *conn)
        .await?;
    sqlx::query(&sql::create_table(staging, &schema.sql_columns(), None, false))
        .execute(&mut *conn)
        .await?;

    let insert = sql::insert_values(staging, &schema.names());
    for row in batch.rows() {
        let query = row
            .iter()
            .fold(sqlx::query(&insert), |query, value| sql::bind_value(query, value));
        query.execute(&mut *conn).await?;
    }
    Ok(batch.len() as u64)
}
