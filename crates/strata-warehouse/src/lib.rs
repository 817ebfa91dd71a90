//! Relational stores for the silver and gold layers, one SQLite file per layer
//! and environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use strata_core::{BatchError, Environment, Layer, RecordBatch};
use thiserror::Error;
use tracing::info;

pub mod dedup;
pub mod merge;
pub mod schema;
pub mod sql;

pub use merge::{staging_table_name, MergeOutcome, MergeStrategy};
pub use schema::{
    infer_schema, ColumnDef, ColumnInfo, ColumnType, PrimaryKeyChange, RetrofitState, TableInfo,
    TableSchema,
};

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("table `{table}`: cannot add primary key on `{column}` (stopped at {state:?}): {reason}")]
    SchemaMigration {
        table: String,
        column: String,
        state: RetrofitState,
        reason: String,
    },
    #[error("upsert into `{table}` needs a primary_key")]
    MissingPrimaryKey { table: String },
    #[error("table `{table}`: key `{column}` is declared {existing} but the batch carries {incoming}")]
    TypeMismatch {
        table: String,
        column: String,
        existing: String,
        incoming: String,
    },
    #[error("{0}")]
    Config(String),
    #[error("unknown column `{0}`")]
    UnknownColumn(String),
    #[error("table `{0}`: batch has no columns")]
    NoColumns(String),
    #[error(transparent)]
    Batch(#[from] BatchError),
    #[error("storage: {0}")]
    Storage(#[from] sqlx::Error),
    #[error("preparing warehouse directory: {0}")]
    Io(#[from] std::io::Error),
}

/// Handle on one layer's store. A single pooled connection serialises writers,
/// which is what SQLite allows anyway.
#[derive(Debug, Clone)]
pub struct Warehouse {
    pool: SqlitePool,
    layer: Layer,
    environment: Environment,
    path: PathBuf,
}

impl Warehouse {
    pub async fn open(
        dir: &Path,
        layer: Layer,
        environment: Environment,
    ) -> Result<Self, WarehouseError> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(layer.store_file_name(environment));
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        info!(%layer, %environment, path = %path.display(), "opened store");
        Ok(Self {
            pool,
            layer,
            environment,
            path,
        })
    }

    pub fn layer(&self) -> Layer {
        self.layer
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn merge(
        &self,
        table: &str,
        batch: RecordBatch,
        strategy: &MergeStrategy,
    ) -> Result<MergeOutcome, WarehouseError> {
        let mut conn = self.pool.acquire().await?;
        merge::merge(&mut conn, table, batch, strategy).await
    }

    pub async fn ensure_table(
        &self,
        table: &str,
        schema: &TableSchema,
    ) -> Result<bool, WarehouseError> {
        let mut conn = self.pool.acquire().await?;
        schema::ensure_table(&mut conn, table, schema).await
    }

    pub async fn add_primary_key(
        &self,
        table: &str,
        column: &str,
    ) -> Result<PrimaryKeyChange, WarehouseError> {
        let mut conn = self.pool.acquire().await?;
        schema::add_primary_key(&mut conn, table, column).await
    }

    pub async fn describe_table(&self, table: &str) -> Result<Option<TableInfo>, WarehouseError> {
        let mut conn = self.pool.acquire().await?;
        schema::describe_table(&mut conn, table).await
    }

    /// Runs a read-only statement against this store.
    pub async fn query(&self, statement: &str) -> Result<RecordBatch, WarehouseError> {
        let mut conn = self.pool.acquire().await?;
        sql::fetch_batch(&mut conn, statement).await
    }

    pub async fn row_count(&self, table: &str) -> Result<u64, WarehouseError> {
        let count: i64 = sqlx::query_scalar(&sql::count_rows(table))
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::{JobDescriptor, LoadType, Lookback, Value};
    use tempfile::TempDir;

    async fn open(dir: &TempDir) -> Warehouse {
        Warehouse::open(dir.path(), Layer::Silver, Environment::Test)
            .await
            .unwrap()
    }

    fn upsert() -> MergeStrategy {
        MergeStrategy::Upsert {
            primary_key: "id".into(),
        }
    }

    fn text(v: &str) -> Value {
        Value::Text(v.to_string())
    }

    fn readings(rows: &[(i64, &str, &str)]) -> RecordBatch {
        RecordBatch::from_rows(
            vec!["id".into(), "value".into(), "load_ts".into()],
            rows.iter()
                .map(|(id, value, marker)| vec![Value::Integer(*id), text(value), text(marker)])
                .collect(),
        )
        .unwrap()
    }

    async fn contents(store: &Warehouse, table: &str) -> Vec<Vec<Value>> {
        store
            .query(&format!("SELECT id, value FROM \"{table}\" ORDER BY id"))
            .await
            .unwrap()
            .into_rows()
    }

    #[tokio::test]
    async fn store_file_is_named_after_layer_and_environment() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        assert_eq!(store.path(), dir.path().join("ingestion_TEST.db"));
        assert!(store.path().exists());
    }

    #[tokio::test]
    async fn upsert_twice_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        let batch = readings(&[(1, "a", "2024-01-01 00:00:00"), (2, "b", "2024-01-01 00:00:00")]);

        let first = store.merge("counts", batch.clone(), &upsert()).await.unwrap();
        assert!(first.master_created);
        let after_first = contents(&store, "counts").await;
        let second = store.merge("counts", batch, &upsert()).await.unwrap();

        assert!(!second.master_created);
        assert_eq!(second.master_rows, 2);
        assert_eq!(contents(&store, "counts").await, after_first);
    }

    #[tokio::test]
    async fn newest_load_wins_within_and_across_runs() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;

        let outcome = store
            .merge(
                "counts",
                readings(&[
                    (1, "b", "2024-01-02 00:00:00"),
                    (1, "a", "2024-01-01 00:00:00"),
                    (2, "x", "2024-01-01 00:00:00"),
                ]),
                &upsert(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.staged_rows, 2);
        store
            .merge("counts", readings(&[(1, "c", "2024-01-03 00:00:00")]), &upsert())
            .await
            .unwrap();

        assert_eq!(
            contents(&store, "counts").await,
            vec![
                vec![Value::Integer(1), text("c")],
                vec![Value::Integer(2), text("x")],
            ]
        );
        let info = store.describe_table("counts").await.unwrap().unwrap();
        assert_eq!(info.primary_key_columns(), vec!["id"]);
    }

    #[tokio::test]
    async fn append_accumulates_rows() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        let m = "2024-01-01 00:00:00";

        store
            .merge("log", readings(&[(1, "a", m), (2, "b", m), (3, "c", m)]), &MergeStrategy::Append)
            .await
            .unwrap();
        let outcome = store
            .merge("log", readings(&[(1, "a", m), (4, "d", m)]), &MergeStrategy::Append)
            .await
            .unwrap();

        assert_eq!(outcome.master_rows, 5);
        assert_eq!(store.row_count("log").await.unwrap(), 5);
        let info = store.describe_table("log").await.unwrap().unwrap();
        assert!(info.primary_key_columns().is_empty());
    }

    #[tokio::test]
    async fn replace_keeps_only_the_latest_result() {
        let dir = TempDir::new().unwrap();
        let store = Warehouse::open(dir.path(), Layer::Gold, Environment::Test)
            .await
            .unwrap();
        let m = "2024-01-01 00:00:00";

        store
            .merge("summary", readings(&[(1, "a", m), (2, "b", m)]), &MergeStrategy::Replace)
            .await
            .unwrap();
        store
            .merge("summary", readings(&[(9, "z", m)]), &MergeStrategy::Replace)
            .await
            .unwrap();

        assert_eq!(
            contents(&store, "summary").await,
            vec![vec![Value::Integer(9), text("z")]]
        );
    }

    #[tokio::test]
    async fn retrofit_on_duplicate_keys_leaves_the_table_untouched() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        let m = "2024-01-01 00:00:00";
        store
            .merge("legacy", readings(&[(1, "a", m), (1, "b", m), (2, "c", m)]), &MergeStrategy::Append)
            .await
            .unwrap();
        let before = store.describe_table("legacy").await.unwrap();

        let err = store.add_primary_key("legacy", "id").await.unwrap_err();

        assert!(matches!(
            err,
            WarehouseError::SchemaMigration {
                state: RetrofitState::Recreated,
                ..
            }
        ));
        assert_eq!(store.describe_table("legacy").await.unwrap(), before);
        assert_eq!(store.row_count("legacy").await.unwrap(), 3);
        assert!(store
            .describe_table(&schema::retrofit_table_name("legacy"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn retrofit_adds_the_key_once() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        let m = "2024-01-01 00:00:00";
        store
            .merge("legacy", readings(&[(1, "a", m), (2, "b", m)]), &MergeStrategy::Append)
            .await
            .unwrap();

        assert_eq!(
            store.add_primary_key("legacy", "id").await.unwrap(),
            PrimaryKeyChange::Added { rows_copied: 2 }
        );
        assert_eq!(
            store.add_primary_key("legacy", "id").await.unwrap(),
            PrimaryKeyChange::AlreadyPresent
        );
        assert_eq!(
            contents(&store, "legacy").await,
            vec![
                vec![Value::Integer(1), text("a")],
                vec![Value::Integer(2), text("b")],
            ]
        );
        let info = store.describe_table("legacy").await.unwrap().unwrap();
        assert_eq!(info.column("value").unwrap().declared_type, "TEXT");
    }

    #[tokio::test]
    async fn retrofit_rejects_unknown_columns_and_tables() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        store
            .merge("legacy", readings(&[(1, "a", "m")]), &MergeStrategy::Append)
            .await
            .unwrap();

        for (table, column) in [("legacy", "nope"), ("absent", "id")] {
            let err = store.add_primary_key(table, column).await.unwrap_err();
            assert!(matches!(
                err,
                WarehouseError::SchemaMigration {
                    state: RetrofitState::Original,
                    ..
                }
            ));
        }
    }

    #[tokio::test]
    async fn upsert_retrofits_an_existing_headless_master() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        store
            .merge("counts", readings(&[(1, "a", "2024-01-01 00:00:00")]), &MergeStrategy::Append)
            .await
            .unwrap();

        store
            .merge("counts", readings(&[(1, "b", "2024-01-02 00:00:00")]), &upsert())
            .await
            .unwrap();

        assert_eq!(
            contents(&store, "counts").await,
            vec![vec![Value::Integer(1), text("b")]]
        );
    }

    #[tokio::test]
    async fn append_into_keyed_master_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        let m = "2024-01-01 00:00:00";
        store.merge("counts", readings(&[(1, "a", m)]), &upsert()).await.unwrap();

        let err = store
            .merge("counts", readings(&[(1, "b", m)]), &MergeStrategy::Append)
            .await
            .unwrap_err();

        assert!(matches!(err, WarehouseError::Config(_)));
        assert_eq!(contents(&store, "counts").await, vec![vec![Value::Integer(1), text("a")]]);
    }

    #[tokio::test]
    async fn key_type_change_is_a_type_mismatch() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        store
            .merge("counts", readings(&[(1, "a", "2024-01-01 00:00:00")]), &upsert())
            .await
            .unwrap();
        let textual = RecordBatch::from_rows(
            vec!["id".into(), "value".into(), "load_ts".into()],
            vec![vec![text("one"), text("b"), text("2024-01-02 00:00:00")]],
        )
        .unwrap();

        let err = store.merge("counts", textual, &upsert()).await.unwrap_err();

        assert!(matches!(err, WarehouseError::TypeMismatch { ref column, .. } if column == "id"));
        assert_eq!(store.row_count("counts").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn keyless_first_load_does_not_fix_the_key_type() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        let keyless = RecordBatch::from_rows(
            vec!["id".into(), "value".into(), "load_ts".into()],
            vec![vec![Value::Null, text("lost"), text("2024-01-01 00:00:00")]],
        )
        .unwrap();

        let outcome = store.merge("counts", keyless, &upsert()).await.unwrap();

        assert!(!outcome.master_created);
        assert_eq!(outcome.staged_rows, 0);
        assert!(store.describe_table("counts").await.unwrap().is_none());

        let outcome = store
            .merge("counts", readings(&[(7, "a", "2024-01-02 00:00:00")]), &upsert())
            .await
            .unwrap();

        assert!(outcome.master_created);
        let info = store.describe_table("counts").await.unwrap().unwrap();
        assert_eq!(info.column("id").unwrap().declared_type, "INTEGER");
        assert_eq!(info.primary_key_columns(), ["id"]);
        assert_eq!(contents(&store, "counts").await, vec![vec![Value::Integer(7), text("a")]]);
    }

    #[tokio::test]
    async fn failed_merge_leaves_master_unchanged() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        let m = "2024-01-01 00:00:00";
        store.merge("counts", readings(&[(1, "a", m)]), &upsert()).await.unwrap();
        let drifted = RecordBatch::from_rows(
            vec!["id".into(), "value".into(), "extra".into(), "load_ts".into()],
            vec![vec![Value::Integer(1), text("b"), text("new"), text(m)]],
        )
        .unwrap();

        let err = store.merge("counts", drifted, &upsert()).await.unwrap_err();

        assert!(matches!(err, WarehouseError::Storage(_)));
        assert_eq!(contents(&store, "counts").await, vec![vec![Value::Integer(1), text("a")]]);
    }

    #[tokio::test]
    async fn reserved_words_work_as_column_names() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        let batch = RecordBatch::from_rows(
            vec!["index".into(), "order".into(), "load_ts".into()],
            vec![
                vec![Value::Integer(1), text("first"), text("2024-01-01 00:00:00")],
                vec![Value::Integer(1), text("second"), text("2024-01-02 00:00:00")],
            ],
        )
        .unwrap();
        let strategy = MergeStrategy::Upsert {
            primary_key: "index".into(),
        };

        store.merge("group", batch, &strategy).await.unwrap();

        let rows = store
            .query("SELECT \"index\", \"order\" FROM \"group\"")
            .await
            .unwrap();
        assert_eq!(rows.columns(), ["index", "order"]);
        assert_eq!(rows.rows(), [vec![Value::Integer(1), text("second")]]);
    }

    #[tokio::test]
    async fn query_decodes_stored_types_and_keeps_empty_column_sets() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        let batch = RecordBatch::from_rows(
            vec!["n".into(), "ratio".into(), "flag".into(), "note".into()],
            vec![vec![Value::Integer(3), Value::Real(0.5), Value::Boolean(true), Value::Null]],
        )
        .unwrap();
        store.merge("mixed", batch, &MergeStrategy::Append).await.unwrap();

        let rows = store.query("SELECT n, ratio, flag, note FROM mixed").await.unwrap();
        assert_eq!(
            rows.rows(),
            [vec![Value::Integer(3), Value::Real(0.5), Value::Integer(1), Value::Null]]
        );

        let empty = store.query("SELECT n FROM mixed WHERE n > 100").await.unwrap();
        assert!(empty.is_empty());
        assert_eq!(empty.columns(), ["n"]);
    }

    #[test]
    fn upsert_jobs_need_a_primary_key() {
        let mut job = JobDescriptor {
            namespace: "open_data".into(),
            dataset: "counts".into(),
            table_name: "counts".into(),
            primary_key: None,
            load_type: LoadType::Upsert,
            date_column: "timestamp".into(),
            lookback: Lookback::Disabled,
            overwrite_sourced: false,
        };
        assert!(matches!(
            MergeStrategy::for_job(&job),
            Err(WarehouseError::MissingPrimaryKey { ref table }) if table == "counts"
        ));

        job.load_type = LoadType::Append;
        assert_eq!(MergeStrategy::for_job(&job).unwrap(), MergeStrategy::Append);
    }
}
