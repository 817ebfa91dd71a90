//! Pipeline orchestration: sourcing into the landing zone, ingestion into the
//! silver store, modelling into the gold store.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strata_core::{Environment, JobDescriptor, JobSpec, Layer, ModelDescriptor, ModelSpec};
use strata_sources::{FetchWindow, OpenDataApi, RecordSource};
use strata_storage::{
    archive_files, encode_csv, read_batch, HttpClientConfig, HttpFetcher, LandingError, LandingZone,
};
use strata_warehouse::{MergeStrategy, Warehouse};
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub environment: Environment,
    pub landing_root: PathBuf,
    pub warehouse_dir: PathBuf,
    pub reference_dir: PathBuf,
    pub jobs_config: PathBuf,
    pub models_config: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub page_size: u32,
    pub scheduler_enabled: bool,
    pub source_cron: String,
    pub ingest_cron: String,
    pub model_cron: String,
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self> {
        let environment = env_or("STRATA_ENV", "PROD")
            .parse::<Environment>()
            .context("reading STRATA_ENV")?;
        Ok(Self {
            environment,
            landing_root: PathBuf::from(env_or("STRATA_LANDING_ROOT", "landing_zone")),
            warehouse_dir: PathBuf::from(env_or("STRATA_WAREHOUSE_DIR", ".")),
            reference_dir: PathBuf::from(env_or("STRATA_REFERENCE_DIR", ".")),
            jobs_config: PathBuf::from(env_or("STRATA_JOBS_CONFIG", "config/jobs.yaml")),
            models_config: PathBuf::from(env_or("STRATA_MODELS_CONFIG", "config/models.yaml")),
            user_agent: env_or("STRATA_USER_AGENT", "strata-pipeline/0.1"),
            http_timeout_secs: std::env::var("STRATA_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            page_size: std::env::var("STRATA_PAGE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(strata_sources::DEFAULT_PAGE_SIZE),
            scheduler_enabled: std::env::var("STRATA_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            source_cron: env_or("STRATA_SOURCE_CRON", "0 0 5 * * *"),
            ingest_cron: env_or("STRATA_INGEST_CRON", "0 30 5 * * *"),
            model_cron: env_or("STRATA_MODEL_CRON", "0 0 6 * * *"),
        })
    }
}

#[derive(Debug, Deserialize)]
struct JobsFile {
    open_api_url: String,
    #[serde(flatten)]
    namespaces: BTreeMap<String, BTreeMap<String, JobSpec>>,
}

/// Parsed `jobs.yaml`: the API base URL plus one descriptor per dataset.
#[derive(Debug, Clone)]
pub struct JobConfig {
    pub open_api_url: String,
    pub jobs: Vec<JobDescriptor>,
}

impl JobConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let file: JobsFile = serde_yaml::from_str(text).context("parsing job config")?;
        let mut jobs = Vec::new();
        for (namespace, datasets) in file.namespaces {
            for (dataset, spec) in datasets {
                jobs.push(JobDescriptor::from_spec(&namespace, &dataset, spec)?);
            }
        }
        Ok(Self {
            open_api_url: file.open_api_url,
            jobs,
        })
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }
}

/// Parsed `models.yaml`: one descriptor per gold table.
#[derive(Debug, Clone, Default)]
pub struct ModelConfig {
    pub models: Vec<ModelDescriptor>,
}

impl ModelConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let file: BTreeMap<String, BTreeMap<String, ModelSpec>> =
            serde_yaml::from_str(text).context("parsing model config")?;
        let mut models = Vec::new();
        for (namespace, entries) in file {
            for (model, spec) in entries {
                models.push(ModelDescriptor::from_spec(&namespace, &model, spec)?);
            }
        }
        Ok(Self { models })
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Sourcing,
    Ingestion,
    Modelling,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Sourcing => "sourcing",
            Stage::Ingestion => "ingestion",
            Stage::Modelling => "modelling",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatasetFailure {
    pub name: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageSummary {
    pub run_id: Uuid,
    pub stage: Stage,
    pub environment: Environment,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub succeeded: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<DatasetFailure>,
}

impl StageSummary {
    fn start(stage: Stage, environment: Environment) -> Self {
        let started_at = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            stage,
            environment,
            started_at,
            finished_at: started_at,
            succeeded: Vec::new(),
            skipped: Vec::new(),
            failed: Vec::new(),
        }
    }

    fn record(&mut self, name: String, result: Result<Step>) {
        match result {
            Ok(Step::Done) => self.succeeded.push(name),
            Ok(Step::Skipped) => self.skipped.push(name),
            Err(err) => {
                let message = format!("{err:#}");
                error!(stage = self.stage.as_str(), dataset = %name, error = %message, "dataset failed");
                self.failed.push(DatasetFailure {
                    name,
                    error: message,
                });
            }
        }
    }

    fn finish(mut self) -> Self {
        self.finished_at = Utc::now();
        info!(
            stage = self.stage.as_str(),
            run_id = %self.run_id,
            succeeded = self.succeeded.len(),
            skipped = self.skipped.len(),
            failed = self.failed.len(),
            "stage finished"
        );
        self
    }

    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }
}

enum Step {
    Done,
    Skipped,
}

pub fn reference_file_name(model: &ModelDescriptor) -> String {
    format!("{}_{}_ref.csv", model.namespace, model.table_name)
}

pub struct Pipeline {
    config: PipelineConfig,
    landing: LandingZone,
    jobs: Vec<JobDescriptor>,
    models: Vec<ModelDescriptor>,
    source: Box<dyn RecordSource>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, jobs: JobConfig, models: ModelConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        let source = OpenDataApi::new(http, jobs.open_api_url, config.page_size);
        Ok(Self {
            landing: LandingZone::new(config.landing_root.clone()),
            config,
            jobs: jobs.jobs,
            models: models.models,
            source: Box::new(source),
        })
    }

    /// Loads both config files named by `config`. A missing model file means no
    /// gold tables.
    pub async fn from_config(config: PipelineConfig) -> Result<Self> {
        let jobs = JobConfig::load(&config.jobs_config).await?;
        let models = if fs::try_exists(&config.models_config).await.unwrap_or(false) {
            ModelConfig::load(&config.models_config).await?
        } else {
            warn!(path = %config.models_config.display(), "model config not found, modelling has nothing to run");
            ModelConfig::default()
        };
        Self::new(config, jobs, models)
    }

    pub fn with_source(mut self, source: Box<dyn RecordSource>) -> Self {
        self.source = source;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub async fn run_stage(&self, stage: Stage) -> Result<StageSummary> {
        match stage {
            Stage::Sourcing => self.run_sourcing().await,
            Stage::Ingestion => self.run_ingestion().await,
            Stage::Modelling => self.run_modelling().await,
        }
    }

    pub async fn run_all(&self) -> Result<Vec<StageSummary>> {
        let mut summaries = Vec::with_capacity(3);
        for stage in [Stage::Sourcing, Stage::Ingestion, Stage::Modelling] {
            summaries.push(self.run_stage(stage).await?);
        }
        Ok(summaries)
    }

    pub async fn run_sourcing(&self) -> Result<StageSummary> {
        self.run_sourcing_at(Utc::now()).await
    }

    /// Sourcing as of `now`: the lookback window ends on `now`'s date and landing
    /// files are named after it.
    pub async fn run_sourcing_at(&self, now: DateTime<Utc>) -> Result<StageSummary> {
        let mut summary = StageSummary::start(Stage::Sourcing, self.config.environment);
        info!(source = self.source.name(), jobs = self.jobs.len(), "sourcing started");
        for job in &self.jobs {
            let span = info_span!("source", namespace = %job.namespace, dataset = %job.dataset);
            let result = self.source_dataset(job, now).instrument(span).await;
            summary.record(job_name(job), result);
        }
        Ok(summary.finish())
    }

    async fn source_dataset(&self, job: &JobDescriptor, now: DateTime<Utc>) -> Result<Step> {
        let window = FetchWindow::for_job(job, now.date_naive());
        let batch = self.source.fetch(&job.dataset, &window).await?;
        if batch.is_empty() {
            warn!("source returned no records, nothing staged");
            return Ok(Step::Skipped);
        }
        self.landing
            .stage_batch(&job.namespace, &job.dataset, &batch, job.overwrite_sourced, now)
            .await?;
        Ok(Step::Done)
    }

    pub async fn run_ingestion(&self) -> Result<StageSummary> {
        let mut summary = StageSummary::start(Stage::Ingestion, self.config.environment);
        let silver = Warehouse::open(&self.config.warehouse_dir, Layer::Silver, self.config.environment)
            .await
            .context("opening silver store")?;
        for job in &self.jobs {
            let span = info_span!("ingest", namespace = %job.namespace, dataset = %job.dataset, table = %job.table_name);
            let result = self.ingest_dataset(&silver, job).instrument(span).await;
            summary.record(job_name(job), result);
        }
        silver.close().await;
        Ok(summary.finish())
    }

    async fn ingest_dataset(&self, silver: &Warehouse, job: &JobDescriptor) -> Result<Step> {
        let strategy = MergeStrategy::for_job(job)?;
        let landing_dir = self.landing.sourcing_dir(&job.namespace, &job.dataset);
        let landed = match read_batch(&landing_dir).await {
            Ok(landed) => landed,
            Err(LandingError::Empty(dir)) => {
                info!(dir = %dir.display(), "nothing landed, skipping");
                return Ok(Step::Skipped);
            }
            Err(err) => return Err(err.into()),
        };

        let mut batch = landed.batch;
        if batch.column_index(&job.date_column).is_some() {
            let converted = batch.coerce_timestamps(&job.date_column)?;
            info!(column = %job.date_column, converted, "coerced date column");
        } else {
            warn!(column = %job.date_column, "date column not present in landed files");
        }

        silver
            .merge(&job.table_name, batch, &strategy)
            .await
            .with_context(|| format!("merging into {}", job.table_name))?;
        let archive_dir = self.landing.archive_dir(&job.namespace, &job.dataset);
        let archived = archive_files(&landed.files, &archive_dir).await?;
        info!(files = landed.files.len(), archived = archived.len(), "ingested landed files");
        Ok(Step::Done)
    }

    pub async fn run_modelling(&self) -> Result<StageSummary> {
        let mut summary = StageSummary::start(Stage::Modelling, self.config.environment);
        let env = self.config.environment;
        let silver = Warehouse::open(&self.config.warehouse_dir, Layer::Silver, env)
            .await
            .context("opening silver store")?;
        let gold = Warehouse::open(&self.config.warehouse_dir, Layer::Gold, env)
            .await
            .context("opening gold store")?;
        for model in &self.models {
            let span = info_span!("model", namespace = %model.namespace, model = %model.model, table = %model.table_name);
            let result = self.build_model(&silver, &gold, model).instrument(span).await;
            summary.record(format!("{}/{}", model.namespace, model.model), result);
        }
        silver.close().await;
        gold.close().await;
        Ok(summary.finish())
    }

    async fn build_model(&self, silver: &Warehouse, gold: &Warehouse, model: &ModelDescriptor) -> Result<Step> {
        let batch = silver
            .query(&model.sql)
            .await
            .with_context(|| format!("running model sql for {}", model.model))?;
        let outcome = gold
            .merge(&model.table_name, batch.clone(), &MergeStrategy::Replace)
            .await
            .with_context(|| format!("replacing {}", model.table_name))?;

        let path = self.config.reference_dir.join(reference_file_name(model));
        write_reference(&path, &encode_csv(&batch)?).await?;
        info!(rows = outcome.master_rows, file = %path.display(), "exported reference file");
        Ok(Step::Done)
    }

    /// Builds one cron job per stage when scheduling is enabled.
    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        for (stage, cron) in [
            (Stage::Sourcing, &self.config.source_cron),
            (Stage::Ingestion, &self.config.ingest_cron),
            (Stage::Modelling, &self.config.model_cron),
        ] {
            let pipeline = Arc::clone(self);
            let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
                let pipeline = Arc::clone(&pipeline);
                Box::pin(async move {
                    match pipeline.run_stage(stage).await {
                        Ok(summary) if summary.has_failures() => {
                            warn!(stage = stage.as_str(), failed = summary.failed.len(), "scheduled stage finished with failures")
                        }
                        Ok(_) => {}
                        Err(err) => {
                            let message = format!("{err:#}");
                            error!(stage = stage.as_str(), error = %message, "scheduled stage aborted")
                        }
                    }
                })
            })
            .with_context(|| format!("creating {} job for cron {cron}", stage.as_str()))?;
            sched.add(job).await.context("adding scheduler job")?;
            info!(stage = stage.as_str(), cron = %cron, "scheduled stage");
        }
        Ok(Some(sched))
    }
}

fn job_name(job: &JobDescriptor) -> String {
    format!("{}/{}", job.namespace, job.dataset)
}

async fn write_reference(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let temp = path.with_extension("csv.tmp");
    fs::write(&temp, bytes)
        .await
        .with_context(|| format!("writing {}", temp.display()))?;
    fs::rename(&temp, path)
        .await
        .with_context(|| format!("renaming {} into place", temp.display()))
}
