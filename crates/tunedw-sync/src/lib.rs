//! Sync pipeline: discover, enrich, shape, reconcile. Plus the daily scheduler.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use tunedw_adapters::{
    musicbrainz_rate_limit, AdapterContext, DiscoverySource, EnrichmentSource,
    MusicBrainzDiscovery, SpotifyCatalog, SpotifyCredentials, MUSICBRAINZ_SOURCE_ID,
};
use tunedw_core::{ArtistBatch, CollectStats};
use tunedw_storage::{
    BackoffPolicy, HttpClientConfig, HttpFetcher, PgWarehouse, ReconcileOutcome, Warehouse,
    WarehouseConfig,
};
use uuid::Uuid;

mod collect;

pub use collect::{
    match_confidence, merge_discoveries, shape, CollectOutcome, Collector, EnrichmentOutcome,
};

pub const CRATE_NAME: &str = "tunedw-sync";

/// Countries queried when no `countries.yaml` is present.
pub const DEFAULT_COUNTRIES: [&str; 23] = [
    "Argentina",
    "United States",
    "Germany",
    "France",
    "England",
    "Uruguay",
    "Chile",
    "Brazil",
    "Spain",
    "Italy",
    "Japan",
    "China",
    "Australia",
    "Canada",
    "Russia",
    "Mexico",
    "Colombia",
    "Peru",
    "Venezuela",
    "Ecuador",
    "Paraguay",
    "Bolivia",
    "Cuba",
];

const COUNTRIES_FILE: &str = "countries.yaml";

#[derive(Debug, Clone, Deserialize)]
pub struct CountryRegistry {
    pub countries: Vec<String>,
}

/// Groups to discover, from `<root>/countries.yaml` if it exists.
pub async fn load_groups(workspace_root: &Path) -> Result<Vec<String>> {
    let path = workspace_root.join(COUNTRIES_FILE);
    let present = fs::try_exists(&path)
        .await
        .with_context(|| format!("checking {}", path.display()))?;
    if !present {
        return Ok(DEFAULT_COUNTRIES.iter().map(|c| c.to_string()).collect());
    }

    let text = fs::read_to_string(&path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let registry: CountryRegistry =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;

    let groups: Vec<String> = registry
        .countries
        .into_iter()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect();
    if groups.is_empty() {
        bail!("{} lists no countries", path.display());
    }
    Ok(groups)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 1,
            delay: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub warehouse: WarehouseConfig,
    pub discovery_limit: u32,
    pub search_limit: u32,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub http_max_retries: usize,
    pub match_threshold: f64,
    pub sync_cron: String,
    pub retry: RetryPolicy,
    pub workspace_root: PathBuf,
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let retry_defaults = RetryPolicy::default();
        Self {
            warehouse: WarehouseConfig::from_env(),
            discovery_limit: env_parse("TUNEDW_DISCOVERY_LIMIT").unwrap_or(100),
            search_limit: env_parse("TUNEDW_SEARCH_LIMIT").unwrap_or(10),
            user_agent: std::env::var("TUNEDW_USER_AGENT").unwrap_or_else(|_| {
                "tunedw/0.1 ( https://github.com/tunedw/tunedw )".to_string()
            }),
            http_timeout_secs: env_parse("TUNEDW_HTTP_TIMEOUT_SECS").unwrap_or(20),
            http_max_retries: env_parse("TUNEDW_HTTP_MAX_RETRIES").unwrap_or(0),
            match_threshold: env_parse("TUNEDW_MATCH_THRESHOLD").unwrap_or(0.85),
            sync_cron: std::env::var("SYNC_CRON").unwrap_or_else(|_| "0 0 12 * * *".to_string()),
            retry: RetryPolicy {
                retries: env_parse("SYNC_RETRIES").unwrap_or(retry_defaults.retries),
                delay: env_parse("SYNC_RETRY_DELAY_SECS")
                    .map(Duration::from_secs)
                    .unwrap_or(retry_defaults.delay),
            },
            workspace_root: std::env::var("TUNEDW_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy {
                max_retries: self.http_max_retries,
                ..Default::default()
            },
            ..Default::default()
        }
        .with_rate_limit(MUSICBRAINZ_SOURCE_ID, musicbrainz_rate_limit())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub records: usize,
    pub staged: usize,
    pub duplicates_dropped: usize,
    pub inserted: usize,
    pub updated: usize,
    pub stats: CollectStats,
}

pub struct SyncPipeline {
    config: SyncConfig,
    groups: Vec<String>,
    collector: Collector,
    warehouse: Arc<dyn Warehouse>,
}

impl SyncPipeline {
    pub fn new(
        config: SyncConfig,
        groups: Vec<String>,
        discovery: Arc<dyn DiscoverySource>,
        enrichment: Arc<dyn EnrichmentSource>,
        warehouse: Arc<dyn Warehouse>,
    ) -> Self {
        let collector = Collector::new(discovery, enrichment, config.match_threshold);
        Self {
            config,
            groups,
            collector,
            warehouse,
        }
    }

    /// Wires the live MusicBrainz, Spotify and warehouse clients.
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let groups = load_groups(&config.workspace_root).await?;
        let http = Arc::new(HttpFetcher::new(config.http_client_config())?);
        let credentials =
            SpotifyCredentials::from_env().context("loading Spotify client credentials")?;
        let discovery = MusicBrainzDiscovery::new(http.clone());
        let enrichment =
            SpotifyCatalog::new(http, credentials).with_search_limit(config.search_limit);
        let warehouse = PgWarehouse::new(&config.warehouse).context("configuring warehouse")?;
        Ok(Self::new(
            config,
            groups,
            Arc::new(discovery),
            Arc::new(enrichment),
            Arc::new(warehouse),
        ))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// First stage: collect and shape a batch. Never touches the warehouse.
    pub async fn fetch_and_shape(&self) -> Result<ArtistBatch> {
        let run_id = Uuid::new_v4();
        self.collect_batch(run_id)
            .instrument(info_span!("fetch_and_shape", %run_id))
            .await
    }

    async fn collect_batch(&self, run_id: Uuid) -> Result<ArtistBatch> {
        let ctx = AdapterContext::new(run_id);
        let outcome = self
            .collector
            .collect(&ctx, &self.groups, self.config.discovery_limit)
            .await;
        let stats = outcome.stats;
        info!(
            groups = stats.groups_requested,
            groups_failed = stats.groups_failed,
            unique_names = stats.unique_names,
            matched = stats.matched,
            no_match = stats.no_match,
            enrichment_errors = stats.enrichment_errors,
            "collection finished"
        );

        if outcome.entities.is_empty() {
            bail!(
                "no artists collected ({} of {} groups failed, {} lookups errored)",
                stats.groups_failed,
                stats.groups_requested,
                stats.enrichment_errors
            );
        }
        Ok(ArtistBatch::new(run_id, shape(outcome.entities), stats))
    }

    /// Second stage: apply a batch to the warehouse.
    pub async fn reconcile(&self, batch: ArtistBatch) -> Result<ReconcileOutcome> {
        self.warehouse
            .reconcile(batch.run_id, &batch.records)
            .await
            .with_context(|| format!("reconciling run {}", batch.run_id))
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let batch = self.fetch_and_shape().await?;
        let outcome = self.reconcile(batch.clone()).await?;
        Ok(SyncRunSummary::new(started_at, &batch, outcome))
    }
}

impl SyncRunSummary {
    fn new(started_at: DateTime<Utc>, batch: &ArtistBatch, outcome: ReconcileOutcome) -> Self {
        Self {
            run_id: batch.run_id,
            started_at,
            finished_at: Utc::now(),
            records: batch.len(),
            staged: outcome.staged,
            duplicates_dropped: outcome.duplicates_dropped,
            inserted: outcome.inserted,
            updated: outcome.updated,
            stats: batch.stats.clone(),
        }
    }
}

async fn retrying<T, F, Fut>(policy: RetryPolicy, stage: &'static str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < policy.retries => {
                attempt += 1;
                warn!(
                    stage,
                    attempt,
                    retries = policy.retries,
                    delay_secs = policy.delay.as_secs(),
                    error = %format!("{err:#}"),
                    "sync stage failed; retrying"
                );
                tokio::time::sleep(policy.delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Runs the pipeline with up to `policy.retries` retries per stage.
///
/// The batch is fetched once. A failed reconcile is retried with that same
/// batch, so a warehouse outage never triggers a second round of API calls.
pub async fn run_with_retry(
    pipeline: &SyncPipeline,
    policy: RetryPolicy,
) -> Result<SyncRunSummary> {
    let started_at = Utc::now();
    let batch = retrying(policy, "fetch_and_shape", || pipeline.fetch_and_shape()).await?;
    let outcome = retrying(policy, "reconcile", || pipeline.reconcile(batch.clone())).await?;
    Ok(SyncRunSummary::new(started_at, &batch, outcome))
}

/// Cron job running the pipeline with retries. A fire that lands while the
/// previous run is still going is skipped.
pub async fn build_scheduler(pipeline: Arc<SyncPipeline>) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let running = Arc::new(Mutex::new(()));
    let cron = pipeline.config().sync_cron.clone();

    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let pipeline = pipeline.clone();
        let running = running.clone();
        Box::pin(async move {
            let Ok(_guard) = running.try_lock_owned() else {
                warn!("previous sync run still in progress; skipping this fire");
                return;
            };
            let policy = pipeline.config().retry;
            match run_with_retry(&pipeline, policy).await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    inserted = summary.inserted,
                    updated = summary.updated,
                    "scheduled sync complete"
                ),
                Err(err) => error!(error = %format!("{err:#}"), "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let pipeline = SyncPipeline::from_config(SyncConfig::from_env()).await?;
    pipeline.run_once().await
}

/// Collects a batch without writing it anywhere.
pub async fn dry_run_from_env() -> Result<ArtistBatch> {
    let pipeline = SyncPipeline::from_config(SyncConfig::from_env()).await?;
    pipeline.fetch_and_shape().await
}

/// Creates the target table. Needs only warehouse credentials.
pub async fn migrate_from_env() -> Result<String> {
    let config = WarehouseConfig::from_env();
    let warehouse = PgWarehouse::new(&config).context("configuring warehouse")?;
    warehouse
        .ensure_schema()
        .await
        .context("creating target table")?;
    Ok(warehouse.target_table().to_string())
}

/// Starts the cron scheduler and blocks until Ctrl-C.
pub async fn run_scheduler_from_env() -> Result<()> {
    let pipeline = Arc::new(SyncPipeline::from_config(SyncConfig::from_env()).await?);
    let cron = pipeline.config().sync_cron.clone();
    let mut sched = build_scheduler(pipeline).await?;
    sched.start().await.context("starting scheduler")?;
    info!(cron = cron.as_str(), "scheduler started");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown requested");
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}
