//! Sync jobs: fetch orders, resolve names through the reference caches,
//! enrich into display rows and publish them to the destination workbook.

pub mod cache;
pub mod enrich;
pub mod job;
pub mod schedule;
pub mod sink;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{FixedOffset, Offset, Utc};
use omsync_catalog::{
    CatalogClient, CatalogError, FixedPacer, FixtureTransport, PagePolicy, ResourceKind,
    DEFAULT_API_BASE,
};
use omsync_core::Credentials;
use omsync_storage::{ApiTransport, HttpClientConfig, HttpTransport, StoreError, TabularStore, Workbook};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::info;

pub use cache::{reset_cache, ReferenceCache, ResolveOutcome, ResolveStrategy};
pub use job::{AbortPolicy, JobKind, JobReport, JobSpec, JobStatus, SyncPipeline};
pub use schedule::{build_scheduler, cron_expressions};

pub const CRATE_NAME: &str = "omsync-sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(
        "{offending} of {total} rows do not match the {expected}-column header \
         (row {first_index} has {first_len} cells)"
    )]
    Inconsistency {
        expected: usize,
        offending: usize,
        total: usize,
        first_index: usize,
        first_len: usize,
    },
    #[error("{0} job is already running")]
    AlreadyRunning(JobKind),
    #[error("scheduler: {0}")]
    Scheduler(String),
}

/// Request pauses in milliseconds, per resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingSettings {
    pub service_orders: u64,
    pub sales_orders: u64,
    pub clients: u64,
    pub projects: u64,
    pub salespeople: u64,
}

impl Default for PacingSettings {
    fn default() -> Self {
        Self {
            service_orders: 0,
            sales_orders: 300,
            clients: 1000,
            projects: 400,
            salespeople: 0,
        }
    }
}

impl PacingSettings {
    pub fn pacer(&self) -> FixedPacer {
        [
            (ResourceKind::ServiceOrders, self.service_orders),
            (ResourceKind::SalesOrders, self.sales_orders),
            (ResourceKind::Clients, self.clients),
            (ResourceKind::Projects, self.projects),
            (ResourceKind::Salespeople, self.salespeople),
        ]
        .into_iter()
        .fold(FixedPacer::none(), |pacer, (kind, ms)| {
            pacer.with_delay(kind, Duration::from_millis(ms))
        })
    }
}

/// Tunables read from the optional YAML settings file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub write_batch_size: usize,
    pub service_order_max_pages: u32,
    pub salespeople_max_pages: u32,
    pub pacing_ms: PacingSettings,
    /// Local hours at which both jobs run.
    pub schedule_hours: Vec<u32>,
    /// Minutes past each scheduled hour at which the sales job runs.
    pub sales_minute: u32,
    /// Offset of local time from UTC, in hours.
    pub utc_offset_hours: i32,
    pub service_autoresize_below: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            write_batch_size: sink::DEFAULT_BATCH_SIZE,
            service_order_max_pages: 10,
            salespeople_max_pages: 20,
            pacing_ms: PacingSettings::default(),
            schedule_hours: vec![5, 12, 15],
            sales_minute: 30,
            utc_offset_hours: -3,
            service_autoresize_below: 200,
        }
    }
}

impl SyncSettings {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text).context("parsing sync settings")
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Local offset; out-of-range values fall back to UTC.
    pub fn utc_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_hours * 3600).unwrap_or_else(|| Utc.fix())
    }

    /// Applies page caps to a catalog client.
    pub fn configure(&self, client: CatalogClient) -> CatalogClient {
        let capped = |kind: ResourceKind, max: u32| PagePolicy {
            max_pages: Some(max),
            ..kind.page_policy()
        };
        client
            .with_page_policy(
                ResourceKind::ServiceOrders,
                capped(ResourceKind::ServiceOrders, self.service_order_max_pages),
            )
            .with_page_policy(
                ResourceKind::Salespeople,
                capped(ResourceKind::Salespeople, self.salespeople_max_pages),
            )
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub credentials: Credentials,
    pub api_base: String,
    pub workbook_path: PathBuf,
    pub fixtures_dir: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub settings_path: Option<PathBuf>,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            credentials: Credentials::new(
                std::env::var("OMIE_APP_KEY").unwrap_or_default(),
                std::env::var("OMIE_APP_SECRET").unwrap_or_default(),
            ),
            api_base: std::env::var("OMIE_API_BASE").unwrap_or_else(|_| DEFAULT_API_BASE.to_string()),
            workbook_path: std::env::var("OMSYNC_WORKBOOK")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./omsync-workbook.json")),
            fixtures_dir: std::env::var("OMSYNC_FIXTURES_DIR").ok().map(PathBuf::from),
            user_agent: std::env::var("OMSYNC_USER_AGENT")
                .unwrap_or_else(|_| format!("omsync/{}", env!("CARGO_PKG_VERSION"))),
            http_timeout_secs: std::env::var("OMSYNC_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
            settings_path: std::env::var("OMSYNC_SETTINGS").ok().map(PathBuf::from),
        }
    }

    pub async fn settings(&self) -> Result<SyncSettings> {
        match &self.settings_path {
            Some(path) => SyncSettings::load(path).await,
            None => Ok(SyncSettings::default()),
        }
    }

    fn transport(&self) -> Result<Arc<dyn ApiTransport>> {
        if let Some(dir) = &self.fixtures_dir {
            info!(dir = %dir.display(), "serving API calls from fixtures");
            return Ok(Arc::new(FixtureTransport::from_dir(dir.clone())));
        }
        if self.credentials.app_key.is_empty() || self.credentials.app_secret.is_empty() {
            bail!("OMIE_APP_KEY and OMIE_APP_SECRET must be set (or use fixtures)");
        }
        let http = HttpTransport::new(HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        })?;
        Ok(Arc::new(http))
    }

    /// Catalog client over the configured transport. Fixture runs are not paced.
    pub fn catalog(&self, settings: &SyncSettings) -> Result<CatalogClient> {
        let pacer = if self.fixtures_dir.is_some() {
            FixedPacer::none()
        } else {
            settings.pacing_ms.pacer()
        };
        let client = CatalogClient::new(self.transport()?, self.credentials.clone())
            .with_base_url(self.api_base.clone())
            .with_pacer(Arc::new(pacer));
        Ok(settings.configure(client))
    }

    pub async fn open_workbook(&self) -> Result<Workbook> {
        Workbook::open(self.workbook_path.clone())
            .await
            .with_context(|| format!("opening workbook {}", self.workbook_path.display()))
    }
}

pub async fn build_pipeline(config: &SyncConfig) -> Result<SyncPipeline> {
    let settings = config.settings().await?;
    let catalog = config.catalog(&settings)?;
    let store: Arc<dyn TabularStore> = Arc::new(config.open_workbook().await?);
    Ok(SyncPipeline::new(catalog, store, settings))
}
