//! Job orchestration: one [`SyncPipeline`] runs either job end to end.
//!
//! Both jobs follow the same shape: prepare the destination table, fetch the
//! orders, resolve the names they reference, build rows, check their width,
//! replace the table body, format, flush and stamp the settings sheet.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use omsync_catalog::CatalogClient;
use omsync_core::{Cell, OutputRow, RefCode, ReferenceKind, SALES_HEADER, SERVICE_HEADER};
use omsync_storage::TabularStore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::cache::ReferenceCache;
use crate::enrich::{check_arity, sales_rows, service_rows, ServiceLookups};
use crate::sink::{
    apply_column_formats, ensure_sheet, record_timestamp, replace_body, ColumnFormat, TableHandle,
    CURRENCY_FORMAT, DATE_FORMAT,
};
use crate::{SyncError, SyncSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    ServiceOrders,
    SalesOrders,
}

impl JobKind {
    pub const ALL: [JobKind; 2] = [Self::ServiceOrders, Self::SalesOrders];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ServiceOrders => "service-orders",
            Self::SalesOrders => "sales-orders",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a failed job does with its error once it has been logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AbortPolicy {
    /// Report the failure in the [`JobReport`] and return normally.
    Swallow,
    /// Return the error to the caller.
    Propagate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampTarget {
    pub cell: &'static str,
    pub label: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub kind: JobKind,
    pub table: &'static str,
    pub header: &'static [&'static str],
    /// Keep existing body rows until new rows replace them.
    pub preserve_existing: bool,
    pub abort_policy: AbortPolicy,
    pub formats: Vec<ColumnFormat>,
    /// Resize columns only for tables under the configured row limit.
    pub limit_autoresize: bool,
    /// Whether a formatting failure fails the job.
    pub formats_fatal: bool,
    pub timestamp: TimestampTarget,
}

impl JobSpec {
    pub fn service_orders() -> Self {
        Self {
            kind: JobKind::ServiceOrders,
            table: "Serviço",
            header: &SERVICE_HEADER,
            preserve_existing: true,
            abort_policy: AbortPolicy::Swallow,
            formats: vec![
                ColumnFormat::single(5, CURRENCY_FORMAT),
                ColumnFormat::single(6, CURRENCY_FORMAT),
                ColumnFormat::single(10, CURRENCY_FORMAT),
                ColumnFormat::single(13, CURRENCY_FORMAT),
            ],
            limit_autoresize: true,
            formats_fatal: true,
            timestamp: TimestampTarget {
                cell: "G6",
                label: "Última atualização OS",
            },
        }
    }

    pub fn sales_orders() -> Self {
        Self {
            kind: JobKind::SalesOrders,
            table: "Pedidos",
            header: &SALES_HEADER,
            preserve_existing: false,
            abort_policy: AbortPolicy::Propagate,
            formats: vec![
                ColumnFormat::span(5, 2, CURRENCY_FORMAT),
                ColumnFormat::single(2, DATE_FORMAT),
            ],
            limit_autoresize: false,
            formats_fatal: false,
            timestamp: TimestampTarget {
                cell: "G11",
                label: "Última atualização Pedidos de Venda",
            },
        }
    }

    pub fn for_kind(kind: JobKind) -> Self {
        match kind {
            JobKind::ServiceOrders => Self::service_orders(),
            JobKind::SalesOrders => Self::sales_orders(),
        }
    }

    pub fn with_abort_policy(mut self, policy: AbortPolicy) -> Self {
        self.abort_policy = policy;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    /// The API returned no orders; the destination table body was not replaced.
    NoData,
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub run_id: Uuid,
    pub job: JobKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub records_fetched: usize,
    pub rows_written: usize,
    pub new_cache_entries: Vec<(ReferenceKind, usize)>,
    /// SHA-256 over the written rows; equal inputs give equal digests.
    pub rows_digest: Option<String>,
    pub timestamp_recorded: bool,
    pub status: JobStatus,
}

impl JobReport {
    fn start(job: JobKind) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            job,
            started_at: now,
            finished_at: now,
            records_fetched: 0,
            rows_written: 0,
            new_cache_entries: Vec::new(),
            rows_digest: None,
            timestamp_recorded: false,
            status: JobStatus::Running,
        }
    }

    pub fn new_entries(&self, kind: ReferenceKind) -> usize {
        self.new_cache_entries
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, n)| n)
            .sum()
    }
}

/// Digest of a row set that does not depend on how it was batched.
pub fn rows_digest(rows: &[OutputRow]) -> String {
    let mut hasher = Sha256::new();
    for row in rows {
        for cell in row {
            match cell {
                Cell::Number(n) => {
                    hasher.update([b'n']);
                    hasher.update(n.to_bits().to_be_bytes());
                }
                Cell::Text(s) => {
                    hasher.update([b't']);
                    hasher.update((s.len() as u64).to_be_bytes());
                    hasher.update(s.as_bytes());
                }
                Cell::Empty => hasher.update([b'e']),
            }
        }
        hasher.update([b'\n']);
    }
    hex::encode(hasher.finalize())
}

fn unique_codes<'a>(codes: impl Iterator<Item = Option<&'a RefCode>>) -> Vec<RefCode> {
    let mut seen = HashSet::new();
    codes
        .flatten()
        .filter(|code| seen.insert(*code))
        .cloned()
        .collect()
}

pub struct SyncPipeline {
    catalog: CatalogClient,
    store: Arc<dyn TabularStore>,
    settings: SyncSettings,
    running: Mutex<()>,
}

impl fmt::Debug for SyncPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncPipeline")
            .field("catalog", &self.catalog)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl SyncPipeline {
    pub fn new(catalog: CatalogClient, store: Arc<dyn TabularStore>, settings: SyncSettings) -> Self {
        Self {
            catalog,
            store,
            settings,
            running: Mutex::new(()),
        }
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn TabularStore> {
        &self.store
    }

    /// Runs one job. A second run while another is in progress, of either
    /// kind, is refused with [`SyncError::AlreadyRunning`].
    pub async fn run(&self, spec: &JobSpec) -> Result<JobReport, SyncError> {
        let Ok(_guard) = self.running.try_lock() else {
            warn!(job = %spec.kind, "another job is running; refusing to start");
            return Err(SyncError::AlreadyRunning(spec.kind));
        };

        let mut report = JobReport::start(spec.kind);
        let span = info_span!("sync_job", run_id = %report.run_id, job = %spec.kind);
        let outcome = async {
            info!("job started");
            match spec.kind {
                JobKind::ServiceOrders => self.service_job(spec, &mut report).await,
                JobKind::SalesOrders => self.sales_job(spec, &mut report).await,
            }
        }
        .instrument(span)
        .await;
        report.finished_at = Utc::now();

        match outcome {
            Ok(status) => {
                report.status = status;
                info!(
                    run_id = %report.run_id,
                    job = %spec.kind,
                    records = report.records_fetched,
                    rows = report.rows_written,
                    status = ?report.status,
                    "job finished"
                );
                Ok(report)
            }
            Err(err) => {
                error!(run_id = %report.run_id, job = %spec.kind, error = %err, "job failed");
                match spec.abort_policy {
                    AbortPolicy::Swallow => {
                        report.status = JobStatus::Failed {
                            error: err.to_string(),
                        };
                        Ok(report)
                    }
                    AbortPolicy::Propagate => Err(err),
                }
            }
        }
    }

    pub async fn run_service_orders(&self) -> Result<JobReport, SyncError> {
        self.run(&JobSpec::service_orders()).await
    }

    pub async fn run_sales_orders(&self) -> Result<JobReport, SyncError> {
        self.run(&JobSpec::sales_orders()).await
    }

    async fn service_job(&self, spec: &JobSpec, report: &mut JobReport) -> Result<JobStatus, SyncError> {
        let store = self.store.as_ref();
        let table = ensure_sheet(store, spec.table, spec.header, spec.preserve_existing).await?;

        let orders = self.catalog.service_orders().await?;
        report.records_fetched = orders.len();
        if orders.is_empty() {
            info!("no service orders returned; table left as is");
            return Ok(JobStatus::NoData);
        }

        let project_codes = unique_codes(orders.iter().map(|o| o.additional.project_code.as_ref()));
        let client_codes = unique_codes(orders.iter().map(|o| o.header.client_code.as_ref()));
        let salesperson_codes = unique_codes(orders.iter().map(|o| o.header.salesperson_code.as_ref()));

        let mut projects = ReferenceCache::load(store, ReferenceKind::Project).await?;
        projects.resolve(&self.catalog, &project_codes).await;
        let mut clients = ReferenceCache::load(store, ReferenceKind::Client).await?;
        clients.resolve(&self.catalog, &client_codes).await;
        let mut salespeople = ReferenceCache::load(store, ReferenceKind::Salesperson).await?;
        salespeople.resolve(&self.catalog, &salesperson_codes).await;
        self.persist_caches(report, [&mut projects, &mut clients, &mut salespeople])
            .await?;

        let rows = service_rows(
            &orders,
            ServiceLookups {
                projects: &projects,
                clients: &clients,
                salespeople: &salespeople,
            },
        );
        check_arity(&rows, spec.header.len())?;
        self.publish(spec, &table, &rows, report).await?;
        Ok(JobStatus::Completed)
    }

    async fn sales_job(&self, spec: &JobSpec, report: &mut JobReport) -> Result<JobStatus, SyncError> {
        let store = self.store.as_ref();
        let table = ensure_sheet(store, spec.table, spec.header, spec.preserve_existing).await?;

        // Clients are listed in bulk before the orders are known and saved
        // right away, so a failed order fetch keeps the scan.
        let mut clients = ReferenceCache::load(store, ReferenceKind::Client).await?;
        clients.resolve(&self.catalog, &[]).await;
        self.persist_caches(report, [&mut clients]).await?;
        store.flush().await?;

        let orders = self.catalog.sales_orders().await?;
        report.records_fetched = orders.len();

        let project_codes = unique_codes(orders.iter().map(|o| o.project_code()));
        let mut projects = ReferenceCache::load(store, ReferenceKind::Project).await?;
        projects.resolve(&self.catalog, &project_codes).await;
        self.persist_caches(report, [&mut projects]).await?;

        let rows = sales_rows(&orders, &clients, &projects);
        check_arity(&rows, spec.header.len())?;
        self.publish(spec, &table, &rows, report).await?;

        if orders.is_empty() {
            info!("no sales orders returned");
            Ok(JobStatus::NoData)
        } else {
            Ok(JobStatus::Completed)
        }
    }

    async fn persist_caches<const N: usize>(
        &self,
        report: &mut JobReport,
        caches: [&mut ReferenceCache; N],
    ) -> Result<(), SyncError> {
        for cache in caches {
            let written = cache.flush(self.store.as_ref()).await?;
            report.new_cache_entries.push((cache.kind(), written));
        }
        Ok(())
    }

    async fn publish(
        &self,
        spec: &JobSpec,
        table: &TableHandle,
        rows: &[OutputRow],
        report: &mut JobReport,
    ) -> Result<(), SyncError> {
        let store = self.store.as_ref();
        replace_body(store, table, rows, self.settings.write_batch_size).await?;
        report.rows_written = rows.len();
        report.rows_digest = Some(rows_digest(rows));

        if !rows.is_empty() {
            let limit = spec
                .limit_autoresize
                .then_some(self.settings.service_autoresize_below);
            if let Err(err) = apply_column_formats(store, table, &spec.formats, limit).await {
                if spec.formats_fatal {
                    return Err(err.into());
                }
                warn!(table = %table.name, error = %err, "column formatting failed; rows kept");
            }
        }
        store.flush().await?;

        let now = Utc::now().with_timezone(&self.settings.utc_offset());
        report.timestamp_recorded =
            record_timestamp(store, spec.timestamp.cell, spec.timestamp.label, now).await?;
        if report.timestamp_recorded {
            store.flush().await?;
        }
        Ok(())
    }
}
