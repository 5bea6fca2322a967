//! Time-based triggers for both jobs.

use std::sync::Arc;

use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::job::{JobKind, JobSpec, JobStatus, SyncPipeline};
use crate::{SyncError, SyncSettings};

/// Six-field cron expressions (seconds first, UTC) for every trigger.
///
/// Each configured local hour gets a service-orders trigger on the hour and
/// a sales-orders trigger `sales_minute` minutes later.
pub fn cron_expressions(settings: &SyncSettings) -> Vec<(JobKind, String)> {
    let sales_minute = settings.sales_minute.min(59);
    settings
        .schedule_hours
        .iter()
        .filter(|hour| **hour < 24)
        .flat_map(|&hour| {
            let utc_hour = (hour as i32 - settings.utc_offset_hours).rem_euclid(24);
            [
                (JobKind::ServiceOrders, format!("0 0 {utc_hour} * * *")),
                (JobKind::SalesOrders, format!("0 {sales_minute} {utc_hour} * * *")),
            ]
        })
        .collect()
}

/// Registers every trigger on a new scheduler. The caller starts it.
pub async fn build_scheduler(pipeline: Arc<SyncPipeline>) -> Result<JobScheduler, SyncError> {
    let sched = JobScheduler::new()
        .await
        .map_err(|e| SyncError::Scheduler(format!("creating scheduler: {e}")))?;

    for (kind, cron) in cron_expressions(pipeline.settings()) {
        let pipeline = Arc::clone(&pipeline);
        let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.run(&JobSpec::for_kind(kind)).await {
                    Ok(report) if matches!(report.status, JobStatus::Failed { .. }) => {
                        error!(job = %kind, run_id = %report.run_id, "scheduled run failed");
                    }
                    Ok(report) => {
                        info!(job = %kind, run_id = %report.run_id, rows = report.rows_written, "scheduled run finished");
                    }
                    Err(err) => error!(job = %kind, error = %err, "scheduled run failed"),
                }
            })
        })
        .map_err(|e| SyncError::Scheduler(format!("creating job for cron {cron}: {e}")))?;
        sched
            .add(job)
            .await
            .map_err(|e| SyncError::Scheduler(format!("adding job for cron {cron}: {e}")))?;
        info!(job = %kind, cron, "trigger registered");
    }
    Ok(sched)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_hours_convert_to_utc() {
        let crons = cron_expressions(&SyncSettings::default());
        assert_eq!(
            crons,
            vec![
                (JobKind::ServiceOrders, "0 0 8 * * *".to_string()),
                (JobKind::SalesOrders, "0 30 8 * * *".to_string()),
                (JobKind::ServiceOrders, "0 0 15 * * *".to_string()),
                (JobKind::SalesOrders, "0 30 15 * * *".to_string()),
                (JobKind::ServiceOrders, "0 0 18 * * *".to_string()),
                (JobKind::SalesOrders, "0 30 18 * * *".to_string()),
            ]
        );
    }

    #[test]
    fn hours_wrap_around_midnight_and_bad_hours_are_skipped() {
        let settings = SyncSettings {
            schedule_hours: vec![23, 30],
            utc_offset_hours: -3,
            sales_minute: 75,
            ..SyncSettings::default()
        };
        assert_eq!(
            cron_expressions(&settings),
            vec![
                (JobKind::ServiceOrders, "0 0 2 * * *".to_string()),
                (JobKind::SalesOrders, "0 59 2 * * *".to_string()),
            ]
        );
    }
}
