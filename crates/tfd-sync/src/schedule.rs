use std::sync::Arc;

use anyhow::{Context, Result};
use tfd_storage::FacilityStore;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::change::ChangeDetector;
use crate::config::SyncConfig;

/// Registers the periodic update check when the scheduler is enabled. The job only reports;
/// it never starts an ingest.
pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    detector: Arc<ChangeDetector>,
    store: Arc<dyn FacilityStore>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.check_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let detector = detector.clone();
        let store = store.clone();
        Box::pin(async move {
            match detector.check_for_update(store.as_ref()).await {
                Ok(check) if check.has_update => info!(
                    current = ?check.current_count,
                    latest = check.latest_count,
                    "scheduled check: source changed, re-ingest advised"
                ),
                Ok(check) => info!(
                    latest = check.latest_count,
                    "scheduled check: source unchanged"
                ),
                Err(err) => warn!(error = %err, "scheduled update check failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    info!(%cron, "update check scheduled");
    Ok(Some(sched))
}
