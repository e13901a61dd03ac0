use anyhow::Result;
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::info;

use crate::config::Config;
use crate::pipeline::RelayPipeline;

/// Initialize and start the housekeeping scheduler
pub async fn start_scheduler(config: Arc<Config>, pipeline: Arc<RelayPipeline>) -> Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;

    info!("Scheduling housekeeping (cron: {})", config.housekeeping_cron);

    let pipeline_clone = Arc::clone(&pipeline);
    let job = Job::new_async(config.housekeeping_cron.as_str(), move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline_clone);

        Box::pin(async move {
            run_housekeeping(&pipeline);
        })
    })?;

    scheduler.add(job).await?;
    scheduler.start().await?;
    info!("✓ Scheduler started");

    Ok(scheduler)
}

/// Sweep stale relay state and log the metrics report
pub fn run_housekeeping(pipeline: &RelayPipeline) {
    pipeline.housekeeping();
    info!("Relay metrics: {}", pipeline.metrics_report());
}
