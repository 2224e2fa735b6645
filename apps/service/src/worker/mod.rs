use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::watch;

use crate::clock::Clock;
use crate::config::Config;
use crate::database::Store;
use crate::error::ServiceError;
use crate::monitoring::ProbeExecutor;
use crate::notification::NotificationDispatcher;
use crate::queue::{Job, JobHandler, NOTIFICATIONS_QUEUE, PingJob, QueueProcessor};

/// Concurrency for the notification partition; providers rate-limit long
/// before the probe pool's defaults are useful there.
const NOTIFICATION_CONCURRENCY: usize = 10;

/// Decodes `monitor:ping` jobs and hands them to the probe executor.
struct PingJobHandler {
    executor: ProbeExecutor,
}

#[async_trait]
impl JobHandler for PingJobHandler {
    async fn handle(&self, job: &Job) -> Result<()> {
        let payload: PingJob = match serde_json::from_value(job.payload.clone()) {
            Ok(payload) => payload,
            Err(error) => {
                // A payload that does not decode will never decode; drop it.
                tracing::error!(job_id = job.id, %error, "undecodable ping payload");
                return Ok(());
            }
        };
        self.executor.execute(&payload.monitor, payload.region_id, job.timeout_seconds).await
    }
}

/// Regional worker process: consumes this region's probe partition plus the
/// shared notification partition until shutdown.
pub async fn run(
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
    config: &Config,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let region = store
        .region_by_code(&config.app_region)
        .await?
        .ok_or_else(|| ServiceError::Fatal(format!("region '{}' is not seeded", config.app_region)))?;

    tracing::info!(region = %region.code, region_id = region.id, "worker starting");

    let ping_handler = Arc::new(PingJobHandler {
        executor: ProbeExecutor::new(Arc::clone(&store), Arc::clone(&clock)),
    });
    let dispatcher = Arc::new(NotificationDispatcher::new(Arc::clone(&store), config.smtp.as_ref())?);

    let ping_processor = QueueProcessor::new(
        Arc::clone(&store),
        Arc::clone(&clock),
        region.id.to_string(),
        config.worker_concurrency,
    );
    let notification_processor = QueueProcessor::new(
        Arc::clone(&store),
        Arc::clone(&clock),
        NOTIFICATIONS_QUEUE.to_string(),
        NOTIFICATION_CONCURRENCY,
    );

    tokio::try_join!(
        ping_processor.run(ping_handler, shutdown.clone()),
        notification_processor.run(dispatcher, shutdown),
    )?;
    Ok(())
}
