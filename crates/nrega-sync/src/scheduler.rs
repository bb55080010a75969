//! Periodic refresh scheduling: one cron job plus a coarser safety-net interval, both
//! funnelled through [`IngestionPipeline::run_full_refresh`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::info;

use crate::{IngestionPipeline, RefreshSummary};

pub struct RefreshScheduler {
    pipeline: Arc<IngestionPipeline>,
    cron: String,
    safety_net: Duration,
    running: Mutex<Option<JobScheduler>>,
}

impl RefreshScheduler {
    pub fn new(pipeline: Arc<IngestionPipeline>, cron: impl Into<String>, safety_net: Duration) -> Self {
        Self {
            pipeline,
            cron: cron.into(),
            safety_net,
            running: Mutex::new(None),
        }
    }

    pub fn pipeline(&self) -> Arc<IngestionPipeline> {
        Arc::clone(&self.pipeline)
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Registers both jobs and starts ticking. Starting twice is a no-op.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;

        let pipeline = Arc::clone(&self.pipeline);
        let primary = Job::new_async(self.cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                info!("scheduled refresh triggered");
                pipeline.run_full_refresh().await;
            })
        })
        .with_context(|| format!("creating refresh job for cron {}", self.cron))?;
        sched.add(primary).await.context("adding refresh job")?;

        let pipeline = Arc::clone(&self.pipeline);
        let safety_net = Job::new_repeated_async(self.safety_net, move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                info!("safety-net refresh triggered");
                pipeline.run_full_refresh().await;
            })
        })
        .context("creating safety-net refresh job")?;
        sched.add(safety_net).await.context("adding safety-net refresh job")?;

        sched.start().await.context("starting scheduler")?;
        info!(
            cron = %self.cron,
            safety_net_secs = self.safety_net.as_secs(),
            "refresh scheduler started"
        );
        *running = Some(sched);
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        let Some(mut sched) = self.running.lock().await.take() else {
            return Ok(());
        };
        sched.shutdown().await.context("stopping scheduler")?;
        info!("refresh scheduler stopped");
        Ok(())
    }

    /// Runs a pass immediately, queued behind any pass already in progress.
    pub async fn trigger_now(&self) -> RefreshSummary {
        self.pipeline.run_full_refresh().await
    }

    /// Runs a pass only when the store is empty, so a fresh deployment has data before the
    /// first scheduled tick. Returns the pass summary when one ran.
    pub async fn bootstrap_if_empty(&self) -> Result<Option<RefreshSummary>> {
        let count = self
            .pipeline
            .store()
            .count_all()
            .await
            .context("counting stored snapshots")?;
        if count > 0 {
            info!(count, "found cached snapshots; skipping initial fetch");
            return Ok(None);
        }
        info!("no stored snapshots; fetching initial dataset");
        Ok(Some(self.trigger_now().await))
    }
}
