// Per-job state machine: resolve tenant and source, open the ingest
// transaction, drive the archive streamer under a deadline, then commit and
// report, or roll back and report the error. One coordinator per message;
// work inside a job is strictly sequential.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{error, info, warn};

use towersync_ingest::{ingest_snapshot, PageDispatcher};
use towersync_models::{
    claim_for_refresh, find_source, find_tenant, finish_refresh, RepoStats, SourceScope,
};

use crate::metrics::Metrics;
use crate::task::{MessageHeaders, TaskOutput, TaskUpdater};

/// Hard ceiling on one snapshot ingest.
const JOB_DEADLINE: Duration = Duration::from_secs(15 * 60);

/// A unit of work from the job bus.
#[derive(Debug, Clone, Deserialize)]
pub struct JobDescriptor {
    pub tenant_id: i64,
    pub source_id: i64,
    pub task_url: String,
    pub data_url: String,
    pub size: i64,
}

/// Run one job to completion and report its outcome on the status callback.
pub async fn run_job(
    pool: PgPool,
    client: reqwest::Client,
    metrics: Arc<Metrics>,
    job: JobDescriptor,
    headers: MessageHeaders,
) {
    info!(data_url = %job.data_url, size = job.size, "Persister job started");
    let task = TaskUpdater::new(client.clone(), job.task_url.clone(), headers);

    match execute(&pool, &client, &task, &metrics, &job).await {
        Ok(stats) => {
            metrics.jobs_succeeded.inc();
            task.report("completed", "ok", "Success", Some(TaskOutput::Stats(stats)))
                .await;
            info!("Persister job finished");
        }
        Err(e) => {
            metrics.jobs_failed.inc();
            let message = e.to_string();
            error!(error = %message, "Persister job failed");
            task.report(
                "completed",
                "error",
                &message,
                Some(TaskOutput::Errors(vec![message.clone()])),
            )
            .await;
        }
    }
}

async fn execute(
    pool: &PgPool,
    client: &reqwest::Client,
    task: &TaskUpdater,
    metrics: &Metrics,
    job: &JobDescriptor,
) -> Result<BTreeMap<&'static str, RepoStats>> {
    // Lookup only; the persister never creates tenants or sources.
    find_tenant(pool, job.tenant_id)
        .await
        .context("Error finding tenant")?
        .ok_or_else(|| anyhow!("Error finding tenant: no tenant with id {}", job.tenant_id))?;
    let source = find_source(pool, job.source_id)
        .await
        .context("Error finding source")?
        .ok_or_else(|| anyhow!("Error finding source: no source with id {}", job.source_id))?;

    task.report(
        "running",
        "ok",
        &format!("Processing file size {} bytes", job.size),
        None,
    )
    .await;

    let scope = SourceScope {
        tenant_id: source.tenant_id,
        source_id: source.id,
    };
    let mut tx = pool.begin().await.context("Error opening transaction")?;
    let mut dispatcher = PageDispatcher::new(scope);

    match ingest(&mut tx, client, metrics, job, &mut dispatcher).await {
        Ok(()) => {
            let stats = dispatcher.stats();
            tx.commit().await.context("Error committing transaction")?;
            info!("Committed database changes");
            dispatcher.log_report();
            Ok(stats)
        }
        Err(e) => {
            warn!(error = %e, "Rolling back database changes");
            if let Err(rollback) = tx.rollback().await {
                warn!(error = %rollback, "Rollback failed");
            }
            Err(e)
        }
    }
}

async fn ingest(
    tx: &mut Transaction<'_, Postgres>,
    client: &reqwest::Client,
    metrics: &Metrics,
    job: &JobDescriptor,
    dispatcher: &mut PageDispatcher,
) -> Result<()> {
    // Single-writer guard: at most one refresh per source at a time. The
    // claim is released by commit or rollback.
    claim_for_refresh(&mut *tx, job.source_id).await?;

    tokio::time::timeout(
        JOB_DEADLINE,
        ingest_snapshot(
            client,
            &job.data_url,
            &mut *tx,
            dispatcher,
            &metrics.pages_processed,
        ),
    )
    .await
    .map_err(|_| {
        anyhow!(
            "Ingest deadline of {} minutes exceeded",
            JOB_DEADLINE.as_secs() / 60
        )
    })?
    .context("Error processing snapshot")?;

    finish_refresh(&mut *tx, job.source_id, job.size)
        .await
        .context("Error recording refresh state")?;
    Ok(())
}
