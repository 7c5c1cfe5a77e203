// Job intake: consumes job descriptors from the bus and fans each one out to
// a coordinator task. The poll loop stops on shutdown; in-flight jobs are
// allowed to finish under their own deadline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{Headers, Message};
use sqlx::PgPool;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use towersync_common::{Config, XrhIdentity};

use crate::coordinator::{run_job, JobDescriptor};
use crate::metrics::Metrics;
use crate::task::MessageHeaders;

pub async fn run(
    config: &Config,
    pool: PgPool,
    metrics: Arc<Metrics>,
    ready: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let consumer: StreamConsumer = ClientConfig::new()
        .set("bootstrap.servers", &config.kafka_brokers)
        .set("group.id", &config.kafka_group_id)
        .set("enable.auto.commit", "true")
        .set("auto.offset.reset", "earliest")
        .create()
        .context("Error creating kafka consumer")?;

    consumer
        .subscribe(&[&config.kafka_topic])
        .context("Error subscribing to topic")?;
    ready.store(true, Ordering::SeqCst);
    info!(topic = %config.kafka_topic, "Subscribed to job queue");

    let client = reqwest::Client::new();
    let mut jobs: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("Shutdown received, closing job queue");
                    break;
                }
            }
            message = consumer.recv() => {
                match message {
                    Err(e) => warn!(error = %e, "Queue error"),
                    Ok(m) => {
                        let payload = m.payload().unwrap_or_default().to_vec();
                        let headers = collect_headers(&m);
                        dispatch(&mut jobs, &pool, &client, &metrics, &payload, headers);
                    }
                }
            }
        }
        // Reap finished coordinators so the set stays small.
        while jobs.try_join_next().is_some() {}
    }

    info!(in_flight = jobs.len(), "Waiting for in-flight jobs");
    while jobs.join_next().await.is_some() {}
    Ok(())
}

fn dispatch(
    jobs: &mut JoinSet<()>,
    pool: &PgPool,
    client: &reqwest::Client,
    metrics: &Arc<Metrics>,
    payload: &[u8],
    headers: MessageHeaders,
) {
    let job: JobDescriptor = match serde_json::from_slice(payload) {
        Ok(job) => job,
        Err(e) => {
            warn!(error = %e, "Error parsing job descriptor");
            return;
        }
    };

    // Correlation id: the inbound request id, else a fresh one.
    let request_id = headers
        .request_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    if let Some(raw) = &headers.identity {
        match XrhIdentity::decode(raw) {
            Ok(id) => info!(
                account = %id.identity.account_number,
                org_id = %id.identity.internal.org_id,
                "Job submitted"
            ),
            Err(e) => warn!(error = %e, "Could not decode identity header"),
        }
    }

    metrics.jobs_started.inc();
    let span = info_span!(
        "persister_job",
        request_id = %request_id,
        tenant_id = job.tenant_id,
        source_id = job.source_id,
    );
    jobs.spawn(
        run_job(pool.clone(), client.clone(), metrics.clone(), job, headers).instrument(span),
    );
}

fn collect_headers<M: Message>(message: &M) -> MessageHeaders {
    let mut collected = MessageHeaders::default();
    let Some(headers) = message.headers() else {
        return collected;
    };
    for header in headers.iter() {
        let value = header
            .value
            .map(|v| String::from_utf8_lossy(v).into_owned());
        match header.key.to_ascii_lowercase().as_str() {
            "x-rh-identity" => collected.identity = value,
            "x-rh-insights-request-id" => collected.request_id = value,
            "event_type" => collected.event_type = value,
            _ => {}
        }
    }
    collected
}
