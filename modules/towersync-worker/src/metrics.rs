use prometheus::{IntCounter, Registry};

/// Process-level counters exposed on /metrics.
pub struct Metrics {
    pub registry: Registry,
    pub jobs_started: IntCounter,
    pub jobs_succeeded: IntCounter,
    pub jobs_failed: IntCounter,
    pub pages_processed: IntCounter,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let jobs_started = IntCounter::new(
            "persister_jobs_started_total",
            "Snapshot jobs accepted from the bus",
        )?;
        let jobs_succeeded = IntCounter::new(
            "persister_jobs_succeeded_total",
            "Snapshot jobs committed successfully",
        )?;
        let jobs_failed = IntCounter::new(
            "persister_jobs_failed_total",
            "Snapshot jobs rolled back with an error",
        )?;
        let pages_processed = IntCounter::new(
            "persister_pages_processed_total",
            "Archive entries dispatched across all jobs",
        )?;

        registry.register(Box::new(jobs_started.clone()))?;
        registry.register(Box::new(jobs_succeeded.clone()))?;
        registry.register(Box::new(jobs_failed.clone()))?;
        registry.register(Box::new(pages_processed.clone()))?;

        Ok(Self {
            registry,
            jobs_started,
            jobs_succeeded,
            jobs_failed,
            pages_processed,
        })
    }
}
