//! Shared provider data.
//!
//! Some values are fetched once for several sensors (e.g. a weather provider
//! returning temperature and humidity in one call). A `ProviderCollector`
//! refreshes them periodically into a `ReadingStore`; number sensors read
//! snapshot copies from it and never hold the lock across their own logic.

use crate::config::CollectorConfig;
use crate::executor::{ProcessExecutor, ProcessOutcome};
use crate::shutdown::ShutdownSignal;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReadingRecord {
    /// Latest good value, `None` once too many updates failed in a row.
    pub value: Option<f64>,
    pub updated_at: Option<DateTime<Utc>>,
    pub failed_updates: u32,
}

#[derive(Debug, Clone, Default)]
pub struct ReadingStore {
    records: Arc<Mutex<HashMap<String, ReadingRecord>>>,
}

impl ReadingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, key: &str, value: f64) {
        let mut records = self.records.lock();
        let record = records.entry(key.to_lowercase()).or_default();
        record.value = Some(value);
        record.updated_at = Some(Utc::now());
        record.failed_updates = 0;
    }

    /// Counts a failed update; past `max_tolerated_fails` the stale value is dropped.
    pub fn record_failure(&self, key: &str, max_tolerated_fails: u32) {
        let mut records = self.records.lock();
        let record = records.entry(key.to_lowercase()).or_default();
        record.failed_updates += 1;
        if record.failed_updates > max_tolerated_fails && record.value.take().is_some() {
            warn!(key, failed = record.failed_updates, "provider data invalidated after repeated failures");
        }
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.records.lock().get(&key.to_lowercase()).and_then(|r| r.value)
    }

    pub fn record(&self, key: &str) -> Option<ReadingRecord> {
        self.records.lock().get(&key.to_lowercase()).cloned()
    }
}

/// Periodically runs a provider command and stores its `key value` lines.
pub struct ProviderCollector {
    config: CollectorConfig,
    store: ReadingStore,
}

impl ProviderCollector {
    pub fn new(config: CollectorConfig, store: ReadingStore) -> Self {
        Self { config, store }
    }

    pub fn store(&self) -> &ReadingStore {
        &self.store
    }

    /// One refresh cycle. Keys missing from the output count as failed updates.
    pub async fn refresh(&self) {
        let outcome = ProcessExecutor::run(&self.config.execute, &self.config.args, self.config.timeout).await;
        let parsed = match outcome {
            ProcessOutcome::Exited(info) if info.success() => parse_lines(&info.stdout),
            ProcessOutcome::Exited(info) => {
                warn!(code = ?info.code, "provider command failed");
                HashMap::new()
            }
            ProcessOutcome::SpawnFailed(e) => {
                warn!(error = %e, "provider command could not be started");
                HashMap::new()
            }
            ProcessOutcome::TimedOut { .. } => {
                warn!("provider command timed out");
                HashMap::new()
            }
        };

        for key in &self.config.keys {
            match parsed.get(&key.to_lowercase()) {
                Some(value) => self.store.record_success(key, *value),
                None => self.store.record_failure(key, self.config.max_tolerated_fails),
            }
        }
        debug!(keys = parsed.len(), "provider data refreshed");
    }

    pub async fn run(self, shutdown: ShutdownSignal) {
        // refresh() already ran once before the sensors were initialized
        let start = tokio::time::Instant::now() + self.config.interval;
        let mut interval = tokio::time::interval_at(start, self.config.interval);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                _ = interval.tick() => {
                    tokio::select! {
                        biased;
                        _ = shutdown.wait() => break,
                        _ = self.refresh() => {}
                    }
                }
            }
        }
    }
}

fn parse_lines(output: &str) -> HashMap<String, f64> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let key = parts.next()?;
            let value = parts.next()?.parse::<f64>().ok()?;
            Some((key.to_lowercase(), value))
        })
        .collect()
}
