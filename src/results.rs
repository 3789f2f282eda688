use std::{sync::Arc, time::Duration};

use chrono::Utc;
use dashmap::DashMap;
use tokio::{sync::watch, task::JoinHandle, time::Instant};
use uuid::Uuid;

use crate::{
    error::ErrorInfo,
    metrics::MetricsRegistry,
    models::{ExecutionResult, SubmissionRecord, SubmissionStatus},
};

struct Entry {
    record: SubmissionRecord,
    status: watch::Sender<SubmissionStatus>,
    expires_at: Option<Instant>,
}

/// Authoritative per-submission state, readable while execution continues.
#[derive(Clone)]
pub struct ResultStore {
    records: Arc<DashMap<Uuid, Entry>>,
    retention: Duration,
    metrics: Arc<MetricsRegistry>,
}

impl ResultStore {
    pub fn new(retention: Duration, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            records: Arc::new(DashMap::new()),
            retention,
            metrics,
        }
    }

    pub fn insert(&self, record: SubmissionRecord) {
        let (status, _) = watch::channel(record.status);
        self.records.insert(
            record.submission_id,
            Entry {
                record,
                status,
                expires_at: None,
            },
        );
    }

    pub fn get(&self, id: &Uuid) -> Option<SubmissionRecord> {
        self.records.get(id).map(|e| e.record.clone())
    }

    /// Completed result, if the submission has one.
    pub fn report(&self, id: &Uuid) -> Option<ExecutionResult> {
        self.records.get(id).and_then(|e| e.record.result.clone())
    }

    pub fn remove(&self, id: &Uuid) {
        self.records.remove(id);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Moves a queued record to running. Returns false for any other state.
    pub fn mark_running(&self, id: Uuid) -> bool {
        let Some(mut entry) = self.records.get_mut(&id) else {
            return false;
        };
        if entry.record.status != SubmissionStatus::Queued {
            return false;
        }
        entry.record.status = SubmissionStatus::Running;
        entry.record.started_at = Some(Utc::now());
        entry.status.send_replace(SubmissionStatus::Running);
        true
    }

    /// Records the terminal state exactly once; later calls are ignored.
    pub fn finish(
        &self,
        id: Uuid,
        status: SubmissionStatus,
        result: Option<ExecutionResult>,
        error: Option<ErrorInfo>,
    ) -> bool {
        let Some(mut entry) = self.records.get_mut(&id) else {
            return false;
        };
        if entry.record.status.is_terminal() {
            tracing::debug!(submission_id = %id, current = entry.record.status.as_str(), "ignoring second terminal transition");
            return false;
        }
        entry.record.status = status;
        entry.record.result = result;
        entry.record.error = error;
        entry.record.finished_at = Some(Utc::now());
        entry.expires_at = Some(Instant::now() + self.retention);
        entry.status.send_replace(status);
        true
    }

    /// Fails every record that never reached a terminal state. Used once no
    /// worker is left to finish them.
    pub fn abandon_unfinished(&self, error: &ErrorInfo) -> usize {
        let live: Vec<Uuid> = self
            .records
            .iter()
            .filter(|entry| !entry.record.status.is_terminal())
            .map(|entry| *entry.key())
            .collect();
        live.into_iter()
            .filter(|id| self.finish(*id, SubmissionStatus::Failed, None, Some(error.clone())))
            .inspect(|_| self.metrics.finished(SubmissionStatus::Failed))
            .count()
    }

    /// Waits until the record is terminal or `timeout` elapses, then returns
    /// whatever the record looks like at that point.
    pub async fn wait_terminal(&self, id: &Uuid, timeout: Duration) -> Option<SubmissionRecord> {
        let mut rx = self.records.get(id)?.status.subscribe();
        if !timeout.is_zero() {
            let _ = tokio::time::timeout(timeout, rx.wait_for(|status| status.is_terminal())).await;
        }
        self.get(id)
    }

    /// Drops terminal records whose retention has lapsed. Live records are
    /// never touched.
    pub fn evict_expired(&self, now: Instant) -> usize {
        let before = self.records.len();
        self.records
            .retain(|_, entry| !matches!(entry.expires_at, Some(at) if at <= now));
        let evicted = before.saturating_sub(self.records.len());
        if evicted > 0 {
            self.metrics.evicted(evicted);
        }
        evicted
    }

    pub fn spawn_reaper(&self, interval: Duration) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let evicted = store.evict_expired(Instant::now());
                if evicted > 0 {
                    tracing::debug!(evicted, remaining = store.len(), "evicted expired results");
                }
            }
        })
    }
}
