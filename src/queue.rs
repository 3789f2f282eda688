use std::{
    cmp::Ordering,
    collections::BinaryHeap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering as AtomicOrdering},
    },
};

use dashmap::DashMap;
use tokio::sync::{Mutex, Notify, watch};
use uuid::Uuid;

use crate::{
    config::QueueOrder,
    error::ServiceError,
    languages::LanguageProfile,
    metrics::MetricsRegistry,
    models::{ExecutionLimits, SourceFile},
};

/// An admitted submission waiting for (or holding) an executor slot.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub id: Uuid,
    pub owner: String,
    pub profile: Arc<LanguageProfile>,
    pub source: String,
    pub entry_file: String,
    pub files: Vec<SourceFile>,
    pub stdin: Option<String>,
    pub limits: ExecutionLimits,
    pub priority: u8,
    pub cancel: CancelToken,
}

/// Receiving side of a submission's cancellation flag.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested; never resolves otherwise.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn detached() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self { rx })
    }
}

#[derive(Debug)]
struct PendingJob {
    priority: u8,
    tiebreak: u128,
    job: QueuedJob,
}

impl PartialEq for PendingJob {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PendingJob {}

impl PartialOrd for PendingJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingJob {
    // max-heap: higher priority first, then the smaller tiebreak
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.tiebreak.cmp(&self.tiebreak))
    }
}

#[derive(Debug, Default)]
struct QueueState {
    pending: BinaryHeap<PendingJob>,
    in_flight: usize,
    closed: bool,
}

/// Outcome of [`Scheduler::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Removed before dispatch; the caller owns finalization.
    Dequeued,
    /// Already dispatched; the executor will terminate it.
    Signalled,
    Unknown,
}

/// Single point of admission control in front of the executor slots.
#[derive(Clone)]
pub struct Scheduler {
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
    cancels: Arc<DashMap<Uuid, watch::Sender<bool>>>,
    sequence: Arc<AtomicU64>,
    order: QueueOrder,
    ceiling: usize,
    metrics: Arc<MetricsRegistry>,
}

/// Everything needed to admit a job except its cancellation token.
#[derive(Debug, Clone)]
pub struct Admission {
    pub id: Uuid,
    pub owner: String,
    pub profile: Arc<LanguageProfile>,
    pub source: String,
    pub entry_file: String,
    pub files: Vec<SourceFile>,
    pub stdin: Option<String>,
    pub limits: ExecutionLimits,
    pub priority: u8,
}

impl Scheduler {
    pub fn new(ceiling: usize, order: QueueOrder, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::default())),
            notify: Arc::new(Notify::new()),
            cancels: Arc::new(DashMap::new()),
            sequence: Arc::new(AtomicU64::new(0)),
            order,
            ceiling: ceiling.max(1),
            metrics,
        }
    }

    pub async fn submit(&self, admission: Admission) -> Result<(), ServiceError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(ServiceError::InfrastructureFailure(
                "scheduler is shutting down".to_string(),
            ));
        }
        if state.in_flight >= self.ceiling {
            self.metrics.rejected();
            return Err(ServiceError::AdmissionRejected {
                in_flight: state.in_flight,
                ceiling: self.ceiling,
            });
        }

        let (tx, rx) = watch::channel(false);
        self.cancels.insert(admission.id, tx);

        let seq = self.sequence.fetch_add(1, AtomicOrdering::Relaxed);
        let (priority, tiebreak) = match self.order {
            QueueOrder::Fifo => (0, u128::from(seq)),
            QueueOrder::Priority => (admission.priority, admission.id.as_u128()),
        };

        state.in_flight += 1;
        state.pending.push(PendingJob {
            priority,
            tiebreak,
            job: QueuedJob {
                id: admission.id,
                owner: admission.owner,
                profile: admission.profile,
                source: admission.source,
                entry_file: admission.entry_file,
                files: admission.files,
                stdin: admission.stdin,
                limits: admission.limits,
                priority: admission.priority,
                cancel: CancelToken { rx },
            },
        });
        drop(state);

        self.metrics.submitted();
        self.notify.notify_one();
        Ok(())
    }

    /// Waits for the next job; `None` once the scheduler is closed and drained.
    pub async fn next(&self) -> Option<QueuedJob> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().await;
                if let Some(pending) = state.pending.pop() {
                    if !state.pending.is_empty() {
                        self.notify.notify_one();
                    }
                    return Some(pending.job);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Requests cancellation. Queued jobs are removed outright.
    pub async fn cancel(&self, id: Uuid) -> CancelOutcome {
        let Some(sender) = self.cancels.get(&id).map(|s| s.value().clone()) else {
            return CancelOutcome::Unknown;
        };
        let _ = sender.send(true);

        let mut state = self.state.lock().await;
        let before = state.pending.len();
        state.pending.retain(|pending| pending.job.id != id);
        if state.pending.len() < before {
            state.in_flight = state.in_flight.saturating_sub(1);
            drop(state);
            self.cancels.remove(&id);
            self.metrics.dequeued();
            CancelOutcome::Dequeued
        } else {
            CancelOutcome::Signalled
        }
    }

    /// Releases the admission slot held by a dispatched job.
    pub async fn complete(&self, id: Uuid) {
        if self.cancels.remove(&id).is_some() {
            let mut state = self.state.lock().await;
            state.in_flight = state.in_flight.saturating_sub(1);
        }
    }

    /// Signals every admitted job, queued or running. Queued ones stay in
    /// the queue and are finalized as cancelled when a worker picks them up.
    pub fn cancel_all(&self) -> usize {
        self.cancels
            .iter()
            .filter(|sender| sender.value().send(true).is_ok())
            .count()
    }

    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.notify.notify_waiters();
    }

    pub async fn in_flight(&self) -> usize {
        self.state.lock().await.in_flight
    }

    pub async fn queued(&self) -> usize {
        self.state.lock().await.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::languages::shell_profile;

    fn limits() -> ExecutionLimits {
        ExecutionLimits {
            timeout_ms: 1_000,
            build_timeout_ms: 1_000,
            memory_mb: 64,
            build_memory_mb: 64,
            cpu_time_secs: 1,
            max_output_bytes: 1024,
            max_file_size_bytes: 1024,
            max_processes: 8,
        }
    }

    fn admission(priority: u8) -> Admission {
        Admission {
            id: Uuid::now_v7(),
            owner: "t".into(),
            profile: Arc::new(shell_profile()),
            source: "echo hi".into(),
            entry_file: "main.sh".into(),
            files: Vec::new(),
            stdin: None,
            limits: limits(),
            priority,
        }
    }

    fn scheduler(ceiling: usize, order: QueueOrder) -> Scheduler {
        Scheduler::new(ceiling, order, Arc::new(MetricsRegistry::new()))
    }

    #[tokio::test]
    async fn dequeues_in_arrival_order() {
        let scheduler = scheduler(8, QueueOrder::Fifo);
        let mut ids = Vec::new();
        for priority in [1, 9, 5] {
            let a = admission(priority);
            ids.push(a.id);
            scheduler.submit(a).await.unwrap();
        }
        for expected in ids {
            assert_eq!(scheduler.next().await.unwrap().id, expected);
        }
    }

    #[tokio::test]
    async fn priority_mode_orders_by_priority_then_id() {
        let scheduler = scheduler(8, QueueOrder::Priority);
        let mut low_a = admission(1);
        let mut low_b = admission(1);
        if low_b.id < low_a.id {
            std::mem::swap(&mut low_a, &mut low_b);
        }
        let high = admission(7);
        let (low_a_id, low_b_id, high_id) = (low_a.id, low_b.id, high.id);

        scheduler.submit(low_b).await.unwrap();
        scheduler.submit(low_a).await.unwrap();
        scheduler.submit(high).await.unwrap();

        assert_eq!(scheduler.next().await.unwrap().id, high_id);
        assert_eq!(scheduler.next().await.unwrap().id, low_a_id);
        assert_eq!(scheduler.next().await.unwrap().id, low_b_id);
    }

    #[tokio::test]
    async fn rejects_beyond_ceiling_until_a_slot_is_released() {
        let scheduler = scheduler(2, QueueOrder::Fifo);
        scheduler.submit(admission(0)).await.unwrap();
        scheduler.submit(admission(0)).await.unwrap();

        let err = scheduler.submit(admission(0)).await.unwrap_err();
        assert!(matches!(err, ServiceError::AdmissionRejected { ceiling: 2, .. }));

        // running jobs still count against the ceiling
        let job = scheduler.next().await.unwrap();
        assert!(scheduler.submit(admission(0)).await.is_err());

        scheduler.complete(job.id).await;
        assert!(scheduler.submit(admission(0)).await.is_ok());
        assert_eq!(scheduler.in_flight().await, 2);
    }

    #[tokio::test]
    async fn cancelling_a_queued_job_removes_it_and_frees_its_slot() {
        let scheduler = scheduler(1, QueueOrder::Fifo);
        let a = admission(0);
        let id = a.id;
        scheduler.submit(a).await.unwrap();

        assert_eq!(scheduler.cancel(id).await, CancelOutcome::Dequeued);
        assert_eq!(scheduler.queued().await, 0);
        assert_eq!(scheduler.in_flight().await, 0);
        assert_eq!(scheduler.cancel(id).await, CancelOutcome::Unknown);
    }

    #[tokio::test]
    async fn cancelling_a_dispatched_job_signals_its_token() {
        let scheduler = scheduler(1, QueueOrder::Fifo);
        let a = admission(0);
        let id = a.id;
        scheduler.submit(a).await.unwrap();
        let mut job = scheduler.next().await.unwrap();
        assert!(!job.cancel.is_cancelled());

        assert_eq!(scheduler.cancel(id).await, CancelOutcome::Signalled);
        tokio::time::timeout(Duration::from_secs(1), job.cancel.cancelled())
            .await
            .unwrap();
        assert!(job.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn waiting_worker_wakes_on_submit_and_exits_on_close() {
        let scheduler = scheduler(4, QueueOrder::Fifo);
        let waiter = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.next().await.map(|job| job.id) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let a = admission(0);
        let id = a.id;
        scheduler.submit(a).await.unwrap();
        assert_eq!(waiter.await.unwrap(), Some(id));

        let idle = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.next().await.is_none() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        scheduler.close().await;
        assert!(tokio::time::timeout(Duration::from_secs(1), idle).await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn cancel_all_signals_queued_and_dispatched_jobs() {
        let scheduler = scheduler(4, QueueOrder::Fifo);
        scheduler.submit(admission(0)).await.unwrap();
        scheduler.submit(admission(0)).await.unwrap();
        let running = scheduler.next().await.unwrap();

        assert_eq!(scheduler.cancel_all(), 2);
        assert!(running.cancel.is_cancelled());
        let queued = scheduler.next().await.unwrap();
        assert!(queued.cancel.is_cancelled());
        assert_eq!(scheduler.in_flight().await, 2);
    }
}
