use std::sync::atomic::{AtomicU64, Ordering};

use crate::models::SubmissionStatus;

#[derive(Debug, Default)]
pub struct MetricsRegistry {
    submitted_total: AtomicU64,
    rejected_total: AtomicU64,
    started_total: AtomicU64,
    succeeded_total: AtomicU64,
    failed_total: AtomicU64,
    timed_out_total: AtomicU64,
    cancelled_total: AtomicU64,
    infrastructure_failures_total: AtomicU64,
    evicted_total: AtomicU64,
    queue_depth: AtomicU64,
    running: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submitted(&self) {
        self.submitted_total.fetch_add(1, Ordering::Relaxed);
        self.queue_depth.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rejected(&self) {
        self.rejected_total.fetch_add(1, Ordering::Relaxed);
    }

    /// A queued job left the queue without being dispatched.
    pub fn dequeued(&self) {
        decrement(&self.queue_depth);
    }

    pub fn started(&self) {
        self.started_total.fetch_add(1, Ordering::Relaxed);
        self.running.fetch_add(1, Ordering::Relaxed);
        decrement(&self.queue_depth);
    }

    pub fn stopped(&self) {
        decrement(&self.running);
    }

    pub fn finished(&self, status: SubmissionStatus) {
        let counter = match status {
            SubmissionStatus::Succeeded => &self.succeeded_total,
            SubmissionStatus::Failed => &self.failed_total,
            SubmissionStatus::TimedOut => &self.timed_out_total,
            SubmissionStatus::Cancelled => &self.cancelled_total,
            SubmissionStatus::Queued | SubmissionStatus::Running => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn infrastructure_failure(&self) {
        self.infrastructure_failures_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn evicted(&self, count: usize) {
        self.evicted_total.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn render_prometheus(&self) -> String {
        format!(
            concat!(
                "# TYPE execution_submitted_total counter\n",
                "execution_submitted_total {}\n",
                "# TYPE execution_rejected_total counter\n",
                "execution_rejected_total {}\n",
                "# TYPE execution_started_total counter\n",
                "execution_started_total {}\n",
                "# TYPE execution_succeeded_total counter\n",
                "execution_succeeded_total {}\n",
                "# TYPE execution_failed_total counter\n",
                "execution_failed_total {}\n",
                "# TYPE execution_timed_out_total counter\n",
                "execution_timed_out_total {}\n",
                "# TYPE execution_cancelled_total counter\n",
                "execution_cancelled_total {}\n",
                "# TYPE execution_infrastructure_failures_total counter\n",
                "execution_infrastructure_failures_total {}\n",
                "# TYPE execution_results_evicted_total counter\n",
                "execution_results_evicted_total {}\n",
                "# TYPE execution_queue_depth gauge\n",
                "execution_queue_depth {}\n",
                "# TYPE execution_running gauge\n",
                "execution_running {}\n"
            ),
            self.submitted_total.load(Ordering::Relaxed),
            self.rejected_total.load(Ordering::Relaxed),
            self.started_total.load(Ordering::Relaxed),
            self.succeeded_total.load(Ordering::Relaxed),
            self.failed_total.load(Ordering::Relaxed),
            self.timed_out_total.load(Ordering::Relaxed),
            self.cancelled_total.load(Ordering::Relaxed),
            self.infrastructure_failures_total.load(Ordering::Relaxed),
            self.evicted_total.load(Ordering::Relaxed),
            self.queue_depth.load(Ordering::Relaxed),
            self.running.load(Ordering::Relaxed),
        )
    }
}

fn decrement(gauge: &AtomicU64) {
    let mut current = gauge.load(Ordering::Relaxed);
    while current > 0 {
        match gauge.compare_exchange_weak(current, current - 1, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return,
            Err(actual) => current = actual,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauges_do_not_underflow() {
        let metrics = MetricsRegistry::new();
        metrics.started();
        metrics.stopped();
        metrics.stopped();
        let rendered = metrics.render_prometheus();
        assert!(rendered.contains("execution_queue_depth 0"));
        assert!(rendered.contains("execution_running 0"));
    }

    #[test]
    fn counts_terminal_statuses() {
        let metrics = MetricsRegistry::new();
        metrics.finished(SubmissionStatus::TimedOut);
        metrics.finished(SubmissionStatus::Cancelled);
        metrics.finished(SubmissionStatus::Running);
        let rendered = metrics.render_prometheus();
        assert!(rendered.contains("execution_timed_out_total 1"));
        assert!(rendered.contains("execution_cancelled_total 1"));
        assert!(rendered.contains("execution_succeeded_total 0"));
    }
}
