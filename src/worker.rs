use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::{
    error::{ErrorInfo, ErrorKind},
    executor::{Execution, Executor},
    metrics::MetricsRegistry,
    models::SubmissionStatus,
    queue::{QueuedJob, Scheduler},
    results::ResultStore,
    sandbox::SandboxError,
};

// provisioning failures get one more attempt in a fresh directory
const MAX_ATTEMPTS: usize = 2;

pub fn spawn_worker_pool(
    workers: usize,
    scheduler: Scheduler,
    results: ResultStore,
    metrics: Arc<MetricsRegistry>,
    executor: Arc<Executor>,
) -> Vec<JoinHandle<()>> {
    (0..workers.max(1))
        .map(|worker_id| {
            let scheduler = scheduler.clone();
            let results = results.clone();
            let metrics = metrics.clone();
            let executor = executor.clone();
            tokio::spawn(async move {
                worker_loop(worker_id, scheduler, results, metrics, executor).await;
            })
        })
        .collect()
}

async fn worker_loop(
    worker_id: usize,
    scheduler: Scheduler,
    results: ResultStore,
    metrics: Arc<MetricsRegistry>,
    executor: Arc<Executor>,
) {
    while let Some(job) = scheduler.next().await {
        let id = job.id;

        if job.cancel.is_cancelled() {
            tracing::info!(worker_id, submission_id = %id, "skipping cancelled submission");
            metrics.dequeued();
            finalize(
                &results,
                &metrics,
                id,
                SubmissionStatus::Cancelled,
                None,
                Some(ErrorInfo::new(ErrorKind::Cancelled, "cancelled before execution")),
            );
        } else {
            tracing::info!(worker_id, submission_id = %id, language = %job.profile.id, "starting execution");
            metrics.started();
            results.mark_running(id);
            match run_with_retry(worker_id, &executor, &job).await {
                Ok(execution) => {
                    tracing::info!(
                        worker_id,
                        submission_id = %id,
                        status = execution.status.as_str(),
                        wall_time_ms = execution.result.wall_time_ms,
                        "execution finished"
                    );
                    finalize(
                        &results,
                        &metrics,
                        id,
                        execution.status,
                        Some(execution.result),
                        execution.error,
                    );
                }
                Err(err) => {
                    tracing::error!(worker_id, submission_id = %id, error = %err, "sandbox failure");
                    metrics.infrastructure_failure();
                    finalize(
                        &results,
                        &metrics,
                        id,
                        SubmissionStatus::Failed,
                        None,
                        Some(ErrorInfo::new(
                            ErrorKind::InfrastructureFailure,
                            "the execution sandbox could not be prepared",
                        )),
                    );
                }
            }
            metrics.stopped();
        }

        scheduler.complete(id).await;
    }
    tracing::info!(worker_id, "scheduler closed, worker exiting");
}

async fn run_with_retry(
    worker_id: usize,
    executor: &Executor,
    job: &QueuedJob,
) -> Result<Execution, SandboxError> {
    let mut cancel = job.cancel.clone();
    let mut attempt = 1;
    loop {
        match executor.execute(job, &mut cancel).await {
            Err(err) if err.is_retryable() && attempt < MAX_ATTEMPTS => {
                tracing::warn!(worker_id, submission_id = %job.id, attempt, error = %err, "retrying after provisioning failure");
                attempt += 1;
            }
            other => return other,
        }
    }
}

fn finalize(
    results: &ResultStore,
    metrics: &MetricsRegistry,
    id: uuid::Uuid,
    status: SubmissionStatus,
    result: Option<crate::models::ExecutionResult>,
    error: Option<ErrorInfo>,
) {
    if results.finish(id, status, result, error) {
        metrics.finished(status);
    }
}
