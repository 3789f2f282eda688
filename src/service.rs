use std::{collections::HashSet, sync::Arc, time::Duration};

use chrono::Utc;
use uuid::Uuid;

use crate::{
    config::EngineConfig,
    error::{ErrorInfo, ErrorKind, ServiceError, ServiceResult},
    languages::LanguageRegistry,
    metrics::MetricsRegistry,
    models::{
        ExecutionLimits, ExecutionResult, RunWorkspaceRequest, SourceFile, SubmissionAccepted,
        SubmissionRecord, SubmissionStatus, SubmitRequest,
    },
    queue::{Admission, CancelOutcome, Scheduler},
    results::ResultStore,
    workspace::{Workspace, validate_file_name},
};

const MAX_PRIORITY: u8 = 9;
const MAX_POLL_WAIT: Duration = Duration::from_secs(30);
const MAX_FILES_PER_SUBMISSION: usize = 64;
const MAX_FILE_SIZE_BYTES: u64 = 16 * 1024 * 1024;
const MAX_PROCESSES: u64 = 64;

/// Request-time ceilings applied before a submission is admitted.
#[derive(Debug, Clone)]
pub struct SubmissionPolicy {
    pub max_source_bytes: usize,
    pub max_timeout_ms: u64,
    pub max_output_bytes: usize,
    pub cancel_ack_timeout: Duration,
}

impl From<&EngineConfig> for SubmissionPolicy {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_source_bytes: config.max_source_bytes,
            max_timeout_ms: config.max_timeout_ms,
            max_output_bytes: config.max_output_bytes,
            cancel_ack_timeout: config.cancel_ack_timeout,
        }
    }
}

/// Front door for submissions: validation, admission, polling, cancellation.
#[derive(Clone)]
pub struct ExecutionService {
    registry: Arc<LanguageRegistry>,
    scheduler: Scheduler,
    results: ResultStore,
    metrics: Arc<MetricsRegistry>,
    policy: SubmissionPolicy,
}

impl ExecutionService {
    pub fn new(
        registry: Arc<LanguageRegistry>,
        scheduler: Scheduler,
        results: ResultStore,
        metrics: Arc<MetricsRegistry>,
        policy: SubmissionPolicy,
    ) -> Self {
        Self {
            registry,
            scheduler,
            results,
            metrics,
            policy,
        }
    }

    pub fn registry(&self) -> &LanguageRegistry {
        &self.registry
    }

    /// Validates and enqueues. Nothing is recorded for rejected requests.
    pub async fn submit(&self, owner: &str, request: SubmitRequest) -> ServiceResult<SubmissionAccepted> {
        let profile = self.registry.get(&request.language).ok_or_else(|| {
            ServiceError::Validation(format!("unsupported language: {}", request.language))
        })?;

        if request.source.trim().is_empty() {
            return Err(ServiceError::Validation("source is empty".to_string()));
        }
        let total_bytes = request.source.len()
            + request.files.iter().map(|f| f.content.len()).sum::<usize>();
        if total_bytes > self.policy.max_source_bytes {
            return Err(ServiceError::Validation(format!(
                "source exceeds {} bytes",
                self.policy.max_source_bytes
            )));
        }
        if let Some(stdin) = &request.stdin {
            if stdin.len() > self.policy.max_source_bytes {
                return Err(ServiceError::Validation(format!(
                    "stdin exceeds {} bytes",
                    self.policy.max_source_bytes
                )));
            }
        }

        let entry_file = request
            .entry_file
            .clone()
            .unwrap_or_else(|| profile.default_entry());
        validate_file_name(&entry_file)?;
        validate_extra_files(&entry_file, &request.files)?;

        let priority = request.priority.unwrap_or(0);
        if priority > MAX_PRIORITY {
            return Err(ServiceError::Validation(format!(
                "priority must be between 0 and {MAX_PRIORITY}"
            )));
        }
        let timeout_ms = match request.timeout_ms {
            Some(0) => {
                return Err(ServiceError::Validation("timeoutMs must be positive".to_string()));
            }
            Some(requested) => requested.min(self.policy.max_timeout_ms),
            None => profile.timeout_ms.min(self.policy.max_timeout_ms),
        };
        let limits = ExecutionLimits {
            timeout_ms,
            build_timeout_ms: profile.build_timeout_ms,
            memory_mb: profile.memory_mb,
            build_memory_mb: profile.build_memory_mb,
            cpu_time_secs: timeout_ms.div_ceil(1000) + 1,
            max_output_bytes: self.policy.max_output_bytes,
            max_file_size_bytes: MAX_FILE_SIZE_BYTES,
            max_processes: MAX_PROCESSES,
        }
        .normalized();

        let id = Uuid::now_v7();
        self.results.insert(SubmissionRecord {
            submission_id: id,
            owner: owner.to_string(),
            language: profile.id.clone(),
            entry_file: entry_file.clone(),
            status: SubmissionStatus::Queued,
            priority,
            requested_at: Utc::now(),
            started_at: None,
            finished_at: None,
            result: None,
            error: None,
        });

        let admission = Admission {
            id,
            owner: owner.to_string(),
            profile: profile.clone(),
            source: request.source,
            entry_file,
            files: request.files,
            stdin: request.stdin,
            limits,
            priority,
        };
        if let Err(err) = self.scheduler.submit(admission).await {
            self.results.remove(&id);
            tracing::info!(owner, language = %profile.id, error = %err, "submission rejected");
            return Err(err);
        }

        tracing::info!(submission_id = %id, owner, language = %profile.id, priority, "submission accepted");
        Ok(SubmissionAccepted {
            submission_id: id,
            status: SubmissionStatus::Queued,
        })
    }

    /// Submits a workspace: `entry_file` is the source, every other file is
    /// staged next to it.
    pub async fn submit_workspace(
        &self,
        owner: &str,
        workspace: &Workspace,
        request: RunWorkspaceRequest,
    ) -> ServiceResult<SubmissionAccepted> {
        workspace.ensure_owner(owner)?;
        let entry = workspace
            .file(&request.entry_file)
            .ok_or(ServiceError::NotFound("file"))?;
        let files = workspace
            .files
            .iter()
            .filter(|f| f.name != entry.name)
            .map(|f| SourceFile {
                name: f.name.clone(),
                content: f.content.clone(),
            })
            .collect();

        self.submit(
            owner,
            SubmitRequest {
                language: entry.language.clone(),
                source: entry.content.clone(),
                entry_file: Some(entry.name.clone()),
                stdin: request.stdin,
                files,
                priority: request.priority,
                timeout_ms: request.timeout_ms,
            },
        )
        .await
    }

    /// Current record, optionally waiting up to `wait` for a terminal state.
    pub async fn poll(
        &self,
        owner: &str,
        id: Uuid,
        wait: Option<Duration>,
    ) -> ServiceResult<SubmissionRecord> {
        let record = self.owned_record(owner, id)?;
        let wait = wait.unwrap_or_default().min(MAX_POLL_WAIT);
        if record.status.is_terminal() || wait.is_zero() {
            return Ok(record);
        }
        self.results
            .wait_terminal(&id, wait)
            .await
            .ok_or(ServiceError::NotFound("submission"))
    }

    /// The completed result; idempotent.
    pub fn report(&self, owner: &str, id: Uuid) -> ServiceResult<ExecutionResult> {
        self.owned_record(owner, id)?;
        self.results
            .report(&id)
            .ok_or(ServiceError::NotFound("result"))
    }

    /// Cancels a queued or running submission. Returns once the submission
    /// is terminal and its sandbox is gone.
    pub async fn cancel(&self, owner: &str, id: Uuid) -> ServiceResult<()> {
        let record = self.owned_record(owner, id)?;
        if record.status.is_terminal() {
            return already_finished(record.status);
        }

        match self.scheduler.cancel(id).await {
            CancelOutcome::Dequeued => {
                if self.results.finish(
                    id,
                    SubmissionStatus::Cancelled,
                    None,
                    Some(ErrorInfo::new(ErrorKind::Cancelled, "cancelled before execution")),
                ) {
                    self.metrics.finished(SubmissionStatus::Cancelled);
                }
                tracing::info!(submission_id = %id, owner, "queued submission cancelled");
                Ok(())
            }
            CancelOutcome::Signalled | CancelOutcome::Unknown => {
                let record = self
                    .results
                    .wait_terminal(&id, self.policy.cancel_ack_timeout)
                    .await
                    .ok_or(ServiceError::NotFound("submission"))?;
                if !record.status.is_terminal() {
                    tracing::warn!(submission_id = %id, "executor did not acknowledge cancellation in time");
                    return Err(ServiceError::InfrastructureFailure(
                        "cancellation was not acknowledged in time".to_string(),
                    ));
                }
                tracing::info!(submission_id = %id, owner, status = record.status.as_str(), "running submission stopped");
                already_finished(record.status)
            }
        }
    }

    fn owned_record(&self, owner: &str, id: Uuid) -> ServiceResult<SubmissionRecord> {
        let record = self
            .results
            .get(&id)
            .ok_or(ServiceError::NotFound("submission"))?;
        if record.owner != owner {
            return Err(ServiceError::Forbidden);
        }
        Ok(record)
    }
}

fn already_finished(status: SubmissionStatus) -> ServiceResult<()> {
    if status == SubmissionStatus::Cancelled {
        Ok(())
    } else {
        Err(ServiceError::Conflict(format!(
            "submission already finished with status {}",
            status.as_str()
        )))
    }
}

fn validate_extra_files(entry_file: &str, files: &[SourceFile]) -> ServiceResult<()> {
    if files.len() > MAX_FILES_PER_SUBMISSION {
        return Err(ServiceError::Validation(format!(
            "at most {MAX_FILES_PER_SUBMISSION} extra files are allowed"
        )));
    }
    let mut seen = HashSet::from([entry_file]);
    for file in files {
        validate_file_name(&file.name)?;
        if !seen.insert(file.name.as_str()) {
            return Err(ServiceError::Validation(format!(
                "duplicate file name {}",
                file.name
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::{
        config::QueueOrder, executor::Executor, languages::test_registry,
        sandbox::test_sandbox, worker::spawn_worker_pool,
    };

    fn policy() -> SubmissionPolicy {
        SubmissionPolicy {
            max_source_bytes: 1024,
            max_timeout_ms: 2_000,
            max_output_bytes: 4096,
            cancel_ack_timeout: Duration::from_secs(5),
        }
    }

    /// Service without workers, so admitted submissions stay queued.
    fn idle_service(ceiling: usize) -> ExecutionService {
        let metrics = Arc::new(MetricsRegistry::new());
        ExecutionService::new(
            Arc::new(test_registry()),
            Scheduler::new(ceiling, QueueOrder::Fifo, metrics.clone()),
            ResultStore::new(Duration::from_secs(60), metrics.clone()),
            metrics,
            policy(),
        )
    }

    fn running_service(root: &Path, workers: usize) -> ExecutionService {
        let service = idle_service(8);
        spawn_worker_pool(
            workers,
            service.scheduler.clone(),
            service.results.clone(),
            service.metrics.clone(),
            Arc::new(Executor::new(Arc::new(test_sandbox()), root.to_path_buf())),
        );
        service
    }

    #[tokio::test]
    async fn invalid_requests_are_never_queued() {
        let service = idle_service(4);
        let cases = [
            SubmitRequest::new("brainfuck", "+"),
            SubmitRequest::new("sh", "   "),
            SubmitRequest::new("sh", "x".repeat(2048)),
            SubmitRequest {
                priority: Some(10),
                ..SubmitRequest::new("sh", "echo")
            },
            SubmitRequest {
                entry_file: Some("../evil.sh".into()),
                ..SubmitRequest::new("sh", "echo")
            },
            SubmitRequest {
                files: vec![SourceFile {
                    name: "main.sh".into(),
                    content: String::new(),
                }],
                ..SubmitRequest::new("sh", "echo")
            },
        ];
        for request in cases {
            let err = service.submit("tenant", request).await.unwrap_err();
            assert!(matches!(err, ServiceError::Validation(_)), "{err}");
        }
        assert_eq!(service.scheduler.in_flight().await, 0);
        assert!(service.results.is_empty());
    }

    #[tokio::test]
    async fn over_capacity_is_rejected_without_a_record() {
        let service = idle_service(2);
        service.submit("tenant", SubmitRequest::new("sh", "echo 1")).await.unwrap();
        service.submit("tenant", SubmitRequest::new("sh", "echo 2")).await.unwrap();

        let err = service
            .submit("tenant", SubmitRequest::new("sh", "echo 3"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::AdmissionRejected { in_flight: 2, ceiling: 2 }));
        assert_eq!(service.results.len(), 2);
    }

    #[tokio::test]
    async fn queued_submission_cancels_immediately() {
        let service = idle_service(4);
        let accepted = service
            .submit("tenant", SubmitRequest::new("sh", "echo never"))
            .await
            .unwrap();
        let id = accepted.submission_id;

        assert!(matches!(service.cancel("other", id).await, Err(ServiceError::Forbidden)));
        service.cancel("tenant", id).await.unwrap();
        let record = service.poll("tenant", id, None).await.unwrap();
        assert_eq!(record.status, SubmissionStatus::Cancelled);
        assert!(record.result.is_none());
        assert_eq!(service.scheduler.in_flight().await, 0);

        // cancelling twice is harmless
        service.cancel("tenant", id).await.unwrap();
        assert!(matches!(
            service.cancel("tenant", Uuid::now_v7()).await,
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn long_poll_returns_the_final_result() {
        let root = tempfile::tempdir().unwrap();
        let service = running_service(root.path(), 1);
        let accepted = service
            .submit(
                "tenant",
                SubmitRequest {
                    stdin: Some("world\n".into()),
                    ..SubmitRequest::new("sh", "read who; echo \"hello $who\"")
                },
            )
            .await
            .unwrap();

        let record = service
            .poll("tenant", accepted.submission_id, Some(Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(record.status, SubmissionStatus::Succeeded);
        let result = service.report("tenant", accepted.submission_id).unwrap();
        assert_eq!(&result.stdout[..], b"hello world\n");
        assert_eq!(result, service.report("tenant", accepted.submission_id).unwrap());

        assert!(matches!(
            service.cancel("tenant", accepted.submission_id).await,
            Err(ServiceError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn cancelling_a_running_submission_waits_for_teardown() {
        let root = tempfile::tempdir().unwrap();
        let service = running_service(root.path(), 1);
        let accepted = service
            .submit("tenant", SubmitRequest::new("sh", "sleep 30"))
            .await
            .unwrap();
        let id = accepted.submission_id;

        for _ in 0..100 {
            if service.results.get(&id).unwrap().status == SubmissionStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        service.cancel("tenant", id).await.unwrap();

        let record = service.poll("tenant", id, None).await.unwrap();
        assert_eq!(record.status, SubmissionStatus::Cancelled);
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn workspace_runs_stage_sibling_files() {
        let root = tempfile::tempdir().unwrap();
        let service = running_service(root.path(), 1);
        let registry = test_registry();
        let mut workspace =
            Workspace::seeded("ws".into(), "tenant".into(), &registry.get("sh").unwrap());
        workspace.files[0].content = ". ./util.sh; shout".into();
        workspace.files.push(crate::workspace::WorkspaceFile {
            name: "util.sh".into(),
            content: "shout() { echo LOUD; }".into(),
            language: "sh".into(),
        });

        let request = RunWorkspaceRequest {
            entry_file: "main.sh".into(),
            stdin: None,
            priority: None,
            timeout_ms: None,
        };
        assert!(matches!(
            service.submit_workspace("other", &workspace, request.clone()).await,
            Err(ServiceError::Forbidden)
        ));
        let accepted = service
            .submit_workspace("tenant", &workspace, request)
            .await
            .unwrap();
        let record = service
            .poll("tenant", accepted.submission_id, Some(Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(&record.result.unwrap().stdout[..], b"LOUD\n");
    }
}
