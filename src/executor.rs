//! Isolated executor: one fresh sandbox directory per submission, an optional
//! build stage, the run stage, and normalization of whatever happened into an
//! [`ExecutionResult`].

use std::{path::PathBuf, sync::Arc, time::Duration};

use bytes::Bytes;
use uuid::Uuid;

use crate::{
    error::{ErrorInfo, ErrorKind},
    languages::{TemplateVars, render_template},
    models::{ExecutionLimits, ExecutionResult, LimitKind, Stage, SubmissionStatus},
    queue::{CancelToken, QueuedJob},
    sandbox::{
        RawOutcome, SandboxBackend, SandboxError, StageLimits, StageSpec, Termination, Workdir,
        supervise,
    },
};

const MEMORY_NOTICE: &str = "codepad: memory limit exceeded";

const OOM_MARKERS: &[&str] = &[
    "MemoryError",
    "std::bad_alloc",
    "java.lang.OutOfMemoryError",
    "JavaScript heap out of memory",
    "NoMemoryError",
    "memory allocation of",
    "Cannot allocate memory",
];

/// Terminal outcome of one submission.
#[derive(Debug, Clone)]
pub struct Execution {
    pub status: SubmissionStatus,
    pub result: ExecutionResult,
    pub error: Option<ErrorInfo>,
}

pub struct Executor {
    backend: Arc<dyn SandboxBackend>,
    sandbox_root: PathBuf,
}

impl Executor {
    pub fn new(backend: Arc<dyn SandboxBackend>, sandbox_root: PathBuf) -> Self {
        Self {
            backend,
            sandbox_root,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Runs a job in a freshly provisioned directory that is torn down on
    /// every path out of this function.
    pub async fn execute(
        &self,
        job: &QueuedJob,
        cancel: &mut CancelToken,
    ) -> Result<Execution, SandboxError> {
        let workdir = Workdir::provision(&self.sandbox_root, job.id, self.backend.workdir_mode())?;
        let outcome = self.run_stages(&workdir, job, cancel).await;
        workdir.teardown(job.id).await;
        outcome
    }

    async fn run_stages(
        &self,
        workdir: &Workdir,
        job: &QueuedJob,
        cancel: &mut CancelToken,
    ) -> Result<Execution, SandboxError> {
        for file in &job.files {
            stage_file(workdir, &file.name, file.content.as_bytes()).await?;
        }
        stage_file(workdir, &job.entry_file, job.source.as_bytes()).await?;

        let guest_dir = self.backend.guest_dir(workdir.path());
        let image = job.profile.image();

        if let Some(build) = &job.profile.build {
            let limits = build_limits(&job.limits);
            let vars = TemplateVars {
                dir: guest_dir.clone(),
                entry: job.entry_file.clone(),
                memory_mb: limits.memory_mb,
            };
            let spec = StageSpec {
                submission_id: job.id,
                stage: Stage::Build,
                argv: render_template(build, &vars),
                workdir: workdir.path(),
                image,
                limits,
            };
            tracing::debug!(submission_id = %job.id, argv = ?spec.argv, "build stage");
            let raw = supervise(self.backend.as_ref(), &spec, None, cancel).await?;
            let built = raw.termination == Termination::Exited
                && raw.exit_code == Some(0)
                && raw.signal.is_none();
            if !built {
                return Ok(classify(job.id, Stage::Build, raw, &spec.limits));
            }
        }

        let limits = run_limits(&job.limits);
        let vars = TemplateVars {
            dir: guest_dir,
            entry: job.entry_file.clone(),
            memory_mb: limits.memory_mb,
        };
        let spec = StageSpec {
            submission_id: job.id,
            stage: Stage::Run,
            argv: render_template(&job.profile.run, &vars),
            workdir: workdir.path(),
            image,
            limits,
        };
        tracing::debug!(submission_id = %job.id, argv = ?spec.argv, "run stage");
        let stdin = job.stdin.as_deref().map(str::as_bytes);
        let raw = supervise(self.backend.as_ref(), &spec, stdin, cancel).await?;
        Ok(classify(job.id, Stage::Run, raw, &spec.limits))
    }
}

async fn stage_file(workdir: &Workdir, name: &str, content: &[u8]) -> Result<(), SandboxError> {
    workdir
        .write_file(name, content)
        .await
        .map(|_| ())
        .map_err(|err| SandboxError::Provision(format!("cannot stage {name}: {err}")))
}

fn run_limits(limits: &ExecutionLimits) -> StageLimits {
    StageLimits {
        timeout: Duration::from_millis(limits.timeout_ms),
        memory_mb: limits.memory_mb,
        cpu_time_secs: limits.cpu_time_secs,
        max_output_bytes: limits.max_output_bytes,
        max_file_size_bytes: limits.max_file_size_bytes,
        max_processes: limits.max_processes,
    }
}

fn build_limits(limits: &ExecutionLimits) -> StageLimits {
    StageLimits {
        timeout: Duration::from_millis(limits.build_timeout_ms),
        memory_mb: limits.build_memory_mb,
        cpu_time_secs: limits.build_timeout_ms.div_ceil(1000).max(1),
        max_output_bytes: limits.max_output_bytes,
        max_file_size_bytes: limits.max_file_size_bytes.max(64 * 1024 * 1024),
        max_processes: limits.max_processes,
    }
}

/// Maps a raw stage outcome onto the submission's terminal status.
pub fn classify(id: Uuid, stage: Stage, raw: RawOutcome, limits: &StageLimits) -> Execution {
    let limit_exceeded = match raw.termination {
        Termination::TimedOut => Some(LimitKind::WallTime),
        Termination::Cancelled => None,
        Termination::Exited => detect_limit(&raw),
    };

    let mut stderr = raw.stderr;
    if limit_exceeded == Some(LimitKind::Memory) {
        if !stderr.is_empty() && !stderr.ends_with(b"\n") {
            stderr.push(b'\n');
        }
        stderr.extend_from_slice(format!("{MEMORY_NOTICE} ({} MiB)\n", limits.memory_mb).as_bytes());
    }

    let result = ExecutionResult {
        submission_id: id,
        stage,
        stdout: Bytes::from(raw.stdout),
        stderr: Bytes::from(stderr),
        exit_code: raw.exit_code,
        signal: raw.signal,
        wall_time_ms: u64::try_from(raw.wall_time.as_millis()).unwrap_or(u64::MAX),
        truncated: raw.truncated,
        limit_exceeded,
    };

    let stage_name = match stage {
        Stage::Build => "build",
        Stage::Run => "run",
    };
    let (status, error) = match raw.termination {
        Termination::TimedOut => (
            SubmissionStatus::TimedOut,
            Some(ErrorInfo::new(
                ErrorKind::ExecutionTimeout,
                format!(
                    "{stage_name} exceeded the wall-clock limit of {} ms",
                    limits.timeout.as_millis()
                ),
            )),
        ),
        Termination::Cancelled => (
            SubmissionStatus::Cancelled,
            Some(ErrorInfo::new(ErrorKind::Cancelled, "cancelled while running")),
        ),
        Termination::Exited if result.exited_cleanly() => (SubmissionStatus::Succeeded, None),
        Termination::Exited => {
            let kind = match stage {
                Stage::Build => ErrorKind::CompilationFailed,
                Stage::Run => ErrorKind::ExecutionCrash,
            };
            (
                SubmissionStatus::Failed,
                Some(ErrorInfo::new(kind, describe_exit(stage_name, &result))),
            )
        }
    };

    Execution {
        status,
        result,
        error,
    }
}

fn detect_limit(raw: &RawOutcome) -> Option<LimitKind> {
    const SIGKILL: i32 = 9;
    const SIGXCPU: i32 = 24;
    const SIGXFSZ: i32 = 25;

    let clean = raw.exit_code == Some(0) && raw.signal.is_none();
    match raw.signal {
        Some(SIGXCPU) => return Some(LimitKind::CpuTime),
        Some(SIGXFSZ) => return Some(LimitKind::FileSize),
        Some(SIGKILL) => return Some(LimitKind::Memory),
        _ => {}
    }
    // container runtimes report an OOM kill as 128 + SIGKILL
    if raw.exit_code == Some(128 + SIGKILL) {
        return Some(LimitKind::Memory);
    }
    if !clean {
        let stderr = String::from_utf8_lossy(&raw.stderr);
        if OOM_MARKERS.iter().any(|marker| stderr.contains(marker)) {
            return Some(LimitKind::Memory);
        }
    }
    raw.truncated.then_some(LimitKind::Output)
}

fn describe_exit(stage: &str, result: &ExecutionResult) -> String {
    let mut detail = match (result.exit_code, result.signal) {
        (_, Some(signal)) => format!("{stage} terminated by signal {signal}"),
        (Some(code), None) => format!("{stage} exited with code {code}"),
        (None, None) => format!("{stage} ended without an exit status"),
    };
    if let Some(limit) = result.limit_exceeded {
        let what = match limit {
            LimitKind::WallTime => "wall-clock",
            LimitKind::CpuTime => "cpu time",
            LimitKind::Memory => "memory",
            LimitKind::FileSize => "file size",
            LimitKind::Output => "output",
        };
        detail.push_str(&format!(" ({what} limit exceeded)"));
    }
    detail
}
