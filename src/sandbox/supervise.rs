use std::{
    os::unix::process::ExitStatusExt,
    process::{ExitStatus, Stdio},
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use nix::{
    errno::Errno,
    sys::signal::{Signal, killpg},
    unistd::Pid,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    task::JoinHandle,
};

use crate::{
    queue::CancelToken,
    sandbox::{SandboxBackend, SandboxError, StageSpec},
};

// Bounds how long we wait for pipes after the process group is gone.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited,
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct RawOutcome {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub truncated: bool,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub termination: Termination,
    pub wall_time: Duration,
}

/// Runs one stage to completion, timeout, or cancellation.
///
/// Whatever the outcome, the stage's whole process group is killed before
/// this returns, so nothing the program spawned outlives the stage.
pub async fn supervise(
    backend: &dyn SandboxBackend,
    spec: &StageSpec<'_>,
    stdin: Option<&[u8]>,
    cancel: &mut CancelToken,
) -> Result<RawOutcome, SandboxError> {
    if cancel.is_cancelled() {
        return Ok(RawOutcome {
            stdout: Vec::new(),
            stderr: Vec::new(),
            truncated: false,
            exit_code: None,
            signal: None,
            termination: Termination::Cancelled,
            wall_time: Duration::ZERO,
        });
    }

    let mut command = backend.prepare(spec)?;
    command
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let started = Instant::now();
    let mut child = command.spawn().map_err(|source| SandboxError::Spawn {
        program: spec.program().to_string(),
        source,
    })?;
    let pgid = child.id().and_then(|pid| i32::try_from(pid).ok());

    if let (Some(mut pipe), Some(input)) = (child.stdin.take(), stdin) {
        let input = input.to_vec();
        tokio::spawn(async move {
            // EPIPE is expected when the program ignores its input
            let _ = pipe.write_all(&input).await;
        });
    }

    let limit = spec.limits.max_output_bytes;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| SandboxError::Provision("missing stdout pipe".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| SandboxError::Provision("missing stderr pipe".to_string()))?;
    let stdout_capture = SharedCapture::default();
    let stderr_capture = SharedCapture::default();
    let stdout_task = tokio::spawn(read_limited(stdout, limit, stdout_capture.clone()));
    let stderr_task = tokio::spawn(read_limited(stderr, limit, stderr_capture.clone()));

    let waited = tokio::select! {
        status = child.wait() => status.map(|s| (Some(s), Termination::Exited)),
        _ = tokio::time::sleep(spec.limits.timeout) => Ok((None, Termination::TimedOut)),
        _ = cancel.cancelled() => Ok((None, Termination::Cancelled)),
    };
    let wall_time = started.elapsed();

    if let Some(pgid) = pgid {
        kill_group(pgid);
    }

    let (status, termination) = match waited {
        Ok((Some(status), termination)) => (status, termination),
        Ok((None, termination)) => {
            tracing::debug!(
                submission_id = %spec.submission_id,
                stage = ?spec.stage,
                ?termination,
                "stage stopped by supervisor"
            );
            backend.abort(spec).await;
            (child.wait().await?, termination)
        }
        Err(err) => {
            backend.abort(spec).await;
            return Err(SandboxError::Io(err));
        }
    };

    let (stdout, stdout_truncated) = drain(stdout_task, &stdout_capture).await;
    let (stderr, stderr_truncated) = drain(stderr_task, &stderr_capture).await;
    let (exit_code, signal) = decode_status(status, termination);

    Ok(RawOutcome {
        stdout,
        stderr,
        truncated: stdout_truncated || stderr_truncated,
        exit_code,
        signal,
        termination,
        wall_time,
    })
}

fn decode_status(status: ExitStatus, termination: Termination) -> (Option<i32>, Option<i32>) {
    match termination {
        // the SIGKILL is ours, not the program's
        Termination::TimedOut | Termination::Cancelled => (status.code(), None),
        Termination::Exited => (status.code(), status.signal()),
    }
}

/// Sends SIGKILL to a process group, ignoring groups that already vanished.
pub fn kill_group(pgid: i32) {
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(err) => tracing::warn!(pgid, error = %err, "failed to kill process group"),
    }
}

#[derive(Debug, Default)]
struct Capture {
    bytes: Vec<u8>,
    truncated: bool,
}

type SharedCapture = Arc<Mutex<Capture>>;

/// Waits briefly for a pipe reader, then keeps whatever it captured so far.
/// A reader still blocked after the grace period counts as truncated.
async fn drain(mut task: JoinHandle<()>, capture: &SharedCapture) -> (Vec<u8>, bool) {
    let finished = tokio::time::timeout(DRAIN_GRACE, &mut task).await.is_ok();
    if !finished {
        task.abort();
    }
    let mut capture = capture.lock().unwrap_or_else(PoisonError::into_inner);
    (std::mem::take(&mut capture.bytes), capture.truncated || !finished)
}

/// Reads everything into `capture`, keeping at most `limit` bytes.
async fn read_limited<R>(mut reader: R, limit: usize, capture: SharedCapture)
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let mut capture = capture.lock().unwrap_or_else(PoisonError::into_inner);
                let remaining = limit.saturating_sub(capture.bytes.len());
                if n > remaining {
                    capture.truncated = true;
                }
                capture.bytes.extend_from_slice(&chunk[..remaining.min(n)]);
            }
        }
    }
}
