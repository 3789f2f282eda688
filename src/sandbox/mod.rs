mod docker;
mod process;
mod supervise;
mod workdir;

use std::{path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use uuid::Uuid;

use crate::{
    config::{SandboxBackendKind, SandboxConfig, SandboxIsolation},
    models::Stage,
};

pub use docker::DockerSandbox;
pub use process::ProcessSandbox;
pub use supervise::{RawOutcome, Termination, supervise};
pub use workdir::Workdir;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("sandbox provisioning failed: {0}")]
    Provision(String),
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("sandbox i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    /// Provisioning failures are worth one more attempt on a fresh sandbox.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Provision(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageLimits {
    pub timeout: Duration,
    pub memory_mb: u64,
    pub cpu_time_secs: u64,
    pub max_output_bytes: usize,
    pub max_file_size_bytes: u64,
    pub max_processes: u64,
}

/// One command to run inside a provisioned sandbox directory.
#[derive(Debug, Clone)]
pub struct StageSpec<'a> {
    pub submission_id: Uuid,
    pub stage: Stage,
    pub argv: Vec<String>,
    pub workdir: &'a Path,
    pub image: &'a str,
    pub limits: StageLimits,
}

impl StageSpec<'_> {
    pub fn program(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or_default()
    }
}

#[async_trait]
pub trait SandboxBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// The sandbox directory as seen by the program being run.
    fn guest_dir(&self, host_dir: &Path) -> String;

    fn workdir_mode(&self) -> u32 {
        0o700
    }

    /// Builds the command for a stage. The child must lead its own process group.
    fn prepare(&self, spec: &StageSpec<'_>) -> Result<Command, SandboxError>;

    /// Extra teardown after the supervisor killed a stage early.
    async fn abort(&self, _spec: &StageSpec<'_>) {}
}

pub struct SandboxFactory;

impl SandboxFactory {
    pub fn from_config(config: &SandboxConfig) -> anyhow::Result<Arc<dyn SandboxBackend>> {
        match config.backend {
            SandboxBackendKind::Docker => Ok(Arc::new(DockerSandbox::new(&config.docker_binary)?)),
            SandboxBackendKind::Process => {
                match config.isolation {
                    SandboxIsolation::Namespaces if !ProcessSandbox::namespaces_supported() => {
                        anyhow::bail!(
                            "process sandbox cannot create user, mount and pid namespaces on this host; \
                             use SANDBOX_BACKEND=docker, or SANDBOX_ISOLATION=none to run unconfined"
                        )
                    }
                    SandboxIsolation::Namespaces => {}
                    SandboxIsolation::Unconfined => tracing::warn!(
                        "process sandbox running without namespaces: submissions share the service's \
                         user, filesystem and process table"
                    ),
                }
                Ok(Arc::new(ProcessSandbox::new(config.isolation)))
            }
        }
    }
}

/// Strongest process isolation this host allows.
#[cfg(test)]
pub(crate) fn test_isolation() -> SandboxIsolation {
    if ProcessSandbox::namespaces_supported() {
        SandboxIsolation::Namespaces
    } else {
        SandboxIsolation::Unconfined
    }
}

#[cfg(test)]
pub(crate) fn test_sandbox() -> ProcessSandbox {
    ProcessSandbox::new(test_isolation())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn process_config(isolation: SandboxIsolation) -> SandboxConfig {
        SandboxConfig {
            backend: SandboxBackendKind::Process,
            isolation,
            docker_binary: "docker".to_string(),
            root: std::env::temp_dir().join("codepad-runs"),
        }
    }

    #[test]
    fn process_backend_is_confined_unless_explicitly_opted_out() {
        let confined = SandboxFactory::from_config(&process_config(SandboxIsolation::Namespaces));
        if ProcessSandbox::namespaces_supported() {
            assert_eq!(confined.unwrap().name(), "process");
        } else {
            let err = confined.err().unwrap().to_string();
            assert!(err.contains("SANDBOX_ISOLATION=none"), "{err}");
        }

        let unconfined =
            SandboxFactory::from_config(&process_config(SandboxIsolation::Unconfined)).unwrap();
        assert_eq!(unconfined.name(), "process-unconfined");
    }
}
