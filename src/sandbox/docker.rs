use std::{path::Path, time::Duration};

use async_trait::async_trait;
use nix::unistd::{Pid, setpgid};
use tokio::process::Command;

use crate::{
    models::Stage,
    sandbox::{SandboxBackend, SandboxError, StageSpec},
};

const GUEST_DIR: &str = "/workspace";
const REMOVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs each stage in a throwaway container with no network, dropped
/// capabilities, and cgroup memory/pid ceilings.
pub struct DockerSandbox {
    binary: String,
}

impl DockerSandbox {
    pub fn new(binary: &str) -> anyhow::Result<Self> {
        if binary.trim().is_empty() {
            anyhow::bail!("docker binary path is empty");
        }
        Ok(Self {
            binary: binary.to_string(),
        })
    }

    fn container_name(spec: &StageSpec<'_>) -> String {
        let stage = match spec.stage {
            Stage::Build => "build",
            Stage::Run => "run",
        };
        format!("codepad-{}-{stage}", spec.submission_id.as_simple())
    }

    fn run_args(&self, spec: &StageSpec<'_>) -> Vec<String> {
        let limits = &spec.limits;
        let fsize = limits.max_file_size_bytes;
        let cpu = limits.cpu_time_secs.max(1);
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "-i".to_string(),
            "--name".to_string(),
            Self::container_name(spec),
            "--network".to_string(),
            "none".to_string(),
            "--memory".to_string(),
            format!("{}m", limits.memory_mb),
            "--memory-swap".to_string(),
            format!("{}m", limits.memory_mb),
            "--cpus".to_string(),
            "1".to_string(),
            "--pids-limit".to_string(),
            limits.max_processes.to_string(),
            "--ulimit".to_string(),
            format!("fsize={fsize}:{fsize}"),
            "--ulimit".to_string(),
            format!("cpu={cpu}:{}", cpu + 1),
            "--cap-drop".to_string(),
            "ALL".to_string(),
            "--security-opt".to_string(),
            "no-new-privileges".to_string(),
            "--tmpfs".to_string(),
            "/tmp:rw,size=64m".to_string(),
            "-e".to_string(),
            format!("HOME={GUEST_DIR}"),
            "-v".to_string(),
            format!("{}:{GUEST_DIR}", spec.workdir.display()),
            "-w".to_string(),
            GUEST_DIR.to_string(),
            spec.image.to_string(),
        ];
        args.extend(spec.argv.iter().cloned());
        args
    }
}

#[async_trait]
impl SandboxBackend for DockerSandbox {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn guest_dir(&self, _host_dir: &Path) -> String {
        GUEST_DIR.to_string()
    }

    // cap-drop ALL removes DAC override from the container's root user
    fn workdir_mode(&self) -> u32 {
        0o777
    }

    fn prepare(&self, spec: &StageSpec<'_>) -> Result<Command, SandboxError> {
        if spec.argv.is_empty() {
            return Err(SandboxError::Provision("empty command template".to_string()));
        }
        let mut command = Command::new(&self.binary);
        command.args(self.run_args(spec));
        // SAFETY: setpgid is async-signal-safe.
        unsafe {
            command.pre_exec(|| {
                setpgid(Pid::from_raw(0), Pid::from_raw(0))?;
                Ok(())
            });
        }
        Ok(command)
    }

    async fn abort(&self, spec: &StageSpec<'_>) {
        let name = Self::container_name(spec);
        let removal = Command::new(&self.binary)
            .args(["rm", "-f", &name])
            .kill_on_drop(true)
            .output();
        match tokio::time::timeout(REMOVE_TIMEOUT, removal).await {
            Ok(Ok(output)) if output.status.success() => {
                tracing::debug!(container = %name, "container removed");
            }
            Ok(Ok(output)) => tracing::warn!(
                container = %name,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "docker rm failed"
            ),
            Ok(Err(err)) => tracing::warn!(container = %name, error = %err, "docker rm could not start"),
            Err(_) => tracing::warn!(container = %name, "docker rm timed out"),
        }
    }
}
