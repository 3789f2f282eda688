use std::{
    fs::Permissions,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use tempfile::TempDir;
use uuid::Uuid;

use crate::sandbox::SandboxError;

/// Fresh per-submission directory; removed on teardown or drop.
#[derive(Debug)]
pub struct Workdir {
    dir: TempDir,
}

impl Workdir {
    pub fn provision(root: &Path, id: Uuid, mode: u32) -> Result<Self, SandboxError> {
        std::fs::create_dir_all(root).map_err(|e| {
            SandboxError::Provision(format!("sandbox root {} unavailable: {e}", root.display()))
        })?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("codepad-{}-", id.as_simple()))
            .tempdir_in(root)
            .map_err(|e| SandboxError::Provision(format!("cannot create run directory: {e}")))?;
        std::fs::set_permissions(dir.path(), Permissions::from_mode(mode))
            .map_err(|e| SandboxError::Provision(format!("cannot set run directory mode: {e}")))?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Writes a file by plain name; callers validate names beforehand.
    pub async fn write_file(&self, name: &str, content: &[u8]) -> Result<PathBuf, SandboxError> {
        if name.contains('/') || name == "." || name == ".." {
            return Err(SandboxError::Provision(format!("refusing to write {name:?}")));
        }
        let path = self.dir.path().join(name);
        tokio::fs::write(&path, content).await?;
        Ok(path)
    }

    /// Removes the directory. Failures are logged, never surfaced.
    pub async fn teardown(self, id: Uuid) {
        let path = self.dir.path().to_path_buf();
        let outcome = tokio::task::spawn_blocking(move || self.dir.close()).await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::warn!(submission_id = %id, path = %path.display(), error = %err, "failed to remove run directory")
            }
            Err(err) => {
                tracing::warn!(submission_id = %id, path = %path.display(), error = %err, "run directory cleanup task failed")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn provisions_private_directory_and_removes_it() {
        let root = tempfile::tempdir().unwrap();
        let id = Uuid::now_v7();
        let workdir = Workdir::provision(root.path(), id, 0o700).unwrap();
        let path = workdir.path().to_path_buf();

        let file = workdir.write_file("main.sh", b"echo hi").await.unwrap();
        assert_eq!(std::fs::read(&file).unwrap(), b"echo hi");
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o700);

        workdir.teardown(id).await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn refuses_path_like_names() {
        let root = tempfile::tempdir().unwrap();
        let workdir = Workdir::provision(root.path(), Uuid::now_v7(), 0o700).unwrap();
        assert!(workdir.write_file("../escape", b"x").await.is_err());
        assert!(workdir.write_file("..", b"x").await.is_err());
    }

    #[test]
    fn unusable_root_is_a_provisioning_failure() {
        let root = tempfile::tempdir().unwrap();
        let blocker = root.path().join("file");
        std::fs::write(&blocker, b"").unwrap();
        let err = Workdir::provision(&blocker.join("nested"), Uuid::now_v7(), 0o700).unwrap_err();
        assert!(err.is_retryable());
    }
}
