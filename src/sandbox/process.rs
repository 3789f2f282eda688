use std::{
    ffi::{CStr, CString},
    os::unix::{ffi::OsStrExt, process::CommandExt},
    path::{Path, PathBuf},
    process::Stdio,
    sync::OnceLock,
};

use nix::{
    errno::Errno,
    mount::{MsFlags, mount},
    sched::{CloneFlags, unshare},
    sys::{
        prctl,
        resource::{Resource, getrlimit, setrlimit},
        signal::{SigHandler, Signal, raise, signal},
        stat::Mode,
        wait::{WaitStatus, waitpid},
    },
    unistd::{ForkResult, Gid, Pid, Uid, chdir, fork, mkdir, setsid},
};
use tokio::process::Command;

use crate::{
    config::SandboxIsolation,
    sandbox::{SandboxBackend, SandboxError, StageLimits, StageSpec},
};

const SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";
const MAX_OPEN_FILES: u64 = 256;
// uid and gid the program sees inside its user namespace
const GUEST_ID: u32 = 1000;

/// Runs stages as host processes confined by rlimits, a scrubbed
/// environment and a private working directory.
///
/// With [`SandboxIsolation::Namespaces`] every stage also gets its own user,
/// mount, pid, ipc, network and uts namespaces. The sandbox root is replaced
/// by an empty tmpfs holding only the stage's own directory, `/proc` is
/// remounted for the new pid namespace, and the program runs as pid 1 of
/// that namespace so nothing it spawns survives it.
pub struct ProcessSandbox {
    isolation: SandboxIsolation,
}

impl ProcessSandbox {
    pub fn new(isolation: SandboxIsolation) -> Self {
        Self { isolation }
    }

    pub fn isolation(&self) -> SandboxIsolation {
        self.isolation
    }

    /// Whether this host lets the service create the namespaces a stage
    /// needs. Checked once per process.
    pub fn namespaces_supported() -> bool {
        static SUPPORTED: OnceLock<bool> = OnceLock::new();
        *SUPPORTED.get_or_init(try_namespaces)
    }
}

fn try_namespaces() -> bool {
    let Ok(root) = tempfile::tempdir() else {
        return false;
    };
    let workdir = root.path().join("check");
    if std::fs::create_dir(&workdir).is_err() {
        return false;
    }
    let Ok(namespaces) = NamespacePlan::new(&workdir) else {
        return false;
    };
    let confinement = Confinement {
        limits: RlimitPlan {
            cpu_secs: 5,
            data_bytes: 256 * 1024 * 1024,
            file_size_bytes: 1024 * 1024,
        },
        namespaces: Some(namespaces),
    };

    let mut command = std::process::Command::new("/bin/sh");
    command
        .args(["-c", "test \"$$\" = 1"])
        .env_clear()
        .env("PATH", SANDBOX_PATH)
        .current_dir(&workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    // SAFETY: see `ProcessSandbox::prepare`.
    unsafe {
        command.pre_exec(move || confinement.apply());
    }
    let supported = matches!(command.status(), Ok(status) if status.success());
    if !supported {
        tracing::debug!("cannot create stage namespaces on this host");
    }
    supported
}

#[derive(Debug, Clone, Copy)]
struct RlimitPlan {
    cpu_secs: u64,
    data_bytes: u64,
    file_size_bytes: u64,
}

impl From<&StageLimits> for RlimitPlan {
    fn from(limits: &StageLimits) -> Self {
        Self {
            cpu_secs: limits.cpu_time_secs.max(1),
            data_bytes: limits.memory_mb.saturating_mul(1024 * 1024),
            file_size_bytes: limits.max_file_size_bytes,
        }
    }
}

impl RlimitPlan {
    fn apply(self) -> nix::Result<()> {
        lower(Resource::RLIMIT_CORE, 0, 0)?;
        // soft limit delivers SIGXCPU, the hard one a second later SIGKILL
        lower(Resource::RLIMIT_CPU, self.cpu_secs, self.cpu_secs + 1)?;
        lower(Resource::RLIMIT_DATA, self.data_bytes, self.data_bytes)?;
        lower(Resource::RLIMIT_FSIZE, self.file_size_bytes, self.file_size_bytes)?;
        lower(Resource::RLIMIT_NOFILE, MAX_OPEN_FILES, MAX_OPEN_FILES)?;
        Ok(())
    }
}

/// Sets a limit without ever trying to raise the inherited hard limit.
fn lower(resource: Resource, soft: u64, hard: u64) -> nix::Result<()> {
    let (_, current_hard) = getrlimit(resource)?;
    let hard = hard.min(current_hard);
    setrlimit(resource, soft.min(hard), hard)
}

/// Everything the child does between fork and exec, computed up front so
/// the child itself never allocates.
#[derive(Debug)]
struct Confinement {
    limits: RlimitPlan,
    namespaces: Option<NamespacePlan>,
}

impl Confinement {
    fn apply(&self) -> std::io::Result<()> {
        setsid()?;
        prctl::set_pdeathsig(Signal::SIGKILL)?;
        if let Some(namespaces) = &self.namespaces {
            namespaces.enter()?;
        }
        self.limits.apply()?;
        if let Some(namespaces) = &self.namespaces {
            namespaces.fork_guest()?;
        }
        Ok(())
    }
}

#[derive(Debug)]
struct NamespacePlan {
    uid_map: Vec<u8>,
    gid_map: Vec<u8>,
    sandbox_root: PathBuf,
    workdir: PathBuf,
    workdir_c: CString,
    fd_ceiling: u32,
}

impl NamespacePlan {
    fn new(workdir: &Path) -> Result<Self, SandboxError> {
        let sandbox_root = workdir
            .parent()
            .filter(|root| *root != Path::new("/"))
            .ok_or_else(|| {
                SandboxError::Provision(format!(
                    "run directory {} must sit below a dedicated sandbox root",
                    workdir.display()
                ))
            })?;
        let workdir_c = CString::new(workdir.as_os_str().as_bytes())
            .map_err(|_| SandboxError::Provision("run directory path contains NUL".to_string()))?;
        let fd_ceiling = getrlimit(Resource::RLIMIT_NOFILE)
            .map(|(soft, _)| soft.min(1 << 16) as u32)
            .unwrap_or(1024);

        Ok(Self {
            uid_map: format!("{GUEST_ID} {} 1\n", Uid::effective()).into_bytes(),
            gid_map: format!("{GUEST_ID} {} 1\n", Gid::effective()).into_bytes(),
            sandbox_root: sandbox_root.to_path_buf(),
            workdir: workdir.to_path_buf(),
            workdir_c,
            fd_ceiling,
        })
    }

    /// Enters fresh namespaces and hides every other run's directory.
    fn enter(&self) -> nix::Result<()> {
        unshare(
            CloneFlags::CLONE_NEWUSER
                | CloneFlags::CLONE_NEWNS
                | CloneFlags::CLONE_NEWPID
                | CloneFlags::CLONE_NEWIPC
                | CloneFlags::CLONE_NEWNET
                | CloneFlags::CLONE_NEWUTS,
        )?;
        write_proc(c"/proc/self/setgroups", b"deny")?;
        write_proc(c"/proc/self/uid_map", &self.uid_map)?;
        write_proc(c"/proc/self/gid_map", &self.gid_map)?;

        mount(
            None::<&str>,
            "/",
            None::<&str>,
            MsFlags::MS_REC | MsFlags::MS_PRIVATE,
            None::<&str>,
        )?;

        // The handle must come from this mount namespace to be bind-mountable.
        // SAFETY: plain open(2) on a NUL-terminated path.
        let dir = Errno::result(unsafe {
            libc::open(
                self.workdir_c.as_ptr(),
                libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC,
            )
        })?;
        let mut link = [0u8; 32];
        let hidden = mount(
            Some("tmpfs"),
            self.sandbox_root.as_path(),
            Some("tmpfs"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
            Some("mode=0555,size=64k"),
        )
        .and_then(|()| mkdir(self.workdir.as_path(), Mode::S_IRWXU))
        .and_then(|()| {
            mount(
                Some(fd_link(dir, &mut link)),
                self.workdir.as_path(),
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REC,
                None::<&str>,
            )
        });
        // SAFETY: `dir` was opened above and is not used afterwards.
        unsafe { libc::close(dir) };
        hidden?;
        chdir(self.workdir.as_path())
    }

    /// Forks the program that becomes pid 1 of the new pid namespace. This
    /// process stays behind as its reaper and mirrors its exit status.
    fn fork_guest(&self) -> nix::Result<()> {
        // SAFETY: the child is single threaded and only issues raw syscalls
        // before exec.
        match unsafe { fork() }? {
            ForkResult::Child => become_guest(),
            ForkResult::Parent { child } => reap_guest(child, self.fd_ceiling),
        }
    }
}

fn become_guest() -> nix::Result<()> {
    let flags = MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC;
    mount(Some("proc"), "/proc", Some("proc"), flags, None::<&str>)
        .or_else(|_| mount(Some("tmpfs"), "/proc", Some("tmpfs"), flags, Some("size=4k")))?;
    prctl::set_pdeathsig(Signal::SIGKILL)?;
    prctl::set_no_new_privs()
}

fn reap_guest(guest: Pid, fd_ceiling: u32) -> ! {
    // The exec-status pipe is among these; holding it would block spawn.
    close_inherited_fds(fd_ceiling);
    let code = loop {
        match waitpid(guest, None) {
            Ok(WaitStatus::Exited(_, code)) => break code,
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                // SAFETY: restoring the default disposition is always sound.
                let _ = unsafe { signal(sig, SigHandler::SigDfl) };
                let _ = raise(sig);
                break 128 + sig as i32;
            }
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(_) => break 127,
        }
    };
    // SAFETY: _exit skips atexit handlers, which must not run after fork.
    unsafe { libc::_exit(code) }
}

fn close_inherited_fds(ceiling: u32) {
    // SAFETY: closing descriptors this process no longer needs.
    let rc = unsafe { libc::syscall(libc::SYS_close_range, 3u32, u32::MAX, 0u32) };
    if rc != 0 {
        for fd in 3..ceiling as libc::c_int {
            // SAFETY: as above; EBADF is harmless.
            unsafe { libc::close(fd) };
        }
    }
}

fn write_proc(path: &CStr, contents: &[u8]) -> nix::Result<()> {
    // SAFETY: plain open/write/close on a NUL-terminated path and a live buffer.
    let fd = Errno::result(unsafe { libc::open(path.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC) })?;
    let written = Errno::result(unsafe { libc::write(fd, contents.as_ptr().cast(), contents.len()) });
    unsafe { libc::close(fd) };
    written.map(drop)
}

/// Formats `/proc/self/fd/<fd>` into `buf` without allocating.
fn fd_link(fd: libc::c_int, buf: &mut [u8; 32]) -> &[u8] {
    const PREFIX: &[u8] = b"/proc/self/fd/";
    buf[..PREFIX.len()].copy_from_slice(PREFIX);
    let mut digits = [0u8; 10];
    let mut n = fd.unsigned_abs();
    let mut len = 0;
    loop {
        digits[len] = b'0' + (n % 10) as u8;
        len += 1;
        n /= 10;
        if n == 0 {
            break;
        }
    }
    for (i, digit) in digits[..len].iter().rev().enumerate() {
        buf[PREFIX.len() + i] = *digit;
    }
    &buf[..PREFIX.len() + len]
}

impl SandboxBackend for ProcessSandbox {
    fn name(&self) -> &'static str {
        match self.isolation {
            SandboxIsolation::Namespaces => "process",
            SandboxIsolation::Unconfined => "process-unconfined",
        }
    }

    fn guest_dir(&self, host_dir: &Path) -> String {
        host_dir.display().to_string()
    }

    fn prepare(&self, spec: &StageSpec<'_>) -> Result<Command, SandboxError> {
        let (program, args) = spec
            .argv
            .split_first()
            .ok_or_else(|| SandboxError::Provision("empty command template".to_string()))?;

        let mut command = std::process::Command::new(program);
        command
            .args(args)
            .env_clear()
            .env("PATH", SANDBOX_PATH)
            .env("HOME", spec.workdir)
            .env("TMPDIR", spec.workdir)
            .env("LANG", "C.UTF-8")
            .current_dir(spec.workdir);

        let confinement = Confinement {
            limits: RlimitPlan::from(&spec.limits),
            namespaces: match self.isolation {
                SandboxIsolation::Namespaces => Some(NamespacePlan::new(spec.workdir)?),
                SandboxIsolation::Unconfined => None,
            },
        };
        // SAFETY: the closure issues raw syscalls only (setsid, prctl,
        // setrlimit, unshare, mount, fork, waitpid) on data prepared before
        // the fork, and never allocates.
        unsafe {
            command.pre_exec(move || confinement.apply());
        }
        Ok(Command::from(command))
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use uuid::Uuid;

    use super::*;
    use crate::{
        models::Stage,
        queue::CancelToken,
        sandbox::{Termination, supervise, test_sandbox},
    };

    fn limits(timeout_ms: u64) -> StageLimits {
        StageLimits {
            timeout: Duration::from_millis(timeout_ms),
            memory_mb: 256,
            cpu_time_secs: 5,
            max_output_bytes: 4096,
            max_file_size_bytes: 1024 * 1024,
            max_processes: 32,
        }
    }

    /// A sandbox root holding one run directory, laid out like `Workdir`.
    fn run_dir() -> (tempfile::TempDir, PathBuf) {
        let root = tempfile::tempdir().unwrap();
        let run = root.path().join("run");
        std::fs::create_dir(&run).unwrap();
        (root, run)
    }

    fn spec<'a>(dir: &'a Path, script: &str, timeout_ms: u64) -> StageSpec<'a> {
        StageSpec {
            submission_id: Uuid::now_v7(),
            stage: Stage::Run,
            argv: vec!["/bin/sh".into(), "-c".into(), script.into()],
            workdir: dir,
            image: "",
            limits: limits(timeout_ms),
        }
    }

    fn file_len(path: &Path) -> u64 {
        std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
    }

    /// Asserts nothing is still appending to `beat` once the stage is over.
    async fn assert_heartbeat_stopped(beat: &Path) {
        tokio::time::sleep(Duration::from_millis(150)).await;
        let settled = file_len(beat);
        assert!(settled > 0, "background writer never ran");
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(file_len(beat), settled, "a background process outlived the stage");
    }

    #[tokio::test]
    async fn captures_output_exit_code_and_stdin() {
        let (_root, run) = run_dir();
        let (_tx, mut cancel) = CancelToken::detached();
        let spec = spec(&run, "read line; echo \"got $line\"; echo oops >&2; exit 3", 5_000);

        let out = supervise(&test_sandbox(), &spec, Some(b"ping\n"), &mut cancel)
            .await
            .unwrap();
        assert_eq!(out.stdout, b"got ping\n");
        assert_eq!(out.stderr, b"oops\n");
        assert_eq!(out.exit_code, Some(3));
        assert_eq!(out.termination, Termination::Exited);
        assert!(!out.truncated);
    }

    #[tokio::test]
    async fn environment_is_scrubbed_and_rooted_in_workdir() {
        let (_root, run) = run_dir();
        let (_tx, mut cancel) = CancelToken::detached();
        let spec = spec(&run, "echo \"$HOME|$CARGO|$(pwd)\"", 5_000);

        let out = supervise(&test_sandbox(), &spec, None, &mut cancel)
            .await
            .unwrap();
        let line = String::from_utf8(out.stdout).unwrap();
        let parts: Vec<&str> = line.trim_end().split('|').collect();
        assert_eq!(parts[0], run.display().to_string());
        assert_eq!(parts[1], "");
        assert_eq!(parts[2], run.display().to_string());
    }

    #[tokio::test]
    async fn timeout_kills_the_whole_group_promptly() {
        let (_root, run) = run_dir();
        let (_tx, mut cancel) = CancelToken::detached();
        let spec = spec(&run, "sleep 30 & sleep 30", 300);

        let started = Instant::now();
        let out = supervise(&test_sandbox(), &spec, None, &mut cancel)
            .await
            .unwrap();
        assert_eq!(out.termination, Termination::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(out.signal, None);
    }

    #[tokio::test]
    async fn background_children_do_not_outlive_a_timeout() {
        let (_root, run) = run_dir();
        let (_tx, mut cancel) = CancelToken::detached();
        let spec = spec(
            &run,
            "(while :; do echo x >> beat; sleep 0.05; done) & sleep 30",
            400,
        );

        let out = supervise(&test_sandbox(), &spec, None, &mut cancel)
            .await
            .unwrap();
        assert_eq!(out.termination, Termination::TimedOut);
        assert_heartbeat_stopped(&run.join("beat")).await;
    }

    #[tokio::test]
    async fn detached_descendants_die_with_a_cancelled_stage() {
        let has_setsid = ["/usr/bin/setsid", "/bin/setsid"]
            .iter()
            .any(|p| Path::new(p).exists());
        if !ProcessSandbox::namespaces_supported() || !has_setsid {
            return;
        }
        let (_root, run) = run_dir();
        let (tx, mut cancel) = CancelToken::detached();
        let spec = spec(
            &run,
            "setsid sh -c 'while :; do echo x >> beat; sleep 0.05; done' & sleep 30",
            20_000,
        );

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(400)).await;
            let _ = tx.send(true);
        });
        let out = supervise(&ProcessSandbox::new(SandboxIsolation::Namespaces), &spec, None, &mut cancel)
            .await
            .unwrap();
        assert_eq!(out.termination, Termination::Cancelled);
        assert_heartbeat_stopped(&run.join("beat")).await;
    }

    #[tokio::test]
    async fn stage_cannot_reach_sibling_runs_or_the_service() {
        if !ProcessSandbox::namespaces_supported() {
            return;
        }
        let (root, run) = run_dir();
        let sibling = root.path().join("sibling");
        std::fs::create_dir(&sibling).unwrap();
        std::fs::write(sibling.join("secret.txt"), "TOPSECRET").unwrap();

        let script = format!(
            "cat ../sibling/secret.txt; cat {root}/sibling/secret.txt; ls -a ..; \
             kill -0 {service} 2>/dev/null && echo service-visible; echo \"pid=$$\"",
            root = root.path().display(),
            service = std::process::id(),
        );
        let (_tx, mut cancel) = CancelToken::detached();
        let spec = spec(&run, &script, 5_000);

        let out = supervise(&ProcessSandbox::new(SandboxIsolation::Namespaces), &spec, None, &mut cancel)
            .await
            .unwrap();
        let stdout = String::from_utf8(out.stdout).unwrap();
        assert!(!stdout.contains("TOPSECRET"), "{stdout}");
        assert!(!stdout.contains("sibling"), "{stdout}");
        assert!(!stdout.contains("service-visible"), "{stdout}");
        assert!(stdout.contains("pid=1"), "{stdout}");
        assert_eq!(std::fs::read_to_string(sibling.join("secret.txt")).unwrap(), "TOPSECRET");
    }

    #[tokio::test]
    async fn oversized_output_is_truncated_not_rejected() {
        let (_root, run) = run_dir();
        let (_tx, mut cancel) = CancelToken::detached();
        let spec = spec(&run, "i=0; while [ $i -lt 2000 ]; do echo 0123456789; i=$((i+1)); done", 5_000);

        let out = supervise(&test_sandbox(), &spec, None, &mut cancel)
            .await
            .unwrap();
        assert_eq!(out.stdout.len(), 4096);
        assert!(out.truncated);
        assert_eq!(out.exit_code, Some(0));
    }

    #[tokio::test]
    async fn cancellation_stops_a_running_stage() {
        let (_root, run) = run_dir();
        let (tx, mut cancel) = CancelToken::detached();
        let spec = spec(&run, "sleep 30", 20_000);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let _ = tx.send(true);
        });
        let started = Instant::now();
        let out = supervise(&test_sandbox(), &spec, None, &mut cancel)
            .await
            .unwrap();
        assert_eq!(out.termination, Termination::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let (_root, run) = run_dir();
        let (_tx, mut cancel) = CancelToken::detached();
        let mut spec = spec(&run, "", 1_000);
        spec.argv = vec!["/definitely/not/here".into()];

        let err = supervise(&test_sandbox(), &spec, None, &mut cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Spawn { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn run_directories_need_a_dedicated_root() {
        assert!(NamespacePlan::new(Path::new("/run-dir")).is_err());
        let plan = NamespacePlan::new(Path::new("/srv/codepad/run-1")).unwrap();
        assert_eq!(plan.sandbox_root, Path::new("/srv/codepad"));
        assert!(plan.uid_map.starts_with(b"1000 "));
    }

    #[test]
    fn descriptor_links_are_formatted_in_place() {
        let mut buf = [0u8; 32];
        assert_eq!(fd_link(7, &mut buf), b"/proc/self/fd/7");
        assert_eq!(fd_link(1234, &mut buf), b"/proc/self/fd/1234");
        assert_eq!(fd_link(0, &mut buf), b"/proc/self/fd/0");
    }
}
