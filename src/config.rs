use std::{
    collections::HashMap,
    env,
    net::SocketAddr,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

/// Publicly known key accepted when no keys are configured.
pub const DEV_API_KEY: &str = "dev-key";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub bind_addr: SocketAddr,
    pub worker_count: usize,
    pub max_in_flight: usize,
    pub queue_order: QueueOrder,
    pub max_source_bytes: usize,
    pub max_request_bytes: usize,
    pub max_timeout_ms: u64,
    pub max_output_bytes: usize,
    pub sandbox: SandboxConfig,
    pub result_retention: Duration,
    pub reaper_interval: Duration,
    pub cancel_ack_timeout: Duration,
    /// How long shutdown lets queued and running work finish before
    /// cancelling it.
    pub shutdown_grace: Duration,
    pub api_keys: HashMap<String, String>,
    pub languages_path: Option<PathBuf>,
    pub workspace_backend: WorkspaceBackendConfig,
    pub max_files_per_workspace: usize,
    pub log_level: String,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub backend: SandboxBackendKind,
    pub isolation: SandboxIsolation,
    pub docker_binary: String,
    pub root: PathBuf,
}

#[derive(Debug, Clone)]
pub enum WorkspaceBackendConfig {
    InMemory,
    Redis { url: String, key_prefix: String },
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let workspace_backend = match env::var("WORKSPACE_BACKEND")
            .unwrap_or_else(|_| "memory".to_string())
            .to_ascii_lowercase()
            .as_str()
        {
            "redis" => WorkspaceBackendConfig::Redis {
                url: env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
                key_prefix: env::var("REDIS_KEY_PREFIX")
                    .unwrap_or_else(|_| "codepad:workspace".to_string()),
            },
            _ => WorkspaceBackendConfig::InMemory,
        };

        Self {
            bind_addr: env_parse("BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080))),
            worker_count: env_parse("WORKER_COUNT", 4usize).max(1),
            max_in_flight: env_parse("MAX_IN_FLIGHT", 64usize).max(1),
            queue_order: env_parse("QUEUE_ORDER", QueueOrder::Fifo),
            max_source_bytes: env_parse("MAX_SOURCE_BYTES", 256 * 1024usize),
            max_request_bytes: env_parse("MAX_REQUEST_BYTES", 1024 * 1024usize),
            max_timeout_ms: env_parse("MAX_TIMEOUT_MS", 30_000u64),
            max_output_bytes: env_parse("MAX_OUTPUT_BYTES", 64 * 1024usize),
            sandbox: SandboxConfig {
                backend: env_parse("SANDBOX_BACKEND", SandboxBackendKind::Process),
                isolation: env_parse("SANDBOX_ISOLATION", SandboxIsolation::Namespaces),
                docker_binary: env::var("DOCKER_BINARY").unwrap_or_else(|_| "docker".to_string()),
                root: env::var("SANDBOX_ROOT")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| env::temp_dir().join("codepad-runs")),
            },
            result_retention: Duration::from_secs(env_parse("RESULT_RETENTION_SECS", 300u64)),
            reaper_interval: Duration::from_secs(env_parse("REAPER_INTERVAL_SECS", 15u64).max(1)),
            cancel_ack_timeout: Duration::from_millis(env_parse("CANCEL_ACK_TIMEOUT_MS", 5_000u64)),
            shutdown_grace: Duration::from_secs(env_parse("SHUTDOWN_GRACE_SECS", 30u64)),
            api_keys: parse_api_keys(
                &env::var("API_KEYS").unwrap_or_else(|_| format!("default:{DEV_API_KEY}")),
            ),
            languages_path: env::var("LANGUAGES_PATH").ok().map(PathBuf::from),
            workspace_backend,
            max_files_per_workspace: env_parse("MAX_FILES_PER_WORKSPACE", 64usize).max(1),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            log_format: env_parse("LOG_FORMAT", LogFormat::Json),
        }
    }
}

impl EngineConfig {
    pub fn accepts_dev_key(&self) -> bool {
        self.api_keys.contains_key(DEV_API_KEY)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            worker_count: 2,
            max_in_flight: 16,
            queue_order: QueueOrder::Fifo,
            max_source_bytes: 256 * 1024,
            max_request_bytes: 1024 * 1024,
            max_timeout_ms: 30_000,
            max_output_bytes: 64 * 1024,
            sandbox: SandboxConfig {
                backend: SandboxBackendKind::Process,
                isolation: SandboxIsolation::Namespaces,
                docker_binary: "docker".to_string(),
                root: env::temp_dir().join("codepad-runs"),
            },
            result_retention: Duration::from_secs(300),
            reaper_interval: Duration::from_secs(15),
            cancel_ack_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(30),
            api_keys: parse_api_keys(&format!("default:{DEV_API_KEY}")),
            languages_path: None,
            workspace_backend: WorkspaceBackendConfig::InMemory,
            max_files_per_workspace: 64,
            log_level: "info".to_string(),
            log_format: LogFormat::Json,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SandboxBackendKind {
    #[default]
    Process,
    Docker,
}

impl FromStr for SandboxBackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "docker" => Ok(Self::Docker),
            "process" => Ok(Self::Process),
            _ => Err(format!("unsupported sandbox backend: {s}")),
        }
    }
}

/// How far the process backend confines a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SandboxIsolation {
    /// Private user, mount, pid, ipc, net and uts namespaces per stage.
    #[default]
    Namespaces,
    /// Host processes with rlimits only. Must be asked for explicitly.
    Unconfined,
}

impl FromStr for SandboxIsolation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "namespaces" => Ok(Self::Namespaces),
            "none" | "unconfined" => Ok(Self::Unconfined),
            _ => Err(format!("unsupported sandbox isolation: {s}")),
        }
    }
}

/// Dequeue policy for admitted submissions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QueueOrder {
    #[default]
    Fifo,
    Priority,
}

impl FromStr for QueueOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fifo" => Ok(Self::Fifo),
            "priority" => Ok(Self::Priority),
            _ => Err(format!("unsupported queue order: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Json,
    Compact,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "compact" | "text" => Ok(Self::Compact),
            _ => Err(format!("unsupported log format: {s}")),
        }
    }
}

/// Parses `tenant:key` pairs into a key -> tenant map.
pub fn parse_api_keys(input: &str) -> HashMap<String, String> {
    let mut keys = HashMap::new();
    for raw in input.split(',') {
        let entry = raw.trim();
        if entry.is_empty() {
            continue;
        }
        if let Some((tenant, key)) = entry.split_once(':') {
            let (tenant, key) = (tenant.trim(), key.trim());
            if !tenant.is_empty() && !key.is_empty() {
                keys.insert(key.to_string(), tenant.to_string());
            }
        }
    }
    if keys.is_empty() {
        keys.insert(DEV_API_KEY.to_string(), "default".to_string());
    }
    keys
}

fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}
