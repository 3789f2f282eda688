pub mod api;
pub mod client;
pub mod config;
pub mod error;
pub mod executor;
pub mod languages;
pub mod metrics;
pub mod models;
pub mod queue;
pub mod results;
pub mod sandbox;
pub mod service;
pub mod worker;
pub mod workspace;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::Router;
use tokio::task::JoinHandle;

use crate::{
    api::{AppState, routes},
    config::{EngineConfig, LogFormat, WorkspaceBackendConfig},
    error::{ErrorInfo, ErrorKind},
    executor::Executor,
    languages::LanguageRegistry,
    metrics::MetricsRegistry,
    queue::Scheduler,
    results::ResultStore,
    sandbox::SandboxFactory,
    service::{ExecutionService, SubmissionPolicy},
    worker::spawn_worker_pool,
    workspace::{InMemoryWorkspaceStore, RedisWorkspaceStore, WorkspaceRules, WorkspaceStore},
};

const DEFAULT_WORKSPACE_LANGUAGE: &str = "python";

/// A fully wired service: router plus the background tasks behind it.
pub struct App {
    pub router: Router,
    pub scheduler: Scheduler,
    results: ResultStore,
    workers: Vec<JoinHandle<()>>,
    reaper: JoinHandle<()>,
    shutdown_grace: Duration,
    cancel_grace: Duration,
}

impl App {
    /// Wires every component and starts workers and the result reaper.
    /// Must be called inside a tokio runtime.
    pub async fn build(config: &EngineConfig, registry: LanguageRegistry) -> anyhow::Result<Self> {
        let registry = Arc::new(registry);
        let metrics = Arc::new(MetricsRegistry::new());
        let scheduler = Scheduler::new(config.max_in_flight, config.queue_order, metrics.clone());
        let results = ResultStore::new(config.result_retention, metrics.clone());
        let sandbox =
            SandboxFactory::from_config(&config.sandbox).context("sandbox backend init failed")?;
        tracing::info!(backend = sandbox.name(), root = %config.sandbox.root.display(), "sandbox ready");
        let executor = Arc::new(Executor::new(sandbox, config.sandbox.root.clone()));

        let workers = spawn_worker_pool(
            config.worker_count,
            scheduler.clone(),
            results.clone(),
            metrics.clone(),
            executor,
        );
        let reaper = results.spawn_reaper(config.reaper_interval);

        let rules = WorkspaceRules {
            registry: registry.clone(),
            max_files: config.max_files_per_workspace,
            max_file_bytes: config.max_source_bytes,
        };
        let workspaces: Arc<dyn WorkspaceStore> = match &config.workspace_backend {
            WorkspaceBackendConfig::InMemory => Arc::new(InMemoryWorkspaceStore::new(rules)),
            WorkspaceBackendConfig::Redis { url, key_prefix } => Arc::new(
                RedisWorkspaceStore::new(url, key_prefix.clone(), rules)
                    .await
                    .context("redis workspace store init failed")?,
            ),
        };
        tracing::info!(backend = workspaces.name(), "workspace store ready");

        let service = ExecutionService::new(
            registry,
            scheduler.clone(),
            results.clone(),
            metrics.clone(),
            SubmissionPolicy::from(config),
        );
        let router = routes(
            AppState {
                service,
                workspaces,
                metrics,
                api_keys: Arc::new(config.api_keys.clone()),
                default_language: DEFAULT_WORKSPACE_LANGUAGE.to_string(),
            },
            config.max_request_bytes,
        );

        Ok(Self {
            router,
            scheduler,
            results,
            workers,
            reaper,
            shutdown_grace: config.shutdown_grace,
            cancel_grace: config.cancel_ack_timeout,
        })
    }

    /// Stops admitting work and lets workers drain the queue for the grace
    /// period. Anything left is then cancelled, which kills its sandbox, and
    /// records no worker got to are failed so none stays live forever.
    pub async fn shutdown(self) {
        self.scheduler.close().await;
        let mut workers = self.workers;

        if !join_within(&mut workers, self.shutdown_grace).await {
            let signalled = self.scheduler.cancel_all();
            tracing::warn!(signalled, "shutdown grace elapsed, cancelling remaining submissions");
            if !join_within(&mut workers, self.cancel_grace).await {
                tracing::warn!(workers = workers.len(), "workers ignored cancellation, aborting them");
                for worker in &workers {
                    worker.abort();
                }
            }
        }

        let abandoned = self.results.abandon_unfinished(&ErrorInfo::new(
            ErrorKind::InfrastructureFailure,
            "the service shut down before the submission finished",
        ));
        if abandoned > 0 {
            tracing::warn!(abandoned, "failed submissions left unfinished by shutdown");
        }
        self.reaper.abort();
    }
}

/// Awaits workers until `grace` runs out. Finished handles are removed.
async fn join_within(workers: &mut Vec<JoinHandle<()>>, grace: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + grace;
    while let Some(worker) = workers.last_mut() {
        if tokio::time::timeout_at(deadline, worker).await.is_err() {
            return false;
        }
        workers.pop();
    }
    true
}

pub async fn run() -> anyhow::Result<()> {
    let config = EngineConfig::from_env();
    init_tracing(&config);
    if config.accepts_dev_key() {
        tracing::warn!(
            key = crate::config::DEV_API_KEY,
            "API_KEYS not set, accepting the public development key; do not expose this service"
        );
    }

    let registry = LanguageRegistry::load(config.languages_path.as_deref())
        .context("failed to load language catalogue")?;
    tracing::info!(languages = registry.iter().count(), "language catalogue loaded");

    let app = App::build(&config, registry).await?;
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .context("failed to bind listener")?;
    let local = listener
        .local_addr()
        .unwrap_or(SocketAddr::from(([0, 0, 0, 0], 0)));
    tracing::info!(bind = %local, workers = config.worker_count, "code execution service ready");

    axum::serve(listener, app.router.clone())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("shutting down");
    app.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

fn init_tracing(config: &EngineConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.clone()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log_format {
        LogFormat::Json => builder
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .init(),
        LogFormat::Compact => builder.with_target(false).compact().init(),
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;
    use crate::{
        languages::{shell_profile, test_registry},
        models::{ExecutionLimits, SubmissionRecord, SubmissionStatus},
        queue::Admission,
    };

    async fn admit(app: &App, source: &str) -> Uuid {
        let id = Uuid::now_v7();
        app.results.insert(SubmissionRecord {
            submission_id: id,
            owner: "tenant".into(),
            language: "sh".into(),
            entry_file: "main.sh".into(),
            status: SubmissionStatus::Queued,
            priority: 0,
            requested_at: Utc::now(),
            started_at: None,
            finished_at: None,
            result: None,
            error: None,
        });
        app.scheduler
            .submit(Admission {
                id,
                owner: "tenant".into(),
                profile: Arc::new(shell_profile()),
                source: source.into(),
                entry_file: "main.sh".into(),
                files: Vec::new(),
                stdin: None,
                limits: ExecutionLimits {
                    timeout_ms: 30_000,
                    build_timeout_ms: 30_000,
                    memory_mb: 256,
                    build_memory_mb: 256,
                    cpu_time_secs: 30,
                    max_output_bytes: 4096,
                    max_file_size_bytes: 1024 * 1024,
                    max_processes: 32,
                },
                priority: 0,
            })
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn shutdown_cancels_running_and_queued_work_after_the_grace_period() {
        let root = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::default();
        config.worker_count = 1;
        config.sandbox.root = root.path().to_path_buf();
        config.sandbox.isolation = crate::sandbox::test_isolation();
        config.shutdown_grace = Duration::from_millis(200);
        let app = App::build(&config, test_registry()).await.unwrap();

        let running = admit(&app, "sleep 30").await;
        let queued = admit(&app, "echo never").await;
        let results = app.results.clone();
        for _ in 0..100 {
            if results.get(&running).unwrap().status == SubmissionStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        tokio::time::timeout(Duration::from_secs(10), app.shutdown())
            .await
            .expect("shutdown hung");
        for id in [running, queued] {
            let record = results.get(&id).unwrap();
            assert_eq!(record.status, SubmissionStatus::Cancelled, "{id}");
            assert_eq!(record.error.unwrap().kind, ErrorKind::Cancelled);
        }
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn shutdown_fails_records_no_worker_will_finish() {
        let root = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::default();
        config.sandbox.root = root.path().to_path_buf();
        config.sandbox.isolation = crate::sandbox::test_isolation();
        let app = App::build(&config, test_registry()).await.unwrap();

        // admitted to the result store but never handed to the scheduler
        let orphan = Uuid::now_v7();
        app.results.insert(SubmissionRecord {
            submission_id: orphan,
            owner: "tenant".into(),
            language: "sh".into(),
            entry_file: "main.sh".into(),
            status: SubmissionStatus::Queued,
            priority: 0,
            requested_at: Utc::now(),
            started_at: None,
            finished_at: None,
            result: None,
            error: None,
        });
        let results = app.results.clone();

        app.shutdown().await;
        let record = results.get(&orphan).unwrap();
        assert_eq!(record.status, SubmissionStatus::Failed);
        assert_eq!(record.error.unwrap().kind, ErrorKind::InfrastructureFailure);
    }
}
