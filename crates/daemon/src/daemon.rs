//! Daemon assembly and main loop.
//!
//! Wires configuration, startup checks, the job manager, the lane
//! scheduler, the status server, and the source-descriptor intake
//! channel into one running process.

use crate::jobs::SourceDescriptor;
use crate::manager::JobManager;
use crate::marker;
use crate::notify::{NullPublisher, StatusPublisher};
use crate::scheduler::Scheduler;
use crate::startup::{run_startup_checks, StartupError, ToolPaths};
use crate::status::{new_shared_status, SharedStatus};
use crate::status_server::run_status_server;
use auto_encode_daemon_config::{Config, ConfigError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Error type for daemon operations.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    /// Server or channel error
    #[error("Server error: {0}")]
    Server(String),
}

/// Daemon state containing all runtime components.
pub struct Daemon {
    /// Configuration loaded from file and environment.
    pub config: Config,
    /// Resolved external tool locations.
    pub tools: ToolPaths,
    /// Shared job collection.
    pub manager: Arc<JobManager>,
    /// Shared status snapshot served over HTTP.
    pub status: SharedStatus,
    /// Working directory for intermediates and the recovery marker.
    temp_dir: PathBuf,
    /// Cancels the scheduler loop and the intake pump.
    shutdown: CancellationToken,
    /// Source descriptor intake sender.
    intake_tx: mpsc::Sender<SourceDescriptor>,
    /// Source descriptor intake receiver (wrapped for async access).
    intake_rx: Arc<RwLock<mpsc::Receiver<SourceDescriptor>>>,
}

impl Daemon {
    /// Initializes the daemon with configuration from file.
    ///
    /// Loads config (with environment overrides), resolves tool paths,
    /// and verifies every required external tool answers a version
    /// probe before any job can be accepted.
    ///
    /// # Arguments
    /// * `config_path` - Path to the config.toml file
    /// * `temp_dir` - Working directory for intermediates and the recovery marker
    pub async fn new<P: AsRef<Path>>(config_path: P, temp_dir: PathBuf) -> Result<Self, DaemonError> {
        let config = Config::load(config_path)?;
        Self::with_config(config, temp_dir, Arc::new(NullPublisher)).await
    }

    /// Initializes the daemon with an existing configuration and a
    /// client-update publisher.
    pub async fn with_config(
        config: Config,
        temp_dir: PathBuf,
        publisher: Arc<dyn StatusPublisher>,
    ) -> Result<Self, DaemonError> {
        let tools = ToolPaths::from_config(&config.tools);
        run_startup_checks(&tools)?;
        Ok(Self::assemble(config, tools, temp_dir, publisher))
    }

    /// Initializes the daemon without running startup checks.
    ///
    /// Useful for testing when the external tools are not available.
    pub fn new_without_checks(config: Config, temp_dir: PathBuf) -> Self {
        let tools = ToolPaths::from_config(&config.tools);
        Self::assemble(config, tools, temp_dir, Arc::new(NullPublisher))
    }

    fn assemble(
        config: Config,
        tools: ToolPaths,
        temp_dir: PathBuf,
        publisher: Arc<dyn StatusPublisher>,
    ) -> Self {
        let manager = Arc::new(JobManager::new(config.jobs.clone(), publisher));
        let (intake_tx, intake_rx) = mpsc::channel(100);

        Self {
            config,
            tools,
            manager,
            status: new_shared_status(),
            temp_dir,
            shutdown: CancellationToken::new(),
            intake_tx,
            intake_rx: Arc::new(RwLock::new(intake_rx)),
        }
    }

    /// Submits a source descriptor to the intake queue.
    pub async fn submit_source(&self, descriptor: SourceDescriptor) -> Result<(), DaemonError> {
        self.intake_tx
            .send(descriptor)
            .await
            .map_err(|e| DaemonError::Server(format!("Failed to submit source: {e}")))
    }

    /// A clone of the intake sender for external source submission.
    pub fn source_sender(&self) -> mpsc::Sender<SourceDescriptor> {
        self.intake_tx.clone()
    }

    /// A handle that stops the daemon when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Starts the status HTTP server as a background task.
    pub fn start_status_server(&self) -> tokio::task::JoinHandle<()> {
        let status = Arc::clone(&self.status);
        let bind_addr = self.config.status_server.bind_addr.clone();
        tokio::spawn(async move {
            if let Err(e) = run_status_server(status, &bind_addr).await {
                tracing::error!(error = %e, "status server exited");
            }
        })
    }

    /// Runs the daemon main loop.
    ///
    /// Purges orphaned partial outputs from a previous crash, starts
    /// the lane scheduler, then pumps incoming source descriptors into
    /// the job queue until the intake channel closes or the shutdown
    /// token fires.
    pub async fn run(&self) -> Result<(), DaemonError> {
        match marker::purge_orphaned_outputs(&self.temp_dir) {
            Ok(purged) if !purged.is_empty() => {
                tracing::info!(count = purged.len(), "removed orphaned partial outputs");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "orphaned-output sweep failed"),
        }

        let scheduler = Scheduler::new(
            &self.config,
            Arc::clone(&self.manager),
            self.tools.clone(),
            Arc::clone(&self.status),
            self.temp_dir.clone(),
            self.shutdown.clone(),
        );
        let scheduler_task = tokio::spawn(scheduler.run());

        loop {
            let descriptor = {
                let mut rx = self.intake_rx.write().await;
                tokio::select! {
                    descriptor = rx.recv() => descriptor,
                    _ = self.shutdown.cancelled() => None,
                }
            };

            match descriptor {
                Some(descriptor) => {
                    let source = descriptor.source_path.display().to_string();
                    match self.manager.create_job(descriptor) {
                        Ok(id) => tracing::info!(id, source, "job queued"),
                        Err(e) => tracing::warn!(source, error = %e, "source rejected"),
                    }
                }
                None => break,
            }
        }

        self.shutdown.cancel();
        let _ = scheduler_task.await;
        Ok(())
    }

    /// Runs the daemon with the status server alongside the main loop.
    pub async fn run_with_server(&self) -> Result<(), DaemonError> {
        let _server = self.start_status_server();
        self.run().await
    }
}
