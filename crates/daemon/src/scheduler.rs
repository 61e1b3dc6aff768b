//! Three-lane phase scheduler.
//!
//! One periodic tick drives three independent lanes (build, encode,
//! post-process). Each tick refreshes the shared status snapshot,
//! evicts jobs past their retention window, then hands at most one
//! job to each lane whose previous task has finished. Phase bodies
//! block on child-process exit, so they run on the blocking pool; the
//! tick itself never waits on a phase.

use crate::build;
use crate::encode;
use crate::jobs::current_timestamp_ms;
use crate::manager::JobManager;
use crate::post_process;
use crate::startup::ToolPaths;
use crate::status::{collect_system_status, SharedStatus, StatusSnapshot};
use auto_encode_daemon_config::{Config, SchedulerConfig, ThresholdsConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Drives the three phase lanes from one shared ticker.
///
/// A lane holds the join handle of its current phase task; a lane with
/// no handle, or whose handle has finished, is free to take the next
/// eligible job. At most one build, one encode, and one post-process
/// run at any time.
pub struct Scheduler {
    manager: Arc<JobManager>,
    tools: ToolPaths,
    thresholds: ThresholdsConfig,
    dolby_vision_enabled: bool,
    temp_dir: PathBuf,
    status: SharedStatus,
    config: SchedulerConfig,
    shutdown: CancellationToken,
    build_lane: Option<JoinHandle<()>>,
    encode_lane: Option<JoinHandle<()>>,
    post_process_lane: Option<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(
        config: &Config,
        manager: Arc<JobManager>,
        tools: ToolPaths,
        status: SharedStatus,
        temp_dir: PathBuf,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            manager,
            tools,
            thresholds: config.thresholds.clone(),
            dolby_vision_enabled: config.jobs.dolby_vision_enabled,
            temp_dir,
            status,
            config: config.scheduler.clone(),
            shutdown,
            build_lane: None,
            encode_lane: None,
            post_process_lane: None,
        }
    }

    /// Runs the scheduling loop until shutdown.
    ///
    /// The startup delay runs first so intake and the status server are
    /// up before any phase work starts.
    pub async fn run(mut self) {
        let delay = Duration::from_secs(self.config.startup_delay_secs);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.shutdown.cancelled() => return,
        }
        tracing::info!(tick_secs = self.config.tick_secs, "scheduler started");

        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.tick_secs.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                _ = self.shutdown.cancelled() => break,
            }
        }
        tracing::info!("scheduler stopped");
    }

    /// One scheduling pass.
    ///
    /// Never brings the loop down; a lane that cannot start a job this
    /// tick simply tries again on the next one.
    pub async fn tick(&mut self) {
        self.refresh_status().await;
        self.manager.evict_expired(current_timestamp_ms());
        self.dispatch_build();
        self.dispatch_encode();
        self.dispatch_post_process();
    }

    async fn refresh_status(&self) {
        let snapshot = StatusSnapshot::new(self.manager.snapshots(), collect_system_status());
        *self.status.write().await = snapshot;
    }

    fn dispatch_build(&mut self) {
        if !lane_is_free(&mut self.build_lane) {
            return;
        }
        let Some(id) = self.manager.next_for_build() else {
            return;
        };
        let Some(cancel) = self.manager.attach_token(id) else {
            return;
        };
        tracing::debug!(id, "build lane taking job");

        let manager = Arc::clone(&self.manager);
        let tools = self.tools.clone();
        let temp_dir = self.temp_dir.clone();
        let dolby_vision_enabled = self.dolby_vision_enabled;
        self.build_lane = Some(spawn_phase(
            Arc::clone(&self.manager),
            id,
            "build",
            move || build::run_build(&manager, id, &tools, &temp_dir, dolby_vision_enabled, &cancel),
        ));
    }

    fn dispatch_encode(&mut self) {
        if !lane_is_free(&mut self.encode_lane) {
            return;
        }
        let Some(id) = self.manager.next_for_encode() else {
            return;
        };
        let Some(cancel) = self.manager.attach_token(id) else {
            return;
        };
        tracing::debug!(id, "encode lane taking job");

        let manager = Arc::clone(&self.manager);
        let tools = self.tools.clone();
        let thresholds = self.thresholds.clone();
        let temp_dir = self.temp_dir.clone();
        self.encode_lane = Some(spawn_phase(
            Arc::clone(&self.manager),
            id,
            "encode",
            move || encode::run_encode(&manager, id, &tools, &thresholds, &temp_dir, &cancel),
        ));
    }

    fn dispatch_post_process(&mut self) {
        if !lane_is_free(&mut self.post_process_lane) {
            return;
        }
        let Some(id) = self.manager.next_for_post_process() else {
            return;
        };
        let Some(cancel) = self.manager.attach_token(id) else {
            return;
        };
        tracing::debug!(id, "post-process lane taking job");

        let manager = Arc::clone(&self.manager);
        self.post_process_lane = Some(spawn_phase(
            Arc::clone(&self.manager),
            id,
            "post-process",
            move || post_process::run_post_process(&manager, id, &cancel),
        ));
    }
}

/// A lane is free when it has no task or its task has finished.
/// Clears a finished handle so the lane can be reused.
fn lane_is_free(lane: &mut Option<JoinHandle<()>>) -> bool {
    match lane {
        None => true,
        Some(task) if task.is_finished() => {
            *lane = None;
            true
        }
        Some(_) => false,
    }
}

/// Runs one phase body on the blocking pool, then always runs the
/// post-phase cleanup continuation, even if the body panicked.
fn spawn_phase(
    manager: Arc<JobManager>,
    id: u64,
    lane: &'static str,
    phase: impl FnOnce() + Send + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = tokio::task::spawn_blocking(phase).await {
            tracing::error!(id, lane, error = %e, "phase task panicked");
            manager.set_error(id, format!("{lane} task aborted unexpectedly"));
        }
        manager.finish_phase(id);
    })
}
