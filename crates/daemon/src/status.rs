//! Status reporting types.
//!
//! Provides structs for per-job status, system status, and full status
//! snapshots with JSON serialization support. The scheduler refreshes a
//! shared snapshot each tick; the status server and dashboard read it.

use crate::jobs::{Job, JobStatus};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Point-in-time view of one job, safe to serialize and ship out.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobSnapshot {
    pub id: u64,
    pub name: String,
    pub filename: String,
    pub status: JobStatus,
    pub build_step: String,
    pub paused: bool,
    pub error: bool,
    pub error_message: Option<String>,
    pub progress: u8,
    pub fps: Option<f64>,
    pub eta_secs: Option<u64>,
    pub elapsed_secs: u64,
    pub dual_layer: bool,
    pub complete: bool,
    pub created_at_ms: i64,
    pub completed_encode_ms: Option<i64>,
    pub completed_post_process_ms: Option<i64>,
}

impl JobSnapshot {
    /// Captures the reportable state of a job.
    pub fn of(job: &Job) -> Self {
        Self {
            id: job.id,
            name: job.name.clone(),
            filename: job.filename.clone(),
            status: job.status,
            build_step: job.build_step.to_string(),
            paused: job.paused || job.pending_pause,
            error: job.error,
            error_message: job.error_message.clone(),
            progress: job.progress,
            fps: job.fps,
            eta_secs: job.eta_secs,
            elapsed_secs: job.elapsed_secs,
            dual_layer: job
                .plan
                .as_ref()
                .map(|p| p.is_dual_layer())
                .unwrap_or(false),
            complete: job.is_complete(),
            created_at_ms: job.created_at_ms,
            completed_encode_ms: job.completed_encode_ms,
            completed_post_process_ms: job.completed_post_process_ms,
        }
    }
}

/// System-level status for resource monitoring
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemStatus {
    pub cpu_usage_percent: f32,
    pub mem_usage_percent: f32,
    pub load_avg_1: f32,
    pub load_avg_5: f32,
    pub load_avg_15: f32,
}

impl Default for SystemStatus {
    fn default() -> Self {
        Self {
            cpu_usage_percent: 0.0,
            mem_usage_percent: 0.0,
            load_avg_1: 0.0,
            load_avg_5: 0.0,
            load_avg_15: 0.0,
        }
    }
}

/// Complete status snapshot including jobs, system, and aggregate counts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusSnapshot {
    pub timestamp_unix_ms: i64,
    pub jobs: Vec<JobSnapshot>,
    pub system: SystemStatus,
    pub queue_len: usize,
    pub processing_jobs: usize,
    pub completed_jobs: usize,
    pub errored_jobs: usize,
}

impl StatusSnapshot {
    /// Assembles a snapshot from job views, deriving the aggregate counts.
    pub fn new(jobs: Vec<JobSnapshot>, system: SystemStatus) -> Self {
        let processing_jobs = jobs
            .iter()
            .filter(|j| {
                matches!(
                    j.status,
                    JobStatus::Building | JobStatus::Encoding | JobStatus::PostProcessing
                )
            })
            .count();
        let completed_jobs = jobs.iter().filter(|j| j.complete).count();
        let errored_jobs = jobs.iter().filter(|j| j.error).count();

        Self {
            timestamp_unix_ms: crate::jobs::current_timestamp_ms(),
            queue_len: jobs.len(),
            jobs,
            system,
            processing_jobs,
            completed_jobs,
            errored_jobs,
        }
    }
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            timestamp_unix_ms: 0,
            jobs: Vec::new(),
            system: SystemStatus::default(),
            queue_len: 0,
            processing_jobs: 0,
            completed_jobs: 0,
            errored_jobs: 0,
        }
    }
}

/// Shared status state for concurrent access across daemon components
pub type SharedStatus = Arc<RwLock<StatusSnapshot>>;

/// Creates a new SharedStatus instance with default values
pub fn new_shared_status() -> SharedStatus {
    Arc::new(RwLock::new(StatusSnapshot::default()))
}

/// Collects current system status using sysinfo
pub fn collect_system_status() -> SystemStatus {
    use sysinfo::System;

    let mut sys = System::new();
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let cpu_usage = sys.global_cpu_usage();
    let total_memory = sys.total_memory();
    let used_memory = sys.used_memory();
    let mem_usage = if total_memory > 0 {
        (used_memory as f64 / total_memory as f64 * 100.0) as f32
    } else {
        0.0
    };

    let load_avg = System::load_average();

    SystemStatus {
        cpu_usage_percent: cpu_usage,
        mem_usage_percent: mem_usage,
        load_avg_1: load_avg.one as f32,
        load_avg_5: load_avg.five as f32,
        load_avg_15: load_avg.fifteen as f32,
    }
}
