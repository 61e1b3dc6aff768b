//! Job manager.
//!
//! Owns the job collection under a single mutex. Collection reads and
//! writes and every scheduling-relevant mutation go through the manager;
//! phase tasks never hold the lock across a blocking wait. Mutations that
//! observers care about are published through the notification port.

use crate::jobs::{BuildStep, Job, JobStatus, SourceDescriptor};
use crate::notify::{JobEvent, StatusPublisher};
use crate::status::JobSnapshot;
use auto_encode_daemon_config::JobsConfig;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

const MS_PER_HOUR: i64 = 3_600_000;

/// Errors surfaced when a job cannot be added to the queue.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ManagerError {
    #[error("A job for '{0}' already exists")]
    DuplicateSource(String),
    #[error("Job queue is full ({0} jobs)")]
    QueueFull(usize),
}

struct ManagerState {
    jobs: Vec<Job>,
    next_id: u64,
}

/// Shared handle to the job collection.
///
/// Cloning is cheap; all clones operate on the same collection.
#[derive(Clone)]
pub struct JobManager {
    inner: Arc<Mutex<ManagerState>>,
    publisher: Arc<dyn StatusPublisher>,
    config: JobsConfig,
}

impl JobManager {
    pub fn new(config: JobsConfig, publisher: Arc<dyn StatusPublisher>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ManagerState {
                jobs: Vec::new(),
                next_id: 1,
            })),
            publisher,
            config,
        }
    }

    /// Creates a job for a source descriptor and returns its id.
    ///
    /// Rejected when a job with the same source filename already exists
    /// (case-insensitive) or the queue is at capacity.
    pub fn create_job(&self, descriptor: SourceDescriptor) -> Result<u64, ManagerError> {
        let filename = descriptor
            .source_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let (id, name) = {
            let mut state = self.inner.lock().unwrap();
            if state
                .jobs
                .iter()
                .any(|j| j.filename.eq_ignore_ascii_case(&filename))
            {
                return Err(ManagerError::DuplicateSource(filename));
            }
            if state.jobs.len() >= self.config.max_jobs_in_queue {
                return Err(ManagerError::QueueFull(state.jobs.len()));
            }

            let id = state.next_id;
            state.next_id += 1;
            let job = Job::new(id, descriptor);
            let name = job.name.clone();
            state.jobs.push(job);
            (id, name)
        };

        tracing::info!(id, file = %filename, "job created");
        self.publisher.publish(JobEvent::QueueChanged {
            id,
            name,
            added: true,
        });
        Ok(id)
    }

    /// Removes a job by id. Returns false if no such job exists.
    pub fn remove_job(&self, id: u64) -> bool {
        let removed = {
            let mut state = self.inner.lock().unwrap();
            let before = state.jobs.len();
            let mut name = String::new();
            state.jobs.retain(|j| {
                if j.id == id {
                    name = j.name.clone();
                    false
                } else {
                    true
                }
            });
            (state.jobs.len() < before).then_some(name)
        };

        match removed {
            Some(name) => {
                tracing::info!(id, "job removed");
                self.publisher.publish(JobEvent::QueueChanged {
                    id,
                    name,
                    added: false,
                });
                true
            }
            None => false,
        }
    }

    /// Runs a closure against one job under the collection lock.
    ///
    /// Mutations the notification port should see go through the dedicated
    /// methods below instead.
    pub fn with_job<R>(&self, id: u64, f: impl FnOnce(&mut Job) -> R) -> Option<R> {
        let mut state = self.inner.lock().unwrap();
        state.jobs.iter_mut().find(|j| j.id == id).map(f)
    }

    pub fn job_count(&self) -> usize {
        self.inner.lock().unwrap().jobs.len()
    }

    /// Point-in-time views of every job, oldest first.
    pub fn snapshots(&self) -> Vec<JobSnapshot> {
        let state = self.inner.lock().unwrap();
        state.jobs.iter().map(JobSnapshot::of).collect()
    }

    /// Requests cancellation of a job's running phase.
    pub fn cancel(&self, id: u64) -> bool {
        let canceled = self.with_job(id, |job| job.cancel()).unwrap_or(false);
        if canceled {
            tracing::info!(id, "job cancellation requested");
            self.publish_status(id);
        }
        canceled
    }

    /// Pauses a job, deferring if a phase is currently running.
    pub fn pause(&self, id: u64) -> bool {
        let found = self.with_job(id, |job| job.pause()).is_some();
        if found {
            self.publish_status(id);
        }
        found
    }

    /// Clears a job's pause flags.
    pub fn resume(&self, id: u64) -> bool {
        let found = self.with_job(id, |job| job.resume()).is_some();
        if found {
            self.publish_status(id);
        }
        found
    }

    /// Cancels the running phase, then pauses.
    pub fn cancel_then_pause(&self, id: u64) -> bool {
        let found = self.with_job(id, |job| job.cancel_then_pause()).is_some();
        if found {
            self.publish_status(id);
        }
        found
    }

    /// Oldest job ready to enter the build lane.
    pub fn next_for_build(&self) -> Option<u64> {
        self.next_eligible(JobStatus::New, |_| true)
    }

    /// Oldest job ready to enter the encode lane.
    pub fn next_for_encode(&self) -> Option<u64> {
        self.next_eligible(JobStatus::Built, |_| true)
    }

    /// Oldest job ready to enter the post-process lane.
    pub fn next_for_post_process(&self) -> Option<u64> {
        self.next_eligible(JobStatus::Encoded, |job| {
            job.needs_post_processing() && job.completed_encode_ms.is_some()
        })
    }

    fn next_eligible(&self, entry: JobStatus, extra: impl Fn(&Job) -> bool) -> Option<u64> {
        let state = self.inner.lock().unwrap();
        state
            .jobs
            .iter()
            .find(|j| j.status == entry && !j.paused && !j.error && !j.canceled() && extra(j))
            .map(|j| j.id)
    }

    /// Attaches a fresh cancellation handle to a job about to start a
    /// phase and returns it for the phase task.
    pub fn attach_token(&self, id: u64) -> Option<CancellationToken> {
        self.with_job(id, |job| {
            let token = CancellationToken::new();
            job.cancel_token = Some(token.clone());
            token
        })
    }

    /// Advances a job's lifecycle status.
    pub fn set_status(&self, id: u64, status: JobStatus) {
        self.with_job(id, |job| job.status = status);
        self.publish_status(id);
    }

    /// Records the current build step.
    pub fn set_build_step(&self, id: u64, step: BuildStep) {
        self.with_job(id, |job| job.build_step = step);
        self.publisher
            .publish(JobEvent::ProcessingDataChanged { id, step });
    }

    /// Updates encode progress fields; `None` fields are left unchanged.
    pub fn update_progress(
        &self,
        id: u64,
        progress: Option<u8>,
        eta_secs: Option<u64>,
        fps: Option<f64>,
        elapsed_secs: Option<u64>,
    ) {
        let published = self.with_job(id, |job| {
            job.update_progress(progress, eta_secs, fps, elapsed_secs);
            JobEvent::ProgressChanged {
                id,
                progress: job.progress,
                fps: job.fps,
                eta_secs: job.eta_secs,
            }
        });
        if let Some(event) = published {
            self.publisher.publish(event);
        }
    }

    /// Records a phase error and rolls the job's status back one step.
    pub fn set_error(&self, id: u64, message: impl Into<String>) {
        let message = message.into();
        tracing::error!(id, error = %message, "job errored");
        self.with_job(id, move |job| job.set_error(message));
        self.publish_status(id);
    }

    /// Marks a job's encode complete.
    pub fn complete_encoding(&self, id: u64, elapsed_secs: u64) {
        self.with_job(id, |job| job.complete_encoding(elapsed_secs));
        self.publish_status(id);
        self.update_progress(id, Some(100), Some(0), Some(0.0), None);
    }

    /// Marks a job's post-processing complete.
    pub fn complete_post_processing(&self, id: u64) {
        self.with_job(id, |job| job.complete_post_processing());
        self.publish_status(id);
    }

    /// Post-phase cleanup continuation, run after every phase task
    /// regardless of how it ended.
    pub fn finish_phase(&self, id: u64) {
        self.with_job(id, |job| job.cleanup_after_phase());
        self.publish_status(id);
    }

    /// Removes jobs that have sat in a terminal state longer than the
    /// configured retention windows. Returns the evicted ids.
    pub fn evict_expired(&self, now_ms: i64) -> Vec<u64> {
        let completed_window = self.config.hours_completed_until_removal as i64 * MS_PER_HOUR;
        let errored_window = self.config.hours_errored_until_removal as i64 * MS_PER_HOUR;

        let evicted = {
            let mut state = self.inner.lock().unwrap();
            let mut evicted = Vec::new();
            state.jobs.retain(|job| {
                let expired = if job.error {
                    job.error_time_ms
                        .map(|t| now_ms - t >= errored_window)
                        .unwrap_or(false)
                } else if job.is_complete() {
                    let terminal = if job.needs_post_processing() {
                        job.completed_post_process_ms
                    } else {
                        job.completed_encode_ms
                    };
                    terminal
                        .map(|t| now_ms - t >= completed_window)
                        .unwrap_or(false)
                } else {
                    false
                };
                if expired {
                    evicted.push((job.id, job.name.clone()));
                }
                !expired
            });
            evicted
        };

        let mut ids = Vec::with_capacity(evicted.len());
        for (id, name) in evicted {
            tracing::info!(id, "job evicted after retention window");
            self.publisher.publish(JobEvent::QueueChanged {
                id,
                name,
                added: false,
            });
            ids.push(id);
        }
        ids
    }

    fn publish_status(&self, id: u64) {
        let event = self.with_job(id, |job| JobEvent::StatusChanged {
            id,
            status: job.status,
            paused: job.paused || job.pending_pause,
            error: job.error,
        });
        if let Some(event) = event {
            self.publisher.publish(event);
        }
    }
}
