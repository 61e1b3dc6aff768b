//! Encoding job entity and its lifecycle state machine.
//!
//! A job tracks one source file through build, encode, and post-process,
//! including pause/cancel state, progress reporting, and error capture.

use crate::commands::CommandSet;
use crate::instructions::EncodingPlan;
use crate::post_process::PostProcessPlan;
use crate::probe::StreamTopology;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;

/// Lifecycle status of an encoding job.
///
/// Statuses are ordered; a job normally advances by exactly one step per
/// completed phase and only regresses through [`JobStatus::predecessor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Job has been created and is waiting to be built.
    New,
    /// Build pipeline is analyzing the source.
    Building,
    /// Build pipeline finished; job is waiting to encode.
    Built,
    /// Encode is running.
    Encoding,
    /// Encode finished successfully.
    Encoded,
    /// Post-processing is running.
    PostProcessing,
    /// Post-processing finished successfully.
    PostProcessed,
}

impl JobStatus {
    /// The status a job rolls back to when its current phase errors or is
    /// canceled. `New` maps to itself.
    pub fn predecessor(self) -> JobStatus {
        match self {
            JobStatus::New => JobStatus::New,
            JobStatus::Building => JobStatus::New,
            JobStatus::Built => JobStatus::Building,
            JobStatus::Encoding => JobStatus::Built,
            JobStatus::Encoded => JobStatus::Encoding,
            JobStatus::PostProcessing => JobStatus::Encoded,
            JobStatus::PostProcessed => JobStatus::PostProcessing,
        }
    }
}

impl Default for JobStatus {
    fn default() -> Self {
        Self::New
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::New => write!(f, "new"),
            JobStatus::Building => write!(f, "building"),
            JobStatus::Built => write!(f, "built"),
            JobStatus::Encoding => write!(f, "encoding"),
            JobStatus::Encoded => write!(f, "encoded"),
            JobStatus::PostProcessing => write!(f, "post_processing"),
            JobStatus::PostProcessed => write!(f, "post_processed"),
        }
    }
}

/// Fine-grained progress marker inside the build phase.
///
/// Used only for diagnostics and cancellation reporting; lane selection
/// looks at [`JobStatus`] alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStep {
    /// Build has started but no step is running yet.
    Building,
    /// Probing the source streams.
    Probing,
    /// Detecting interlaced vs. progressive content.
    ScanType,
    /// Detecting the active picture rectangle.
    Crop,
    /// Extracting dynamic HDR sidecar metadata.
    DynamicHdr,
    /// Synthesizing the encoding plan.
    Instructions,
    /// Rendering the external-tool commands.
    Command,
    /// Build finished.
    Built,
}

impl Default for BuildStep {
    fn default() -> Self {
        Self::Building
    }
}

impl std::fmt::Display for BuildStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildStep::Building => write!(f, "building"),
            BuildStep::Probing => write!(f, "probing"),
            BuildStep::ScanType => write!(f, "scan_type"),
            BuildStep::Crop => write!(f, "crop"),
            BuildStep::DynamicHdr => write!(f, "dynamic_hdr"),
            BuildStep::Instructions => write!(f, "instructions"),
            BuildStep::Command => write!(f, "command"),
            BuildStep::Built => write!(f, "built"),
        }
    }
}

/// Describes a source file handed to the daemon for encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceDescriptor {
    /// Full path to the source file.
    pub source_path: PathBuf,
    /// Full path the encoded output should land at.
    pub destination_path: PathBuf,
    /// Post-processing requested for this job.
    pub post_plan: PostProcessPlan,
}

/// One transcoding unit: a source file, its analysis results, its encoding
/// plan, and all lifecycle state.
#[derive(Debug, Clone)]
pub struct Job {
    /// Monotonically assigned identifier, starting at 1.
    pub id: u64,
    /// Source file name including extension (identity key for duplicates).
    pub filename: String,
    /// Source file name without extension.
    pub name: String,
    /// Full path to the source file.
    pub source_path: PathBuf,
    /// Full path for the encoded output.
    pub destination_path: PathBuf,
    /// Current lifecycle status.
    pub status: JobStatus,
    /// Current build step (meaningful while status is Building).
    pub build_step: BuildStep,
    /// Whether a phase has errored; an errored job never re-enters a lane.
    pub error: bool,
    /// Error message, if errored.
    pub error_message: Option<String>,
    /// Unix timestamp (milliseconds) when the error was recorded.
    pub error_time_ms: Option<i64>,
    /// Whether the job is paused (excluded from lane selection).
    pub paused: bool,
    /// Whether a pause was requested while a phase was running.
    pub pending_pause: bool,
    /// Cancellation handle owned by the currently running phase task.
    pub cancel_token: Option<CancellationToken>,
    /// Encode progress percent, 0-100.
    pub progress: u8,
    /// Current encoder frames per second, while encoding.
    pub fps: Option<f64>,
    /// Estimated seconds remaining, while encoding.
    pub eta_secs: Option<u64>,
    /// Seconds spent encoding so far.
    pub elapsed_secs: u64,
    /// Unix timestamp (milliseconds) when the encode completed.
    pub completed_encode_ms: Option<i64>,
    /// Unix timestamp (milliseconds) when post-processing completed.
    pub completed_post_process_ms: Option<i64>,
    /// Unix timestamp (milliseconds) when the job was created.
    pub created_at_ms: i64,
    /// Probed stream topology, filled in by the build phase.
    pub topology: Option<StreamTopology>,
    /// Synthesized encoding plan, filled in by the build phase.
    pub plan: Option<EncodingPlan>,
    /// Rendered external-tool commands, filled in by the build phase.
    pub commands: Option<CommandSet>,
    /// Post-processing requested for this job.
    pub post_plan: PostProcessPlan,
}

impl Job {
    /// Creates a new job in status NEW from a source descriptor.
    pub fn new(id: u64, descriptor: SourceDescriptor) -> Self {
        let filename = descriptor
            .source_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let name = descriptor
            .source_path
            .file_stem()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        Self {
            id,
            filename,
            name,
            source_path: descriptor.source_path,
            destination_path: descriptor.destination_path,
            status: JobStatus::New,
            build_step: BuildStep::Building,
            error: false,
            error_message: None,
            error_time_ms: None,
            paused: false,
            pending_pause: false,
            cancel_token: None,
            progress: 0,
            fps: None,
            eta_secs: None,
            elapsed_secs: 0,
            completed_encode_ms: None,
            completed_post_process_ms: None,
            created_at_ms: current_timestamp_ms(),
            topology: None,
            plan: None,
            commands: None,
            post_plan: descriptor.post_plan,
        }
    }

    /// Title carried into the output metadata: the probed container title
    /// when present, else the source file stem.
    pub fn title(&self) -> String {
        self.topology
            .as_ref()
            .and_then(|t| t.title.clone())
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| self.name.clone())
    }

    /// Whether a phase currently owns this job.
    pub fn is_processing(&self) -> bool {
        matches!(
            self.status,
            JobStatus::Building | JobStatus::Encoding | JobStatus::PostProcessing
        )
    }

    /// Whether the running phase's cancellation handle has been triggered.
    pub fn canceled(&self) -> bool {
        self.cancel_token
            .as_ref()
            .map(|t| t.is_cancelled())
            .unwrap_or(false)
    }

    /// Whether this job still has post-processing work after encoding.
    pub fn needs_post_processing(&self) -> bool {
        !self.post_plan.is_empty()
    }

    /// Whether the job has finished all the work it will ever do.
    pub fn is_complete(&self) -> bool {
        !self.error
            && self.progress == 100
            && ((self.status == JobStatus::Encoded && !self.needs_post_processing())
                || (self.status == JobStatus::PostProcessed && self.needs_post_processing()))
    }

    /// Requests cancellation of the running phase.
    ///
    /// No-op unless the job is currently processing and not already
    /// canceled. Returns true if the cancellation handle was triggered.
    pub fn cancel(&mut self) -> bool {
        if self.is_processing() && !self.canceled() {
            if let Some(token) = &self.cancel_token {
                token.cancel();
                return true;
            }
        }
        false
    }

    /// Pauses the job: immediately when idle, deferred when a phase is
    /// running (applied by the post-phase cleanup).
    pub fn pause(&mut self) {
        if self.is_processing() {
            self.pending_pause = true;
            self.paused = false;
        } else {
            self.pending_pause = false;
            self.paused = true;
        }
    }

    /// Clears both pause flags unconditionally.
    pub fn resume(&mut self) {
        self.paused = false;
        self.pending_pause = false;
    }

    /// Cancels the running phase, then pauses.
    pub fn cancel_then_pause(&mut self) -> bool {
        let canceled = self.cancel();
        self.pause();
        canceled
    }

    /// Records an error and rolls the status back one step.
    pub fn set_error(&mut self, message: impl Into<String>) {
        self.error = true;
        self.error_message = Some(message.into());
        self.error_time_ms = Some(current_timestamp_ms());
        self.apply_rollback();
    }

    /// Rolls the status back to its predecessor.
    ///
    /// Leaving ENCODING also clears the encode-completion timestamp and
    /// resets all progress fields.
    pub fn apply_rollback(&mut self) {
        if self.status == JobStatus::Encoding {
            self.completed_encode_ms = None;
            self.reset_encode_progress();
        }
        self.status = self.status.predecessor();
    }

    /// Post-phase cleanup, run by the scheduler after every phase task
    /// regardless of how it ended.
    pub fn cleanup_after_phase(&mut self) {
        if self.canceled() {
            self.cancel_token = None;
            self.apply_rollback();
        }

        // A completed job has nothing left to pause
        if self.is_complete() {
            self.resume();
        } else if self.pending_pause {
            self.pause();
        }
    }

    /// Updates encode progress fields; `None` fields are left unchanged.
    pub fn update_progress(
        &mut self,
        progress: Option<u8>,
        eta_secs: Option<u64>,
        fps: Option<f64>,
        elapsed_secs: Option<u64>,
    ) {
        if let Some(p) = progress {
            self.progress = p.min(100);
        }
        if let Some(eta) = eta_secs {
            self.eta_secs = Some(eta);
        }
        if let Some(f) = fps {
            self.fps = Some(f);
        }
        if let Some(elapsed) = elapsed_secs {
            self.elapsed_secs = elapsed;
        }
    }

    /// Marks the encode complete: progress 100, completion timestamp,
    /// status ENCODED.
    pub fn complete_encoding(&mut self, elapsed_secs: u64) {
        self.completed_encode_ms = Some(current_timestamp_ms());
        self.update_progress(Some(100), Some(0), Some(0.0), Some(elapsed_secs));
        self.status = JobStatus::Encoded;
    }

    /// Marks post-processing complete with its timestamp.
    pub fn complete_post_processing(&mut self) {
        self.completed_post_process_ms = Some(current_timestamp_ms());
        self.status = JobStatus::PostProcessed;
    }

    fn reset_encode_progress(&mut self) {
        self.progress = 0;
        self.fps = None;
        self.eta_secs = None;
        self.elapsed_secs = 0;
    }
}

/// Get current timestamp in milliseconds since Unix epoch.
pub(crate) fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
