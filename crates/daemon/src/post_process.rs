//! Post-processing phase.
//!
//! After a successful encode, copies the finished output to any
//! additional destinations and optionally deletes the source file.
//! Jobs without a post-process plan skip this phase entirely.

use crate::jobs::JobStatus;
use crate::manager::JobManager;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Error type for the post-process phase.
#[derive(Debug, Error)]
pub enum PostProcessError {
    /// Copying the output to an additional destination failed.
    #[error("Failed to copy output to {}: {source}", .dest.display())]
    Copy {
        dest: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Deleting the source file failed.
    #[error("Failed to delete source file {}: {source}", .path.display())]
    DeleteSource {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// How a post-process run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostProcessOutcome {
    Completed,
    Canceled,
}

/// What to do with a job's output after encoding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostProcessPlan {
    /// Full file paths the finished output is copied to.
    #[serde(default)]
    pub copy_destinations: Vec<PathBuf>,
    /// Whether the source file is deleted once the output is in place.
    #[serde(default)]
    pub delete_source: bool,
}

impl PostProcessPlan {
    /// An empty plan means the job finishes at ENCODED.
    pub fn is_empty(&self) -> bool {
        self.copy_destinations.is_empty() && !self.delete_source
    }
}

/// Runs the post-process phase for one job.
///
/// On success the job moves to POST_PROCESSED; on failure it is
/// errored; on cancellation it is left at POST_PROCESSING for the
/// post-phase rollback.
pub fn run_post_process(manager: &JobManager, id: u64, cancel: &CancellationToken) {
    let Some((output, source, plan)) = manager.with_job(id, |job| {
        (
            job.destination_path.clone(),
            job.source_path.clone(),
            job.post_plan.clone(),
        )
    }) else {
        return;
    };

    manager.set_status(id, JobStatus::PostProcessing);
    tracing::info!(id, output = %output.display(), "post-process started");

    match execute_plan(&output, &source, &plan, cancel) {
        Ok(PostProcessOutcome::Completed) => {
            manager.complete_post_processing(id);
            tracing::info!(id, "post-process finished");
        }
        Ok(PostProcessOutcome::Canceled) => tracing::info!(id, "post-process canceled"),
        Err(e) => manager.set_error(id, format!("Post-processing failed: {e}")),
    }
}

/// Runs the post-process steps for a finished encode.
///
/// Cancellation is checked before each step; a cancelled run returns
/// `Canceled` with whatever steps already ran left in place.
///
/// # Arguments
///
/// * `output` - The finished encode output.
/// * `source` - The job's source file.
/// * `plan` - The post-process plan.
/// * `cancel` - Cancellation token for the phase.
pub fn execute_plan(
    output: &Path,
    source: &Path,
    plan: &PostProcessPlan,
    cancel: &CancellationToken,
) -> Result<PostProcessOutcome, PostProcessError> {
    if cancel.is_cancelled() {
        return Ok(PostProcessOutcome::Canceled);
    }

    for dest in &plan.copy_destinations {
        if let Some(parent) = dest.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| PostProcessError::Copy {
                    dest: dest.clone(),
                    source: e,
                })?;
            }
        }

        std::fs::copy(output, dest).map_err(|e| PostProcessError::Copy {
            dest: dest.clone(),
            source: e,
        })?;
        tracing::info!(output = %output.display(), dest = %dest.display(), "copied output");
    }

    if cancel.is_cancelled() {
        return Ok(PostProcessOutcome::Canceled);
    }

    if plan.delete_source {
        std::fs::remove_file(source).map_err(|e| PostProcessError::DeleteSource {
            path: source.to_path_buf(),
            source: e,
        })?;
        tracing::info!(source = %source.display(), "deleted source file");
    }

    Ok(PostProcessOutcome::Completed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::SourceDescriptor;
    use crate::notify::NullPublisher;
    use auto_encode_daemon_config::JobsConfig;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn write_output(dir: &TempDir, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_empty_plan() {
        assert!(PostProcessPlan::default().is_empty());
        assert!(!PostProcessPlan {
            copy_destinations: vec![PathBuf::from("/library/Movie.mkv")],
            delete_source: false,
        }
        .is_empty());
        assert!(!PostProcessPlan {
            copy_destinations: Vec::new(),
            delete_source: true,
        }
        .is_empty());
    }

    #[test]
    fn test_copies_output_to_each_destination() {
        let dir = TempDir::new().unwrap();
        let output = write_output(&dir, "Movie.mkv", b"encoded");
        let source = write_output(&dir, "Source.mkv", b"source");

        let plan = PostProcessPlan {
            copy_destinations: vec![
                dir.path().join("library/a/Movie.mkv"),
                dir.path().join("library/b/Movie.mkv"),
            ],
            delete_source: false,
        };

        let outcome =
            execute_plan(&output, &source, &plan, &CancellationToken::new()).unwrap();
        assert_eq!(outcome, PostProcessOutcome::Completed);
        for dest in &plan.copy_destinations {
            assert_eq!(std::fs::read(dest).unwrap(), b"encoded");
        }
        assert!(source.exists());
    }

    #[test]
    fn test_copy_overwrites_existing_destination() {
        let dir = TempDir::new().unwrap();
        let output = write_output(&dir, "Movie.mkv", b"new encode");
        let source = write_output(&dir, "Source.mkv", b"source");
        let dest = write_output(&dir, "existing.mkv", b"old encode");

        let plan = PostProcessPlan {
            copy_destinations: vec![dest.clone()],
            delete_source: false,
        };

        execute_plan(&output, &source, &plan, &CancellationToken::new()).unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"new encode");
    }

    #[test]
    fn test_delete_source_removes_file() {
        let dir = TempDir::new().unwrap();
        let output = write_output(&dir, "Movie.mkv", b"encoded");
        let source = write_output(&dir, "Source.mkv", b"source");

        let plan = PostProcessPlan {
            copy_destinations: Vec::new(),
            delete_source: true,
        };

        let outcome =
            execute_plan(&output, &source, &plan, &CancellationToken::new()).unwrap();
        assert_eq!(outcome, PostProcessOutcome::Completed);
        assert!(!source.exists());
        assert!(output.exists());
    }

    #[test]
    fn test_cancel_before_any_step() {
        let dir = TempDir::new().unwrap();
        let output = write_output(&dir, "Movie.mkv", b"encoded");
        let source = write_output(&dir, "Source.mkv", b"source");

        let plan = PostProcessPlan {
            copy_destinations: vec![dir.path().join("library/Movie.mkv")],
            delete_source: true,
        };

        let token = CancellationToken::new();
        token.cancel();
        let outcome = execute_plan(&output, &source, &plan, &token).unwrap();
        assert_eq!(outcome, PostProcessOutcome::Canceled);
        assert!(!plan.copy_destinations[0].exists());
        assert!(source.exists());
    }

    #[test]
    fn test_copy_failure_is_error() {
        let dir = TempDir::new().unwrap();
        let output = write_output(&dir, "Movie.mkv", b"encoded");
        let source = write_output(&dir, "Source.mkv", b"source");
        // Parent path is a file, directory creation must fail
        let blocker = write_output(&dir, "blocker", b"");

        let plan = PostProcessPlan {
            copy_destinations: vec![blocker.join("Movie.mkv")],
            delete_source: true,
        };

        let result = execute_plan(&output, &source, &plan, &CancellationToken::new());
        assert!(matches!(result, Err(PostProcessError::Copy { .. })));
        assert!(source.exists());
    }

    #[test]
    fn test_delete_missing_source_is_error() {
        let dir = TempDir::new().unwrap();
        let output = write_output(&dir, "Movie.mkv", b"encoded");
        let source = dir.path().join("AlreadyGone.mkv");

        let plan = PostProcessPlan {
            copy_destinations: Vec::new(),
            delete_source: true,
        };

        let result = execute_plan(&output, &source, &plan, &CancellationToken::new());
        assert!(matches!(result, Err(PostProcessError::DeleteSource { .. })));
    }

    fn make_encoded_job(dir: &TempDir, plan: PostProcessPlan) -> (JobManager, u64) {
        let manager = JobManager::new(JobsConfig::default(), Arc::new(NullPublisher));
        let output = write_output(dir, "Movie.mkv", b"encoded");
        let source = write_output(dir, "Source.mkv", b"source");
        let id = manager
            .create_job(SourceDescriptor {
                source_path: source,
                destination_path: output,
                post_plan: plan,
            })
            .unwrap();
        manager.complete_encoding(id, 100);
        (manager, id)
    }

    #[test]
    fn test_run_post_process_finishes_job() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("library/Movie.mkv");
        let (manager, id) = make_encoded_job(
            &dir,
            PostProcessPlan {
                copy_destinations: vec![dest.clone()],
                delete_source: false,
            },
        );
        assert_eq!(manager.next_for_post_process(), Some(id));

        run_post_process(&manager, id, &CancellationToken::new());

        assert_eq!(std::fs::read(&dest).unwrap(), b"encoded");
        manager
            .with_job(id, |job| {
                assert_eq!(job.status, JobStatus::PostProcessed);
                assert!(job.completed_post_process_ms.is_some());
            })
            .unwrap();
        // A finished job is never reselected.
        assert_eq!(manager.next_for_post_process(), None);
    }

    #[test]
    fn test_run_post_process_failure_errors_job() {
        let dir = TempDir::new().unwrap();
        let blocker = write_output(&dir, "blocker", b"");
        let (manager, id) = make_encoded_job(
            &dir,
            PostProcessPlan {
                copy_destinations: vec![blocker.join("Movie.mkv")],
                delete_source: false,
            },
        );

        run_post_process(&manager, id, &CancellationToken::new());

        manager
            .with_job(id, |job| {
                assert!(job.error);
                assert!(job
                    .error_message
                    .as_deref()
                    .unwrap()
                    .starts_with("Post-processing failed:"));
            })
            .unwrap();
        assert_eq!(manager.next_for_post_process(), None);
    }
}
