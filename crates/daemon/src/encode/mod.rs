//! Encode phase.
//!
//! Dispatches a built job to the standard single-process encode or the
//! dual-layer three-process pipeline, supervising external encoder
//! output for progress and applying the shared post-exit cleanup
//! policy. The crash-recovery marker written here is what the startup
//! sweep consumes after an unclean shutdown.

pub mod dual_layer;
pub mod progress;
pub mod standard;

pub use dual_layer::{run_dual_layer_encode, DualLayerEncodeParams};
pub use progress::{parse_ffmpeg_progress, parse_x265_progress, ProgressUpdate};
pub use standard::{run_standard_encode, StandardEncodeParams};

use crate::commands::CommandSet;
use crate::jobs::JobStatus;
use crate::manager::JobManager;
use crate::marker;
use crate::startup::ToolPaths;
use auto_encode_daemon_config::ThresholdsConfig;
use std::fs;
use std::io::{self, BufRead, BufReader, Read};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, ChildStderr, ChildStdout, Command, ExitStatus, Stdio};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Error types for encode supervision.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("failed to spawn {tool}: {source}")]
    Spawn { tool: &'static str, source: io::Error },

    #[error("error supervising {tool}: {source}")]
    Supervise { tool: &'static str, source: io::Error },

    #[error("failed to record in-flight outputs: {0}")]
    Marker(io::Error),

    #[error("{0} stage thread panicked")]
    StagePanicked(&'static str),
}

/// Terminal outcome of one encode attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeOutcome {
    /// Killed by an external cancel; the job rolls back for reselection.
    Canceled,
    /// The encode did not produce a good output; the message errors the
    /// job.
    Failed(String),
    Success,
}

/// Runs the encode phase for one job.
///
/// On success the job moves to ENCODED with its progress pinned at 100.
/// On failure the job is errored; on cancellation it is left at
/// ENCODING for the post-phase rollback.
pub fn run_encode(
    manager: &JobManager,
    id: u64,
    tools: &ToolPaths,
    thresholds: &ThresholdsConfig,
    temp_dir: &Path,
    cancel: &CancellationToken,
) {
    let Some((source, destination, commands, plan, frame_count)) = manager.with_job(id, |job| {
        (
            job.source_path.clone(),
            job.destination_path.clone(),
            job.commands.clone(),
            job.plan.clone(),
            job.topology.as_ref().map_or(0, |topology| topology.frame_count),
        )
    }) else {
        return;
    };

    manager.set_status(id, JobStatus::Encoding);
    tracing::info!(id, destination = %destination.display(), "encode started");

    let (Some(commands), Some(plan)) = (commands, plan) else {
        manager.set_error(id, "Encode started without built commands");
        return;
    };
    if let Err(e) = fs::metadata(&source) {
        manager.set_error(id, format!("Source file no longer exists: {e}"));
        return;
    }
    if let Some(parent) = destination.parent() {
        if let Err(e) = fs::create_dir_all(parent) {
            manager.set_error(id, format!("Cannot create destination directory: {e}"));
            return;
        }
    }

    let total_frames = total_output_frames(frame_count, plan.video.deinterlace);
    let sidecars: Vec<_> = plan.video.dynamic_metadata.values().cloned().collect();

    let result = match commands {
        CommandSet::Standard { ffmpeg_args } => {
            let params = StandardEncodeParams {
                ffmpeg: tools.ffmpeg.clone(),
                ffmpeg_args,
                destination,
                total_frames,
                sidecars,
                min_percent: thresholds.standard_min_percent,
            };
            standard::run_standard_encode(manager, id, &params, temp_dir, cancel)
        }
        CommandSet::DualLayer { video_pipeline, audio_subs_args, merge_args } => {
            let Some(paths) = plan.dual_layer else {
                manager.set_error(id, "Dual-layer commands without intermediate paths");
                return;
            };
            let params = DualLayerEncodeParams {
                video_pipeline,
                ffmpeg: tools.ffmpeg.clone(),
                audio_subs_args,
                mkvmerge: tools.mkvmerge.clone(),
                merge_args,
                video_out: paths.video_out,
                audio_subs_out: paths.audio_subs_out,
                destination,
                total_frames,
                sidecars,
                stage_min_percent: thresholds.dual_layer_stage_min_percent,
                final_min_percent: thresholds.dual_layer_final_min_percent,
            };
            dual_layer::run_dual_layer_encode(manager, id, &params, temp_dir, cancel)
        }
    };

    match result {
        Ok(EncodeOutcome::Success) => {}
        Ok(EncodeOutcome::Canceled) => tracing::info!(id, "encode canceled"),
        Ok(EncodeOutcome::Failed(message)) => manager.set_error(id, message),
        Err(e) => manager.set_error(id, e.to_string()),
    }
}

/// Expected output frame count. Deinterlacing emits one frame per
/// field, doubling the source count.
pub(crate) fn total_output_frames(frame_count: u64, deinterlace: bool) -> u64 {
    if deinterlace {
        frame_count.saturating_mul(2)
    } else {
        frame_count
    }
}

/// Applies the post-exit cleanup policy, highest priority first:
/// cancellation, exit code, output presence, then the completion
/// threshold.
pub(crate) fn classify_outcome(
    canceled: bool,
    tool: &str,
    status: &ExitStatus,
    output: &Path,
    percent: u8,
    min_percent: u8,
) -> EncodeOutcome {
    if canceled {
        return EncodeOutcome::Canceled;
    }
    if !status.success() {
        return EncodeOutcome::Failed(exit_failure_message(tool, status));
    }
    if let Some(problem) = output_problem(output) {
        return EncodeOutcome::Failed(problem);
    }
    if percent < min_percent {
        return EncodeOutcome::Failed(format!("Encoding ended prematurely at {percent}%"));
    }
    EncodeOutcome::Success
}

pub(crate) fn exit_failure_message(tool: &str, status: &ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("{tool} exited with code {code}"),
        None => format!("{tool} was terminated by a signal"),
    }
}

/// A reason the produced output is unusable, if any.
pub(crate) fn output_problem(output: &Path) -> Option<String> {
    match fs::metadata(output) {
        Err(e) => Some(format!("Output file not found: {e}")),
        Ok(metadata) if metadata.len() == 0 => Some("Output file is empty".to_string()),
        Ok(_) => None,
    }
}

/// Best-effort deletion of partial outputs. Missing files are fine;
/// anything else is logged and skipped.
pub(crate) fn remove_files(paths: &[&Path]) {
    for path in paths {
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to delete partial output"),
        }
    }
}

pub(crate) fn discard_marker(temp_dir: &Path) {
    if let Err(e) = marker::clear_marker(temp_dir) {
        tracing::warn!(error = %e, "failed to remove in-flight marker");
    }
}

/// Spawns an encode child with its stderr captured.
///
/// Every encode child leads its own process group so that a cancel can
/// signal a shell-wrapped pipeline together with its halves; killing
/// only the shell would leave the encoders running.
pub(crate) fn spawn_with_stderr(
    mut command: Command,
    tool: &'static str,
) -> Result<(Child, ChildStderr), EncodeError> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .process_group(0)
        .spawn()
        .map_err(|source| EncodeError::Spawn { tool, source })?;
    let stderr = child.stderr.take().ok_or_else(|| missing_pipe(tool))?;
    Ok((child, stderr))
}

pub(crate) fn spawn_with_stdout(
    mut command: Command,
    tool: &'static str,
) -> Result<(Child, ChildStdout), EncodeError> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .process_group(0)
        .spawn()
        .map_err(|source| EncodeError::Spawn { tool, source })?;
    let stdout = child.stdout.take().ok_or_else(|| missing_pipe(tool))?;
    Ok((child, stdout))
}

fn missing_pipe(tool: &'static str) -> EncodeError {
    EncodeError::Supervise {
        tool,
        source: io::Error::new(io::ErrorKind::BrokenPipe, "output pipe not captured"),
    }
}

/// Force-kills a supervised child and everything in its process group.
fn kill_group(child: &mut Child) {
    let pid = child.id() as i32;
    // SAFETY: sends a signal, touches no memory. The child is not yet
    // reaped, so its pid (and group id) cannot have been recycled; a
    // group that already died yields ESRCH, which is ignored.
    unsafe {
        libc::kill(-pid, libc::SIGKILL);
    }
    // Race with a natural exit leaves nothing to kill.
    let _ = child.kill();
}

/// Reads a child's output line by line until exit, invoking `on_line`
/// for each non-empty line. The child is force-killed as soon as the
/// cancellation token is observed; the caller classifies the resulting
/// signal exit via [`classify_outcome`].
pub(crate) fn supervise_lines(
    child: &mut Child,
    pipe: impl Read,
    cancel: &CancellationToken,
    mut on_line: impl FnMut(&str),
) -> io::Result<ExitStatus> {
    let mut reader = BufReader::new(pipe);
    let mut line = String::new();
    loop {
        if cancel.is_cancelled() {
            kill_group(child);
            return child.wait();
        }
        line.clear();
        let consumed = match read_progress_line(&mut reader, &mut line) {
            Ok(consumed) => consumed,
            Err(e) => {
                kill_group(child);
                let _ = child.wait();
                return Err(e);
            }
        };
        if consumed == 0 {
            break;
        }
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            on_line(trimmed);
        }
    }
    child.wait()
}

/// Reads up to the next `\r` or `\n`, appending to `line`.
///
/// Encoders rewrite their stat line in place with a bare carriage
/// return; `BufRead::lines` would buffer those until process exit.
/// Returns the number of bytes consumed, 0 at end of stream.
fn read_progress_line(reader: &mut impl BufRead, line: &mut String) -> io::Result<usize> {
    let mut consumed = 0usize;
    loop {
        let (done, used) = {
            let available = match reader.fill_buf() {
                Ok(buffer) => buffer,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            if available.is_empty() {
                return Ok(consumed);
            }
            match available.iter().position(|&byte| byte == b'\r' || byte == b'\n') {
                Some(position) => {
                    line.push_str(&String::from_utf8_lossy(&available[..position]));
                    (true, position + 1)
                }
                None => {
                    line.push_str(&String::from_utf8_lossy(available));
                    (false, available.len())
                }
            }
        };
        reader.consume(used);
        consumed += used;
        if done {
            return Ok(consumed);
        }
    }
}
