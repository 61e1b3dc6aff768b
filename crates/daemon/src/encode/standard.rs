//! Standard single-process encode.
//!
//! One ffmpeg invocation carries the whole job: video, audio, and
//! subtitles straight into the destination container. Progress comes
//! from sampling ffmpeg's stat lines against the expected frame count.

use super::{
    classify_outcome, discard_marker, parse_ffmpeg_progress, remove_files, spawn_with_stderr,
    supervise_lines, EncodeError, EncodeOutcome,
};
use crate::manager::JobManager;
use crate::marker;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Everything a standard encode needs, resolved from the job and the
/// daemon configuration.
#[derive(Debug, Clone)]
pub struct StandardEncodeParams {
    pub ffmpeg: PathBuf,
    pub ffmpeg_args: Vec<String>,
    pub destination: PathBuf,
    /// Expected output frame count, for percent computation.
    pub total_frames: u64,
    /// Dynamic HDR sidecars, deleted once the encode succeeds.
    pub sidecars: Vec<PathBuf>,
    /// Completion threshold below which a clean exit is still a failure.
    pub min_percent: u8,
}

/// Builds the ffmpeg invocation for a standard encode.
pub fn build_ffmpeg_command(params: &StandardEncodeParams) -> Command {
    let mut command = Command::new(&params.ffmpeg);
    command.args(&params.ffmpeg_args);
    command
}

/// Runs a standard encode to completion.
///
/// The crash-recovery marker is written before the process spawns and
/// removed on every exit path; partial outputs are deleted on every
/// non-success outcome.
pub fn run_standard_encode(
    manager: &JobManager,
    id: u64,
    params: &StandardEncodeParams,
    temp_dir: &Path,
    cancel: &CancellationToken,
) -> Result<EncodeOutcome, EncodeError> {
    marker::write_marker(temp_dir, &[params.destination.as_path()]).map_err(EncodeError::Marker)?;

    let started = Instant::now();
    let (mut child, stderr) = match spawn_with_stderr(build_ffmpeg_command(params), "ffmpeg") {
        Ok(pair) => pair,
        Err(e) => {
            cleanup_partial(params, temp_dir);
            return Err(e);
        }
    };

    let mut latest_percent = 0u8;
    let mut line_index = 0usize;
    let supervised = supervise_lines(&mut child, stderr, cancel, |line| {
        line_index += 1;
        // Sample every other line.
        if line_index % 2 != 0 {
            return;
        }
        if let Some(update) = parse_ffmpeg_progress(line, params.total_frames) {
            latest_percent = update.percent;
            manager.update_progress(
                id,
                Some(update.percent),
                update.eta_secs,
                update.fps,
                Some(started.elapsed().as_secs()),
            );
        }
    });
    let status = match supervised {
        Ok(status) => status,
        Err(source) => {
            cleanup_partial(params, temp_dir);
            return Err(EncodeError::Supervise { tool: "ffmpeg", source });
        }
    };

    let outcome = classify_outcome(
        cancel.is_cancelled(),
        "ffmpeg",
        &status,
        &params.destination,
        latest_percent,
        params.min_percent,
    );
    match &outcome {
        EncodeOutcome::Success => {
            let elapsed_secs = started.elapsed().as_secs();
            manager.complete_encoding(id, elapsed_secs);
            let sidecars: Vec<&Path> = params.sidecars.iter().map(PathBuf::as_path).collect();
            remove_files(&sidecars);
            discard_marker(temp_dir);
            tracing::info!(id, elapsed_secs, "encode finished");
        }
        EncodeOutcome::Canceled | EncodeOutcome::Failed(_) => cleanup_partial(params, temp_dir),
    }
    Ok(outcome)
}

fn cleanup_partial(params: &StandardEncodeParams, temp_dir: &Path) {
    remove_files(&[params.destination.as_path()]);
    discard_marker(temp_dir);
}
