//! Dual-layer three-process encode.
//!
//! Dolby Vision profile 8.1 cannot be carried through a single ffmpeg
//! invocation, so the job runs as three processes: a shell pipeline
//! decoding into the standalone x265 binary for the video layer, a
//! concurrent ffmpeg pass for audio and subtitles, and a final mkvmerge
//! combining both intermediates into the destination. The two encode
//! stages are fail-fast coupled: either one failing kills the other.

use super::progress::VIDEO_STAGE_PERCENT_CEILING;
use super::{
    classify_outcome, discard_marker, exit_failure_message, output_problem, parse_x265_progress,
    remove_files, spawn_with_stderr, spawn_with_stdout, supervise_lines, EncodeError,
    EncodeOutcome,
};
use crate::manager::JobManager;
use crate::marker;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Everything a dual-layer encode needs, resolved from the job and the
/// daemon configuration.
#[derive(Debug, Clone)]
pub struct DualLayerEncodeParams {
    /// Rendered `decode | x265` shell pipeline for the video layer.
    pub video_pipeline: String,
    pub ffmpeg: PathBuf,
    pub audio_subs_args: Vec<String>,
    pub mkvmerge: PathBuf,
    pub merge_args: Vec<String>,
    pub video_out: PathBuf,
    pub audio_subs_out: PathBuf,
    pub destination: PathBuf,
    /// Expected output frame count, for percent computation.
    pub total_frames: u64,
    /// Dynamic HDR sidecars, deleted once the encode succeeds.
    pub sidecars: Vec<PathBuf>,
    /// Completion threshold for the concurrent encode stages.
    pub stage_min_percent: u8,
    /// Completion threshold applied after the merge.
    pub final_min_percent: u8,
}

/// Builds the shell invocation for the video-layer pipeline.
pub fn build_video_stage_command(params: &DualLayerEncodeParams) -> Command {
    let mut command = Command::new("sh");
    command.arg("-c").arg(&params.video_pipeline);
    command
}

/// Builds the ffmpeg invocation for the audio/subtitle stage.
pub fn build_audio_subs_command(params: &DualLayerEncodeParams) -> Command {
    let mut command = Command::new(&params.ffmpeg);
    command.args(&params.audio_subs_args);
    command
}

/// Builds the mkvmerge invocation combining both intermediates.
pub fn build_merge_command(params: &DualLayerEncodeParams) -> Command {
    let mut command = Command::new(&params.mkvmerge);
    command.args(&params.merge_args);
    command
}

/// Runs a dual-layer encode to completion.
///
/// The video and audio stages run on their own threads under a shared
/// stage token: an external cancel propagates into it, and either stage
/// cancels it on failure to kill its sibling. Once both intermediates
/// are good, progress is pinned at the video stage ceiling and the
/// merge produces the destination.
pub fn run_dual_layer_encode(
    manager: &JobManager,
    id: u64,
    params: &DualLayerEncodeParams,
    temp_dir: &Path,
    cancel: &CancellationToken,
) -> Result<EncodeOutcome, EncodeError> {
    marker::write_marker(
        temp_dir,
        &[params.video_out.as_path(), params.audio_subs_out.as_path()],
    )
    .map_err(EncodeError::Marker)?;

    let started = Instant::now();
    let stage = cancel.child_token();
    let video_percent = AtomicU8::new(0);

    let (video, audio) = std::thread::scope(|scope| {
        let video = scope.spawn(|| {
            run_video_stage(manager, id, params, &stage, started, &video_percent)
        });
        let audio = scope.spawn(|| run_audio_stage(params, &stage));
        (
            video.join().unwrap_or(Err(EncodeError::StagePanicked("video"))),
            audio.join().unwrap_or(Err(EncodeError::StagePanicked("audio"))),
        )
    });

    if cancel.is_cancelled() {
        cleanup_intermediates(params, temp_dir);
        return Ok(EncodeOutcome::Canceled);
    }
    let (video, audio) = match (video, audio) {
        (Ok(video), Ok(audio)) => (video, audio),
        (Err(e), _) | (_, Err(e)) => {
            cleanup_intermediates(params, temp_dir);
            return Err(e);
        }
    };
    if let Some(message) = stage_pair_failure(&video, &audio) {
        cleanup_intermediates(params, temp_dir);
        return Ok(EncodeOutcome::Failed(message));
    }
    let stage_percent = video_percent.load(Ordering::Relaxed);
    if stage_percent < params.stage_min_percent {
        cleanup_intermediates(params, temp_dir);
        return Ok(EncodeOutcome::Failed(format!(
            "Encoding ended prematurely at {stage_percent}%"
        )));
    }

    // Both intermediates are good; the merge owns the rest of the bar.
    manager.update_progress(
        id,
        Some(VIDEO_STAGE_PERCENT_CEILING),
        None,
        None,
        Some(started.elapsed().as_secs()),
    );
    run_merge(manager, id, params, temp_dir, cancel, started)
}

/// Exit status and failure verdict of one encode stage.
struct StageReport {
    status: ExitStatus,
    failure: Option<String>,
}

fn run_video_stage(
    manager: &JobManager,
    id: u64,
    params: &DualLayerEncodeParams,
    stage: &CancellationToken,
    started: Instant,
    percent: &AtomicU8,
) -> Result<StageReport, EncodeError> {
    let (mut child, stderr) =
        match spawn_with_stderr(build_video_stage_command(params), "video pipeline") {
            Ok(pair) => pair,
            Err(e) => {
                stage.cancel();
                return Err(e);
            }
        };

    let mut line_index = 0usize;
    let supervised = supervise_lines(&mut child, stderr, stage, |line| {
        line_index += 1;
        // Sample every other line.
        if line_index % 2 != 0 {
            return;
        }
        if let Some(update) = parse_x265_progress(line, params.total_frames) {
            percent.store(update.percent, Ordering::Relaxed);
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
            stage.cancel();
            return Err(EncodeError::Supervise { tool: "video pipeline", source });
        }
    };

    let failure = stage_failure("video pipeline", &status, &params.video_out);
    if failure.is_some() {
        stage.cancel();
    }
    Ok(StageReport { status, failure })
}

fn run_audio_stage(
    params: &DualLayerEncodeParams,
    stage: &CancellationToken,
) -> Result<StageReport, EncodeError> {
    let (mut child, stderr) = match spawn_with_stderr(build_audio_subs_command(params), "ffmpeg") {
        Ok(pair) => pair,
        Err(e) => {
            stage.cancel();
            return Err(e);
        }
    };

    // Drained for liveness only; the video stage owns the progress bar.
    let supervised = supervise_lines(&mut child, stderr, stage, |_line| {});
    let status = match supervised {
        Ok(status) => status,
        Err(source) => {
            stage.cancel();
            return Err(EncodeError::Supervise { tool: "ffmpeg", source });
        }
    };

    let failure = stage_failure("ffmpeg", &status, &params.audio_subs_out);
    if failure.is_some() {
        stage.cancel();
    }
    Ok(StageReport { status, failure })
}

fn run_merge(
    manager: &JobManager,
    id: u64,
    params: &DualLayerEncodeParams,
    temp_dir: &Path,
    cancel: &CancellationToken,
    started: Instant,
) -> Result<EncodeOutcome, EncodeError> {
    let (mut child, stdout) = match spawn_with_stdout(build_merge_command(params), "mkvmerge") {
        Ok(pair) => pair,
        Err(e) => {
            cleanup_with_destination(params, temp_dir);
            return Err(e);
        }
    };
    if let Err(e) = marker::append_to_marker(temp_dir, &params.destination) {
        tracing::warn!(error = %e, "failed to record merge output in marker");
    }

    // mkvmerge chatter is a liveness heartbeat; the bar stays at the
    // stage ceiling until completion.
    let supervised = supervise_lines(&mut child, stdout, cancel, |_line| {
        manager.update_progress(id, None, None, None, Some(started.elapsed().as_secs()));
    });
    let status = match supervised {
        Ok(status) => status,
        Err(source) => {
            cleanup_with_destination(params, temp_dir);
            return Err(EncodeError::Supervise { tool: "mkvmerge", source });
        }
    };

    let outcome = classify_outcome(
        cancel.is_cancelled(),
        "mkvmerge",
        &status,
        &params.destination,
        VIDEO_STAGE_PERCENT_CEILING,
        params.final_min_percent,
    );
    match &outcome {
        EncodeOutcome::Success => {
            let elapsed_secs = started.elapsed().as_secs();
            manager.complete_encoding(id, elapsed_secs);
            let mut files = vec![params.video_out.as_path(), params.audio_subs_out.as_path()];
            files.extend(params.sidecars.iter().map(PathBuf::as_path));
            remove_files(&files);
            discard_marker(temp_dir);
            tracing::info!(id, elapsed_secs, "dual-layer encode finished");
        }
        EncodeOutcome::Canceled | EncodeOutcome::Failed(_) => {
            cleanup_with_destination(params, temp_dir)
        }
    }
    Ok(outcome)
}

/// A stage's failure verdict: bad exit first, then a missing or empty
/// intermediate.
fn stage_failure(tool: &str, status: &ExitStatus, output: &Path) -> Option<String> {
    if !status.success() {
        return Some(exit_failure_message(tool, status));
    }
    output_problem(output)
}

/// Picks the message for a failed stage pair. A signal exit usually
/// means that stage was killed after its sibling failed, so a real exit
/// code wins when both report failure.
fn stage_pair_failure(video: &StageReport, audio: &StageReport) -> Option<String> {
    match (&video.failure, &audio.failure) {
        (None, None) => None,
        (Some(failure), None) => Some(failure.clone()),
        (None, Some(failure)) => Some(failure.clone()),
        (Some(video_failure), Some(audio_failure)) => {
            if video.status.code().is_none() && audio.status.code().is_some() {
                Some(audio_failure.clone())
            } else {
                Some(video_failure.clone())
            }
        }
    }
}

fn cleanup_intermediates(params: &DualLayerEncodeParams, temp_dir: &Path) {
    remove_files(&[params.video_out.as_path(), params.audio_subs_out.as_path()]);
    discard_marker(temp_dir);
}

fn cleanup_with_destination(params: &DualLayerEncodeParams, temp_dir: &Path) {
    remove_files(&[
        params.video_out.as_path(),
        params.audio_subs_out.as_path(),
        params.destination.as_path(),
    ]);
    discard_marker(temp_dir);
}
