//! Build phase.
//!
//! Runs the sequential analysis steps for one job: probe, scan type,
//! crop, dynamic HDR extraction, instruction synthesis, and command
//! synthesis. Any step's failure errors the job and aborts the rest;
//! every step is guarded by a cancellation check.

use crate::commands;
use crate::crop;
use crate::hdr_extract;
use crate::instructions;
use crate::jobs::{BuildStep, JobStatus};
use crate::manager::JobManager;
use crate::probe::{self, DynamicHdrFormat, StreamTopology};
use crate::scan_type;
use crate::startup::ToolPaths;
use std::path::Path;
use tokio_util::sync::CancellationToken;

/// Runs the full build pipeline for one job.
///
/// On success the job holds its topology, plan, and rendered commands
/// and moves to BUILT. On failure the job is errored; on cancellation
/// it is left at BUILDING for the post-phase rollback.
pub fn run_build(
    manager: &JobManager,
    id: u64,
    tools: &ToolPaths,
    temp_dir: &Path,
    dolby_vision_enabled: bool,
    cancel: &CancellationToken,
) {
    let Some((source, destination)) =
        manager.with_job(id, |job| (job.source_path.clone(), job.destination_path.clone()))
    else {
        return;
    };

    manager.set_status(id, JobStatus::Building);
    manager.set_build_step(id, BuildStep::Building);
    tracing::info!(id, source = %source.display(), "build started");

    if is_canceled(cancel, id, "probe") {
        return;
    }
    if let Err(e) = std::fs::metadata(&source) {
        manager.set_error(id, format!("Source file no longer exists: {e}"));
        return;
    }
    manager.set_build_step(id, BuildStep::Probing);
    let mut topology = match probe::probe_source(&tools.ffprobe, &source) {
        Ok(topology) => topology,
        Err(e) => {
            manager.set_error(id, format!("Probing failed: {e}"));
            return;
        }
    };
    manager.with_job(id, |job| job.topology = Some(topology.clone()));

    if is_canceled(cancel, id, "scan type") {
        return;
    }
    manager.set_build_step(id, BuildStep::ScanType);
    match scan_type::detect_scan_type(&tools.ffmpeg, &source) {
        Ok(scan) => topology.video.scan_type = scan,
        Err(e) => {
            manager.set_error(id, format!("Scan type detection failed: {e}"));
            return;
        }
    }

    if is_canceled(cancel, id, "crop") {
        return;
    }
    manager.set_build_step(id, BuildStep::Crop);
    match crop::detect_crop(&tools.ffmpeg, &source, topology.duration_secs) {
        Ok(rectangle) => topology.video.crop = Some(rectangle),
        Err(e) => {
            manager.set_error(id, format!("Crop detection failed: {e}"));
            return;
        }
    }

    if has_dynamic_hdr(&topology) {
        if is_canceled(cancel, id, "dynamic HDR") {
            return;
        }
        manager.set_build_step(id, BuildStep::DynamicHdr);
        if !extract_dynamic_hdr(manager, id, tools, temp_dir, &source, &mut topology) {
            return;
        }
    }
    strip_dolby_vision_without_encoder(&mut topology, tools);

    if is_canceled(cancel, id, "instructions") {
        return;
    }
    manager.set_build_step(id, BuildStep::Instructions);
    let plan = instructions::synthesize_plan(
        &topology,
        &destination,
        instructions::PRIMARY_LANGUAGE,
        dolby_vision_enabled,
    );

    if is_canceled(cancel, id, "command") {
        return;
    }
    manager.set_build_step(id, BuildStep::Command);
    let title = manager
        .with_job(id, |job| {
            job.topology = Some(topology.clone());
            job.title()
        })
        .unwrap_or_default();
    let x265 = tools.x265.as_deref().unwrap_or_else(|| Path::new("x265"));
    let command_set = match commands::synthesize_commands(
        &topology,
        &plan,
        &source,
        &destination,
        &title,
        &tools.ffmpeg,
        x265,
    ) {
        Ok(set) => set,
        Err(e) => {
            manager.set_error(id, format!("Command synthesis failed: {e}"));
            return;
        }
    };

    manager.with_job(id, |job| {
        job.plan = Some(plan);
        job.commands = Some(command_set);
    });
    manager.set_build_step(id, BuildStep::Built);
    manager.set_status(id, JobStatus::Built);
    tracing::info!(id, "build finished");
}

fn is_canceled(cancel: &CancellationToken, id: u64, step: &str) -> bool {
    if cancel.is_cancelled() {
        tracing::info!(id, step, "build canceled");
        true
    } else {
        false
    }
}

fn has_dynamic_hdr(topology: &StreamTopology) -> bool {
    topology
        .video
        .hdr
        .as_ref()
        .map(|hdr| hdr.flags.has_dynamic())
        .unwrap_or(false)
}

/// Extractor binary for a dynamic HDR sub-format, if configured.
fn extractor_for(format: DynamicHdrFormat, tools: &ToolPaths) -> Option<&Path> {
    match format {
        DynamicHdrFormat::Hdr10Plus => tools.hdr10plus_extractor.as_deref(),
        DynamicHdrFormat::DolbyVision => tools.dolby_vision_extractor.as_deref(),
    }
}

/// Runs sidecar extraction for every flagged dynamic HDR sub-format.
///
/// An unconfigured extractor downgrades that sub-format to static HDR10
/// with a warning; a failed extraction errors the job. Returns false
/// when the build must abort.
fn extract_dynamic_hdr(
    manager: &JobManager,
    id: u64,
    tools: &ToolPaths,
    temp_dir: &Path,
    source: &Path,
    topology: &mut StreamTopology,
) -> bool {
    let Some(hdr) = topology.video.hdr.as_mut() else {
        return true;
    };

    let mut formats = Vec::new();
    if hdr.flags.hdr10plus {
        formats.push(DynamicHdrFormat::Hdr10Plus);
    }
    if hdr.flags.dolby_vision {
        formats.push(DynamicHdrFormat::DolbyVision);
    }

    for format in formats {
        let Some(tool) = extractor_for(format, tools) else {
            tracing::warn!(id, %format, "no extractor configured, using static HDR10 only");
            continue;
        };
        match hdr_extract::extract_metadata(&tools.ffmpeg, tool, temp_dir, source, format) {
            Ok(sidecar) => {
                tracing::info!(id, %format, sidecar = %sidecar.display(), "metadata extracted");
                hdr.sidecars.insert(format, sidecar);
            }
            Err(e) => {
                manager.set_error(id, format!("HDR metadata extraction failed: {e}"));
                return false;
            }
        }
    }
    true
}

/// Drops a Dolby Vision sidecar when no x265 binary is configured, since
/// the dual-layer pipeline cannot run without it.
fn strip_dolby_vision_without_encoder(topology: &mut StreamTopology, tools: &ToolPaths) {
    if tools.x265.is_some() {
        return;
    }
    if let Some(hdr) = topology.video.hdr.as_mut() {
        if hdr.sidecars.remove(&DynamicHdrFormat::DolbyVision).is_some() {
            tracing::warn!("x265 not configured, encoding without the Dolby Vision layer");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::SourceDescriptor;
    use crate::notify::NullPublisher;
    use crate::post_process::PostProcessPlan;
    use crate::probe::{HdrFlags, HdrMetadata, VideoScanType, VideoTrack};
    use auto_encode_daemon_config::JobsConfig;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn make_manager_with_source(source: PathBuf) -> (JobManager, u64) {
        let manager = JobManager::new(JobsConfig::default(), Arc::new(NullPublisher));
        let id = manager
            .create_job(SourceDescriptor {
                source_path: source,
                destination_path: PathBuf::from("/nonexistent/out.mkv"),
                post_plan: PostProcessPlan::default(),
            })
            .unwrap();
        (manager, id)
    }

    fn make_manager_with_job() -> (JobManager, u64) {
        make_manager_with_source(PathBuf::from("/nonexistent/source.mkv"))
    }

    fn missing_tools() -> ToolPaths {
        ToolPaths {
            ffmpeg: PathBuf::from("/nonexistent/ffmpeg"),
            ffprobe: PathBuf::from("/nonexistent/ffprobe"),
            x265: None,
            mkvmerge: PathBuf::from("/nonexistent/mkvmerge"),
            hdr10plus_extractor: None,
            dolby_vision_extractor: None,
        }
    }

    fn make_hdr_topology() -> StreamTopology {
        StreamTopology {
            duration_secs: 7200.0,
            frame_count: 172800,
            title: None,
            video: VideoTrack {
                codec: "hevc".to_string(),
                width: 3840,
                height: 2160,
                pixel_format: "yuv420p10le".to_string(),
                color_space: "bt2020nc".to_string(),
                color_primaries: "bt2020".to_string(),
                color_transfer: "smpte2084".to_string(),
                chroma_location: None,
                frame_rate: 24.0,
                scan_type: VideoScanType::Progressive,
                crop: Some("3840:1600:0:280".to_string()),
                hdr: Some(HdrMetadata {
                    flags: HdrFlags {
                        hdr10: true,
                        hdr10plus: false,
                        dolby_vision: true,
                    },
                    red_x: "34000".to_string(),
                    red_y: "16000".to_string(),
                    green_x: "13250".to_string(),
                    green_y: "34500".to_string(),
                    blue_x: "7500".to_string(),
                    blue_y: "3000".to_string(),
                    white_point_x: "15635".to_string(),
                    white_point_y: "16450".to_string(),
                    min_luminance: "1".to_string(),
                    max_luminance: "10000000".to_string(),
                    max_cll: "1000,400".to_string(),
                    sidecars: BTreeMap::new(),
                }),
            },
            audio: Vec::new(),
            subtitles: Vec::new(),
        }
    }

    #[test]
    fn test_probe_failure_errors_job() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("source.mkv");
        std::fs::write(&source, b"not a real container").unwrap();
        let (manager, id) = make_manager_with_source(source);
        let cancel = CancellationToken::new();

        run_build(
            &manager,
            id,
            &missing_tools(),
            dir.path(),
            true,
            &cancel,
        );

        let (status, step, error, message) = manager
            .with_job(id, |job| {
                (
                    job.status,
                    job.build_step,
                    job.error,
                    job.error_message.clone(),
                )
            })
            .unwrap();
        assert!(error);
        assert!(message.unwrap().starts_with("Probing failed"));
        // Rolled back one step from BUILDING
        assert_eq!(status, JobStatus::New);
        assert_eq!(step, BuildStep::Probing);
    }

    #[test]
    fn test_vanished_source_errors_job_before_probing() {
        let (manager, id) = make_manager_with_job();
        let cancel = CancellationToken::new();

        run_build(
            &manager,
            id,
            &missing_tools(),
            Path::new("/tmp"),
            true,
            &cancel,
        );

        let (status, step, error, message) = manager
            .with_job(id, |job| {
                (
                    job.status,
                    job.build_step,
                    job.error,
                    job.error_message.clone(),
                )
            })
            .unwrap();
        assert!(error);
        assert!(message.unwrap().starts_with("Source file no longer exists"));
        assert_eq!(status, JobStatus::New);
        // The step never advanced past the pre-flight check
        assert_eq!(step, BuildStep::Building);
    }

    #[test]
    fn test_pre_canceled_build_leaves_status_for_rollback() {
        let (manager, id) = make_manager_with_job();
        let cancel = manager.attach_token(id).unwrap();
        cancel.cancel();

        run_build(
            &manager,
            id,
            &missing_tools(),
            Path::new("/tmp"),
            true,
            &cancel,
        );

        let (status, error) = manager.with_job(id, |job| (job.status, job.error)).unwrap();
        assert_eq!(status, JobStatus::Building);
        assert!(!error);

        // The post-phase continuation makes the job reselectable
        manager.finish_phase(id);
        assert_eq!(manager.next_for_build(), Some(id));
    }

    #[test]
    fn test_has_dynamic_hdr() {
        let mut topology = make_hdr_topology();
        assert!(has_dynamic_hdr(&topology));

        topology.video.hdr.as_mut().unwrap().flags.dolby_vision = false;
        assert!(!has_dynamic_hdr(&topology));

        topology.video.hdr = None;
        assert!(!has_dynamic_hdr(&topology));
    }

    #[test]
    fn test_extractor_for_maps_formats() {
        let mut tools = missing_tools();
        tools.hdr10plus_extractor = Some(PathBuf::from("/opt/hdr10plus_tool"));

        assert_eq!(
            extractor_for(DynamicHdrFormat::Hdr10Plus, &tools),
            Some(Path::new("/opt/hdr10plus_tool"))
        );
        assert_eq!(extractor_for(DynamicHdrFormat::DolbyVision, &tools), None);
    }

    #[test]
    fn test_unconfigured_extractor_degrades_without_error() {
        let (manager, id) = make_manager_with_job();
        let mut topology = make_hdr_topology();

        let aborted = !extract_dynamic_hdr(
            &manager,
            id,
            &missing_tools(),
            Path::new("/tmp"),
            Path::new("/nonexistent/source.mkv"),
            &mut topology,
        );

        assert!(!aborted);
        assert!(topology.video.hdr.as_ref().unwrap().sidecars.is_empty());
        assert!(!manager.with_job(id, |job| job.error).unwrap());
    }

    #[test]
    fn test_dolby_vision_sidecar_dropped_without_x265() {
        let mut topology = make_hdr_topology();
        topology
            .video
            .hdr
            .as_mut()
            .unwrap()
            .sidecars
            .insert(DynamicHdrFormat::DolbyVision, PathBuf::from("/tmp/x.RPU.bin"));

        let mut tools = missing_tools();
        strip_dolby_vision_without_encoder(&mut topology, &tools);
        assert!(topology.video.hdr.as_ref().unwrap().sidecars.is_empty());

        // With x265 configured the sidecar is kept
        topology
            .video
            .hdr
            .as_mut()
            .unwrap()
            .sidecars
            .insert(DynamicHdrFormat::DolbyVision, PathBuf::from("/tmp/x.RPU.bin"));
        tools.x265 = Some(PathBuf::from("/usr/local/bin/x265"));
        strip_dolby_vision_without_encoder(&mut topology, &tools);
        assert_eq!(topology.video.hdr.as_ref().unwrap().sidecars.len(), 1);
    }
}
