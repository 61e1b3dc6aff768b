//! Encode command synthesis.
//!
//! Renders an encoding plan into concrete process invocations: a single
//! ffmpeg argument vector for the standard path, or the three dual-layer
//! stages (ffmpeg-to-x265 shell pipeline, audio/subtitle ffmpeg vector,
//! mkvmerge vector). Pure rendering, no process execution.

use crate::instructions::{AudioAction, EncodingPlan, VideoEncoder};
use crate::probe::{DynamicHdrFormat, HdrMetadata, StreamTopology};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Error type for command synthesis.
#[derive(Debug, Error)]
pub enum CommandError {
    /// Crop was requested but never detected.
    #[error("Crop requested but no crop rectangle is available")]
    MissingCrop,

    /// HDR flags are set but the topology carries no HDR metadata.
    #[error("HDR encode requested but no HDR metadata is available")]
    MissingHdrMetadata,

    /// Dual-layer encode without an extracted Dolby Vision sidecar.
    #[error("Dual-layer encode requested but no Dolby Vision sidecar is available")]
    MissingDolbyVisionSidecar,

    /// A rendered invocation came out empty.
    #[error("Rendered command is empty: {0}")]
    EmptyCommand(&'static str),
}

/// Rendered invocations for a job's encode phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandSet {
    /// One ffmpeg invocation.
    Standard { ffmpeg_args: Vec<String> },
    /// The three dual-layer stages.
    DualLayer {
        /// ffmpeg-into-x265 pipeline, run via `sh -c`.
        video_pipeline: String,
        /// ffmpeg argument vector for the audio/subtitle container.
        audio_subs_args: Vec<String>,
        /// mkvmerge argument vector for the final merge.
        merge_args: Vec<String>,
    },
}

impl CommandSet {
    /// Confirms no rendered invocation came out empty.
    pub fn validate(&self) -> Result<(), CommandError> {
        match self {
            CommandSet::Standard { ffmpeg_args } => {
                if ffmpeg_args.is_empty() {
                    return Err(CommandError::EmptyCommand("ffmpeg"));
                }
            }
            CommandSet::DualLayer {
                video_pipeline,
                audio_subs_args,
                merge_args,
            } => {
                if video_pipeline.trim().is_empty() {
                    return Err(CommandError::EmptyCommand("video pipeline"));
                }
                if audio_subs_args.is_empty() {
                    return Err(CommandError::EmptyCommand("audio/subs ffmpeg"));
                }
                if merge_args.is_empty() {
                    return Err(CommandError::EmptyCommand("mkvmerge"));
                }
            }
        }
        Ok(())
    }
}

/// Renders the command set for a planned job.
///
/// # Arguments
///
/// * `topology` - Probed topology with crop and scan type filled in.
/// * `plan` - The encoding plan.
/// * `source` - Source file path.
/// * `destination` - Final output path.
/// * `title` - Output title metadata.
/// * `ffmpeg_path` - ffmpeg executable, embedded in the dual-layer pipeline.
/// * `x265_path` - Standalone x265 executable for the dual-layer pipeline.
pub fn synthesize_commands(
    topology: &StreamTopology,
    plan: &EncodingPlan,
    source: &Path,
    destination: &Path,
    title: &str,
    ffmpeg_path: &Path,
    x265_path: &Path,
) -> Result<CommandSet, CommandError> {
    let command_set = match &plan.dual_layer {
        Some(dual) => {
            let hdr = topology
                .video
                .hdr
                .as_ref()
                .ok_or(CommandError::MissingHdrMetadata)?;
            let rpu = plan
                .video
                .dynamic_metadata
                .get(&DynamicHdrFormat::DolbyVision)
                .ok_or(CommandError::MissingDolbyVisionSidecar)?;

            let video_pipeline = render_dual_layer_video_pipeline(
                topology,
                plan,
                hdr,
                rpu.as_path(),
                source,
                &dual.video_out,
                ffmpeg_path,
                x265_path,
            )?;

            let mut audio_subs_args = vec![
                "-y".to_string(),
                "-nostdin".to_string(),
                "-i".to_string(),
                source.to_string_lossy().into_owned(),
                "-vn".to_string(),
            ];
            push_track_maps(&mut audio_subs_args, plan);
            push_audio_args(&mut audio_subs_args, plan);
            push_subtitle_args(&mut audio_subs_args, plan);
            audio_subs_args.push("-max_muxing_queue_size".to_string());
            audio_subs_args.push("9999".to_string());
            audio_subs_args.push(dual.audio_subs_out.to_string_lossy().into_owned());

            let merge_args = vec![
                "-o".to_string(),
                destination.to_string_lossy().into_owned(),
                "--compression".to_string(),
                "-1:none".to_string(),
                dual.video_out.to_string_lossy().into_owned(),
                "--compression".to_string(),
                "-1:none".to_string(),
                dual.audio_subs_out.to_string_lossy().into_owned(),
                "--title".to_string(),
                title.to_string(),
            ];

            CommandSet::DualLayer {
                video_pipeline,
                audio_subs_args,
                merge_args,
            }
        }
        None => CommandSet::Standard {
            ffmpeg_args: render_standard_args(topology, plan, source, destination, title)?,
        },
    };

    command_set.validate()?;
    Ok(command_set)
}

fn render_standard_args(
    topology: &StreamTopology,
    plan: &EncodingPlan,
    source: &Path,
    destination: &Path,
    title: &str,
) -> Result<Vec<String>, CommandError> {
    let mut args = vec![
        "-y".to_string(),
        "-nostdin".to_string(),
        "-i".to_string(),
        source.to_string_lossy().into_owned(),
        "-map".to_string(),
        "0:v:0".to_string(),
    ];
    push_track_maps(&mut args, plan);

    args.push("-pix_fmt".to_string());
    args.push(plan.video.pixel_format.clone());

    let filter = video_filter(topology, plan)?;

    match plan.video.encoder {
        VideoEncoder::X265 => {
            args.push("-c:v".to_string());
            args.push("libx265".to_string());
            args.push("-preset".to_string());
            args.push("slow".to_string());
            args.push("-crf".to_string());
            args.push(plan.video.crf.to_string());
            if let Some(filter) = &filter {
                args.push("-vf".to_string());
                args.push(filter.clone());
            }
            args.push("-x265-params".to_string());
            args.push(x265_params(topology, plan)?);
        }
        VideoEncoder::X264 => {
            args.push("-c:v".to_string());
            args.push("libx264".to_string());
            args.push("-preset".to_string());
            args.push("veryslow".to_string());
            if let Some(filter) = &filter {
                args.push("-vf".to_string());
                args.push(filter.clone());
            }
            args.push("-x264-params".to_string());
            args.push("bframes=16:b-adapt=2:b-pyramid=normal:partitions=all".to_string());
            args.push("-crf".to_string());
            args.push(plan.video.crf.to_string());
        }
    }

    push_audio_args(&mut args, plan);
    push_subtitle_args(&mut args, plan);

    args.push("-max_muxing_queue_size".to_string());
    args.push("9999".to_string());
    args.push("-metadata".to_string());
    args.push(format!("title={title}"));
    args.push(destination.to_string_lossy().into_owned());
    Ok(args)
}

#[allow(clippy::too_many_arguments)]
fn render_dual_layer_video_pipeline(
    topology: &StreamTopology,
    plan: &EncodingPlan,
    hdr: &HdrMetadata,
    rpu: &Path,
    source: &Path,
    video_out: &Path,
    ffmpeg_path: &Path,
    x265_path: &Path,
) -> Result<String, CommandError> {
    let video = &topology.video;

    let crop = if plan.video.crop {
        let rectangle = video.crop.as_deref().ok_or(CommandError::MissingCrop)?;
        format!("-vf crop={rectangle} ")
    } else {
        String::new()
    };

    let dhdr10 = plan
        .video
        .dynamic_metadata
        .get(&DynamicHdrFormat::Hdr10Plus)
        .map(|json| format!("--dhdr10-info '{}' ", json.display()))
        .unwrap_or_default();

    Ok(format!(
        "'{ffmpeg}' -y -hide_banner -loglevel error -nostdin -i '{source}' {crop}\
         -an -sn -f yuv4mpegpipe -strict -1 -pix_fmt {pix_fmt} - | \
         '{x265}' - --input-depth 10 --output-depth 10 --y4m --preset slow \
         --crf {crf} --bframes {bframes} --repeat-headers --keyint 120 \
         --master-display '{master_display}' --max-cll '{max_cll}' \
         --colormatrix {colormatrix} --colorprim {colorprim} --transfer {transfer} \
         --dolby-vision-rpu '{rpu}' --dolby-vision-profile 8.1 \
         --vbv-bufsize 120000 --vbv-maxrate 120000 {dhdr10}'{video_out}'",
        ffmpeg = ffmpeg_path.display(),
        source = escape_single_quoted(&source.display().to_string()),
        pix_fmt = plan.video.pixel_format,
        x265 = x265_path.display(),
        crf = plan.video.crf,
        bframes = plan.video.bframes,
        master_display = master_display(hdr),
        max_cll = hdr.max_cll,
        colormatrix = video.color_space,
        colorprim = video.color_primaries,
        transfer = video.color_transfer,
        rpu = rpu.display(),
        video_out = video_out.display(),
    ))
}

/// `-map` entries for every planned audio and subtitle track, in plan
/// order.
fn push_track_maps(args: &mut Vec<String>, plan: &EncodingPlan) {
    for audio in &plan.audio {
        args.push("-map".to_string());
        args.push(format!("0:a:{}", audio.source_index));
    }
    for subtitle in &plan.subtitles {
        args.push("-map".to_string());
        args.push(format!("0:s:{}", subtitle.source_index));
    }
}

fn push_audio_args(args: &mut Vec<String>, plan: &EncodingPlan) {
    for (i, audio) in plan.audio.iter().enumerate() {
        match audio.action {
            AudioAction::Copy => {
                args.push(format!("-c:a:{i}"));
                args.push("copy".to_string());
                if audio.commentary {
                    args.push(format!("-disposition:a:{i}"));
                    args.push("comment".to_string());
                }
            }
            AudioAction::TranscodeAac => {
                args.push(format!("-c:a:{i}"));
                args.push("aac".to_string());
                args.push(format!("-ac:a:{i}"));
                args.push("2".to_string());
                args.push(format!("-b:a:{i}"));
                args.push("192k".to_string());
                args.push(format!("-filter:a:{i}"));
                args.push("aresample=matrix_encoding=dplii".to_string());
                args.push(format!("-metadata:s:a:{i}"));
                args.push("title=Stereo (aac)".to_string());
                args.push(format!("-metadata:s:a:{i}"));
                args.push(format!("language={}", audio.language));
            }
        }
    }
}

fn push_subtitle_args(args: &mut Vec<String>, plan: &EncodingPlan) {
    for (i, subtitle) in plan.subtitles.iter().enumerate() {
        args.push(format!("-c:s:{i}"));
        args.push("copy".to_string());
        if subtitle.forced {
            args.push(format!("-disposition:s:{i}"));
            args.push("forced".to_string());
        }
    }
}

/// Renders the crop/yadif filter chain, when any filter applies.
fn video_filter(topology: &StreamTopology, plan: &EncodingPlan) -> Result<Option<String>, CommandError> {
    let mut filters = Vec::new();

    if plan.video.crop {
        let rectangle = topology
            .video
            .crop
            .as_deref()
            .ok_or(CommandError::MissingCrop)?;
        filters.push(format!("crop={rectangle}"));
    }
    if plan.video.deinterlace {
        // Parity argument is the scan-type code (0 TFF, 1 BFF)
        filters.push(format!("yadif=1:{}:0", topology.video.scan_type.code()));
    }

    if filters.is_empty() {
        Ok(None)
    } else {
        Ok(Some(filters.join(", ")))
    }
}

/// Renders the `-x265-params` value.
fn x265_params(topology: &StreamTopology, plan: &EncodingPlan) -> Result<String, CommandError> {
    let video = &topology.video;
    let mut segments = vec![
        format!("bframes={}", plan.video.bframes),
        "keyint=120".to_string(),
        "repeat-headers=1".to_string(),
    ];

    if !video.color_primaries.is_empty() {
        segments.push(format!("colorprim={}", video.color_primaries));
    }
    if !video.color_transfer.is_empty() {
        segments.push(format!("transfer={}", video.color_transfer));
    }
    if !video.color_space.is_empty() {
        segments.push(format!("colormatrix={}", video.color_space));
    }
    if let Some(chroma) = video.chroma_location {
        segments.push(format!("chromaloc={}", chroma.code()));
    }

    if plan.video.hdr_flags.hdr10 {
        let hdr = video.hdr.as_ref().ok_or(CommandError::MissingHdrMetadata)?;
        // Sidecar paths may contain ':', the quotes keep the param parser
        // from splitting on them
        segments.push(format!("master-display='{}'", master_display(hdr)));
        segments.push(format!("max-cll={}", hdr.max_cll));

        if plan.video.hdr_flags.hdr10plus {
            if let Some(json) = plan.video.dynamic_metadata.get(&DynamicHdrFormat::Hdr10Plus) {
                segments.push(format!("dhdr10-info='{}'", json.display()));
            }
        }
    }

    Ok(segments.join(":"))
}

/// Renders the mastering display primaries for x265, green first, with
/// luminance as L(max,min).
fn master_display(hdr: &HdrMetadata) -> String {
    format!(
        "G({},{})B({},{})R({},{})WP({},{})L({},{})",
        hdr.green_x,
        hdr.green_y,
        hdr.blue_x,
        hdr.blue_y,
        hdr.red_x,
        hdr.red_y,
        hdr.white_point_x,
        hdr.white_point_y,
        hdr.max_luminance,
        hdr.min_luminance
    )
}

fn escape_single_quoted(value: &str) -> String {
    value.replace('\'', r"'\''")
}
