//! Encoding plan synthesis.
//!
//! Turns a probed stream topology into a deterministic encoding plan:
//! encoder choice by resolution, HDR handling (including the dual-layer
//! Dolby Vision route), an audio track plan driven by a codec quality
//! ranking, and a subtitle copy plan. Pure policy, no process execution.

use crate::probe::{DynamicHdrFormat, HdrFlags, StreamTopology, VideoScanType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Minimum pixel count (1280x720) at which x265 10-bit is selected over
/// x264 8-bit.
const MIN_X265_RESOLUTION_PIXELS: u64 = 921_600;

/// Language preferred as the first audio group in the output.
pub const PRIMARY_LANGUAGE: &str = "eng";

/// Audio codec quality ranking, worst to best. Codecs not listed rank
/// below everything listed.
const AUDIO_CODEC_RANKING: [&str; 9] = [
    "ac3",
    "aac",
    "dts",
    "dts-es",
    "dts-hd hra",
    "pcm_s16le",
    "pcm_s24le",
    "dts-hd ma",
    "truehd",
];

/// Video encoder selected for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoEncoder {
    X264,
    X265,
}

impl std::fmt::Display for VideoEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VideoEncoder::X264 => write!(f, "x264"),
            VideoEncoder::X265 => write!(f, "x265"),
        }
    }
}

/// What to do with an audio track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioAction {
    /// Copy the stream verbatim.
    Copy,
    /// Transcode to stereo AAC.
    TranscodeAac,
}

/// Video portion of the plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoInstruction {
    pub encoder: VideoEncoder,
    pub pixel_format: String,
    pub crf: u8,
    pub bframes: u8,
    pub deinterlace: bool,
    pub crop: bool,
    /// HDR formats the encode must carry through.
    pub hdr_flags: HdrFlags,
    /// Sidecar metadata files per dynamic format.
    pub dynamic_metadata: BTreeMap<DynamicHdrFormat, PathBuf>,
}

/// One entry of the audio plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioInstruction {
    /// Audio-relative index of the source track.
    pub source_index: usize,
    pub action: AudioAction,
    pub language: String,
    pub commentary: bool,
}

/// One entry of the subtitle plan. Subtitles are always copied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtitleInstruction {
    /// Subtitle-relative index of the source track.
    pub source_index: usize,
    pub forced: bool,
}

/// Intermediate output paths for the dual-layer (three stage) Dolby
/// Vision pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DualLayerPaths {
    /// Raw HEVC video layer written by the x265 stage.
    pub video_out: PathBuf,
    /// Audio and subtitle container written by the ffmpeg stage.
    pub audio_subs_out: PathBuf,
}

impl DualLayerPaths {
    /// Derives the intermediate paths from the final destination.
    ///
    /// Apostrophes are replaced with spaces so the paths survive
    /// single-quoting in the encode shell pipeline.
    pub fn for_destination(destination: &Path) -> Self {
        let video_out = destination.with_extension("hevc");
        let audio_subs_out = destination.with_extension("as.mkv");
        Self {
            video_out: PathBuf::from(video_out.to_string_lossy().replace('\'', " ")),
            audio_subs_out: PathBuf::from(audio_subs_out.to_string_lossy().replace('\'', " ")),
        }
    }
}

/// Full encoding plan for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodingPlan {
    pub video: VideoInstruction,
    pub audio: Vec<AudioInstruction>,
    pub subtitles: Vec<SubtitleInstruction>,
    /// Present only when the job takes the dual-layer pipeline.
    pub dual_layer: Option<DualLayerPaths>,
}

impl EncodingPlan {
    /// Whether the job encodes via the dual-layer pipeline.
    pub fn is_dual_layer(&self) -> bool {
        self.dual_layer.is_some()
    }
}

/// Synthesizes the encoding plan for a probed source.
///
/// # Arguments
///
/// * `topology` - Probed stream topology with scan type and crop filled in.
/// * `destination` - Final output path, used to derive dual-layer
///   intermediate paths.
/// * `primary_language` - Language sorted first in the audio plan.
/// * `dolby_vision_enabled` - Whether the dual-layer pipeline may be used.
pub fn synthesize_plan(
    topology: &StreamTopology,
    destination: &Path,
    primary_language: &str,
    dolby_vision_enabled: bool,
) -> EncodingPlan {
    let use_x265 = topology.video.resolution_pixels() >= MIN_X265_RESOLUTION_PIXELS;

    let mut hdr_flags = HdrFlags::default();
    let mut dynamic_metadata = BTreeMap::new();
    let mut dual_layer = None;

    if let Some(hdr) = &topology.video.hdr {
        hdr_flags.hdr10 = true;
        if hdr.flags.has_dynamic() {
            for (format, sidecar) in &hdr.sidecars {
                match format {
                    DynamicHdrFormat::Hdr10Plus => hdr_flags.hdr10plus = true,
                    DynamicHdrFormat::DolbyVision => hdr_flags.dolby_vision = true,
                }
                dynamic_metadata.insert(*format, sidecar.clone());

                if *format == DynamicHdrFormat::DolbyVision && dolby_vision_enabled {
                    dual_layer = Some(DualLayerPaths::for_destination(destination));
                }
            }
        }
    }

    let video = VideoInstruction {
        encoder: if use_x265 {
            VideoEncoder::X265
        } else {
            VideoEncoder::X264
        },
        pixel_format: if use_x265 { "yuv420p10le" } else { "yuv420p" }.to_string(),
        crf: if use_x265 { 20 } else { 16 },
        bframes: 8,
        deinterlace: topology.video.scan_type != VideoScanType::Progressive,
        crop: true,
        hdr_flags,
        dynamic_metadata,
    };

    EncodingPlan {
        video,
        audio: plan_audio(topology, primary_language),
        subtitles: plan_subtitles(topology),
        dual_layer,
    }
}

fn plan_audio(topology: &StreamTopology, primary_language: &str) -> Vec<AudioInstruction> {
    // Group tracks by language, preserving first-seen group order
    let mut groups: Vec<(String, Vec<&crate::probe::AudioTrack>)> = Vec::new();
    for track in &topology.audio {
        match groups.iter_mut().find(|(lang, _)| *lang == track.language) {
            Some((_, tracks)) => tracks.push(track),
            None => groups.push((track.language.clone(), vec![track])),
        }
    }

    let mut instructions = Vec::new();
    for (language, tracks) in &groups {
        // First track wins rank ties, so the earlier stream is preferred
        let mut best: Option<&crate::probe::AudioTrack> = None;
        for track in tracks.iter().filter(|t| !t.commentary) {
            let better = match best {
                Some(current) => codec_rank(&track.codec) > codec_rank(&current.codec),
                None => true,
            };
            if better {
                best = Some(track);
            }
        }

        if let Some(best) = best {
            let low_channel_lossy = (best.codec.eq_ignore_ascii_case("ac3")
                || best.codec.eq_ignore_ascii_case("aac"))
                && best.channels < 2;

            if low_channel_lossy {
                // Nothing worth copying, a single AAC track suffices
                instructions.push(AudioInstruction {
                    source_index: best.index,
                    action: AudioAction::TranscodeAac,
                    language: language.clone(),
                    commentary: false,
                });
            } else {
                instructions.push(AudioInstruction {
                    source_index: best.index,
                    action: AudioAction::Copy,
                    language: language.clone(),
                    commentary: false,
                });
                // Stereo compatibility down-mix alongside the original
                instructions.push(AudioInstruction {
                    source_index: best.index,
                    action: AudioAction::TranscodeAac,
                    language: language.clone(),
                    commentary: false,
                });
            }
        }

        for track in tracks.iter().filter(|t| t.commentary) {
            instructions.push(AudioInstruction {
                source_index: track.index,
                action: AudioAction::Copy,
                language: language.clone(),
                commentary: true,
            });
        }
    }

    // Commentary last, primary language first, then by language, and copy
    // before transcode within a track's pair. Sort is stable so grouped
    // pairs keep their emitted order on ties.
    instructions.sort_by_key(|a| {
        (
            a.commentary,
            !a.language.eq_ignore_ascii_case(primary_language),
            a.language.clone(),
            a.action != AudioAction::Copy,
        )
    });
    instructions
}

fn plan_subtitles(topology: &StreamTopology) -> Vec<SubtitleInstruction> {
    let mut instructions: Vec<SubtitleInstruction> = topology
        .subtitles
        .iter()
        .map(|s| SubtitleInstruction {
            source_index: s.index,
            forced: s.forced,
        })
        .collect();
    instructions.sort_by_key(|s| s.forced);
    instructions
}

/// Position of a codec in the quality ranking; unknown codecs rank below
/// everything listed.
fn codec_rank(codec: &str) -> i32 {
    let lowered = codec.to_lowercase();
    AUDIO_CODEC_RANKING
        .iter()
        .position(|c| *c == lowered)
        .map(|p| p as i32)
        .unwrap_or(-1)
}
