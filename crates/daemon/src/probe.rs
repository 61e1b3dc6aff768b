//! Stream prober for analyzing source files before encoding.
//!
//! This module invokes ffprobe with JSON output and parses the result into
//! a stream topology: video/audio/subtitle tracks, duration, an estimated
//! frame count, and HDR side-data (mastering display primaries, content
//! light level, and dynamic-format presence flags).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// ffprobe command failed to execute.
    #[error("ffprobe failed: {0}")]
    FfprobeFailed(String),

    /// Failed to parse ffprobe JSON output.
    #[error("Failed to parse ffprobe output: {0}")]
    ParseError(String),

    /// Source has no video stream.
    #[error("No video stream found")]
    NoVideoStream,

    /// Source has no audio streams.
    #[error("No audio streams found")]
    NoAudioStream,

    /// An audio stream reported no codec name.
    #[error("Unable to determine audio codec name for stream index {0}")]
    MissingAudioCodec(u32),

    /// No pixel format was reported for the video stream.
    #[error("No pixel format found for video stream")]
    MissingPixelFormat,

    /// Mastering display side-data was present but incomplete.
    #[error("Invalid HDR mastering display data")]
    InvalidHdrData,

    /// IO error during probe.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Scan classification of the video stream, set by the scan-type detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoScanType {
    /// Interlaced, top field first.
    InterlacedTff,
    /// Interlaced, bottom field first.
    InterlacedBff,
    /// Progressive.
    Progressive,
    /// Could not be determined.
    Undetermined,
}

impl VideoScanType {
    /// Numeric code used as the yadif parity argument.
    pub fn code(self) -> u8 {
        match self {
            VideoScanType::InterlacedTff => 0,
            VideoScanType::InterlacedBff => 1,
            VideoScanType::Progressive => 2,
            VideoScanType::Undetermined => 3,
        }
    }

    /// Whether the content needs deinterlacing.
    pub fn is_interlaced(self) -> bool {
        matches!(
            self,
            VideoScanType::InterlacedTff | VideoScanType::InterlacedBff
        )
    }
}

impl Default for VideoScanType {
    fn default() -> Self {
        Self::Undetermined
    }
}

impl std::fmt::Display for VideoScanType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VideoScanType::InterlacedTff => write!(f, "interlaced_tff"),
            VideoScanType::InterlacedBff => write!(f, "interlaced_bff"),
            VideoScanType::Progressive => write!(f, "progressive"),
            VideoScanType::Undetermined => write!(f, "undetermined"),
        }
    }
}

/// Chroma sample siting of the video stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChromaLocation {
    Left,
    Center,
    TopLeft,
    Top,
    BottomLeft,
    Bottom,
}

impl ChromaLocation {
    /// Numeric code carried into the x265 `chromaloc` parameter.
    pub fn code(self) -> u8 {
        match self {
            ChromaLocation::Left => 0,
            ChromaLocation::Center => 1,
            ChromaLocation::TopLeft => 2,
            ChromaLocation::Top => 3,
            ChromaLocation::BottomLeft => 4,
            ChromaLocation::Bottom => 5,
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "left" => Some(ChromaLocation::Left),
            "center" => Some(ChromaLocation::Center),
            "topleft" => Some(ChromaLocation::TopLeft),
            "top" => Some(ChromaLocation::Top),
            "bottomleft" => Some(ChromaLocation::BottomLeft),
            "bottom" => Some(ChromaLocation::Bottom),
            _ => None,
        }
    }
}

/// Dynamic HDR sub-formats that require sidecar metadata extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DynamicHdrFormat {
    Hdr10Plus,
    DolbyVision,
}

impl std::fmt::Display for DynamicHdrFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DynamicHdrFormat::Hdr10Plus => write!(f, "hdr10plus"),
            DynamicHdrFormat::DolbyVision => write!(f, "dolby_vision"),
        }
    }
}

/// Which HDR formats the source carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HdrFlags {
    /// Static HDR10 mastering display metadata is present.
    pub hdr10: bool,
    /// HDR10+ dynamic metadata is present.
    pub hdr10plus: bool,
    /// A Dolby Vision RPU is present.
    pub dolby_vision: bool,
}

impl HdrFlags {
    /// Whether any dynamic sub-format is present.
    pub fn has_dynamic(&self) -> bool {
        self.hdr10plus || self.dolby_vision
    }
}

/// Static HDR10 mastering display metadata plus dynamic-format state.
///
/// Coordinate and luminance values keep ffprobe's rational numerators as
/// strings; they are only ever rendered back into encoder parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HdrMetadata {
    pub flags: HdrFlags,
    pub red_x: String,
    pub red_y: String,
    pub green_x: String,
    pub green_y: String,
    pub blue_x: String,
    pub blue_y: String,
    pub white_point_x: String,
    pub white_point_y: String,
    pub min_luminance: String,
    pub max_luminance: String,
    /// Content light level as "max_content,max_average".
    pub max_cll: String,
    /// Sidecar metadata files produced by the extraction step.
    pub sidecars: BTreeMap<DynamicHdrFormat, PathBuf>,
}

/// The single video track selected for encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoTrack {
    /// Codec name (e.g., "hevc", "h264").
    pub codec: String,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Source pixel format (e.g., "yuv420p10le").
    pub pixel_format: String,
    /// Color space, defaulting to bt709 when unreported.
    pub color_space: String,
    /// Color primaries, defaulting to bt709 when unreported.
    pub color_primaries: String,
    /// Color transfer characteristics, defaulting to bt709 when unreported.
    pub color_transfer: String,
    /// Chroma siting, when reported.
    pub chroma_location: Option<ChromaLocation>,
    /// Average frames per second.
    pub frame_rate: f64,
    /// Scan classification, filled in by the scan-type step.
    #[serde(default)]
    pub scan_type: VideoScanType,
    /// Active picture rectangle "W:H:X:Y", filled in by the crop step.
    #[serde(default)]
    pub crop: Option<String>,
    /// HDR metadata, when the source is HDR.
    pub hdr: Option<HdrMetadata>,
}

impl VideoTrack {
    /// Total pixel count, used for encoder selection.
    pub fn resolution_pixels(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

/// One audio track of the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioTrack {
    /// Zero-based index among the source's audio streams.
    pub index: usize,
    /// Codec name; for DTS streams the profile ("DTS-HD MA" etc.) when set.
    pub codec: String,
    /// Channel count.
    pub channels: u32,
    /// Channel layout description.
    pub channel_layout: String,
    /// Language tag, "und" when unreported.
    pub language: String,
    /// Track title, when tagged.
    pub title: Option<String>,
    /// Whether this is a commentary track.
    pub commentary: bool,
}

/// One subtitle track of the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtitleTrack {
    /// Zero-based index among the source's subtitle streams.
    pub index: usize,
    /// Language tag, "und" when unreported.
    pub language: String,
    /// Track title, when tagged.
    pub title: Option<String>,
    /// Whether the track is flagged forced.
    pub forced: bool,
}

/// Parsed description of everything the encoder needs to know about a
/// source file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamTopology {
    /// Container duration in seconds.
    pub duration_secs: f64,
    /// Estimated total frame count (duration times frame rate).
    pub frame_count: u64,
    /// Container title tag, when present.
    pub title: Option<String>,
    /// The video track.
    pub video: VideoTrack,
    /// All audio tracks, in stream order.
    pub audio: Vec<AudioTrack>,
    /// All subtitle tracks, in stream order.
    pub subtitles: Vec<SubtitleTrack>,
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub frames: Option<Vec<Frame>>,
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub index: Option<u32>,
        pub codec_type: Option<String>,
        pub codec_name: Option<String>,
        pub profile: Option<String>,
        pub width: Option<u32>,
        pub height: Option<u32>,
        pub channels: Option<u32>,
        pub channel_layout: Option<String>,
        pub r_frame_rate: Option<String>,
        pub avg_frame_rate: Option<String>,
        pub tags: Option<Tags>,
        pub disposition: Option<Disposition>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Tags {
        pub language: Option<String>,
        pub title: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Disposition {
        pub comment: Option<u8>,
        pub forced: Option<u8>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Frame {
        pub media_type: Option<String>,
        pub pix_fmt: Option<String>,
        pub color_space: Option<String>,
        pub color_primaries: Option<String>,
        pub color_transfer: Option<String>,
        pub chroma_location: Option<String>,
        pub side_data_list: Option<Vec<SideData>>,
    }

    #[derive(Debug, Deserialize)]
    pub struct SideData {
        pub side_data_type: Option<String>,
        pub red_x: Option<String>,
        pub red_y: Option<String>,
        pub green_x: Option<String>,
        pub green_y: Option<String>,
        pub blue_x: Option<String>,
        pub blue_y: Option<String>,
        pub white_point_x: Option<String>,
        pub white_point_y: Option<String>,
        pub min_luminance: Option<String>,
        pub max_luminance: Option<String>,
        pub max_content: Option<u32>,
        pub max_average: Option<u32>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub duration: Option<String>,
        pub tags: Option<FormatTags>,
    }

    #[derive(Debug, Deserialize)]
    pub struct FormatTags {
        pub title: Option<String>,
    }
}

/// Probes a source file with ffprobe.
///
/// Runs `ffprobe -v quiet -read_intervals %+#2 -print_format json
/// -show_format -show_streams -show_entries frame <path>` and parses the
/// JSON output. The two-frame read interval is enough to surface the video
/// frame side-data without decoding the title.
pub fn probe_source(ffprobe_path: &Path, source: &Path) -> Result<StreamTopology, ProbeError> {
    let output = Command::new(ffprobe_path)
        .args([
            "-v",
            "quiet",
            "-read_intervals",
            "%+#2",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
            "-show_entries",
            "frame",
        ])
        .arg(source)
        .output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ProbeError::FfprobeFailed(format!(
            "ffprobe exited with status {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_probe_output(&stdout)
}

/// Parses ffprobe JSON output into a StreamTopology.
pub fn parse_probe_output(json_str: &str) -> Result<StreamTopology, ProbeError> {
    let ffprobe: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::ParseError(e.to_string()))?;

    let streams = ffprobe.streams.unwrap_or_default();
    let format = ffprobe.format.ok_or_else(|| {
        ProbeError::ParseError("Missing format information in ffprobe output".to_string())
    })?;

    let duration_secs = format
        .duration
        .as_ref()
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0);

    let title = format
        .tags
        .as_ref()
        .and_then(|t| t.title.clone())
        .filter(|t| !t.trim().is_empty());

    let mut video: Option<VideoTrack> = None;
    let mut frame_count = 0u64;
    let mut audio = Vec::new();
    let mut subtitles = Vec::new();

    for stream in &streams {
        let codec_type = stream.codec_type.as_deref().unwrap_or("");

        match codec_type {
            // Only the first video stream is encoded
            "video" if video.is_none() => {
                let frame_rate = parse_frame_rate(stream);
                frame_count = (frame_rate * duration_secs) as u64;

                video = Some(VideoTrack {
                    codec: stream.codec_name.clone().unwrap_or_default(),
                    width: stream.width.unwrap_or(0),
                    height: stream.height.unwrap_or(0),
                    pixel_format: String::new(),
                    color_space: "bt709".to_string(),
                    color_primaries: "bt709".to_string(),
                    color_transfer: "bt709".to_string(),
                    chroma_location: None,
                    frame_rate,
                    scan_type: VideoScanType::Undetermined,
                    crop: None,
                    hdr: None,
                });
            }
            "audio" => {
                let codec_name = stream.codec_name.clone().unwrap_or_default();
                if codec_name.trim().is_empty() {
                    return Err(ProbeError::MissingAudioCodec(stream.index.unwrap_or(0)));
                }

                // DTS variants only show up in the profile field
                let codec = if codec_name == "dts" {
                    match stream.profile.as_deref() {
                        Some(profile) if !profile.trim().is_empty() => profile.to_string(),
                        _ => codec_name,
                    }
                } else {
                    codec_name
                };

                let track_title = stream.tags.as_ref().and_then(|t| t.title.clone());
                let commentary = stream
                    .disposition
                    .as_ref()
                    .and_then(|d| d.comment)
                    .unwrap_or(0)
                    == 1
                    || track_title
                        .as_deref()
                        .map(|t| t.contains("Commentary"))
                        .unwrap_or(false);

                let channels = stream.channels.unwrap_or(0);
                let channel_layout = match stream.channel_layout.as_deref() {
                    Some(layout) if !layout.trim().is_empty() => layout.to_string(),
                    _ => match track_title.as_deref() {
                        Some(t) if !t.trim().is_empty() => t.to_string(),
                        _ => format!("{}-channel(s)", channels),
                    },
                };

                audio.push(AudioTrack {
                    index: audio.len(),
                    codec,
                    channels,
                    channel_layout,
                    language: stream_language(stream),
                    title: track_title,
                    commentary,
                });
            }
            "subtitle" => {
                subtitles.push(SubtitleTrack {
                    index: subtitles.len(),
                    language: stream_language(stream),
                    title: stream.tags.as_ref().and_then(|t| t.title.clone()),
                    forced: stream
                        .disposition
                        .as_ref()
                        .and_then(|d| d.forced)
                        .unwrap_or(0)
                        == 1,
                });
            }
            _ => {}
        }
    }

    let mut video = video.ok_or(ProbeError::NoVideoStream)?;
    if audio.is_empty() {
        return Err(ProbeError::NoAudioStream);
    }

    // Frame-level detail: pixel format, color characteristics, HDR side-data
    for frame in ffprobe.frames.unwrap_or_default() {
        if frame.media_type.as_deref() != Some("video") {
            continue;
        }

        video.pixel_format = match frame.pix_fmt.as_deref() {
            Some(fmt) if !fmt.trim().is_empty() => fmt.to_string(),
            _ => return Err(ProbeError::MissingPixelFormat),
        };
        if let Some(space) = non_empty(&frame.color_space) {
            video.color_space = space;
        }
        if let Some(primaries) = non_empty(&frame.color_primaries) {
            video.color_primaries = primaries;
        }
        if let Some(transfer) = non_empty(&frame.color_transfer) {
            video.color_transfer = transfer;
        }
        video.chroma_location = frame
            .chroma_location
            .as_deref()
            .and_then(ChromaLocation::parse);

        if let Some(side_data) = &frame.side_data_list {
            video.hdr = parse_hdr_side_data(side_data)?;
        }
    }

    Ok(StreamTopology {
        duration_secs,
        frame_count,
        title,
        video,
        audio,
        subtitles,
    })
}

fn stream_language(stream: &ffprobe_json::Stream) -> String {
    stream
        .tags
        .as_ref()
        .and_then(|t| t.language.clone())
        .filter(|l| !l.trim().is_empty())
        .unwrap_or_else(|| "und".to_string())
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .filter(|v| !v.trim().is_empty())
        .map(|v| v.to_string())
}

fn parse_frame_rate(stream: &ffprobe_json::Stream) -> f64 {
    let rate_str = match stream.r_frame_rate.as_deref() {
        Some(r) if !r.trim().is_empty() => r,
        _ => stream.avg_frame_rate.as_deref().unwrap_or(""),
    };

    let mut parts = rate_str.split('/');
    let numerator = parts.next().and_then(|n| n.parse::<f64>().ok());
    let denominator = parts.next().and_then(|d| d.parse::<f64>().ok());
    match (numerator, denominator) {
        (Some(n), Some(d)) if d != 0.0 => n / d,
        _ => 0.0,
    }
}

/// Extracts HDR metadata from a video frame's side-data list.
///
/// Returns `Ok(None)` when no mastering display metadata is present; the
/// source is then treated as SDR regardless of any other side-data.
fn parse_hdr_side_data(
    side_data: &[ffprobe_json::SideData],
) -> Result<Option<HdrMetadata>, ProbeError> {
    let mastering = side_data
        .iter()
        .find(|sd| sd.side_data_type.as_deref() == Some("Mastering display metadata"));

    let mastering = match mastering {
        Some(m) => m,
        None => return Ok(None),
    };

    let mut flags = HdrFlags {
        hdr10: true,
        ..HdrFlags::default()
    };

    for sd in side_data {
        let sd_type = sd.side_data_type.as_deref().unwrap_or("");
        if sd_type.contains("Dolby Vision") {
            flags.dolby_vision = true;
        }
        if sd_type.contains("HDR Dynamic Metadata") || sd_type.contains("HDR10+") {
            flags.hdr10plus = true;
        }
    }

    let light_level = side_data
        .iter()
        .find(|sd| sd.side_data_type.as_deref() == Some("Content light level metadata"));
    let max_cll = format!(
        "{},{}",
        light_level.and_then(|sd| sd.max_content).unwrap_or(0),
        light_level.and_then(|sd| sd.max_average).unwrap_or(0)
    );

    Ok(Some(HdrMetadata {
        flags,
        red_x: rational_numerator(&mastering.red_x)?,
        red_y: rational_numerator(&mastering.red_y)?,
        green_x: rational_numerator(&mastering.green_x)?,
        green_y: rational_numerator(&mastering.green_y)?,
        blue_x: rational_numerator(&mastering.blue_x)?,
        blue_y: rational_numerator(&mastering.blue_y)?,
        white_point_x: rational_numerator(&mastering.white_point_x)?,
        white_point_y: rational_numerator(&mastering.white_point_y)?,
        min_luminance: rational_numerator(&mastering.min_luminance)?,
        max_luminance: rational_numerator(&mastering.max_luminance)?,
        max_cll,
        sidecars: BTreeMap::new(),
    }))
}

/// Takes the numerator of a rational string like "35400/50000".
fn rational_numerator(value: &Option<String>) -> Result<String, ProbeError> {
    match value.as_deref() {
        Some(v) if !v.trim().is_empty() => {
            Ok(v.split('/').next().unwrap_or_default().to_string())
        }
        _ => Err(ProbeError::InvalidHdrData),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// ffprobe output for an HDR10+Dolby Vision source with two audio
    /// tracks and one forced subtitle.
    const HDR_SAMPLE: &str = r#"{
        "frames": [
            {
                "media_type": "video",
                "stream_index": 0,
                "pix_fmt": "yuv420p10le",
                "color_space": "bt2020nc",
                "color_primaries": "bt2020",
                "color_transfer": "smpte2084",
                "chroma_location": "topleft",
                "side_data_list": [
                    { "side_data_type": "Dolby Vision RPU Data" },
                    {
                        "side_data_type": "Mastering display metadata",
                        "red_x": "35400/50000",
                        "red_y": "14600/50000",
                        "green_x": "8500/50000",
                        "green_y": "39850/50000",
                        "blue_x": "6550/50000",
                        "blue_y": "2300/50000",
                        "white_point_x": "15635/50000",
                        "white_point_y": "16450/50000",
                        "min_luminance": "50/10000",
                        "max_luminance": "10000000/10000"
                    },
                    {
                        "side_data_type": "Content light level metadata",
                        "max_content": 1600,
                        "max_average": 230
                    },
                    { "side_data_type": "HDR Dynamic Metadata SMPTE2094-40 (HDR10+)" }
                ]
            }
        ],
        "streams": [
            {
                "index": 0,
                "codec_type": "video",
                "codec_name": "hevc",
                "width": 3840,
                "height": 2160,
                "r_frame_rate": "24000/1001",
                "avg_frame_rate": "24000/1001",
                "disposition": { "default": 1, "comment": 0, "forced": 0 }
            },
            {
                "index": 1,
                "codec_type": "audio",
                "codec_name": "dts",
                "profile": "DTS-HD MA",
                "channels": 8,
                "channel_layout": "7.1",
                "tags": { "language": "eng", "title": "Surround 7.1" },
                "disposition": { "default": 1, "comment": 0, "forced": 0 }
            },
            {
                "index": 2,
                "codec_type": "audio",
                "codec_name": "ac3",
                "channels": 2,
                "tags": { "language": "eng", "title": "Director Commentary" },
                "disposition": { "default": 0, "comment": 0, "forced": 0 }
            },
            {
                "index": 3,
                "codec_type": "subtitle",
                "codec_name": "hdmv_pgs_subtitle",
                "tags": { "language": "eng" },
                "disposition": { "default": 0, "comment": 0, "forced": 1 }
            }
        ],
        "format": {
            "nb_streams": 4,
            "duration": "7200.500000",
            "tags": { "title": "Film Name" }
        }
    }"#;

    /// SDR 1080p source with one audio track and no frame side-data.
    const SDR_SAMPLE: &str = r#"{
        "frames": [
            {
                "media_type": "video",
                "stream_index": 0,
                "pix_fmt": "yuv420p"
            }
        ],
        "streams": [
            {
                "index": 0,
                "codec_type": "video",
                "codec_name": "h264",
                "width": 1920,
                "height": 1080,
                "r_frame_rate": "25/1"
            },
            {
                "index": 1,
                "codec_type": "audio",
                "codec_name": "aac",
                "channels": 2,
                "disposition": { "default": 1, "comment": 1, "forced": 0 }
            }
        ],
        "format": { "nb_streams": 2, "duration": "1800.000000" }
    }"#;

    #[test]
    fn test_parse_hdr_sample() {
        let topology = parse_probe_output(HDR_SAMPLE).expect("HDR sample should parse");

        assert_eq!(topology.title.as_deref(), Some("Film Name"));
        assert!((topology.duration_secs - 7200.5).abs() < 0.001);
        // 24000/1001 fps over 7200.5 seconds
        assert_eq!(topology.frame_count, 172639);

        let video = &topology.video;
        assert_eq!(video.codec, "hevc");
        assert_eq!(video.width, 3840);
        assert_eq!(video.height, 2160);
        assert_eq!(video.resolution_pixels(), 8_294_400);
        assert_eq!(video.pixel_format, "yuv420p10le");
        assert_eq!(video.color_space, "bt2020nc");
        assert_eq!(video.color_primaries, "bt2020");
        assert_eq!(video.color_transfer, "smpte2084");
        assert_eq!(video.chroma_location, Some(ChromaLocation::TopLeft));
        assert_eq!(video.scan_type, VideoScanType::Undetermined);

        let hdr = video.hdr.as_ref().expect("HDR metadata expected");
        assert!(hdr.flags.hdr10);
        assert!(hdr.flags.hdr10plus);
        assert!(hdr.flags.dolby_vision);
        assert!(hdr.flags.has_dynamic());
        assert_eq!(hdr.red_x, "35400");
        assert_eq!(hdr.green_y, "39850");
        assert_eq!(hdr.white_point_x, "15635");
        assert_eq!(hdr.min_luminance, "50");
        assert_eq!(hdr.max_luminance, "10000000");
        assert_eq!(hdr.max_cll, "1600,230");
        assert!(hdr.sidecars.is_empty());
    }

    #[test]
    fn test_parse_hdr_sample_audio_and_subtitles() {
        let topology = parse_probe_output(HDR_SAMPLE).expect("HDR sample should parse");

        assert_eq!(topology.audio.len(), 2);
        let main = &topology.audio[0];
        assert_eq!(main.index, 0);
        // DTS codec name is expanded from the profile field
        assert_eq!(main.codec, "DTS-HD MA");
        assert_eq!(main.channels, 8);
        assert_eq!(main.channel_layout, "7.1");
        assert_eq!(main.language, "eng");
        assert!(!main.commentary);

        let commentary = &topology.audio[1];
        assert_eq!(commentary.index, 1);
        assert_eq!(commentary.codec, "ac3");
        // Commentary detected from the title even without the disposition
        assert!(commentary.commentary);
        // Layout falls back to the title when unreported
        assert_eq!(commentary.channel_layout, "Director Commentary");

        assert_eq!(topology.subtitles.len(), 1);
        assert_eq!(topology.subtitles[0].index, 0);
        assert_eq!(topology.subtitles[0].language, "eng");
        assert!(topology.subtitles[0].forced);
    }

    #[test]
    fn test_parse_sdr_sample() {
        let topology = parse_probe_output(SDR_SAMPLE).expect("SDR sample should parse");

        assert!(topology.title.is_none());
        assert_eq!(topology.frame_count, 45000);
        assert_eq!(topology.video.pixel_format, "yuv420p");
        // Defaults applied when the frame reports no color data
        assert_eq!(topology.video.color_space, "bt709");
        assert_eq!(topology.video.color_primaries, "bt709");
        assert_eq!(topology.video.color_transfer, "bt709");
        assert!(topology.video.chroma_location.is_none());
        assert!(topology.video.hdr.is_none());

        // Commentary detected from the disposition flag alone
        assert!(topology.audio[0].commentary);
        // Language defaults to "und" when untagged
        assert_eq!(topology.audio[0].language, "und");
        // Layout falls back to the channel count when untagged
        assert_eq!(topology.audio[0].channel_layout, "2-channel(s)");
    }

    #[test]
    fn test_no_video_stream_is_error() {
        let json = r#"{
            "streams": [
                { "index": 0, "codec_type": "audio", "codec_name": "aac", "channels": 2 }
            ],
            "format": { "duration": "60.0" }
        }"#;
        assert!(matches!(
            parse_probe_output(json),
            Err(ProbeError::NoVideoStream)
        ));
    }

    #[test]
    fn test_no_audio_stream_is_error() {
        let json = r#"{
            "streams": [
                { "index": 0, "codec_type": "video", "codec_name": "h264", "width": 1280, "height": 720 }
            ],
            "format": { "duration": "60.0" }
        }"#;
        assert!(matches!(
            parse_probe_output(json),
            Err(ProbeError::NoAudioStream)
        ));
    }

    #[test]
    fn test_missing_audio_codec_is_error() {
        let json = r#"{
            "streams": [
                { "index": 0, "codec_type": "video", "codec_name": "h264", "width": 1280, "height": 720 },
                { "index": 1, "codec_type": "audio", "channels": 2 }
            ],
            "format": { "duration": "60.0" }
        }"#;
        assert!(matches!(
            parse_probe_output(json),
            Err(ProbeError::MissingAudioCodec(1))
        ));
    }

    #[test]
    fn test_missing_pixel_format_is_error() {
        let json = r#"{
            "frames": [ { "media_type": "video" } ],
            "streams": [
                { "index": 0, "codec_type": "video", "codec_name": "h264", "width": 1280, "height": 720 },
                { "index": 1, "codec_type": "audio", "codec_name": "aac", "channels": 2 }
            ],
            "format": { "duration": "60.0" }
        }"#;
        assert!(matches!(
            parse_probe_output(json),
            Err(ProbeError::MissingPixelFormat)
        ));
    }

    #[test]
    fn test_incomplete_mastering_display_is_error() {
        let json = r#"{
            "frames": [
                {
                    "media_type": "video",
                    "pix_fmt": "yuv420p10le",
                    "side_data_list": [
                        { "side_data_type": "Mastering display metadata", "red_x": "35400/50000" }
                    ]
                }
            ],
            "streams": [
                { "index": 0, "codec_type": "video", "codec_name": "hevc", "width": 3840, "height": 2160 },
                { "index": 1, "codec_type": "audio", "codec_name": "ac3", "channels": 6 }
            ],
            "format": { "duration": "60.0" }
        }"#;
        assert!(matches!(
            parse_probe_output(json),
            Err(ProbeError::InvalidHdrData)
        ));
    }

    #[test]
    fn test_invalid_json_is_parse_error() {
        assert!(matches!(
            parse_probe_output("{not json"),
            Err(ProbeError::ParseError(_))
        ));
    }

    #[test]
    fn test_chroma_location_codes() {
        assert_eq!(ChromaLocation::Left.code(), 0);
        assert_eq!(ChromaLocation::Center.code(), 1);
        assert_eq!(ChromaLocation::TopLeft.code(), 2);
        assert_eq!(ChromaLocation::Top.code(), 3);
        assert_eq!(ChromaLocation::BottomLeft.code(), 4);
        assert_eq!(ChromaLocation::Bottom.code(), 5);
        assert_eq!(ChromaLocation::parse("unknown"), None);
        assert_eq!(ChromaLocation::parse("TopLeft"), Some(ChromaLocation::TopLeft));
    }

    #[test]
    fn test_scan_type_codes() {
        assert_eq!(VideoScanType::InterlacedTff.code(), 0);
        assert_eq!(VideoScanType::InterlacedBff.code(), 1);
        assert_eq!(VideoScanType::Progressive.code(), 2);
        assert_eq!(VideoScanType::Undetermined.code(), 3);
        assert!(VideoScanType::InterlacedTff.is_interlaced());
        assert!(VideoScanType::InterlacedBff.is_interlaced());
        assert!(!VideoScanType::Progressive.is_interlaced());
        assert!(!VideoScanType::Undetermined.is_interlaced());
    }

    // Every audio stream in the input shows up in the topology, in order,
    // with sequential audio-relative indexes.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        #[test]
        fn prop_audio_indexes_are_sequential(count in 1usize..8) {
            let mut streams = String::from(
                r#"{ "index": 0, "codec_type": "video", "codec_name": "h264", "width": 1920, "height": 1080, "r_frame_rate": "24/1" }"#,
            );
            for i in 0..count {
                streams.push_str(&format!(
                    r#", {{ "index": {}, "codec_type": "audio", "codec_name": "ac3", "channels": 6, "tags": {{ "language": "eng" }} }}"#,
                    i + 1
                ));
            }
            let json = format!(
                r#"{{ "streams": [ {} ], "format": {{ "duration": "600.0" }} }}"#,
                streams
            );

            let topology = parse_probe_output(&json).expect("generated sample should parse");
            prop_assert_eq!(topology.audio.len(), count);
            for (expected, track) in topology.audio.iter().enumerate() {
                prop_assert_eq!(track.index, expected);
            }
        }
    }
}
