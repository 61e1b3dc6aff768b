//! Encoder output parsing.
//!
//! ffmpeg reports progress on stderr as `frame= 1234 fps= 48 q=28.0 ...`
//! stat lines; the standalone x265 binary reports `1234 frames: 48.21
//! fps, 5400.12 kb/s` when fed through a pipe. Both are turned into a
//! percent / fps / ETA triple against the expected output frame count.

/// Progress ceiling for the dual-layer video stage. The remaining span
/// up to 100 belongs to the merge step.
pub(crate) const VIDEO_STAGE_PERCENT_CEILING: u8 = 90;

/// One parsed progress sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressUpdate {
    pub percent: u8,
    /// Encode rate, absent while the encoder still reports 0 fps.
    pub fps: Option<f64>,
    /// Seconds left at the reported rate.
    pub eta_secs: Option<u64>,
}

/// Parses one ffmpeg stat line.
///
/// Returns `None` for lines that are not stat lines (ffmpeg mixes
/// configuration and stream banners into the same pipe).
pub fn parse_ffmpeg_progress(line: &str, total_frames: u64) -> Option<ProgressUpdate> {
    let frames: u64 = slice_between(line, "frame=", "fps=")?.parse().ok()?;
    let fps = slice_between(line, "fps=", "q=")
        .and_then(|token| token.parse::<f64>().ok())
        .filter(|fps| *fps > 0.0);
    Some(sample(frames, fps, total_frames, 100))
}

/// Parses one x265 stat line from the dual-layer video stage.
///
/// x265 never sees the total frame count when reading from a pipe, so
/// its lines carry only an absolute frame counter; the percentage is
/// computed here and scaled onto the video stage's share of the bar.
pub fn parse_x265_progress(line: &str, total_frames: u64) -> Option<ProgressUpdate> {
    let idx = line.find("frames:")?;
    let frames: u64 = line[..idx].trim().parse().ok()?;
    let fps = slice_between(line, "frames:", "fps")
        .and_then(|token| token.parse::<f64>().ok())
        .filter(|fps| *fps > 0.0);
    Some(sample(frames, fps, total_frames, VIDEO_STAGE_PERCENT_CEILING))
}

fn sample(frames: u64, fps: Option<f64>, total_frames: u64, ceiling: u8) -> ProgressUpdate {
    let percent = if total_frames == 0 {
        0
    } else {
        let ratio = frames as f64 / total_frames as f64;
        ((ratio * f64::from(ceiling)).floor() as u64).min(u64::from(ceiling)) as u8
    };
    let remaining = total_frames.saturating_sub(frames);
    let eta_secs = fps.map(|fps| (remaining as f64 / fps) as u64);
    ProgressUpdate { percent, fps, eta_secs }
}

/// The trimmed text between two tags, when both are present in order.
fn slice_between<'a>(line: &'a str, start_tag: &str, end_tag: &str) -> Option<&'a str> {
    let start = line.find(start_tag)? + start_tag.len();
    let end = start + line[start..].find(end_tag)?;
    Some(line[start..end].trim())
}
