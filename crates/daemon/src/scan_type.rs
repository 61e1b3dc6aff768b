//! Video scan-type detection.
//!
//! Runs ffmpeg's idet filter over the first 10000 frames of a source and
//! classifies the content as interlaced (top or bottom field first) or
//! progressive by summing the filter's frame detection counters.

use crate::probe::VideoScanType;
use std::path::Path;
use std::process::Command;
use thiserror::Error;

#[cfg(windows)]
const NULL_DEVICE: &str = "NUL";
#[cfg(not(windows))]
const NULL_DEVICE: &str = "/dev/null";

/// Number of leading characters of an idet summary line occupied by the
/// filter instance tag (e.g. `[Parsed_idet_0 @ 0x55d3a0f2bc00] `).
const DETECTION_LINE_PREFIX_LEN: usize = 34;

/// Error type for scan-type detection.
#[derive(Debug, Error)]
pub enum ScanTypeError {
    /// ffmpeg command failed to execute.
    #[error("ffmpeg idet run failed: {0}")]
    FfmpegFailed(String),

    /// Detection output could not be parsed.
    #[error("Failed to parse idet output: {0}")]
    ParseError(String),

    /// Undetermined frames dominated the detection counts.
    #[error("Unable to determine video scan type")]
    Undetermined,

    /// IO error during detection.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Determines the scan type of a source file.
///
/// Runs `ffmpeg -filter:v idet -frames:v 10000 -an -f rawvideo -y
/// <null> -i <path>` and classifies from the "frame detection" summary
/// lines on stderr.
pub fn detect_scan_type(ffmpeg_path: &Path, source: &Path) -> Result<VideoScanType, ScanTypeError> {
    let output = Command::new(ffmpeg_path)
        .args([
            "-filter:v",
            "idet",
            "-frames:v",
            "10000",
            "-an",
            "-f",
            "rawvideo",
            "-y",
            NULL_DEVICE,
            "-i",
        ])
        .arg(source)
        .output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ScanTypeError::FfmpegFailed(format!(
            "ffmpeg exited with status {}: {}",
            output.status,
            last_line(&stderr)
        )));
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let detections: Vec<&str> = stderr
        .lines()
        .filter(|line| line.contains("frame detection"))
        .collect();

    classify_frame_detections(&detections)
}

/// Classifies scan type from idet "frame detection" summary lines.
///
/// Each line carries four counters in the order TFF, BFF, progressive,
/// undetermined. Counters are summed across lines and the largest total
/// wins; ties go to the earlier column.
pub fn classify_frame_detections(lines: &[&str]) -> Result<VideoScanType, ScanTypeError> {
    if lines.is_empty() {
        return Err(ScanTypeError::ParseError(
            "No frame detection lines in idet output".to_string(),
        ));
    }

    let mut totals = [0u64; 4];
    for line in lines {
        let counts = detection_counts(line)?;
        for (total, count) in totals.iter_mut().zip(counts) {
            *total += count;
        }
    }

    let mut best_index = 0;
    for (index, total) in totals.iter().enumerate() {
        if *total > totals[best_index] {
            best_index = index;
        }
    }

    match best_index {
        0 => Ok(VideoScanType::InterlacedTff),
        1 => Ok(VideoScanType::InterlacedBff),
        2 => Ok(VideoScanType::Progressive),
        _ => Err(ScanTypeError::Undetermined),
    }
}

/// Pulls the four detection counters out of one summary line.
///
/// The filter instance tag prefix is dropped first so the pointer inside
/// it does not contribute digit runs.
fn detection_counts(line: &str) -> Result<[u64; 4], ScanTypeError> {
    if line.len() <= DETECTION_LINE_PREFIX_LEN {
        return Err(ScanTypeError::ParseError(format!(
            "Detection line too short: {line}"
        )));
    }
    let trimmed = &line[DETECTION_LINE_PREFIX_LEN..];

    let mut counts = [0u64; 4];
    let mut found = 0;
    let mut current = String::new();
    for ch in trimmed.chars().chain(std::iter::once(' ')) {
        if ch.is_ascii_digit() {
            current.push(ch);
        } else if !current.is_empty() {
            if found < 4 {
                counts[found] = current.parse().map_err(|_| {
                    ScanTypeError::ParseError(format!("Bad counter in detection line: {line}"))
                })?;
                found += 1;
            }
            current.clear();
        }
    }

    if found < 4 {
        return Err(ScanTypeError::ParseError(format!(
            "Expected 4 counters in detection line: {line}"
        )));
    }
    Ok(counts)
}

fn last_line(text: &str) -> String {
    text.lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("")
        .to_string()
}
