//! Crop detection.
//!
//! Samples a five minute window starting halfway through the source with
//! ffmpeg's cropdetect filter and picks the most frequently reported crop
//! rectangle. Sampling the middle of the title avoids studio logos and
//! letterboxed credits skewing the result.

use std::path::Path;
use std::process::Command;
use thiserror::Error;

/// Error type for crop detection.
#[derive(Debug, Error)]
pub enum CropError {
    /// ffmpeg command failed to execute.
    #[error("ffmpeg cropdetect run failed: {0}")]
    FfmpegFailed(String),

    /// No crop rectangle appeared in the detection output.
    #[error("No crop detected")]
    NoCropDetected,

    /// IO error during detection.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Determines the crop rectangle of a source file.
///
/// Runs `ffmpeg -ss <halfway> -t 00:05:00 -i <path> -vf cropdetect -f null -`
/// and returns the most frequent rectangle as "W:H:X:Y".
pub fn detect_crop(
    ffmpeg_path: &Path,
    source: &Path,
    duration_secs: f64,
) -> Result<String, CropError> {
    let halfway = seconds_to_timestamp((duration_secs / 2.0) as u64);

    let output = Command::new(ffmpeg_path)
        .args(["-ss", &halfway, "-t", "00:05:00", "-i"])
        .arg(source)
        .args(["-vf", "cropdetect", "-f", "null", "-"])
        .output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let last = stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("");
        return Err(CropError::FfmpegFailed(format!(
            "ffmpeg exited with status {}: {last}",
            output.status
        )));
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    most_frequent_crop(stderr.lines()).ok_or(CropError::NoCropDetected)
}

/// Picks the most frequently reported crop rectangle from cropdetect
/// output lines. Ties go to the rectangle seen first.
pub fn most_frequent_crop<'a>(lines: impl Iterator<Item = &'a str>) -> Option<String> {
    let mut counts: Vec<(String, usize)> = Vec::new();

    for line in lines {
        let rectangle = match line.find("crop=") {
            Some(pos) => line[pos + 5..].trim(),
            None => continue,
        };
        if rectangle.is_empty() {
            continue;
        }

        match counts.iter_mut().find(|(r, _)| r == rectangle) {
            Some((_, count)) => *count += 1,
            None => counts.push((rectangle.to_string(), 1)),
        }
    }

    counts
        .into_iter()
        .reduce(|best, candidate| if candidate.1 > best.1 { candidate } else { best })
        .map(|(rectangle, _)| rectangle)
}

/// Formats whole seconds as an "HH:MM:SS" seek timestamp.
fn seconds_to_timestamp(total_secs: u64) -> String {
    format!(
        "{:02}:{:02}:{:02}",
        total_secs / 3600,
        (total_secs % 3600) / 60,
        total_secs % 60
    )
}
