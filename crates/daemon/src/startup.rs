//! Startup checks.
//!
//! Resolves configured tool locations into concrete paths and verifies
//! the required binaries run before the daemon starts taking jobs.
//! ffmpeg and ffprobe are hard requirements; the dual-layer and
//! HDR-extraction tools degrade to warnings when absent.

use auto_encode_daemon_config::ToolsConfig;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("{tool} not available: {detail}")]
    ToolUnavailable { tool: &'static str, detail: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Resolved locations of every external tool the daemon invokes.
#[derive(Debug, Clone)]
pub struct ToolPaths {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    /// Standalone x265 binary for the dual-layer video stage.
    pub x265: Option<PathBuf>,
    pub mkvmerge: PathBuf,
    pub hdr10plus_extractor: Option<PathBuf>,
    pub dolby_vision_extractor: Option<PathBuf>,
}

impl ToolPaths {
    /// Resolves tool paths from configuration.
    ///
    /// An empty `ffmpeg_dir` means ffmpeg/ffprobe come from PATH; empty
    /// optional tool paths mean that tool is unset.
    pub fn from_config(tools: &ToolsConfig) -> Self {
        let (ffmpeg, ffprobe) = if tools.ffmpeg_dir.trim().is_empty() {
            (PathBuf::from("ffmpeg"), PathBuf::from("ffprobe"))
        } else {
            let dir = Path::new(&tools.ffmpeg_dir);
            (dir.join("ffmpeg"), dir.join("ffprobe"))
        };

        Self {
            ffmpeg,
            ffprobe,
            x265: optional_path(&tools.x265_path),
            mkvmerge: PathBuf::from(&tools.mkvmerge_path),
            hdr10plus_extractor: optional_path(&tools.hdr10plus_extractor_path),
            dolby_vision_extractor: optional_path(&tools.dolby_vision_extractor_path),
        }
    }
}

fn optional_path(value: &str) -> Option<PathBuf> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| PathBuf::from(trimmed))
}

/// Extracts the version token from a tool's `-version` banner.
///
/// ffmpeg-family tools print "<name> version <token> ..." on the first
/// line; the token may carry an `n` prefix or a git suffix, both kept
/// verbatim for logging.
pub fn parse_tool_version(output: &str, tool: &str) -> Option<String> {
    let needle = format!("{tool} version");
    let line = output
        .lines()
        .find(|line| line.to_lowercase().contains(&needle))?;
    let idx = line.to_lowercase().find(&needle)?;
    line[idx + needle.len()..]
        .split_whitespace()
        .next()
        .map(|token| token.to_string())
}

fn check_tool(path: &Path, tool: &'static str) -> Result<String, StartupError> {
    let output = Command::new(path)
        .arg("-version")
        .output()
        .map_err(|e| StartupError::ToolUnavailable {
            tool,
            detail: format!("'{}' failed to run: {}", path.display(), e),
        })?;

    if !output.status.success() {
        return Err(StartupError::ToolUnavailable {
            tool,
            detail: format!("'{}' exited with {}", path.display(), output.status),
        });
    }

    let banner = String::from_utf8_lossy(&output.stdout);
    Ok(parse_tool_version(&banner, tool).unwrap_or_else(|| "unknown".to_string()))
}

/// Logs a warning for each optional tool that is unset or points at a
/// missing file. The affected feature degrades instead of failing jobs.
pub fn warn_missing_optional_tools(tools: &ToolPaths) {
    match &tools.x265 {
        None => tracing::warn!("x265 path not configured, dual-layer encodes unavailable"),
        Some(path) if !path.exists() => {
            tracing::warn!(path = %path.display(), "configured x265 binary not found")
        }
        Some(_) => {}
    }
    match &tools.hdr10plus_extractor {
        None => tracing::warn!(
            "HDR10+ extractor not configured, HDR10+ sources fall back to static HDR10"
        ),
        Some(path) if !path.exists() => {
            tracing::warn!(path = %path.display(), "configured HDR10+ extractor not found")
        }
        Some(_) => {}
    }
    match &tools.dolby_vision_extractor {
        None => tracing::warn!(
            "Dolby Vision extractor not configured, DV sources fall back to static HDR10"
        ),
        Some(path) if !path.exists() => {
            tracing::warn!(path = %path.display(), "configured Dolby Vision extractor not found")
        }
        Some(_) => {}
    }
}

/// Run all startup checks
///
/// Verifies ffmpeg and ffprobe run, logs their versions, and warns
/// about any unset or missing optional tools.
pub fn run_startup_checks(tools: &ToolPaths) -> Result<(), StartupError> {
    let ffmpeg_version = check_tool(&tools.ffmpeg, "ffmpeg")?;
    tracing::info!(version = %ffmpeg_version, "ffmpeg available");

    let ffprobe_version = check_tool(&tools.ffprobe, "ffprobe")?;
    tracing::info!(version = %ffprobe_version, "ffprobe available");

    warn_missing_optional_tools(tools);
    Ok(())
}
