//! Dynamic HDR metadata extraction.
//!
//! HDR10+ and Dolby Vision carry per-scene metadata inside the HEVC
//! bitstream. Encoding either format requires that metadata as a sidecar
//! file (hdr10plus_tool JSON, dovi_tool RPU), produced here by piping the
//! raw video bitstream through the configured extractor.

use crate::probe::DynamicHdrFormat;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

/// Error type for HDR metadata extraction.
#[derive(Debug, Error)]
pub enum HdrExtractError {
    /// The expected sidecar file was not created.
    #[error("Metadata sidecar was not created: {}", .0.display())]
    SidecarMissing(PathBuf),

    /// The sidecar file was created but is empty.
    #[error("Metadata sidecar was created but is empty: {}", .0.display())]
    SidecarEmpty(PathBuf),

    /// IO error during extraction.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Computes the sidecar path for a source and dynamic format.
///
/// Sidecars land in the working directory, named after the source stem
/// with apostrophes replaced by spaces so the path can be single-quoted
/// into shell pipelines and encoder parameters untouched.
pub fn sidecar_path(temp_dir: &Path, source: &Path, format: DynamicHdrFormat) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().replace('\'', " "))
        .unwrap_or_default();

    let file_name = match format {
        DynamicHdrFormat::Hdr10Plus => format!("{stem}.json"),
        DynamicHdrFormat::DolbyVision => format!("{stem}.RPU.bin"),
    };
    temp_dir.join(file_name)
}

/// Extracts dynamic HDR metadata from a source into its sidecar file.
///
/// # Arguments
///
/// * `ffmpeg_path` - Full path to the ffmpeg executable.
/// * `tool_path` - Full path to hdr10plus_tool or dovi_tool.
/// * `temp_dir` - Directory the sidecar is written into.
/// * `source` - Source file to extract from.
/// * `format` - Which dynamic format to extract.
///
/// # Returns
///
/// The sidecar path once it exists and is non-empty.
pub fn extract_metadata(
    ffmpeg_path: &Path,
    tool_path: &Path,
    temp_dir: &Path,
    source: &Path,
    format: DynamicHdrFormat,
) -> Result<PathBuf, HdrExtractError> {
    let sidecar = sidecar_path(temp_dir, source, format);

    let pipeline = shell_pipeline(ffmpeg_path, tool_path, source, &sidecar, format);
    let output = Command::new("sh").arg("-c").arg(&pipeline).output()?;

    // The pipe reports the extractor's status, which some tool versions
    // misreport. The sidecar checks below are what actually matter.
    if !output.status.success() {
        tracing::debug!(
            status = %output.status,
            format = %format,
            "extractor exited non-zero, checking sidecar anyway"
        );
    }

    validate_sidecar(sidecar)
}

/// Renders the ffmpeg-to-extractor shell pipeline.
pub fn shell_pipeline(
    ffmpeg_path: &Path,
    tool_path: &Path,
    source: &Path,
    sidecar: &Path,
    format: DynamicHdrFormat,
) -> String {
    let extractor = match format {
        DynamicHdrFormat::Hdr10Plus => format!(
            "'{}' extract -o '{}' -",
            tool_path.display(),
            sidecar.display()
        ),
        DynamicHdrFormat::DolbyVision => format!(
            "'{}' extract-rpu - -o '{}'",
            tool_path.display(),
            sidecar.display()
        ),
    };

    format!(
        "{} -nostdin -i '{}' -c:v copy -bsf:v hevc_mp4toannexb -f hevc - | {}",
        ffmpeg_path.display(),
        escape_single_quoted(&source.display().to_string()),
        extractor
    )
}

/// Escapes a value for inclusion inside single quotes in a shell command.
fn escape_single_quoted(value: &str) -> String {
    value.replace('\'', r"'\''")
}

fn validate_sidecar(sidecar: PathBuf) -> Result<PathBuf, HdrExtractError> {
    let metadata = match std::fs::metadata(&sidecar) {
        Ok(m) => m,
        Err(_) => return Err(HdrExtractError::SidecarMissing(sidecar)),
    };
    if metadata.len() == 0 {
        return Err(HdrExtractError::SidecarEmpty(sidecar));
    }
    Ok(sidecar)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn write_script(dir: &TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut permissions = std::fs::metadata(&path).unwrap().permissions();
        permissions.set_mode(0o755);
        std::fs::set_permissions(&path, permissions).unwrap();
        path
    }

    #[test]
    fn test_sidecar_path_hdr10plus() {
        let path = sidecar_path(
            Path::new("/tmp/work"),
            Path::new("/media/source/Movie Title.mkv"),
            DynamicHdrFormat::Hdr10Plus,
        );
        assert_eq!(path, PathBuf::from("/tmp/work/Movie Title.json"));
    }

    #[test]
    fn test_sidecar_path_dolby_vision() {
        let path = sidecar_path(
            Path::new("/tmp/work"),
            Path::new("/media/source/Movie Title.mkv"),
            DynamicHdrFormat::DolbyVision,
        );
        assert_eq!(path, PathBuf::from("/tmp/work/Movie Title.RPU.bin"));
    }

    #[test]
    fn test_sidecar_path_replaces_apostrophes() {
        let path = sidecar_path(
            Path::new("/tmp/work"),
            Path::new("/media/source/A Knight's Tale.mp4"),
            DynamicHdrFormat::DolbyVision,
        );
        assert_eq!(path, PathBuf::from("/tmp/work/A Knight s Tale.RPU.bin"));
    }

    #[test]
    fn test_shell_pipeline_hdr10plus() {
        let pipeline = shell_pipeline(
            Path::new("/usr/bin/ffmpeg"),
            Path::new("/opt/tools/hdr10plus_tool"),
            Path::new("/media/Movie.mp4"),
            Path::new("/tmp/Movie.json"),
            DynamicHdrFormat::Hdr10Plus,
        );
        assert_eq!(
            pipeline,
            "/usr/bin/ffmpeg -nostdin -i '/media/Movie.mp4' -c:v copy -bsf:v hevc_mp4toannexb -f hevc - | '/opt/tools/hdr10plus_tool' extract -o '/tmp/Movie.json' -"
        );
    }

    #[test]
    fn test_shell_pipeline_dolby_vision() {
        let pipeline = shell_pipeline(
            Path::new("/usr/bin/ffmpeg"),
            Path::new("/opt/tools/dovi_tool"),
            Path::new("/media/Movie.mp4"),
            Path::new("/tmp/Movie.RPU.bin"),
            DynamicHdrFormat::DolbyVision,
        );
        assert_eq!(
            pipeline,
            "/usr/bin/ffmpeg -nostdin -i '/media/Movie.mp4' -c:v copy -bsf:v hevc_mp4toannexb -f hevc - | '/opt/tools/dovi_tool' extract-rpu - -o '/tmp/Movie.RPU.bin'"
        );
    }

    #[test]
    fn test_shell_pipeline_escapes_source_apostrophes() {
        let pipeline = shell_pipeline(
            Path::new("ffmpeg"),
            Path::new("dovi_tool"),
            Path::new("/media/A Knight's Tale.mp4"),
            Path::new("/tmp/A Knight s Tale.RPU.bin"),
            DynamicHdrFormat::DolbyVision,
        );
        assert!(pipeline.contains(r"-i '/media/A Knight'\''s Tale.mp4'"));
    }

    #[test]
    fn test_extract_metadata_pipes_matroska_source_through_ffmpeg() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("Movie.mkv");
        std::fs::write(&source, b"src").unwrap();
        let sidecar = sidecar_path(dir.path(), &source, DynamicHdrFormat::DolbyVision);

        let ffmpeg_args = dir.path().join("ffmpeg_args");
        let ffmpeg = write_script(
            &dir,
            "ffmpeg",
            &format!("printf '%s ' \"$@\" > '{}'\nprintf 'hevc'", ffmpeg_args.display()),
        );
        let extractor_args = dir.path().join("extractor_args");
        let extractor = write_script(
            &dir,
            "dovi_tool",
            &format!(
                "printf '%s ' \"$@\" > '{}'\ncat > /dev/null\nprintf 'rpu' > '{}'",
                extractor_args.display(),
                sidecar.display()
            ),
        );

        let result = extract_metadata(
            &ffmpeg,
            &extractor,
            dir.path(),
            &source,
            DynamicHdrFormat::DolbyVision,
        )
        .unwrap();
        assert_eq!(result, sidecar);
        assert_eq!(std::fs::read_to_string(&sidecar).unwrap(), "rpu");

        // The bitstream is demuxed by ffmpeg and fed to the extractor on
        // stdin for every container, Matroska included
        let recorded = std::fs::read_to_string(&ffmpeg_args).unwrap();
        assert!(recorded.starts_with("-nostdin -i "));
        assert!(recorded.contains("-bsf:v hevc_mp4toannexb -f hevc -"));
        let recorded = std::fs::read_to_string(&extractor_args).unwrap();
        assert!(recorded.starts_with("extract-rpu - -o "));
    }

    #[test]
    fn test_validate_sidecar_accepts_non_empty_file() {
        let dir = TempDir::new().unwrap();
        let sidecar = dir.path().join("Movie.json");
        std::fs::write(&sidecar, b"{\"metadata\": []}").unwrap();

        let validated = validate_sidecar(sidecar.clone()).unwrap();
        assert_eq!(validated, sidecar);
    }

    #[test]
    fn test_validate_sidecar_rejects_empty_file() {
        let dir = TempDir::new().unwrap();
        let sidecar = dir.path().join("Movie.json");
        std::fs::write(&sidecar, b"").unwrap();

        assert!(matches!(
            validate_sidecar(sidecar),
            Err(HdrExtractError::SidecarEmpty(_))
        ));
    }

    #[test]
    fn test_validate_sidecar_rejects_missing_file() {
        let dir = TempDir::new().unwrap();
        let sidecar = dir.path().join("Movie.RPU.bin");

        assert!(matches!(
            validate_sidecar(sidecar),
            Err(HdrExtractError::SidecarMissing(_))
        ));
    }
}
