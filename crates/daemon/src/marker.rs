//! Crash-recovery marker file.
//!
//! Before spawning an encode, the in-flight output path(s) are recorded
//! in a marker file, one per line. A clean finish removes the marker; if
//! the daemon dies mid-encode, the next startup reads the leftover marker
//! and deletes the partial outputs it lists before scheduling resumes.

use std::io;
use std::path::{Path, PathBuf};

/// Marker file name inside the working directory.
pub const MARKER_FILE_NAME: &str = "auto-encode-daemon.tmp";

/// Full path of the marker file.
pub fn marker_path(temp_dir: &Path) -> PathBuf {
    temp_dir.join(MARKER_FILE_NAME)
}

/// Writes the marker with the given in-flight output paths, replacing
/// any previous marker.
pub fn write_marker(temp_dir: &Path, outputs: &[&Path]) -> io::Result<()> {
    let mut contents = String::new();
    for output in outputs {
        contents.push_str(&output.display().to_string());
        contents.push('\n');
    }
    std::fs::write(marker_path(temp_dir), contents)
}

/// Appends one more in-flight output to the marker. Used when the
/// dual-layer merge stage starts writing the final destination.
pub fn append_to_marker(temp_dir: &Path, output: &Path) -> io::Result<()> {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(marker_path(temp_dir))?;
    writeln!(file, "{}", output.display())
}

/// Removes the marker. Missing markers are fine.
pub fn clear_marker(temp_dir: &Path) -> io::Result<()> {
    match std::fs::remove_file(marker_path(temp_dir)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Deletes the partial outputs listed in a leftover marker, then the
/// marker itself.
///
/// # Returns
///
/// The paths that were actually deleted.
pub fn purge_orphaned_outputs(temp_dir: &Path) -> io::Result<Vec<PathBuf>> {
    let path = marker_path(temp_dir);
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut removed = Vec::new();
    for line in contents.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let orphan = PathBuf::from(line);
        match std::fs::remove_file(&orphan) {
            Ok(()) => {
                tracing::warn!(path = %orphan.display(), "deleted orphaned partial output");
                removed.push(orphan);
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::error!(path = %orphan.display(), error = %e, "failed to delete orphaned output");
            }
        }
    }

    std::fs::remove_file(&path)?;
    Ok(removed)
}
