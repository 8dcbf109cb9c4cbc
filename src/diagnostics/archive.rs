//! In-place gzip compression of collected logs.

use std::io::Write;

use camino::Utf8Path;
use cap_std::{ambient_authority, fs_utf8::Dir};
use flate2::Compression;
use flate2::write::GzEncoder;

use super::DiagnosticsError;

/// Replaces every `*.log` file directly inside `directory` with a
/// gzip-compressed `*.log.gz`, returning how many files were compressed.
/// A missing directory compresses nothing.
///
/// # Errors
///
/// Returns [`DiagnosticsError::Io`] when a file cannot be read, written or
/// removed.
pub fn compress_logs(directory: &Utf8Path) -> Result<usize, DiagnosticsError> {
    let logs = super::list_logs(directory)?;
    if logs.is_empty() {
        return Ok(0);
    }
    let dir = Dir::open_ambient_dir(directory, ambient_authority())
        .map_err(|err| DiagnosticsError::io(directory, &err))?;

    for path in &logs {
        let Some(name) = path.file_name() else {
            continue;
        };
        let contents = dir
            .read(name)
            .map_err(|err| DiagnosticsError::io(path, &err))?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&contents)
            .map_err(|err| DiagnosticsError::io(path, &err))?;
        let compressed = encoder
            .finish()
            .map_err(|err| DiagnosticsError::io(path, &err))?;

        let target = format!("{name}.gz");
        dir.write(&target, compressed)
            .map_err(|err| DiagnosticsError::io(&directory.join(&target), &err))?;
        dir.remove_file(name)
            .map_err(|err| DiagnosticsError::io(path, &err))?;
    }
    tracing::debug!(directory = %directory, count = logs.len(), "compressed logs");
    Ok(logs.len())
}
