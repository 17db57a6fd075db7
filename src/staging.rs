use crate::error::{JobError, Result};
use crate::job::Mode;
use crate::util::{ensure_dir, sha256_hex};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use time::macros::format_description;
use tracing::debug;

/// Write an uploaded reference image under `staging_dir/<digest>/<name>`.
///
/// The directory is keyed by content, so the same upload always maps to the
/// same `--image-path`.
pub fn stage_reference_image(staging_dir: &Path, name: &str, bytes: &[u8]) -> Result<PathBuf> {
    let file_name = Path::new(name)
        .file_name()
        .ok_or_else(|| JobError::validation(format!("invalid reference image name: {name}")))?;

    let digest = sha256_hex(bytes);
    let dir = staging_dir.join(&digest[..16]);
    ensure_dir(&dir)?;

    let path = dir.join(file_name);
    if path.is_file() {
        debug!("reference image already staged: {}", path.display());
        return Ok(path);
    }
    std::fs::write(&path, bytes).map_err(|e| JobError::fs(&path, e))?;
    debug!("staged reference image {} ({} bytes)", path.display(), bytes.len());
    Ok(path)
}

/// Stage an image that already exists on disk (e.g. given on the command line).
pub fn stage_reference_file(staging_dir: &Path, source: &Path) -> Result<PathBuf> {
    let bytes = std::fs::read(source).map_err(|e| JobError::fs(source, e))?;
    let name = source
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            JobError::validation(format!("invalid reference image path: {}", source.display()))
        })?;
    stage_reference_image(staging_dir, name, &bytes)
}

/// `<mode>_<YYYYmmdd_HHMMSS>.png`, local time when the offset is known.
pub fn default_output_name(mode: Mode, at: OffsetDateTime) -> String {
    let stamp = at
        .format(format_description!(
            "[year][month][day]_[hour][minute][second]"
        ))
        .unwrap_or_else(|_| "00000000_000000".to_string());
    format!("{}_{}.png", mode.key(), stamp)
}

pub fn now_local() -> OffsetDateTime {
    OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
}
