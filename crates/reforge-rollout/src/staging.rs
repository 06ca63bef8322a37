//! Artifact verification and extraction.
//!
//! Downloaded release archives are checked against their published SHA-256
//! (when there is one) and unpacked into a scratch directory. The live tree
//! is never touched here.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{StageError, StageResult};

/// Hex-encoded SHA-256 of a file's contents.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let bytes = fs::read(path)?;
    let hash = Sha256::digest(&bytes);
    Ok(hex::encode(hash))
}

/// Extract the digest from a `sha256sum`-style line (`<hex>  <file>`).
pub fn parse_checksum(text: &str) -> Option<String> {
    let token = text.split_whitespace().next()?;
    if token.len() == 64 && token.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(token.to_ascii_lowercase())
    } else {
        None
    }
}

pub fn verify_checksum(path: &Path, expected: &str) -> StageResult<()> {
    let actual = sha256_file(path).map_err(|e| StageError::io(path, e))?;
    if !actual.eq_ignore_ascii_case(expected) {
        return Err(StageError::ChecksumMismatch {
            expected: expected.to_ascii_lowercase(),
            actual,
        });
    }
    Ok(())
}

/// Unpack a zip archive into `into`. Returns the number of files written.
pub fn extract_zip(archive: &Path, into: &Path) -> StageResult<u64> {
    let file = fs::File::open(archive).map_err(|e| StageError::io(archive, e))?;
    let mut zip = zip::ZipArchive::new(file)?;
    fs::create_dir_all(into).map_err(|e| StageError::io(into, e))?;

    let mut written = 0;
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let relative = entry
            .enclosed_name()
            .map(Path::to_path_buf)
            .ok_or_else(|| StageError::UnsafePath(entry.name().to_string()))?;
        let target = into.join(&relative);

        if entry.is_dir() {
            fs::create_dir_all(&target).map_err(|e| StageError::io(&target, e))?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| StageError::io(parent, e))?;
        }
        let mut out = fs::File::create(&target).map_err(|e| StageError::io(&target, e))?;
        io::copy(&mut entry, &mut out).map_err(|e| StageError::io(&target, e))?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&target, fs::Permissions::from_mode(mode & 0o7777))
                .map_err(|e| StageError::io(&target, e))?;
        }
        written += 1;
    }
    debug!(archive = %archive.display(), files = written, "archive extracted");
    Ok(written)
}

/// The directory holding the release files. Archives that wrap everything
/// in one top-level directory are unwrapped.
pub fn staged_root(dir: &Path) -> StageResult<PathBuf> {
    let entries: Vec<_> = fs::read_dir(dir)
        .map_err(|e| StageError::io(dir, e))?
        .collect::<io::Result<_>>()
        .map_err(|e| StageError::io(dir, e))?;

    match entries.as_slice() {
        [] => Err(StageError::Empty),
        [only] if only.path().is_dir() => Ok(only.path()),
        _ => Ok(dir.to_path_buf()),
    }
}

/// Verify and unpack `archive` under `into`, returning the release root.
pub fn stage(archive: &Path, expected_sha256: Option<&str>, into: &Path) -> StageResult<PathBuf> {
    match expected_sha256 {
        Some(expected) => verify_checksum(archive, expected)?,
        None => debug!(archive = %archive.display(), "no published checksum, skipping verification"),
    }
    if extract_zip(archive, into)? == 0 {
        return Err(StageError::Empty);
    }
    staged_root(into)
}
