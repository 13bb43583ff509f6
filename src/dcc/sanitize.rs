//! # Download Path Validation
//!
//! Every inbound offer's filename passes through here before any socket is
//! opened. Sanitization strips directory components; validation then
//! confirms the saved path cannot land outside the configured download
//! directory, even through symlinks already present there.

use crate::config::DccConfig;
use crate::error::{CoreError, CoreResult};
use std::path::PathBuf;
use tracing::warn;

/// Longest accepted filename, in bytes.
const MAX_FILENAME_BYTES: usize = 255;

/// Reduce an offered filename to a safe basename.
///
/// Directory components are stripped (an offer for `../../etc/passwd`
/// becomes `passwd`); the remaining name must not be `.` or `..`, must not
/// contain control characters, and is clamped to 255 bytes.
pub fn sanitize_filename(original: &str) -> CoreResult<String> {
    let name = original
        .rsplit(&['/', '\\'][..])
        .next()
        .unwrap_or("")
        .trim();

    if name.is_empty() || name == "." || name == ".." {
        return Err(CoreError::DccSecurityViolation(format!(
            "unusable filename {original:?}"
        )));
    }
    if name.chars().any(|c| (c as u32) < 0x20) {
        return Err(CoreError::DccSecurityViolation(format!(
            "control characters in filename {original:?}"
        )));
    }

    let mut name = name.to_string();
    while name.len() > MAX_FILENAME_BYTES {
        // Pop whole chars until under the byte limit.
        name.pop();
    }
    Ok(name)
}

fn extension_blocked(name: &str, blocked: &[String]) -> bool {
    let lower = name.to_ascii_lowercase();
    blocked.iter().any(|ext| lower.ends_with(&ext.to_ascii_lowercase()))
}

/// Validate an inbound offer against DCC policy and return the path the
/// file will be written to, together with the sanitized display name.
///
/// The returned path is guaranteed to canonicalize to a location inside
/// `download_dir` (symlinks resolved); anything else is a
/// [`CoreError::DccSecurityViolation`] and the offer must be refused
/// without opening a socket.
pub fn validate_download_path(
    original_filename: &str,
    filesize: u64,
    config: &DccConfig,
) -> CoreResult<(PathBuf, String)> {
    let sanitized = sanitize_filename(original_filename)?;

    if extension_blocked(&sanitized, &config.blocked_extensions) {
        warn!("refusing blocked extension: {}", sanitized);
        return Err(CoreError::DccSecurityViolation(format!(
            "blocked file extension: {sanitized}"
        )));
    }
    if config.max_file_size > 0 && filesize > config.max_file_size {
        return Err(CoreError::DccOfferInvalid(format!(
            "file size {} exceeds limit {}",
            filesize, config.max_file_size
        )));
    }

    std::fs::create_dir_all(&config.download_dir)
        .map_err(|e| CoreError::DccInternal(format!("cannot create download dir: {e}")))?;
    let canonical_dir = std::fs::canonicalize(&config.download_dir)
        .map_err(|e| CoreError::DccInternal(format!("cannot resolve download dir: {e}")))?;

    let candidate = canonical_dir.join(&sanitized);

    // If the target already exists (resume, or a planted symlink), resolve
    // it fully and require it to stay inside the download directory.
    if candidate.exists() || candidate.symlink_metadata().is_ok() {
        let resolved = std::fs::canonicalize(&candidate).map_err(|e| {
            CoreError::DccSecurityViolation(format!("cannot resolve {sanitized:?}: {e}"))
        })?;
        if !resolved.starts_with(&canonical_dir) {
            warn!(
                "refusing {}: resolves outside download dir ({})",
                sanitized,
                resolved.display()
            );
            return Err(CoreError::DccSecurityViolation(format!(
                "{sanitized:?} resolves outside the download directory"
            )));
        }
    }

    Ok((candidate, sanitized))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_in(dir: &std::path::Path) -> DccConfig {
        DccConfig {
            download_dir: dir.to_path_buf(),
            ..Default::default()
        }
    }

    #[test]
    fn test_sanitize_strips_traversal() {
        assert_eq!(sanitize_filename("../../etc/passwd").unwrap(), "passwd");
        assert_eq!(sanitize_filename("C:\\temp\\evil.txt").unwrap(), "evil.txt");
        assert_eq!(sanitize_filename("plain.txt").unwrap(), "plain.txt");
    }

    #[test]
    fn test_sanitize_rejects_dots_and_controls() {
        assert!(sanitize_filename("..").is_err());
        assert!(sanitize_filename("dir/..").is_err());
        assert!(sanitize_filename("").is_err());
        assert!(sanitize_filename("bad\x07name").is_err());
    }

    #[test]
    fn test_sanitize_clamps_length() {
        let long = "x".repeat(300);
        let name = sanitize_filename(&long).unwrap();
        assert!(name.len() <= 255);
    }

    #[test]
    fn test_blocked_extension_refused() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let err = validate_download_path("malware.EXE", 10, &config).unwrap_err();
        assert!(matches!(err, CoreError::DccSecurityViolation(_)));
    }

    #[test]
    fn test_size_limit_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(dir.path());
        config.max_file_size = 100;
        let err = validate_download_path("big.bin", 200, &config).unwrap_err();
        assert!(matches!(err, CoreError::DccOfferInvalid(_)));
    }

    #[test]
    fn test_valid_offer_lands_inside_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let (path, name) = validate_download_path("../../etc/passwd", 10, &config).unwrap();
        assert_eq!(name, "passwd");
        assert!(path.starts_with(std::fs::canonicalize(dir.path()).unwrap()));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_refused() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let target = outside.path().join("target.bin");
        std::fs::write(&target, b"x").unwrap();
        std::os::unix::fs::symlink(&target, dir.path().join("link.bin")).unwrap();

        let config = config_in(dir.path());
        let err = validate_download_path("link.bin", 10, &config).unwrap_err();
        assert!(matches!(err, CoreError::DccSecurityViolation(_)));
    }
}
