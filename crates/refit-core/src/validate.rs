use std::io::Read;
use std::path::Path;

use thiserror::Error;

/// Bytes inspected for HTML markers.
const SNIFF_LEN: usize = 512;

const HTML_MARKERS: &[&[u8]] = &[b"<!doctype html", b"<html", b"<head", b"<body"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    EmptyZip,
    SpannedZip,
}

impl ArchiveKind {
    const SIGNATURES: [([u8; 4], ArchiveKind); 3] = [
        (*b"PK\x03\x04", ArchiveKind::Zip),
        (*b"PK\x05\x06", ArchiveKind::EmptyZip),
        (*b"PK\x07\x08", ArchiveKind::SpannedZip),
    ];

    /// Identify an archive by its first four bytes.
    #[must_use]
    pub fn from_signature(header: &[u8]) -> Option<Self> {
        let header: [u8; 4] = header.get(..4)?.try_into().ok()?;
        Self::SIGNATURES
            .iter()
            .find(|(signature, _)| *signature == header)
            .map(|(_, kind)| *kind)
    }
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("archive not found: {path}")]
    Missing { path: String },
    #[error("archive is empty: {path}")]
    Empty { path: String },
    #[error("downloaded file is an HTML page, not an archive")]
    Html,
    #[error("unrecognized archive signature {found:02x?}")]
    UnknownSignature { found: Vec<u8> },
    #[error("failed to read archive {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Whether a destination path names an archive by its extension.
#[must_use]
pub fn is_archive_path(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("zip"))
}

/// Whether the leading bytes of a payload look like an HTML document.
#[must_use]
pub fn looks_like_html(bytes: &[u8]) -> bool {
    let window = &bytes[..bytes.len().min(SNIFF_LEN)];
    let lowered = window.to_ascii_lowercase();
    HTML_MARKERS
        .iter()
        .any(|marker| lowered.windows(marker.len()).any(|chunk| chunk == *marker))
}

/// Confirm that a file on disk is an archive before it is handed to the
/// decoder.
///
/// The HTML check runs independently of the signature check so an error page
/// is reported as such even if it happens to start with archive-like bytes.
///
/// # Errors
/// Returns an error when the file is missing, empty, unreadable, looks like
/// HTML, or does not start with a known archive signature.
pub fn validate(path: &Path) -> Result<ArchiveKind, ValidationError> {
    let display = path.display().to_string();
    let metadata = match std::fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            return Err(ValidationError::Missing { path: display });
        }
        Err(source) => {
            return Err(ValidationError::Io {
                path: display,
                source,
            });
        }
    };
    if metadata.len() == 0 {
        return Err(ValidationError::Empty { path: display });
    }

    let mut head = Vec::with_capacity(SNIFF_LEN);
    std::fs::File::open(path)
        .and_then(|file| file.take(SNIFF_LEN as u64).read_to_end(&mut head))
        .map_err(|source| ValidationError::Io {
            path: display,
            source,
        })?;

    if looks_like_html(&head) {
        return Err(ValidationError::Html);
    }

    ArchiveKind::from_signature(&head).ok_or_else(|| ValidationError::UnknownSignature {
        found: head.iter().take(4).copied().collect(),
    })
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::{ArchiveKind, ValidationError, is_archive_path, looks_like_html, validate};

    #[test]
    fn validate_accepts_zip_signature() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let path = temp.path().join("update.zip");
        std::fs::write(&path, b"PK\x03\x04rest-of-archive").expect("archive should be written");

        assert_eq!(validate(&path).expect("zip should validate"), ArchiveKind::Zip);
    }

    #[test]
    fn validate_rejects_missing_and_empty_files() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let missing = temp.path().join("missing.zip");
        let empty = temp.path().join("empty.zip");
        std::fs::write(&empty, b"").expect("empty file should be written");

        assert!(matches!(
            validate(&missing),
            Err(ValidationError::Missing { .. })
        ));
        assert!(matches!(validate(&empty), Err(ValidationError::Empty { .. })));
    }

    #[test]
    fn validate_rejects_html_error_page() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let path = temp.path().join("update.zip");
        std::fs::write(
            &path,
            b"\n  <!DOCTYPE html><html><body>Quota exceeded</body></html>",
        )
        .expect("page should be written");

        assert!(matches!(validate(&path), Err(ValidationError::Html)));
    }

    #[test]
    fn validate_rejects_unknown_signature() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let path = temp.path().join("update.zip");
        std::fs::write(&path, b"\x7fELF\x02\x01").expect("file should be written");

        let error = validate(&path).expect_err("ELF file is not an archive");
        assert!(matches!(
            error,
            ValidationError::UnknownSignature { ref found } if found == b"\x7fELF"
        ));
    }

    #[test]
    fn validate_is_idempotent() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let good = temp.path().join("good.zip");
        let bad = temp.path().join("bad.zip");
        std::fs::write(&good, b"PK\x05\x06").expect("file should be written");
        std::fs::write(&bad, b"<html>").expect("file should be written");

        assert_eq!(
            validate(&good).expect("first run"),
            validate(&good).expect("second run")
        );
        assert_eq!(
            validate(&bad).expect_err("first run").to_string(),
            validate(&bad).expect_err("second run").to_string()
        );
    }

    #[test]
    fn archive_path_and_html_sniffing() {
        assert!(is_archive_path(Path::new("/tmp/app-1.2.0.ZIP")));
        assert!(!is_archive_path(Path::new("/tmp/notes.txt")));
        assert!(looks_like_html(b"<HTML lang=\"en\">"));
        assert!(!looks_like_html(b"PK\x03\x04"));
    }
}
