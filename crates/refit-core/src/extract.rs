use std::path::{Component, Path, PathBuf};

use log::{debug, warn};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionResult {
    pub extracted_root_path: PathBuf,
    pub entry_count: usize,
}

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("failed to open archive {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{context}: {source}")]
    Decode {
        context: &'static str,
        #[source]
        source: zip::result::ZipError,
    },
    #[error("archive contains no entries")]
    NoEntries,
    #[error("unsafe entry path: {entry}")]
    UnsafePath { entry: String },
    #[error("{context}: {source}")]
    Write {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl ExtractionError {
    fn decode(context: &'static str, source: zip::result::ZipError) -> Self {
        Self::Decode { context, source }
    }

    fn write_with_path(context: &'static str, path: &Path, source: &std::io::Error) -> Self {
        Self::Write {
            context,
            source: std::io::Error::new(source.kind(), format!("{}: {source}", path.display())),
        }
    }

    /// True only for the truncated-archive class (missing end-of-central-
    /// directory record, short reads), which a fresh attempt may cure.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        let Self::Decode { source, .. } = self else {
            return false;
        };
        if let zip::result::ZipError::Io(error) = source {
            return error.kind() == std::io::ErrorKind::UnexpectedEof;
        }
        let message = source.to_string().to_ascii_lowercase();
        [
            "eocd",
            "central directory end",
            "end of central directory",
            "unexpected eof",
            "failed to fill whole buffer",
        ]
        .iter()
        .any(|marker| message.contains(marker))
    }
}

/// Normalize an archive entry name into a relative path, rejecting absolute
/// paths, drive prefixes and any parent-traversal segment.
fn safe_relative_path(raw: &str) -> Option<PathBuf> {
    let unified = raw.replace('\\', "/");
    if unified.starts_with('/') || unified.as_bytes().get(1) == Some(&b':') {
        return None;
    }

    let mut relative = PathBuf::new();
    for component in Path::new(&unified).components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(relative)
}

/// Decode a ZIP archive into `target_dir`.
///
/// Every entry name is vetted before anything is written, so an archive with
/// a single unsafe entry leaves no output behind. Any later failure removes
/// the partially populated target directory.
///
/// # Errors
/// Returns an error when the archive cannot be opened or decoded, contains
/// no entries, contains an unsafe entry path, or an entry cannot be written.
pub fn extract(archive_path: &Path, target_dir: &Path) -> Result<ExtractionResult, ExtractionError> {
    let result = extract_inner(archive_path, target_dir);
    if let Err(error) = &result {
        warn!("Extraction failed, removing partial output: {error}");
        remove_partial(target_dir);
    }
    result
}

fn extract_inner(
    archive_path: &Path,
    target_dir: &Path,
) -> Result<ExtractionResult, ExtractionError> {
    let file = std::fs::File::open(archive_path).map_err(|source| ExtractionError::Open {
        path: archive_path.display().to_string(),
        source,
    })?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|error| ExtractionError::decode("failed to read zip archive", error))?;

    if archive.is_empty() {
        return Err(ExtractionError::NoEntries);
    }

    let mut plan = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let entry = archive
            .by_index_raw(i)
            .map_err(|error| ExtractionError::decode("failed to read zip entry", error))?;
        let name = entry.name().to_string();
        let Some(relative) = safe_relative_path(&name) else {
            return Err(ExtractionError::UnsafePath { entry: name });
        };
        plan.push((i, relative, entry.is_dir()));
    }

    std::fs::create_dir_all(target_dir).map_err(|error| {
        ExtractionError::write_with_path("failed to create extraction directory", target_dir, &error)
    })?;

    for (index, relative, is_dir) in &plan {
        let out_path = target_dir.join(relative);

        if *is_dir {
            std::fs::create_dir_all(&out_path).map_err(|error| {
                ExtractionError::write_with_path(
                    "failed to create extraction directory",
                    &out_path,
                    &error,
                )
            })?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent).map_err(|error| {
                ExtractionError::write_with_path(
                    "failed to create extraction parent directory",
                    parent,
                    &error,
                )
            })?;
        }
        let mut entry = archive
            .by_index(*index)
            .map_err(|error| ExtractionError::decode("failed to read zip entry", error))?;
        let mut outfile = std::fs::File::create(&out_path).map_err(|error| {
            ExtractionError::write_with_path("failed to create extracted file", &out_path, &error)
        })?;
        std::io::copy(&mut entry, &mut outfile).map_err(|error| {
            if error.kind() == std::io::ErrorKind::UnexpectedEof {
                ExtractionError::decode("truncated archive entry", zip::result::ZipError::Io(error))
            } else {
                ExtractionError::write_with_path(
                    "failed to extract archive entry",
                    &out_path,
                    &error,
                )
            }
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = entry.unix_mode() {
                let _ = std::fs::set_permissions(&out_path, std::fs::Permissions::from_mode(mode));
            }
        }
    }

    debug!(
        "Extracted {} entries to {}",
        plan.len(),
        target_dir.display()
    );
    Ok(ExtractionResult {
        extracted_root_path: target_dir.to_path_buf(),
        entry_count: plan.len(),
    })
}

/// Remove extraction output left behind by a failed attempt.
pub fn remove_partial(target_dir: &Path) {
    if target_dir.exists()
        && let Err(error) = std::fs::remove_dir_all(target_dir)
    {
        warn!(
            "Failed to remove partial extraction {}: {error}",
            target_dir.display()
        );
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;
    use std::path::{Path, PathBuf};

    use super::{ExtractionError, extract, safe_relative_path};

    fn write_zip(path: &Path, entries: &[(&str, &str)]) {
        let zip_file = std::fs::File::create(path).expect("zip file should be created");
        let mut writer = zip::ZipWriter::new(zip_file);
        let options = zip::write::SimpleFileOptions::default().unix_permissions(0o644);
        for (name, contents) in entries {
            if name.ends_with('/') {
                writer
                    .add_directory(*name, options)
                    .expect("directory entry should be written");
            } else {
                writer
                    .start_file(*name, options)
                    .expect("file entry should be started");
                writer
                    .write_all(contents.as_bytes())
                    .expect("file entry should be written");
            }
        }
        writer.finish().expect("zip archive should be finalized");
    }

    #[test]
    fn extract_expands_files_and_directories() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let zip_path = temp.path().join("update.zip");
        let extract_dir = temp.path().join("extract");
        write_zip(
            &zip_path,
            &[
                ("nested/", ""),
                ("nested/app.bin", "binary-content"),
                ("readme.txt", "hi"),
            ],
        );

        let result = extract(&zip_path, &extract_dir).expect("zip should extract");

        assert_eq!(result.entry_count, 3);
        assert_eq!(result.extracted_root_path, extract_dir);
        let extracted = std::fs::read(extract_dir.join("nested/app.bin"))
            .expect("extracted file should exist and be readable");
        assert_eq!(extracted, b"binary-content");
    }

    #[test]
    fn extract_aborts_on_parent_traversal_and_leaves_nothing() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let zip_path = temp.path().join("unsafe.zip");
        let extract_dir = temp.path().join("extract");
        write_zip(
            &zip_path,
            &[("good.txt", "fine"), ("../../evil.txt", "should not be extracted")],
        );

        let error = extract(&zip_path, &extract_dir).expect_err("unsafe archive should fail");

        assert!(matches!(
            error,
            ExtractionError::UnsafePath { ref entry } if entry == "../../evil.txt"
        ));
        assert!(error.to_string().starts_with("unsafe entry path"));
        assert!(!extract_dir.exists(), "target directory should be absent");
        assert!(!temp.path().join("evil.txt").exists());
    }

    #[test]
    fn extract_rejects_empty_archive() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let zip_path = temp.path().join("empty.zip");
        let extract_dir = temp.path().join("extract");
        write_zip(&zip_path, &[]);

        let error = extract(&zip_path, &extract_dir).expect_err("empty archive should fail");
        assert!(matches!(error, ExtractionError::NoEntries));
        assert!(!error.is_retryable());
    }

    #[test]
    fn truncated_archive_is_retryable_and_cleaned_up() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let zip_path = temp.path().join("truncated.zip");
        let extract_dir = temp.path().join("extract");
        let payload = "7".repeat(4096);
        write_zip(&zip_path, &[("payload.bin", payload.as_str())]);
        let bytes = std::fs::read(&zip_path).expect("archive should be readable");
        std::fs::write(&zip_path, &bytes[..bytes.len() / 2]).expect("archive should be truncated");

        let error = extract(&zip_path, &extract_dir).expect_err("truncated archive should fail");

        assert!(error.is_retryable(), "unexpected error class: {error}");
        assert!(!extract_dir.exists());
    }

    #[test]
    fn unsafe_error_is_not_retryable() {
        let error = ExtractionError::UnsafePath {
            entry: "/etc/passwd".to_string(),
        };
        assert!(!error.is_retryable());
    }

    #[test]
    fn safe_relative_path_normalizes_and_rejects() {
        assert_eq!(
            safe_relative_path("./bin\\tool.exe"),
            Some(PathBuf::from("bin/tool.exe"))
        );
        assert_eq!(safe_relative_path("a/../../b"), None);
        assert_eq!(safe_relative_path("/abs/path"), None);
        assert_eq!(safe_relative_path("C:/windows/system32"), None);
        assert_eq!(safe_relative_path("\\\\server\\share"), None);
    }
}
