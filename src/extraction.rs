//! Archive extraction for bundled assets and installer packages

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{Error, ExtractionError, Result};
use crate::source::AssetSource;

/// Extract a zip archive into `dest`, returning total bytes written
///
/// Entries whose names escape the destination directory are skipped, not
/// extracted. Directories are created as needed.
pub fn extract_zip(archive_path: &Path, dest: &Path) -> Result<u64> {
    debug!(archive = %archive_path.display(), dest = %dest.display(), "extracting archive");

    let file = std::fs::File::open(archive_path).map_err(|e| ExtractionError::OpenFailed {
        archive: archive_path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| ExtractionError::OpenFailed {
        archive: archive_path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let mut written = 0u64;
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index).map_err(|e| {
            Error::Extraction(ExtractionError::EntryFailed {
                archive: archive_path.to_path_buf(),
                entry: format!("#{index}"),
                reason: e.to_string(),
            })
        })?;

        let out_path = match entry.enclosed_name() {
            Some(path) => dest.join(path),
            None => {
                warn!(entry = entry.name(), "skipping entry with unsafe path");
                continue;
            }
        };

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = std::fs::File::create(&out_path)?;
        let copied = std::io::copy(&mut entry, &mut out).map_err(|e| {
            Error::Extraction(ExtractionError::EntryFailed {
                archive: archive_path.to_path_buf(),
                entry: entry.name().to_string(),
                reason: e.to_string(),
            })
        })?;
        written += copied;
    }

    debug!(
        archive = %archive_path.display(),
        bytes = written,
        "extraction complete"
    );
    Ok(written)
}

/// [`AssetSource`] backed by a zip archive on local storage
///
/// Used during Preprocess when the local manifest is missing or corrupt: the
/// bundled archive seeds the content directory before the diff runs. A
/// missing archive is not an error: extraction just writes nothing, and the
/// flow proceeds with an empty local baseline.
pub struct ZipAssetSource {
    archive_path: PathBuf,
}

impl ZipAssetSource {
    /// Create a source reading from the archive at `archive_path`
    pub fn new(archive_path: impl Into<PathBuf>) -> Self {
        Self {
            archive_path: archive_path.into(),
        }
    }
}

#[async_trait]
impl AssetSource for ZipAssetSource {
    async fn extract(&self, dest: &Path) -> Result<u64> {
        if !self.archive_path.exists() {
            debug!(
                archive = %self.archive_path.display(),
                "no bundled asset archive present, nothing to extract"
            );
            return Ok(0);
        }
        let archive_path = self.archive_path.clone();
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || extract_zip(&archive_path, &dest))
            .await
            .map_err(|e| Error::Other(format!("extraction task panicked: {e}")))?
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::FileOptions;

    fn build_zip(path: &Path, files: &[(&str, &[u8])]) {
        let file = std::fs::File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        for (name, contents) in files {
            writer
                .start_file(*name, FileOptions::default())
                .unwrap();
            writer.write_all(contents).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn extract_zip_writes_files_and_reports_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("assets.zip");
        build_zip(
            &archive,
            &[("manifest.json", b"{}"), ("data/level1.pak", b"abcdef")],
        );

        let dest = dir.path().join("content");
        std::fs::create_dir_all(&dest).unwrap();
        let written = extract_zip(&archive, &dest).unwrap();

        assert_eq!(written, 8, "2 + 6 bytes across both entries");
        assert_eq!(
            std::fs::read(dest.join("data/level1.pak")).unwrap(),
            b"abcdef"
        );
    }

    #[test]
    fn extract_zip_missing_archive_is_open_failed() {
        let dir = tempfile::tempdir().unwrap();
        let result = extract_zip(&dir.path().join("nope.zip"), dir.path());
        assert!(matches!(
            result,
            Err(Error::Extraction(ExtractionError::OpenFailed { .. }))
        ));
    }

    #[tokio::test]
    async fn asset_source_missing_archive_extracts_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let source = ZipAssetSource::new(dir.path().join("absent.zip"));
        let written = source.extract(dir.path()).await.unwrap();
        assert_eq!(written, 0, "missing bundled asset is not an error");
    }

    #[tokio::test]
    async fn asset_source_extracts_into_dest() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("bundle.zip");
        build_zip(&archive, &[("a.txt", b"hi")]);

        let dest = dir.path().join("out");
        std::fs::create_dir_all(&dest).unwrap();
        let written = ZipAssetSource::new(&archive).extract(&dest).await.unwrap();
        assert_eq!(written, 2);
        assert!(dest.join("a.txt").exists());
    }
}
