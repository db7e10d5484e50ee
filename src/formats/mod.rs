//! Format generators
//!
//! Each generator rewrites a source file into a copy that carries the
//! current library metadata, touching only the parts of the container that
//! hold that metadata.
//!
//! # Formats
//!
//! - `epub`: package document (OPF) and cover image inside the zip
//! - `cbz`: ComicInfo.xml inside the zip
//! - `m4b`: iTunes metadata atoms inside the MP4 box tree

pub mod archive;
pub mod cbz;
pub mod epub;
pub mod m4b;

#[cfg(test)]
pub(crate) mod fixtures;

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{DownloadError, DownloadResult};
use crate::library::{Book, File, FileType};
use crate::storage::AtomicFile;

/// Output formats the cache can generate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadFormat {
    Epub,
    M4b,
    Cbz,
}

impl DownloadFormat {
    pub const ALL: [DownloadFormat; 3] = [DownloadFormat::Epub, DownloadFormat::M4b, DownloadFormat::Cbz];

    /// Output file extension without the leading dot
    pub fn extension(&self) -> &'static str {
        match self {
            DownloadFormat::Epub => "epub",
            DownloadFormat::M4b => "m4b",
            DownloadFormat::Cbz => "cbz",
        }
    }

    /// The generated format for a stored file type, if there is one
    pub fn for_file_type(file_type: FileType) -> Option<Self> {
        match file_type {
            FileType::Epub => Some(DownloadFormat::Epub),
            FileType::M4b => Some(DownloadFormat::M4b),
            FileType::Cbz => Some(DownloadFormat::Cbz),
            FileType::Pdf => None,
        }
    }
}

impl fmt::Display for DownloadFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Rewrites a source container with updated metadata
///
/// Implementations are synchronous and run on the blocking pool. They write
/// into an already-open temporary file; `prepare` owns that file so no
/// implementation can leave a partial destination behind.
pub trait FormatGenerator: Send + Sync {
    fn format(&self) -> DownloadFormat;

    /// Write the rewritten container for `source` into `out`
    fn rewrite(
        &self,
        cancel: &CancellationToken,
        source: &Path,
        out: &mut std::fs::File,
        book: &Book,
        file: &File,
    ) -> DownloadResult<()>;

    /// Write the rewritten `source` into a temporary file next to `dest`
    ///
    /// Returns the synced file and its size; `dest` is not touched until the
    /// caller commits. Dropping the result removes the temporary file.
    fn prepare(
        &self,
        cancel: &CancellationToken,
        source: &Path,
        dest: &Path,
        book: &Book,
        file: &File,
    ) -> DownloadResult<(AtomicFile, u64)> {
        if !source.is_file() {
            return Err(DownloadError::SourceNotFound(source.display().to_string()));
        }
        let mut atomic = AtomicFile::create(dest)?;
        self.rewrite(cancel, source, atomic.file_mut()?, book, file)?;
        check_cancelled(cancel)?;
        let size = atomic.sync()?;
        Ok((atomic, size))
    }

    /// Generate `dest` from `source` and commit it straight away
    #[cfg(test)]
    fn generate(
        &self,
        cancel: &CancellationToken,
        source: &Path,
        dest: &Path,
        book: &Book,
        file: &File,
    ) -> DownloadResult<u64> {
        let (atomic, size) = self.prepare(cancel, source, dest, book, file)?;
        atomic.commit()?;
        Ok(size)
    }
}

/// Generator for `format`
pub fn generator_for(format: DownloadFormat) -> &'static dyn FormatGenerator {
    match format {
        DownloadFormat::Epub => &epub::EpubGenerator,
        DownloadFormat::M4b => &m4b::M4bGenerator,
        DownloadFormat::Cbz => &cbz::CbzGenerator,
    }
}

/// Bail out of a long-running rewrite once its request is gone
pub(crate) fn check_cancelled(cancel: &CancellationToken) -> DownloadResult<()> {
    if cancel.is_cancelled() {
        Err(DownloadError::Cancelled)
    } else {
        Ok(())
    }
}

/// Read an external cover image, treating a missing file as absent
pub(crate) fn read_cover(file: &File) -> Option<(Vec<u8>, String)> {
    let cover = file.cover.as_ref()?;
    match std::fs::read(&cover.path) {
        Ok(bytes) => {
            let mime = if cover.mime_type.is_empty() {
                mime_guess::from_path(&cover.path)
                    .first_or_octet_stream()
                    .essence_str()
                    .to_string()
            } else {
                cover.mime_type.clone()
            };
            Some((bytes, mime))
        }
        Err(e) => {
            tracing::warn!(
                file_id = file.id,
                cover = %cover.path.display(),
                "Cover image unavailable, keeping embedded cover: {}",
                e
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::fixtures;
    use crate::library::CoverRef;
    use tempfile::TempDir;

    #[test]
    fn test_format_for_file_type() {
        assert_eq!(DownloadFormat::for_file_type(FileType::Epub), Some(DownloadFormat::Epub));
        assert_eq!(DownloadFormat::for_file_type(FileType::Pdf), None);
        assert_eq!(DownloadFormat::Cbz.to_string(), "cbz");
    }

    #[test]
    fn test_generator_selection() {
        for format in DownloadFormat::ALL {
            assert_eq!(generator_for(format).format(), format);
        }
    }

    #[test]
    fn test_read_cover_treats_missing_file_as_absent() {
        let dir = TempDir::new().unwrap();
        let (_, mut file) = fixtures::snapshot(FileType::Epub, &dir.path().join("book.epub"));
        file.cover = Some(CoverRef {
            path: dir.path().join("gone.jpg"),
            mime_type: "image/jpeg".to_string(),
            modified_at: None,
        });
        assert!(read_cover(&file).is_none());

        let path = dir.path().join("cover.png");
        std::fs::write(&path, fixtures::PNG_COVER).unwrap();
        file.cover = Some(CoverRef {
            path,
            mime_type: String::new(),
            modified_at: None,
        });
        let (bytes, mime) = read_cover(&file).unwrap();
        assert_eq!(bytes, fixtures::PNG_COVER);
        assert_eq!(mime, "image/png");
    }

    #[test]
    fn test_failed_generation_keeps_previous_output() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("broken.epub");
        std::fs::write(&source, b"this is not a zip archive").unwrap();
        let dest = dir.path().join("out").join("1.epub");
        std::fs::create_dir_all(dest.parent().unwrap()).unwrap();
        std::fs::write(&dest, b"previous").unwrap();

        let (book, file) = fixtures::snapshot(FileType::Epub, &source);
        let result = generator_for(DownloadFormat::Epub).generate(
            &CancellationToken::new(),
            &source,
            &dest,
            &book,
            &file,
        );

        assert!(result.is_err());
        assert_eq!(std::fs::read(&dest).unwrap(), b"previous");
        let leftovers: Vec<_> = std::fs::read_dir(dest.parent().unwrap()).unwrap().collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn test_missing_source() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("missing.cbz");
        let (book, file) = fixtures::snapshot(FileType::Cbz, &source);
        let result = generator_for(DownloadFormat::Cbz).generate(
            &CancellationToken::new(),
            &source,
            &dir.path().join("1.cbz"),
            &book,
            &file,
        );
        assert!(matches!(result, Err(DownloadError::SourceNotFound(_))));
    }

    #[test]
    fn test_cancelled_generation_leaves_nothing_behind() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("book.epub");
        std::fs::write(&source, fixtures::epub_bytes(fixtures::OPF_V3)).unwrap();
        let dest = dir.path().join("out").join("1.epub");

        let cancel = CancellationToken::new();
        cancel.cancel();
        let (book, file) = fixtures::snapshot(FileType::Epub, &source);
        let result = generator_for(DownloadFormat::Epub).generate(&cancel, &source, &dest, &book, &file);

        assert!(matches!(result, Err(DownloadError::Cancelled)));
        assert!(!dest.exists());
        assert_eq!(std::fs::read_dir(dest.parent().unwrap()).unwrap().count(), 0);
    }
}
