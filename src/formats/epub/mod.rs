//! EPUB generator
//!
//! Rewrites the package document and, when the library has a different
//! cover, the embedded cover image. All other entries (including the
//! uncompressed `mimetype` entry at position 0) are copied raw.

pub mod opf;

use std::io::{self, Read, Seek};
use std::path::Path;

use quick_xml::events::Event;
use quick_xml::Reader;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use zip::ZipArchive;

use crate::error::{DownloadError, DownloadResult};
use crate::library::{Book, File};

use super::archive::{self, RewritePlan};
use super::{check_cancelled, read_cover, DownloadFormat, FormatGenerator};
use opf::CoverUpdate;

const CONTAINER_PATH: &str = "META-INF/container.xml";

pub struct EpubGenerator;

impl FormatGenerator for EpubGenerator {
    fn format(&self) -> DownloadFormat {
        DownloadFormat::Epub
    }

    fn rewrite(
        &self,
        cancel: &CancellationToken,
        source: &Path,
        out: &mut std::fs::File,
        book: &Book,
        file: &File,
    ) -> DownloadResult<()> {
        let mut archive = archive::open(source)?;

        let opf_path = locate_package(&mut archive)?;
        let opf_index = archive
            .index_for_name(&opf_path)
            .ok_or_else(|| DownloadError::MissingPackageDocument(opf_path.clone()))?;
        let opf_bytes = archive::read_entry(&mut archive, opf_index)?;
        let opf_xml = String::from_utf8(opf_bytes).map_err(|_| {
            DownloadError::MissingPackageDocument(format!("{} is not valid UTF-8", opf_path))
        })?;

        let info = opf::scan(&opf_xml)?;
        check_cancelled(cancel)?;

        let mut plan = RewritePlan::new();
        let cover_update = plan_cover(&mut archive, &mut plan, &opf_path, &info, file)?;

        let rewritten = opf::rewrite(&opf_xml, &info, book, cover_update.as_ref())?;
        plan.replace(opf_index, rewritten);

        tracing::debug!(
            file_id = file.id,
            package = %opf_path,
            version = %info.version,
            cover_replaced = cover_update.is_some(),
            "Rewriting EPUB"
        );

        archive::rewrite(&mut archive, out, plan, cancel)
    }
}

/// Path of the package document inside the archive
///
/// `META-INF/container.xml` names it; archives without a usable container
/// fall back to the first `.opf` entry.
fn locate_package<R: Read + Seek>(archive: &mut ZipArchive<R>) -> DownloadResult<String> {
    if let Some(bytes) = archive::read_named(archive, CONTAINER_PATH)? {
        match rootfile_path(&bytes) {
            Ok(Some(path)) if archive.index_for_name(&path).is_some() => return Ok(path),
            Ok(_) => tracing::warn!("container.xml does not name a package document in the archive"),
            Err(e) => tracing::warn!("Unreadable container.xml: {}", e),
        }
    }

    let fallback = archive::find_entry(archive, |name| name.to_ascii_lowercase().ends_with(".opf"))?;
    match fallback {
        Some(index) => Ok(archive.by_index_raw(index)?.name().to_string()),
        None => Err(DownloadError::MissingPackageDocument(
            "no package document in archive".to_string(),
        )),
    }
}

fn rootfile_path(container: &[u8]) -> DownloadResult<Option<String>> {
    let mut reader = Reader::from_reader(container);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"rootfile" => {
                for attr in e.attributes() {
                    let attr = attr?;
                    if attr.key.as_ref() == b"full-path" {
                        return Ok(Some(attr.unescape_value()?.into_owned()));
                    }
                }
            }
            Event::Eof => return Ok(None),
            _ => {}
        }
        buf.clear();
    }
}

/// Queue a cover replacement when the library cover differs from the
/// embedded one
///
/// Books whose package document declares no cover are left without one.
fn plan_cover<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    plan: &mut RewritePlan,
    opf_path: &str,
    info: &opf::PackageInfo,
    file: &File,
) -> DownloadResult<Option<CoverUpdate>> {
    let Some(item) = info.cover.as_ref() else {
        if file.cover.is_some() {
            tracing::debug!(file_id = file.id, "Package declares no cover; not embedding one");
        }
        return Ok(None);
    };
    let Some((cover_bytes, mime_type)) = read_cover(file) else {
        return Ok(None);
    };

    let entry_name = opf::resolve_href(opf_path, &item.href);
    let Some(index) = archive.index_for_name(&entry_name) else {
        tracing::warn!(
            file_id = file.id,
            href = %item.href,
            "Cover reference does not resolve to an archive entry; keeping package as-is"
        );
        return Ok(None);
    };

    let mut embedded = Sha256::new();
    io::copy(&mut archive.by_index(index)?, &mut embedded)?;
    if embedded.finalize() == Sha256::digest(&cover_bytes) {
        return Ok(None);
    }

    plan.replace(index, cover_bytes);
    Ok(Some(CoverUpdate {
        id: item.id.clone(),
        media_type: mime_type,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::fixtures;
    use crate::library::{CoverRef, FileType};
    use std::io::Cursor;
    use tempfile::TempDir;
    use zip::CompressionMethod;

    fn generate(source_bytes: &[u8], book: &Book, file: &mut File, dir: &TempDir) -> ZipArchive<Cursor<Vec<u8>>> {
        let source = dir.path().join("source.epub");
        std::fs::write(&source, source_bytes).unwrap();
        file.path = source.clone();
        let dest = dir.path().join("out.epub");
        EpubGenerator
            .generate(&CancellationToken::new(), &source, &dest, book, file)
            .unwrap();
        ZipArchive::new(Cursor::new(std::fs::read(&dest).unwrap())).unwrap()
    }

    fn package(archive: &mut ZipArchive<Cursor<Vec<u8>>>) -> String {
        String::from_utf8(archive::read_named(archive, "OEBPS/content.opf").unwrap().unwrap()).unwrap()
    }

    #[test]
    fn test_rewrites_metadata_and_copies_everything_else() {
        let dir = TempDir::new().unwrap();
        let source = fixtures::epub_bytes(fixtures::OPF_V3);
        let (book, mut file) = fixtures::snapshot(FileType::Epub, Path::new("unused"));

        let mut result = generate(&source, &book, &mut file, &dir);
        let opf = package(&mut result);
        assert!(opf.contains(">The Way of Kings</dc:title>"));
        assert!(!opf.contains("Old Title"));

        // mimetype first and stored
        let first = result.by_index_raw(0).unwrap();
        assert_eq!(first.name(), "mimetype");
        assert_eq!(first.compression(), CompressionMethod::Stored);
        drop(first);

        let mut original = ZipArchive::new(Cursor::new(source)).unwrap();
        for name in ["mimetype", "OEBPS/chapter1.xhtml", "OEBPS/images/cover.jpg"] {
            assert!(fixtures::raw_entries_equal(&mut original, &mut result, name), "{}", name);
        }
    }

    #[test]
    fn test_replaces_changed_cover() {
        let dir = TempDir::new().unwrap();
        let cover_path = dir.path().join("cover.png");
        std::fs::write(&cover_path, fixtures::PNG_COVER).unwrap();

        let (book, mut file) = fixtures::snapshot(FileType::Epub, Path::new("unused"));
        file.cover = Some(CoverRef {
            path: cover_path,
            mime_type: "image/png".to_string(),
            modified_at: None,
        });

        let mut result = generate(&fixtures::epub_bytes(fixtures::OPF_V3), &book, &mut file, &dir);
        assert_eq!(
            archive::read_named(&mut result, "OEBPS/images/cover.jpg").unwrap().unwrap(),
            fixtures::PNG_COVER
        );
        assert!(package(&mut result).contains(r#"media-type="image/png""#));
    }

    #[test]
    fn test_identical_cover_is_left_alone() {
        let dir = TempDir::new().unwrap();
        let cover_path = dir.path().join("cover.jpg");
        std::fs::write(&cover_path, fixtures::JPEG_COVER).unwrap();

        let (book, mut file) = fixtures::snapshot(FileType::Epub, Path::new("unused"));
        file.cover = Some(CoverRef {
            path: cover_path,
            mime_type: "image/jpeg".to_string(),
            modified_at: None,
        });

        let source = fixtures::epub_bytes(fixtures::OPF_V3);
        let mut result = generate(&source, &book, &mut file, &dir);
        let mut original = ZipArchive::new(Cursor::new(source)).unwrap();
        assert!(fixtures::raw_entries_equal(&mut original, &mut result, "OEBPS/images/cover.jpg"));
    }

    fn library_cover(dir: &TempDir, file: &mut File) {
        let cover_path = dir.path().join("cover.png");
        std::fs::write(&cover_path, fixtures::PNG_COVER).unwrap();
        file.cover = Some(CoverRef {
            path: cover_path,
            mime_type: "image/png".to_string(),
            modified_at: None,
        });
    }

    #[test]
    fn test_unresolvable_cover_href_keeps_package_cover() {
        let dir = TempDir::new().unwrap();
        let (book, mut file) = fixtures::snapshot(FileType::Epub, Path::new("unused"));
        library_cover(&dir, &mut file);

        let opf = fixtures::OPF_V3.replace(r#"href="images/cover.jpg""#, r#"href="images/missing.jpg""#);
        let source = fixtures::epub_bytes(&opf);
        let mut result = generate(&source, &book, &mut file, &dir);

        let mut original = ZipArchive::new(Cursor::new(source)).unwrap();
        assert!(fixtures::raw_entries_equal(&mut original, &mut result, "OEBPS/images/cover.jpg"));
        let package = package(&mut result);
        assert!(package.contains(">The Way of Kings</dc:title>"));
        assert!(package.contains(r#"media-type="image/jpeg""#));
        assert!(!package.contains("image/png"));
    }

    #[test]
    fn test_missing_library_cover_keeps_embedded_cover() {
        let dir = TempDir::new().unwrap();
        let (book, mut file) = fixtures::snapshot(FileType::Epub, Path::new("unused"));
        library_cover(&dir, &mut file);
        std::fs::remove_file(dir.path().join("cover.png")).unwrap();

        let source = fixtures::epub_bytes(fixtures::OPF_V3);
        let mut result = generate(&source, &book, &mut file, &dir);

        let mut original = ZipArchive::new(Cursor::new(source)).unwrap();
        assert!(fixtures::raw_entries_equal(&mut original, &mut result, "OEBPS/images/cover.jpg"));
        assert!(!package(&mut result).contains("image/png"));
    }

    #[test]
    fn test_falls_back_to_first_opf_without_container() {
        let source = fixtures::zip_bytes(&[
            ("mimetype", b"application/epub+zip".as_slice(), CompressionMethod::Stored),
            ("OEBPS/content.opf", fixtures::OPF_V2.as_bytes(), CompressionMethod::Deflated),
        ]);
        let mut archive = ZipArchive::new(Cursor::new(source)).unwrap();
        assert_eq!(locate_package(&mut archive).unwrap(), "OEBPS/content.opf");
    }

    #[test]
    fn test_missing_package_document() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("empty.epub");
        std::fs::write(
            &source,
            fixtures::zip_bytes(&[("mimetype", b"application/epub+zip".as_slice(), CompressionMethod::Stored)]),
        )
        .unwrap();
        let (book, file) = fixtures::snapshot(FileType::Epub, &source);
        let result = EpubGenerator.generate(
            &CancellationToken::new(),
            &source,
            &dir.path().join("out.epub"),
            &book,
            &file,
        );
        assert!(matches!(result, Err(DownloadError::MissingPackageDocument(_))));
    }
}
