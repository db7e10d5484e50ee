//! CBZ generator
//!
//! Only `ComicInfo.xml` is rewritten; page images are copied raw. Archives
//! without one get a freshly written `ComicInfo.xml` appended.

pub mod comic_info;

use std::path::Path;

use tokio_util::sync::CancellationToken;

use crate::error::DownloadResult;
use crate::library::{Book, File};

use super::archive::{self, RewritePlan};
use super::{check_cancelled, DownloadFormat, FormatGenerator};
use comic_info::{ComicInfo, ENTRY_NAME};

pub struct CbzGenerator;

impl FormatGenerator for CbzGenerator {
    fn format(&self) -> DownloadFormat {
        DownloadFormat::Cbz
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
        let existing = archive::find_entry(&mut archive, |name| name.eq_ignore_ascii_case(ENTRY_NAME))?;

        let mut info = match existing {
            Some(index) => ComicInfo::parse(&archive::read_entry(&mut archive, index)?)?,
            None => ComicInfo::empty(),
        };
        check_cancelled(cancel)?;
        info.apply(book, file)?;
        let bytes = info.to_bytes()?;

        tracing::debug!(
            file_id = file.id,
            existing = existing.is_some(),
            cover_page = ?file.cover_page,
            "Rewriting CBZ"
        );

        let mut plan = RewritePlan::new();
        match existing {
            Some(index) => plan.replace(index, bytes),
            None => plan.append(ENTRY_NAME, bytes),
        }
        archive::rewrite(&mut archive, out, plan, cancel)
    }
}
