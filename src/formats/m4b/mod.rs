//! M4B generator
//!
//! Top-level boxes are streamed from the source in order. The `moov` box is
//! parsed, its iTunes metadata list (`moov/udta/meta/ilst`) rewritten, and
//! every chunk offset that points past the old `moov` is shifted by the
//! change in its size so the audio data stays addressable.

pub mod atoms;

use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use tokio_util::sync::CancellationToken;

use crate::error::{DownloadError, DownloadResult};
use crate::library::{format_series_number, Book, File};

use super::{check_cancelled, read_cover, DownloadFormat, FormatGenerator};
use atoms::{Mp4Box, ALBUM, ARTIST, COMPOSER, COVER, DATA_JPEG, DATA_PNG, FREEFORM, NAME, NARRATOR};

const ITUNES_MEAN: &str = "com.apple.iTunes";
const SUBTITLE_NAME: &str = "SUBTITLE";

const COPY_CHUNK: usize = 1024 * 1024;

/// A box at the top level of the file
#[derive(Debug, Clone)]
struct TopLevelBox {
    kind: [u8; 4],
    offset: u64,
    size: u64,
    header_len: u64,
}

pub struct M4bGenerator;

impl FormatGenerator for M4bGenerator {
    fn format(&self) -> DownloadFormat {
        DownloadFormat::M4b
    }

    fn rewrite(
        &self,
        cancel: &CancellationToken,
        source: &Path,
        out: &mut fs::File,
        book: &Book,
        file: &File,
    ) -> DownloadResult<()> {
        let mut input = fs::File::open(source)?;
        let len = input.metadata()?.len();
        let boxes = scan_top_level(&mut input, len)?;

        if boxes.iter().any(|b| &b.kind == b"moof") {
            return Err(DownloadError::UnsupportedContainer(
                "fragmented MP4 (moof) is not supported".to_string(),
            ));
        }
        let mut moovs = boxes.iter().filter(|b| &b.kind == b"moov");
        let moov_box = match (moovs.next(), moovs.next()) {
            (Some(moov), None) => moov.clone(),
            (None, _) => return Err(DownloadError::MalformedContainer("no moov box".to_string())),
            (Some(_), Some(_)) => {
                return Err(DownloadError::MalformedContainer("more than one moov box".to_string()))
            }
        };

        let mut payload = vec![0u8; (moov_box.size - moov_box.header_len) as usize];
        input.seek(SeekFrom::Start(moov_box.offset + moov_box.header_len))?;
        input.read_exact(&mut payload)?;
        let mut moov = Mp4Box::parse(*b"moov", &payload, None, 0)?;
        drop(payload);
        check_cancelled(cancel)?;

        apply_metadata(&mut moov, book, file)?;

        let old_end = moov_box.offset + moov_box.size;
        let delta = moov.encoded_len() as i64 - moov_box.size as i64;
        if delta != 0 {
            let shifted = atoms::shift_chunk_offsets(&mut moov, old_end, delta)?;
            tracing::debug!(file_id = file.id, delta, shifted, "Shifted chunk offsets");
        }
        let moov_bytes = moov.to_bytes();

        for b in &boxes {
            check_cancelled(cancel)?;
            if &b.kind == b"moov" {
                out.write_all(&moov_bytes)?;
            } else {
                copy_range(&mut input, out, b.offset, b.size, cancel)?;
            }
        }
        out.flush()?;

        tracing::debug!(
            file_id = file.id,
            boxes = boxes.len(),
            moov_before = moov_box.size,
            moov_after = moov_bytes.len(),
            "Rewrote M4B"
        );
        Ok(())
    }
}

/// Read the headers of every top-level box
fn scan_top_level<R: Read + Seek>(input: &mut R, len: u64) -> DownloadResult<Vec<TopLevelBox>> {
    let mut boxes = Vec::new();
    let mut offset = 0u64;

    while offset < len {
        if len - offset < 8 {
            return Err(DownloadError::MalformedContainer(format!(
                "{} trailing bytes after last box",
                len - offset
            )));
        }
        input.seek(SeekFrom::Start(offset))?;
        let mut header = [0u8; 8];
        input.read_exact(&mut header)?;
        let size32 = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let kind = [header[4], header[5], header[6], header[7]];

        let (size, header_len) = match size32 {
            0 => (len - offset, 8),
            1 => {
                let mut large = [0u8; 8];
                input.read_exact(&mut large)?;
                (u64::from_be_bytes(large), 16)
            }
            n => (n as u64, 8),
        };
        if size < header_len || size > len - offset {
            return Err(DownloadError::MalformedContainer(format!(
                "top-level box '{}' at {} declares {} bytes",
                atoms::kind_str(&kind),
                offset,
                size
            )));
        }

        boxes.push(TopLevelBox {
            kind,
            offset,
            size,
            header_len,
        });
        offset += size;
    }

    if boxes.is_empty() {
        return Err(DownloadError::MalformedContainer("empty file".to_string()));
    }
    Ok(boxes)
}

/// Copy `size` bytes starting at `offset`, checking for cancellation
fn copy_range<R: Read + Seek, W: Write>(
    input: &mut R,
    out: &mut W,
    offset: u64,
    size: u64,
    cancel: &CancellationToken,
) -> DownloadResult<()> {
    input.seek(SeekFrom::Start(offset))?;
    let mut remaining = size;
    let mut buf = vec![0u8; COPY_CHUNK.min(size as usize)];
    while remaining > 0 {
        check_cancelled(cancel)?;
        let want = (remaining as usize).min(buf.len());
        input.read_exact(&mut buf[..want])?;
        out.write_all(&buf[..want])?;
        remaining -= want as u64;
    }
    Ok(())
}

fn cover_type_code(mime_type: &str) -> Option<u32> {
    match mime_type {
        "image/jpeg" | "image/jpg" => Some(DATA_JPEG),
        "image/png" => Some(DATA_PNG),
        _ => None,
    }
}

/// Rewrite `moov/udta/meta/ilst`, creating the path when missing
fn apply_metadata(moov: &mut Mp4Box, book: &Book, file: &File) -> DownloadResult<()> {
    let udta = moov.child_or_insert(*b"udta", || Mp4Box::container(*b"udta", Vec::new()))?;
    let meta = udta.child_or_insert(*b"meta", atoms::itunes_meta)?;
    let ilst = meta.child_or_insert(*b"ilst", || Mp4Box::container(*b"ilst", Vec::new()))?;
    let items = ilst
        .children_mut()
        .ok_or_else(|| DownloadError::MalformedContainer("'ilst' is not a container".to_string()))?;

    let cover = read_cover(file).and_then(|(bytes, mime)| match cover_type_code(&mime) {
        Some(code) => Some((bytes, code)),
        None => {
            tracing::warn!(file_id = file.id, mime = %mime, "Cover type cannot be embedded in M4B; skipping");
            None
        }
    });
    let cover = cover.filter(|(bytes, _)| {
        let embedded = items
            .iter()
            .find(|item| item.kind == COVER)
            .and_then(atoms::item_value);
        embedded != Some(bytes.as_slice())
    });

    items.retain(|item| match item.kind {
        NAME | ARTIST | ALBUM | NARRATOR | COMPOSER => false,
        FREEFORM => atoms::freeform_name(item).as_deref() != Some(SUBTITLE_NAME),
        COVER => cover.is_none(),
        _ => true,
    });

    if !book.title.trim().is_empty() {
        items.push(atoms::text_item(NAME, &book.title));
    }
    if let Some(subtitle) = book.subtitle.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        items.push(atoms::freeform_item(ITUNES_MEAN, SUBTITLE_NAME, subtitle));
    }

    let authors: Vec<&str> = book.sorted_authors().into_iter().map(|a| a.name.as_str()).collect();
    if !authors.is_empty() {
        items.push(atoms::text_item(ARTIST, &authors.join(", ")));
    }

    let narrators: Vec<&str> = file.sorted_narrators().into_iter().map(|n| n.name.as_str()).collect();
    if !narrators.is_empty() {
        let joined = narrators.join(", ");
        items.push(atoms::text_item(NARRATOR, &joined));
        items.push(atoms::text_item(COMPOSER, &joined));
    }

    if let Some(series) = book.primary_series() {
        let album = match series.number {
            Some(number) => format!("{} #{}", series.name, format_series_number(number)),
            None => series.name.clone(),
        };
        items.push(atoms::text_item(ALBUM, &album));
    }

    if let Some((bytes, code)) = cover {
        items.push(Mp4Box::container(COVER, vec![atoms::data_box(code, &bytes)]));
    }
    Ok(())
}
