//! Metadata fingerprints
//!
//! A fingerprint is a SHA-256 digest over only the metadata fields that end
//! up inside a generated file of a given format. Fields that change on
//! unrelated edits (`updated_at`, description) are never part of it, so they
//! cannot invalidate a cached download.
//!
//! The payload is serialized as JSON from plain structs, which keeps field
//! order fixed. Every list is sorted by its sort key, then by name, then by
//! the remaining fields, so equal metadata in any input order hashes the same.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::formats::DownloadFormat;

use super::types::{sorted, AuthorRole, Book, CoverRef, File};

/// Bumped whenever the payload layout changes, so old cache entries miss
const PAYLOAD_VERSION: u32 = 1;

#[derive(Serialize)]
struct Payload<'a> {
    version: u32,
    format: &'static str,
    #[serde(flatten)]
    fields: Fields<'a>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum Fields<'a> {
    Epub(EpubFields<'a>),
    M4b(M4bFields<'a>),
    Cbz(CbzFields<'a>),
}

#[derive(Serialize)]
struct EpubFields<'a> {
    title: &'a str,
    subtitle: Option<&'a str>,
    authors: Vec<AuthorEntry<'a>>,
    series: Vec<SeriesEntry<'a>>,
    cover: Option<CoverIdentity<'a>>,
}

#[derive(Serialize)]
struct M4bFields<'a> {
    #[serde(flatten)]
    base: EpubFields<'a>,
    narrators: Vec<NarratorEntry<'a>>,
}

#[derive(Serialize)]
struct CbzFields<'a> {
    title: &'a str,
    authors: Vec<RoleAuthorEntry<'a>>,
    series: Vec<SeriesEntry<'a>>,
    cover_page: Option<u32>,
}

#[derive(Serialize)]
struct AuthorEntry<'a> {
    name: &'a str,
    sort_order: i32,
}

#[derive(Serialize)]
struct RoleAuthorEntry<'a> {
    name: &'a str,
    role: Option<AuthorRole>,
    sort_order: i32,
}

#[derive(Serialize)]
struct SeriesEntry<'a> {
    name: &'a str,
    number: Option<f64>,
    sort_order: i32,
}

#[derive(Serialize)]
struct NarratorEntry<'a> {
    name: &'a str,
    sort_order: i32,
}

#[derive(Serialize)]
struct CoverIdentity<'a> {
    path: String,
    mime_type: &'a str,
    modified_at: Option<DateTime<Utc>>,
}

impl<'a> CoverIdentity<'a> {
    fn from_ref(cover: &'a CoverRef) -> Self {
        Self {
            path: cover.path.to_string_lossy().into_owned(),
            mime_type: &cover.mime_type,
            modified_at: cover.modified_at,
        }
    }
}

fn series_entries(book: &Book) -> Vec<SeriesEntry<'_>> {
    let mut entries: Vec<SeriesEntry<'_>> = sorted(&book.series)
        .into_iter()
        .map(|s| SeriesEntry {
            name: &s.name,
            number: s.number,
            sort_order: s.sort_order,
        })
        .collect();
    // Same name and sort order: order by number so input order never leaks in
    entries.sort_by(|a, b| {
        (a.sort_order, a.name)
            .cmp(&(b.sort_order, b.name))
            .then_with(|| compare_numbers(a.number, b.number))
    });
    entries
}

fn compare_numbers(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => x.total_cmp(&y),
        (a, b) => a.is_some().cmp(&b.is_some()),
    }
}

/// Comic creators, ordered by sort order, then name, then role
fn role_author_entries(book: &Book) -> Vec<RoleAuthorEntry<'_>> {
    let mut entries: Vec<RoleAuthorEntry<'_>> = book
        .authors
        .iter()
        .map(|a| RoleAuthorEntry {
            name: &a.name,
            role: a.role,
            sort_order: a.sort_order,
        })
        .collect();
    entries.sort_by_key(|e| (e.sort_order, e.name, e.role));
    entries
}

fn epub_fields<'a>(book: &'a Book, file: &'a File) -> EpubFields<'a> {
    EpubFields {
        title: &book.title,
        subtitle: book.subtitle.as_deref(),
        authors: book
            .sorted_authors()
            .into_iter()
            .map(|a| AuthorEntry {
                name: &a.name,
                sort_order: a.sort_order,
            })
            .collect(),
        series: series_entries(book),
        cover: file.cover.as_ref().map(CoverIdentity::from_ref),
    }
}

fn fields<'a>(format: DownloadFormat, book: &'a Book, file: &'a File) -> Fields<'a> {
    match format {
        DownloadFormat::Epub => Fields::Epub(epub_fields(book, file)),
        DownloadFormat::M4b => Fields::M4b(M4bFields {
            base: epub_fields(book, file),
            narrators: file
                .sorted_narrators()
                .into_iter()
                .map(|n| NarratorEntry {
                    name: &n.name,
                    sort_order: n.sort_order,
                })
                .collect(),
        }),
        DownloadFormat::Cbz => Fields::Cbz(CbzFields {
            title: &book.title,
            authors: role_author_entries(book),
            series: series_entries(book),
            cover_page: file.cover_page,
        }),
    }
}

/// Canonical payload bytes for `format`
fn canonical_payload(format: DownloadFormat, book: &Book, file: &File) -> Vec<u8> {
    let payload = Payload {
        version: PAYLOAD_VERSION,
        format: format.extension(),
        fields: fields(format, book, file),
    };
    // Plain structs of strings and numbers; serialization cannot fail.
    serde_json::to_vec(&payload).unwrap_or_default()
}

/// Compute the hex-encoded fingerprint of the metadata that `format` embeds
pub fn compute(format: DownloadFormat, book: &Book, file: &File) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_payload(format, book, file));
    hex::encode(hasher.finalize())
}
