//! Metadata providers
//!
//! The download cache never talks to the database directly; it receives
//! `Book`/`File` snapshots from a `MetadataProvider`. `JsonCatalog` is a
//! file-backed provider used by the standalone server.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::DownloadResult;

use super::types::{Book, File, FileId};

/// Source of book/file metadata snapshots
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    /// Current snapshot of a file and the book it belongs to
    async fn file_snapshot(&self, file_id: FileId) -> DownloadResult<Option<(Book, File)>>;
}

#[derive(Debug, Deserialize)]
struct CatalogDocument {
    #[serde(default)]
    books: Vec<CatalogBook>,
}

#[derive(Debug, Deserialize)]
struct CatalogBook {
    #[serde(flatten)]
    book: Book,
    #[serde(default)]
    files: Vec<File>,
}

/// In-memory catalog loaded from a JSON document
///
/// ```json
/// { "books": [ { "id": 1, "title": "...", "authors": [...], "files": [ { "id": 7, ... } ] } ] }
/// ```
#[derive(Debug, Default)]
pub struct JsonCatalog {
    entries: HashMap<FileId, (Book, File)>,
}

impl JsonCatalog {
    /// Build a catalog from already-loaded snapshots
    pub fn from_snapshots(snapshots: impl IntoIterator<Item = (Book, File)>) -> Self {
        Self {
            entries: snapshots
                .into_iter()
                .map(|(book, file)| (file.id, (book, file)))
                .collect(),
        }
    }

    /// Load a catalog from a JSON file
    pub async fn load(path: impl AsRef<Path>) -> DownloadResult<Self> {
        let raw = tokio::fs::read(path.as_ref()).await?;
        let mut catalog = Self::parse(&raw)?;
        catalog.fill_cover_details().await;

        tracing::info!(
            path = %path.as_ref().display(),
            files = catalog.entries.len(),
            "Loaded library catalog"
        );
        Ok(catalog)
    }

    fn parse(raw: &[u8]) -> DownloadResult<Self> {
        let document: CatalogDocument = serde_json::from_slice(raw)?;
        let mut snapshots = Vec::new();
        for entry in document.books {
            for mut file in entry.files {
                file.book_id = entry.book.id;
                snapshots.push((entry.book.clone(), file));
            }
        }
        Ok(Self::from_snapshots(snapshots))
    }

    /// Fill in cover MIME types and modification times that the catalog omits
    async fn fill_cover_details(&mut self) {
        for (_, file) in self.entries.values_mut() {
            let Some(cover) = file.cover.as_mut() else {
                continue;
            };
            if cover.mime_type.is_empty() {
                cover.mime_type = mime_guess::from_path(&cover.path)
                    .first_or_octet_stream()
                    .essence_str()
                    .to_string();
            }
            if cover.modified_at.is_none() {
                match tokio::fs::metadata(&cover.path).await.and_then(|m| m.modified()) {
                    Ok(modified) => cover.modified_at = Some(DateTime::<Utc>::from(modified)),
                    Err(e) => tracing::warn!(
                        file_id = file.id,
                        cover = %cover.path.display(),
                        "Cover file not readable: {}",
                        e
                    ),
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl MetadataProvider for JsonCatalog {
    async fn file_snapshot(&self, file_id: FileId) -> DownloadResult<Option<(Book, File)>> {
        Ok(self.entries.get(&file_id).cloned())
    }
}
