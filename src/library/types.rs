//! Book and file snapshots
//!
//! Read-only projections of the library database handed to the download
//! cache. These are owned by the persistence layer; the cache never mutates
//! them.

use std::cmp::Ordering;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of a stored file (one book can have several files)
pub type FileId = i64;

/// Book-level metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Book {
    pub id: i64,
    pub title: String,
    #[serde(default)]
    pub subtitle: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub authors: Vec<Author>,
    #[serde(default)]
    pub series: Vec<SeriesRef>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

/// A single stored file belonging to a book
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct File {
    pub id: FileId,
    #[serde(default)]
    pub book_id: i64,
    /// Location of the original file on disk
    pub path: PathBuf,
    pub file_type: FileType,
    /// Audiobook narrators (empty for other file types)
    #[serde(default)]
    pub narrators: Vec<Narrator>,
    /// External cover image for this file
    #[serde(default)]
    pub cover: Option<CoverRef>,
    /// Zero-based page index used as the front cover (CBZ only)
    #[serde(default)]
    pub cover_page: Option<u32>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

/// Container type of a stored file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Epub,
    M4b,
    Cbz,
    Pdf,
}

impl FileType {
    /// File extension without the leading dot
    pub fn extension(&self) -> &'static str {
        match self {
            FileType::Epub => "epub",
            FileType::M4b => "m4b",
            FileType::Cbz => "cbz",
            FileType::Pdf => "pdf",
        }
    }

    /// MIME type served for the original file
    pub fn mime_type(&self) -> &'static str {
        match self {
            FileType::Epub => "application/epub+zip",
            FileType::M4b => "audio/mp4",
            FileType::Cbz => "application/vnd.comicbook+zip",
            FileType::Pdf => "application/pdf",
        }
    }

    pub fn is_audiobook(&self) -> bool {
        matches!(self, FileType::M4b)
    }
}

/// Comic creator roles understood by ComicInfo.xml
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorRole {
    Writer,
    Penciller,
    Inker,
    Colorist,
    Letterer,
    CoverArtist,
    Editor,
    Translator,
}

impl AuthorRole {
    pub const ALL: [AuthorRole; 8] = [
        AuthorRole::Writer,
        AuthorRole::Penciller,
        AuthorRole::Inker,
        AuthorRole::Colorist,
        AuthorRole::Letterer,
        AuthorRole::CoverArtist,
        AuthorRole::Editor,
        AuthorRole::Translator,
    ];

    /// ComicInfo.xml element name for this role
    pub fn comic_info_element(&self) -> &'static str {
        match self {
            AuthorRole::Writer => "Writer",
            AuthorRole::Penciller => "Penciller",
            AuthorRole::Inker => "Inker",
            AuthorRole::Colorist => "Colorist",
            AuthorRole::Letterer => "Letterer",
            AuthorRole::CoverArtist => "CoverArtist",
            AuthorRole::Editor => "Editor",
            AuthorRole::Translator => "Translator",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Author {
    pub name: String,
    #[serde(default)]
    pub role: Option<AuthorRole>,
    #[serde(default)]
    pub sort_order: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesRef {
    pub name: String,
    #[serde(default)]
    pub number: Option<f64>,
    #[serde(default)]
    pub sort_order: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Narrator {
    pub name: String,
    #[serde(default)]
    pub sort_order: i32,
}

/// Reference to an external cover image
///
/// Identity is path + MIME type + modification time; pixel data is never
/// compared when deciding whether metadata changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverRef {
    pub path: PathBuf,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub modified_at: Option<DateTime<Utc>>,
}

/// Something with a sort key and a name tie-breaker
pub trait Ordered {
    fn sort_order(&self) -> i32;
    fn name(&self) -> &str;
}

impl Ordered for Author {
    fn sort_order(&self) -> i32 {
        self.sort_order
    }
    fn name(&self) -> &str {
        &self.name
    }
}

impl Ordered for SeriesRef {
    fn sort_order(&self) -> i32 {
        self.sort_order
    }
    fn name(&self) -> &str {
        &self.name
    }
}

impl Ordered for Narrator {
    fn sort_order(&self) -> i32 {
        self.sort_order
    }
    fn name(&self) -> &str {
        &self.name
    }
}

fn compare_ordered<T: Ordered>(a: &T, b: &T) -> Ordering {
    a.sort_order()
        .cmp(&b.sort_order())
        .then_with(|| a.name().cmp(b.name()))
}

/// Borrow a list sorted by sort order, ties broken by name
pub fn sorted<T: Ordered>(items: &[T]) -> Vec<&T> {
    let mut out: Vec<&T> = items.iter().collect();
    out.sort_by(|a, b| compare_ordered(*a, *b));
    out
}

impl Book {
    pub fn sorted_authors(&self) -> Vec<&Author> {
        sorted(&self.authors)
    }

    pub fn primary_author(&self) -> Option<&Author> {
        self.sorted_authors().into_iter().next()
    }

    pub fn primary_series(&self) -> Option<&SeriesRef> {
        sorted(&self.series).into_iter().next()
    }
}

impl File {
    pub fn sorted_narrators(&self) -> Vec<&Narrator> {
        sorted(&self.narrators)
    }

    pub fn primary_narrator(&self) -> Option<&Narrator> {
        self.sorted_narrators().into_iter().next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn author(name: &str, sort_order: i32) -> Author {
        Author {
            name: name.to_string(),
            role: None,
            sort_order,
        }
    }

    #[test]
    fn test_sorted_uses_name_as_tie_breaker() {
        let authors = vec![author("Zed", 1), author("Amy", 1), author("Bob", 0)];
        let names: Vec<&str> = sorted(&authors).iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["Bob", "Amy", "Zed"]);
    }

    #[test]
    fn test_file_type_deserializes_lowercase() {
        let ft: FileType = serde_json::from_str("\"m4b\"").unwrap();
        assert_eq!(ft, FileType::M4b);
        assert!(ft.is_audiobook());
    }
}
