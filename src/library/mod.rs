//! Library metadata as seen by the download cache
//!
//! - `types`: book/file snapshots
//! - `fingerprint`: per-format metadata digests
//! - `filename`: human-readable download names
//! - `provider`: where snapshots come from

pub mod filename;
pub mod fingerprint;
pub mod provider;
pub mod types;

pub use filename::{format_name, format_series_number};
pub use provider::{JsonCatalog, MetadataProvider};
pub use types::{
    sorted, Author, AuthorRole, Book, CoverRef, File, FileId, FileType, Narrator, SeriesRef,
};
