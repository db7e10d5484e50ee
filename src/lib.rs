//! Amnesia Downloads Library
//!
//! Metadata-aware download cache: stored EPUB, M4B and CBZ files are
//! rewritten with the library's current metadata on download and cached
//! until that metadata changes.
//!
//! # Modules
//!
//! - `library`: book/file snapshots, fingerprints, download names
//! - `formats`: per-format generators
//! - `cache`: cache store, per-file locking, eviction, orchestration
//! - `routes`: HTTP endpoints

pub mod cache;
pub mod config;
pub mod error;
pub mod formats;
pub mod library;
pub mod routes;
pub mod state;
pub mod storage;
