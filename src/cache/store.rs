//! On-disk cache entries
//!
//! Layout under the cache directory:
//!
//! ```text
//! {file_id}.{ext}        generated file
//! {file_id}.meta.json    sidecar record
//! ```
//!
//! Both halves of a pair are written through atomic renames. A sidecar that
//! cannot be read is treated as absent, never as an error.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DownloadResult;
use crate::formats::DownloadFormat;
use crate::library::FileId;
use crate::storage::atomic::is_temp_name;
use crate::storage::{write_atomic, AtomicFile};

const SIDECAR_SUFFIX: &str = ".meta.json";

/// Sidecar record for one generated file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub file_id: FileId,
    pub fingerprint_hash: String,
    pub generated_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub size_bytes: u64,
}

/// What a cache directory file name refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CacheFileKind {
    Sidecar(FileId),
    Generated(FileId, DownloadFormat),
}

fn classify(name: &str) -> Option<CacheFileKind> {
    if let Some(id) = name.strip_suffix(SIDECAR_SUFFIX) {
        return id.parse().ok().map(CacheFileKind::Sidecar);
    }
    let (id, ext) = name.split_once('.')?;
    let id: FileId = id.parse().ok()?;
    DownloadFormat::ALL
        .into_iter()
        .find(|format| format.extension() == ext)
        .map(|format| CacheFileKind::Generated(id, format))
}

/// Files removed by `CacheStore::sweep`
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub temp_files: usize,
    pub orphan_sidecars: usize,
    pub orphan_files: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.temp_files + self.orphan_sidecars + self.orphan_files
    }
}

async fn remove_if_present(path: &Path) -> std::io::Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[derive(Debug, Clone)]
pub struct CacheStore {
    dir: PathBuf,
}

impl CacheStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Path of the generated file for `file_id` in `format`
    pub fn file_path(&self, file_id: FileId, format: DownloadFormat) -> PathBuf {
        self.dir.join(format!("{}.{}", file_id, format.extension()))
    }

    pub fn sidecar_path(&self, file_id: FileId) -> PathBuf {
        self.dir.join(format!("{}{}", file_id, SIDECAR_SUFFIX))
    }

    /// Read the sidecar for `file_id`
    ///
    /// Missing, unreadable or mismatched sidecars all yield `None`.
    pub async fn load(&self, file_id: FileId) -> Option<CacheEntry> {
        let path = self.sidecar_path(file_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(file_id, path = %path.display(), "Unreadable cache sidecar: {}", e);
                return None;
            }
        };
        match serde_json::from_slice::<CacheEntry>(&bytes) {
            Ok(entry) if entry.file_id == file_id => Some(entry),
            Ok(entry) => {
                tracing::warn!(
                    file_id,
                    recorded = entry.file_id,
                    "Cache sidecar belongs to another file; treating as miss"
                );
                None
            }
            Err(e) => {
                tracing::warn!(file_id, path = %path.display(), "Corrupt cache sidecar, treating as miss: {}", e);
                None
            }
        }
    }

    /// Atomically write the sidecar for `entry`
    pub async fn save(&self, entry: &CacheEntry) -> DownloadResult<()> {
        let json = serde_json::to_vec_pretty(entry)?;
        write_atomic(&self.sidecar_path(entry.file_id), &json).await?;
        Ok(())
    }

    /// Write the sidecar for `entry` to a temporary file without replacing
    /// the current one
    ///
    /// Blocking; the returned file is committed by the caller.
    pub fn stage_sidecar(&self, entry: &CacheEntry) -> DownloadResult<AtomicFile> {
        let json = serde_json::to_vec_pretty(entry)?;
        let mut staged = AtomicFile::create(self.sidecar_path(entry.file_id))?;
        staged.file_mut()?.write_all(&json)?;
        staged.sync()?;
        Ok(staged)
    }

    /// Record an access at the current time
    pub async fn touch(&self, entry: &mut CacheEntry) -> DownloadResult<()> {
        entry.last_accessed_at = Utc::now();
        self.save(entry).await
    }

    /// Delete every generated file for `file_id`, then its sidecar
    ///
    /// Returns whether anything was removed.
    pub async fn remove(&self, file_id: FileId) -> DownloadResult<bool> {
        let mut removed = false;
        for format in DownloadFormat::ALL {
            removed |= remove_if_present(&self.file_path(file_id, format)).await?;
        }
        removed |= remove_if_present(&self.sidecar_path(file_id)).await?;
        Ok(removed)
    }

    /// Delete generated files for `file_id` in formats other than `keep`
    pub async fn remove_siblings(&self, file_id: FileId, keep: DownloadFormat) -> DownloadResult<usize> {
        let mut removed = 0;
        for format in DownloadFormat::ALL.into_iter().filter(|f| *f != keep) {
            if remove_if_present(&self.file_path(file_id, format)).await? {
                tracing::debug!(file_id, format = %format, "Removed stale generated file");
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// All readable sidecar records
    pub async fn entries(&self) -> DownloadResult<Vec<CacheEntry>> {
        let mut entries = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(e.into()),
        };
        while let Some(item) = dir.next_entry().await? {
            let name = item.file_name().to_string_lossy().into_owned();
            if let Some(CacheFileKind::Sidecar(file_id)) = classify(&name) {
                if let Some(entry) = self.load(file_id).await {
                    entries.push(entry);
                }
            }
        }
        entries.sort_by_key(|e| e.file_id);
        Ok(entries)
    }

    /// Remove temporary files and any half of a broken pair
    ///
    /// Meant for startup, before requests are served: temporary files of an
    /// in-flight generation would otherwise be deleted under it.
    pub async fn sweep(&self) -> DownloadResult<SweepReport> {
        let mut report = SweepReport::default();
        let mut sidecars = Vec::new();
        let mut generated = Vec::new();

        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(report),
            Err(e) => return Err(e.into()),
        };
        while let Some(item) = dir.next_entry().await? {
            let name = item.file_name().to_string_lossy().into_owned();
            if is_temp_name(&name) {
                if remove_if_present(&item.path()).await? {
                    report.temp_files += 1;
                }
                continue;
            }
            match classify(&name) {
                Some(CacheFileKind::Sidecar(id)) => sidecars.push(id),
                Some(CacheFileKind::Generated(id, format)) => generated.push((id, format)),
                None => {}
            }
        }

        for id in &sidecars {
            let has_file = generated.iter().any(|(gid, _)| gid == id);
            if !has_file || self.load(*id).await.is_none() {
                if remove_if_present(&self.sidecar_path(*id)).await? {
                    report.orphan_sidecars += 1;
                }
            }
        }
        for (id, format) in generated {
            if !self.sidecar_path(id).exists() {
                if remove_if_present(&self.file_path(id, format)).await? {
                    report.orphan_files += 1;
                }
            }
        }

        if report.total() > 0 {
            tracing::info!(
                temp_files = report.temp_files,
                orphan_sidecars = report.orphan_sidecars,
                orphan_files = report.orphan_files,
                "Swept download cache"
            );
        }
        Ok(report)
    }
}
