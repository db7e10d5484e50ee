//! Download cache orchestration
//!
//! `DownloadCache` ties the pieces together: it fingerprints the current
//! metadata, serves a cached file when the fingerprint still matches, and
//! otherwise regenerates the file while holding the per-file lock.
//!
//! # Thread Safety
//!
//! At most one request works on a given `FileId` at a time. Concurrent
//! requests for the same file wait on its lock and then observe the file the
//! first request produced as a cache hit.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::CacheConfig;
use crate::error::{DownloadError, DownloadResult};
use crate::formats::{generator_for, DownloadFormat};
use crate::library::{fingerprint, Book, File, FileId};
use crate::storage::AtomicFile;

use super::evictor::LruEvictor;
use super::locks::KeyedLocks;
use super::store::{CacheEntry, CacheStore};

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    generations: AtomicU64,
    failures: AtomicU64,
    fallbacks: AtomicU64,
}

/// Snapshot of cache activity since startup
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub generations: u64,
    pub failures: u64,
    pub fallbacks: u64,
    pub entries: usize,
    pub total_bytes: u64,
    pub max_bytes: u64,
}

pub struct DownloadCache {
    store: Arc<CacheStore>,
    locks: KeyedLocks<FileId>,
    evictor: Arc<LruEvictor>,
    counters: Counters,
}

/// Move a prepared output and its sidecar into place
///
/// The sidecar is staged before either rename. A failed output rename leaves
/// the previous pair untouched; a failed sidecar rename leaves the new output
/// without any sidecar, so the next request regenerates it.
fn commit_pair(store: &CacheStore, output: AtomicFile, entry: &CacheEntry) -> DownloadResult<()> {
    let sidecar = store.stage_sidecar(entry)?;
    output.commit()?;
    if let Err(e) = sidecar.commit() {
        let path = store.sidecar_path(entry.file_id);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(cleanup) if cleanup.kind() == std::io::ErrorKind::NotFound => {}
            Err(cleanup) => {
                tracing::warn!(file_id = entry.file_id, "Failed to remove previous sidecar: {}", cleanup);
            }
        }
        return Err(e.into());
    }
    Ok(())
}

impl DownloadCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self::with_limits(config.cache_dir.clone(), config.max_bytes(), config.target_bytes())
    }

    /// Cache in `dir` bounded by `max_bytes` (`0` for unbounded)
    pub fn with_limits(dir: impl Into<PathBuf>, max_bytes: u64, target_bytes: u64) -> Self {
        let store = Arc::new(CacheStore::new(dir));
        let locks = KeyedLocks::new();
        let evictor = Arc::new(LruEvictor::new(store.clone(), locks.clone(), max_bytes, target_bytes));
        Self {
            store,
            locks,
            evictor,
            counters: Counters::default(),
        }
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn evictor(&self) -> &Arc<LruEvictor> {
        &self.evictor
    }

    /// Path of a file carrying the current metadata, generating it if needed
    ///
    /// Dropping the returned future cancels an in-flight generation; the
    /// per-file lock stays held until the generator has stopped.
    pub async fn get_or_generate(
        &self,
        file_id: FileId,
        format: DownloadFormat,
        source: &Path,
        book: &Book,
        file: &File,
    ) -> DownloadResult<PathBuf> {
        let hash = fingerprint::compute(format, book, file);
        let guard = self.locks.lock(file_id).await;
        let dest = self.store.file_path(file_id, format);

        match self.store.load(file_id).await {
            Some(mut entry) if entry.fingerprint_hash == hash && dest.is_file() => {
                if let Err(e) = self.store.touch(&mut entry).await {
                    tracing::warn!(file_id, "Failed to record cache access: {}", e);
                }
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(file_id, format = %format, hash = %hash, "Download cache hit");
                return Ok(dest);
            }
            Some(entry) => {
                tracing::info!(
                    file_id,
                    format = %format,
                    old_hash = %entry.fingerprint_hash,
                    new_hash = %hash,
                    "Download cache stale, regenerating"
                );
            }
            None => {
                tracing::info!(file_id, format = %format, hash = %hash, "Download cache miss, generating");
            }
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);

        let started = Instant::now();
        let cancel = CancellationToken::new();
        let _cancel_on_drop = cancel.clone().drop_guard();
        let generator = generator_for(format);
        let store = self.store.clone();
        let (source_path, dest_path) = (source.to_path_buf(), dest.clone());
        let (book, file) = (book.clone(), file.clone());

        // The guard travels with the blocking task so an abandoned request
        // cannot release the lock while the pair is still being written.
        let (result, guard) = tokio::task::spawn_blocking(move || {
            let result = generator
                .prepare(&cancel, &source_path, &dest_path, &book, &file)
                .and_then(|(output, size_bytes)| {
                    let now = Utc::now();
                    let entry = CacheEntry {
                        file_id,
                        fingerprint_hash: hash,
                        generated_at: now,
                        last_accessed_at: now,
                        size_bytes,
                    };
                    commit_pair(&store, output, &entry)?;
                    Ok(size_bytes)
                });
            (result, guard)
        })
        .await?;

        let size_bytes = match result {
            Ok(size) => size,
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(file_id, format = %format, source = %source.display(), "Generation failed: {}", e);
                return Err(e);
            }
        };

        if let Err(e) = self.store.remove_siblings(file_id, format).await {
            tracing::warn!(file_id, "Failed to remove stale outputs: {}", e);
        }

        self.counters.generations.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            file_id,
            format = %format,
            size_bytes,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Generated download"
        );

        drop(guard);
        self.evictor.schedule();
        Ok(dest)
    }

    /// The untouched source file, bypassing generation
    pub async fn serve_original(&self, source: &Path) -> DownloadResult<PathBuf> {
        match tokio::fs::metadata(source).await {
            Ok(meta) if meta.is_file() => Ok(source.to_path_buf()),
            _ => Err(DownloadError::SourceNotFound(source.display().to_string())),
        }
    }

    /// Like `get_or_generate`, but falls back to the original file on error
    ///
    /// For clients that cannot show an error to the reader. The failure is
    /// still logged at error level.
    pub async fn get_or_original(
        &self,
        file_id: FileId,
        format: DownloadFormat,
        source: &Path,
        book: &Book,
        file: &File,
    ) -> DownloadResult<PathBuf> {
        match self.get_or_generate(file_id, format, source, book, file).await {
            Ok(path) => Ok(path),
            Err(e) => {
                self.counters.fallbacks.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    file_id,
                    format = %format,
                    "Serving original file after generation error: {}",
                    e
                );
                self.serve_original(source).await
            }
        }
    }

    /// Drop the cached output for `file_id`
    pub async fn invalidate(&self, file_id: FileId) -> DownloadResult<bool> {
        let _guard = self.locks.lock(file_id).await;
        let removed = self.store.remove(file_id).await?;
        if removed {
            tracing::info!(file_id, "Invalidated cached download");
        }
        Ok(removed)
    }

    pub async fn stats(&self) -> DownloadResult<CacheStats> {
        let entries = self.store.entries().await?;
        Ok(CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            generations: self.counters.generations.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            fallbacks: self.counters.fallbacks.load(Ordering::Relaxed),
            entries: entries.len(),
            total_bytes: entries.iter().map(|e| e.size_bytes).sum(),
            max_bytes: self.evictor.max_bytes(),
        })
    }
}
