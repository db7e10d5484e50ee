//! Least-recently-used eviction with hysteresis
//!
//! A pass starts when the cache grows beyond `max_bytes` and removes the
//! least recently accessed entries until the total is at or below
//! `target_bytes`. Entries currently locked by a request are skipped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::DownloadResult;
use crate::library::FileId;

use super::locks::KeyedLocks;
use super::store::CacheStore;

/// Outcome of one eviction pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EvictionReport {
    pub scanned: usize,
    pub total_before: u64,
    pub removed: usize,
    pub freed_bytes: u64,
    pub total_after: u64,
    pub skipped_busy: usize,
}

pub struct LruEvictor {
    store: Arc<CacheStore>,
    locks: KeyedLocks<FileId>,
    max_bytes: u64,
    target_bytes: u64,
    running: AtomicBool,
}

/// Clears the running flag however the pass ends
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl LruEvictor {
    /// `max_bytes == 0` disables eviction
    pub fn new(store: Arc<CacheStore>, locks: KeyedLocks<FileId>, max_bytes: u64, target_bytes: u64) -> Self {
        Self {
            store,
            locks,
            max_bytes,
            target_bytes: target_bytes.min(max_bytes.saturating_sub(1)),
            running: AtomicBool::new(false),
        }
    }

    pub fn enabled(&self) -> bool {
        self.max_bytes > 0
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub fn target_bytes(&self) -> u64 {
        self.target_bytes
    }

    /// Run a pass in the background
    pub fn schedule(self: &Arc<Self>) {
        if !self.enabled() {
            return;
        }
        let evictor = Arc::clone(self);
        tokio::spawn(async move {
            match evictor.run().await {
                Ok(Some(report)) if report.removed > 0 => {
                    tracing::info!(
                        removed = report.removed,
                        freed_bytes = report.freed_bytes,
                        total_before = report.total_before,
                        total_after = report.total_after,
                        skipped_busy = report.skipped_busy,
                        "Evicted cached downloads"
                    );
                }
                Ok(Some(report)) => {
                    tracing::debug!(total = report.total_after, max = evictor.max_bytes, "Cache within limits");
                }
                Ok(None) => {}
                Err(e) => tracing::warn!("Cache eviction failed: {}", e),
            }
        });
    }

    /// Run a pass now
    ///
    /// Returns `None` when eviction is disabled or another pass is already
    /// running.
    pub async fn run(&self) -> DownloadResult<Option<EvictionReport>> {
        if !self.enabled() {
            return Ok(None);
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("Eviction pass already running");
            return Ok(None);
        }
        let _running = RunningGuard(&self.running);

        let mut entries = self.store.entries().await?;
        let total: u64 = entries.iter().map(|e| e.size_bytes).sum();
        let mut report = EvictionReport {
            scanned: entries.len(),
            total_before: total,
            total_after: total,
            ..Default::default()
        };
        if total <= self.max_bytes {
            return Ok(Some(report));
        }

        entries.sort_by(|a, b| {
            a.last_accessed_at
                .cmp(&b.last_accessed_at)
                .then(a.file_id.cmp(&b.file_id))
        });

        let mut current = total;
        for entry in entries {
            if current <= self.target_bytes {
                break;
            }
            let Some(_guard) = self.locks.try_lock(entry.file_id) else {
                report.skipped_busy += 1;
                continue;
            };
            // The entry may have been regenerated or touched since the scan.
            let Some(fresh) = self.store.load(entry.file_id).await else {
                current = current.saturating_sub(entry.size_bytes);
                continue;
            };
            if fresh.last_accessed_at != entry.last_accessed_at {
                current = current.saturating_sub(entry.size_bytes) + fresh.size_bytes;
                continue;
            }
            match self.store.remove(entry.file_id).await {
                Ok(_) => {
                    tracing::debug!(
                        file_id = entry.file_id,
                        size_bytes = fresh.size_bytes,
                        "Evicted cached download"
                    );
                    current = current.saturating_sub(fresh.size_bytes);
                    report.removed += 1;
                    report.freed_bytes += fresh.size_bytes;
                }
                Err(e) => {
                    tracing::warn!(file_id = entry.file_id, "Failed to evict cached download: {}", e);
                }
            }
        }

        report.total_after = current;
        Ok(Some(report))
    }
}
