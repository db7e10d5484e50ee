//! Application state management

use std::sync::Arc;

use crate::cache::DownloadCache;
use crate::config::CacheConfig;
use crate::library::MetadataProvider;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    cache: Arc<DownloadCache>,
    library: Arc<dyn MetadataProvider>,
}

impl AppState {
    /// Create the state with a download cache built from `config`
    pub fn new(config: &CacheConfig, library: Arc<dyn MetadataProvider>) -> Self {
        Self::with_cache(Arc::new(DownloadCache::new(config)), library)
    }

    pub fn with_cache(cache: Arc<DownloadCache>, library: Arc<dyn MetadataProvider>) -> Self {
        Self {
            inner: Arc::new(AppStateInner { cache, library }),
        }
    }

    /// Get the download cache
    pub fn cache(&self) -> &DownloadCache {
        &self.inner.cache
    }

    /// Get the metadata provider
    pub fn library(&self) -> &dyn MetadataProvider {
        self.inner.library.as_ref()
    }
}
