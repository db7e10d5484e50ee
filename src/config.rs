//! Configuration management for the download service

use serde::Deserialize;
use std::env;
use std::path::PathBuf;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub cache: CacheConfig,
    pub library: LibraryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Directory holding generated files and their sidecars
    pub cache_dir: PathBuf,
    /// Size bound for the eviction pass; `0` disables eviction
    pub download_cache_max_size_gb: f64,
    /// Eviction stops once the cache is at or below `max * ratio`
    pub eviction_target_ratio: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LibraryConfig {
    /// JSON catalog of books and files
    pub catalog_path: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {value}")]
    InvalidValue { var: &'static str, value: String },
}

impl CacheConfig {
    pub fn max_bytes(&self) -> u64 {
        if self.download_cache_max_size_gb <= 0.0 {
            return 0;
        }
        (self.download_cache_max_size_gb * BYTES_PER_GB) as u64
    }

    /// Eviction floor, always strictly below `max_bytes`
    pub fn target_bytes(&self) -> u64 {
        let max = self.max_bytes();
        if max == 0 {
            return 0;
        }
        let ratio = self.eviction_target_ratio.clamp(0.0, 1.0);
        ((max as f64 * ratio) as u64).min(max - 1)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 3000,
            },
            cache: CacheConfig {
                cache_dir: PathBuf::from("./cache/downloads"),
                download_cache_max_size_gb: 5.0,
                eviction_target_ratio: 0.8,
            },
            library: LibraryConfig {
                catalog_path: PathBuf::from("./library.json"),
            },
        }
    }
}

fn parse_var<T: std::str::FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { var, value }),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let max_size_gb: f64 = parse_var("DOWNLOAD_CACHE_MAX_SIZE_GB", 5.0)?;
        if !max_size_gb.is_finite() || max_size_gb < 0.0 {
            return Err(ConfigError::InvalidValue {
                var: "DOWNLOAD_CACHE_MAX_SIZE_GB",
                value: max_size_gb.to_string(),
            });
        }
        let ratio: f64 = parse_var("DOWNLOAD_CACHE_EVICTION_TARGET", 0.8)?;
        if !(ratio > 0.0 && ratio < 1.0) {
            return Err(ConfigError::InvalidValue {
                var: "DOWNLOAD_CACHE_EVICTION_TARGET",
                value: ratio.to_string(),
            });
        }

        Ok(Config {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env::var("SERVER_PORT")
                    .unwrap_or_else(|_| "3000".to_string())
                    .parse()
                    .unwrap_or(3000),
            },
            cache: CacheConfig {
                cache_dir: env::var("CACHE_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("./cache/downloads")),
                download_cache_max_size_gb: max_size_gb,
                eviction_target_ratio: ratio,
            },
            library: LibraryConfig {
                catalog_path: env::var("LIBRARY_CATALOG")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("./library.json")),
            },
        })
    }
}
