//! Atomic file replacement
//!
//! Every write into the cache directory goes through a temporary file in the
//! destination's directory followed by a rename, so readers only ever see
//! the previous file or the complete new one.

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use uuid::Uuid;

/// Suffix shared by every temporary file we create
pub const TEMP_SUFFIX: &str = ".tmp";

/// Temporary sibling path for `dest`: `.{name}.{uuid}.tmp`
pub fn temp_path_for(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    let mut temp = OsString::from(".");
    temp.push(name);
    temp.push(format!(".{}{}", Uuid::new_v4().simple(), TEMP_SUFFIX));
    dest.with_file_name(temp)
}

/// Whether `name` looks like one of our temporary files
pub fn is_temp_name(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(TEMP_SUFFIX)
}

fn sync_parent(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
}

/// A file being written that replaces `dest` only on `commit`
///
/// Dropping an uncommitted `AtomicFile` removes the temporary file and leaves
/// `dest` untouched.
pub struct AtomicFile {
    dest: PathBuf,
    temp: PathBuf,
    file: Option<fs::File>,
}

impl AtomicFile {
    /// Create the temporary file next to `dest`
    pub fn create(dest: impl Into<PathBuf>) -> io::Result<Self> {
        let dest = dest.into();
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let temp = temp_path_for(&dest);
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&temp)?;
        Ok(Self {
            dest,
            temp,
            file: Some(file),
        })
    }

    pub fn file_mut(&mut self) -> io::Result<&mut fs::File> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "atomic file already closed"))
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp
    }

    /// Flush and fsync the temporary file; returns its size in bytes
    pub fn sync(&mut self) -> io::Result<u64> {
        let file = self.file_mut()?;
        file.sync_all()?;
        Ok(file.metadata()?.len())
    }

    /// Flush, fsync and rename into place; returns the final size in bytes
    pub fn commit(mut self) -> io::Result<u64> {
        let file = self
            .file
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "atomic file already closed"))?;
        file.sync_all()?;
        let size = file.metadata()?.len();
        drop(file);

        fs::rename(&self.temp, &self.dest)?;
        sync_parent(&self.dest);
        // Renamed away; nothing left for Drop to clean up.
        self.temp = PathBuf::new();
        Ok(size)
    }
}

impl Drop for AtomicFile {
    fn drop(&mut self) {
        self.file.take();
        if !self.temp.as_os_str().is_empty() {
            if let Err(e) = fs::remove_file(&self.temp) {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(temp = %self.temp.display(), "Failed to remove temporary file: {}", e);
                }
            }
        }
    }
}

/// Atomically replace `dest` with `bytes`
pub async fn write_atomic(dest: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let temp = temp_path_for(dest);

    let result = async {
        let mut file = tokio::fs::File::create(&temp).await?;
        tokio::io::AsyncWriteExt::write_all(&mut file, bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&temp, dest).await
    }
    .await;

    if result.is_err() {
        let _ = tokio::fs::remove_file(&temp).await;
    }
    result
}

/// Create `dir` if needed and prove it is writable with a probe file
pub async fn verify_writable(dir: &Path) -> io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let probe = dir.join(format!(".write-probe-{}", Uuid::new_v4().simple()));
    tokio::fs::write(&probe, b"probe").await?;
    tokio::fs::remove_file(&probe).await?;
    Ok(())
}
