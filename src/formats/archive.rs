//! Streaming zip rewrite shared by EPUB and CBZ
//!
//! Entries are visited in their original order. Untouched entries are copied
//! raw (compressed bytes, CRC and local header as-is) so they come out
//! byte-identical; only entries named in the plan are recompressed.

use std::collections::HashMap;
use std::fs;
use std::io::{BufReader, Read, Seek, Write};
use std::path::Path;

use tokio_util::sync::CancellationToken;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::{DownloadError, DownloadResult};

use super::check_cancelled;

pub type SourceArchive = ZipArchive<BufReader<fs::File>>;

/// Largest entry `read_entry` will decompress into memory
pub const MAX_ENTRY_BYTES: u64 = 4 * 1024 * 1024;

/// Open `path` as a zip archive
pub fn open(path: &Path) -> DownloadResult<SourceArchive> {
    let file = fs::File::open(path)?;
    ZipArchive::new(BufReader::new(file))
        .map_err(|e| DownloadError::MalformedContainer(format!("{}: {}", path.display(), e)))
}

/// Index of the first entry whose name satisfies `pred`
pub fn find_entry<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    pred: impl Fn(&str) -> bool,
) -> DownloadResult<Option<usize>> {
    for index in 0..archive.len() {
        let entry = archive.by_index_raw(index)?;
        if !entry.is_dir() && pred(entry.name()) {
            return Ok(Some(index));
        }
    }
    Ok(None)
}

/// Decompressed contents of entry `index`
///
/// Meant for metadata documents. Entries that inflate past
/// `MAX_ENTRY_BYTES` are rejected whatever size their header declares.
pub fn read_entry<R: Read + Seek>(archive: &mut ZipArchive<R>, index: usize) -> DownloadResult<Vec<u8>> {
    let entry = archive.by_index(index)?;
    let name = entry.name().to_string();
    let mut bytes = Vec::with_capacity(entry.size().min(MAX_ENTRY_BYTES) as usize);
    entry.take(MAX_ENTRY_BYTES + 1).read_to_end(&mut bytes)?;
    if bytes.len() as u64 > MAX_ENTRY_BYTES {
        return Err(DownloadError::MalformedContainer(format!(
            "entry '{}' inflates past {} bytes",
            name, MAX_ENTRY_BYTES
        )));
    }
    Ok(bytes)
}

/// Decompressed contents of the entry called `name`, if present
pub fn read_named<R: Read + Seek>(archive: &mut ZipArchive<R>, name: &str) -> DownloadResult<Option<Vec<u8>>> {
    match archive.index_for_name(name) {
        Some(index) => read_entry(archive, index).map(Some),
        None => Ok(None),
    }
}

/// Entries to replace or add while copying an archive
#[derive(Debug, Default)]
pub struct RewritePlan {
    replacements: HashMap<usize, Vec<u8>>,
    appended: Vec<(String, Vec<u8>)>,
}

impl RewritePlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the contents of entry `index`, keeping its name and position
    pub fn replace(&mut self, index: usize, bytes: Vec<u8>) {
        self.replacements.insert(index, bytes);
    }

    /// Add a new entry after all existing ones
    pub fn append(&mut self, name: impl Into<String>, bytes: Vec<u8>) {
        self.appended.push((name.into(), bytes));
    }

    #[cfg(test)]
    pub fn is_replaced(&self, index: usize) -> bool {
        self.replacements.contains_key(&index)
    }
}

fn options_for(method: CompressionMethod) -> SimpleFileOptions {
    let method = match method {
        CompressionMethod::Stored => CompressionMethod::Stored,
        _ => CompressionMethod::Deflated,
    };
    SimpleFileOptions::default().compression_method(method)
}

/// Copy `archive` into `out`, applying `plan`
pub fn rewrite<R: Read + Seek, W: Write + Seek>(
    archive: &mut ZipArchive<R>,
    out: W,
    mut plan: RewritePlan,
    cancel: &CancellationToken,
) -> DownloadResult<()> {
    let mut writer = ZipWriter::new(out);

    for index in 0..archive.len() {
        check_cancelled(cancel)?;

        match plan.replacements.remove(&index) {
            Some(bytes) => {
                let (name, method) = {
                    let entry = archive.by_index_raw(index)?;
                    (entry.name().to_string(), entry.compression())
                };
                writer.start_file(name, options_for(method))?;
                writer.write_all(&bytes)?;
            }
            None => {
                let entry = archive.by_index_raw(index)?;
                writer.raw_copy_file(entry)?;
            }
        }
    }

    for (name, bytes) in plan.appended {
        check_cancelled(cancel)?;
        writer.start_file(name, options_for(CompressionMethod::Deflated))?;
        writer.write_all(&bytes)?;
    }

    writer.finish()?;
    Ok(())
}
