//! Zip extraction and deterministic re-serialization.
//!
//! [`ExtractedArchive::open`] unzips the input package and remembers how every
//! entry was compressed. [`ExtractedArchive::close`] zips the (possibly
//! modified) tree back up, walking it in a fixed order so the same tree always
//! yields the same archive.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

use walkdir::{DirEntry, WalkDir};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipArchive, ZipWriter};

use crate::error::{PackError, Result};
use crate::fs_utils::glob_in;

/// Directory holding the package signature; stale once contents change.
pub const SIGNATURE_DIR: &str = "META-INF";

/// Method used for entries that were not present in the source archive.
pub const DEFAULT_COMPRESSION: CompressionMethod = CompressionMethod::Deflated;

/// How an entry was stored in the source archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EntryInfo {
    compression: CompressionMethod,
    unix_mode: Option<u32>,
}

/// An archive unpacked to disk, waiting to be written back out.
///
/// Dropping the value without calling [`close`](Self::close) writes nothing;
/// a failed run must never produce a half-transformed package.
#[derive(Debug)]
pub struct ExtractedArchive {
    extracted_dir: PathBuf,
    entries: HashMap<String, EntryInfo>,
}

impl ExtractedArchive {
    /// Extract every entry of `archive_path` into `extracted_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the archive cannot be opened or is corrupt, an
    /// entry escapes the destination, or a file cannot be written.
    pub fn open(archive_path: &Path, extracted_dir: &Path) -> Result<Self> {
        tracing::info!("Extracting apk...");
        let file = File::open(archive_path).map_err(|e| PackError::file(archive_path, e))?;
        let mut archive = ZipArchive::new(BufReader::new(file))?;

        fs::create_dir_all(extracted_dir)?;
        let mut entries = HashMap::with_capacity(archive.len());

        for i in 0..archive.len() {
            let mut entry = archive.by_index(i)?;
            let Some(relative_path) = entry.enclosed_name() else {
                return Err(PackError::Invalid(format!(
                    "Invalid path in archive: {}",
                    entry.name()
                )));
            };

            entries.insert(
                entry.name().to_string(),
                EntryInfo {
                    compression: entry.compression(),
                    unix_mode: entry.unix_mode(),
                },
            );

            let absolute_path = extracted_dir.join(&relative_path);
            if entry.is_dir() {
                fs::create_dir_all(&absolute_path)?;
                continue;
            }
            if let Some(parent) = absolute_path.parent() {
                fs::create_dir_all(parent)?;
            }

            let mut outfile =
                File::create(&absolute_path).map_err(|e| PackError::file(&absolute_path, e))?;
            io::copy(&mut entry, &mut outfile)?;
        }

        tracing::debug!(entries = entries.len(), "archive extracted");
        Ok(Self {
            extracted_dir: extracted_dir.to_path_buf(),
            entries,
        })
    }

    /// Root of the extracted tree.
    pub fn extracted_dir(&self) -> &Path {
        &self.extracted_dir
    }

    /// Compression method recorded for `archive_path`, if it was in the source.
    pub fn compression_of(&self, archive_path: &str) -> Option<CompressionMethod> {
        self.entries.get(archive_path).map(|e| e.compression)
    }

    /// Zip the extracted tree into `output_path`, replacing any existing file.
    ///
    /// # Errors
    ///
    /// Returns an error if the tree cannot be walked or the output cannot be
    /// written.
    pub fn close(self, output_path: &Path) -> Result<()> {
        if output_path.is_file() {
            fs::remove_file(output_path).map_err(|e| PackError::file(output_path, e))?;
        }

        tracing::info!("Creating output apk");
        let file = File::create(output_path).map_err(|e| PackError::file(output_path, e))?;
        let mut writer = ZipWriter::new(file);

        for path in walk_sorted(&self.extracted_dir)? {
            let archive_path = archive_name(&self.extracted_dir, &path)?;
            let info = self.entries.get(&archive_path);
            let options = entry_options(&archive_path, info, &path)?;

            writer.start_file(archive_path, options)?;
            let mut input = File::open(&path).map_err(|e| PackError::file(&path, e))?;
            io::copy(&mut input, &mut writer)?;
        }

        writer.finish()?;
        Ok(())
    }
}

fn entry_options(
    archive_path: &str,
    info: Option<&EntryInfo>,
    path: &Path,
) -> Result<SimpleFileOptions> {
    let compression = match info.map(|i| i.compression) {
        None => DEFAULT_COMPRESSION,
        Some(
            method @ (CompressionMethod::Stored
            | CompressionMethod::Deflated
            | CompressionMethod::Bzip2
            | CompressionMethod::Zstd),
        ) => method,
        Some(other) => {
            tracing::warn!(
                "{archive_path}: cannot rewrite with {other:?}, using {DEFAULT_COMPRESSION:?}"
            );
            DEFAULT_COMPRESSION
        }
    };
    let size = fs::metadata(path).map_err(|e| PackError::file(path, e))?.len();

    let mut options = SimpleFileOptions::default()
        .compression_method(compression)
        .last_modified_time(DateTime::default())
        .large_file(size >= u64::from(u32::MAX));
    if let Some(mode) = info.and_then(|i| i.unix_mode) {
        options = options.unix_permissions(mode);
    }
    Ok(options)
}

/// Remove the plain files under `META-INF/`; they are regenerated by signing.
///
/// # Errors
///
/// Returns an error if a signature file cannot be deleted.
pub fn remove_signature_files(extracted_dir: &Path) -> Result<()> {
    let signature_dir = extracted_dir.join(SIGNATURE_DIR);
    if !signature_dir.is_dir() {
        return Ok(());
    }
    for path in glob_in(&signature_dir, "*")? {
        if path.is_file() {
            tracing::debug!("removing signature file {}", path.display());
            fs::remove_file(&path).map_err(|e| PackError::file(&path, e))?;
        }
    }
    Ok(())
}

/// Every file under `root`, depth-first. Within each directory the files come
/// first, sorted by name, followed by the subdirectories, sorted by name.
fn walk_sorted(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by(files_then_dirs) {
        let entry = entry?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

fn files_then_dirs(a: &DirEntry, b: &DirEntry) -> Ordering {
    a.file_type()
        .is_dir()
        .cmp(&b.file_type().is_dir())
        .then_with(|| a.file_name().cmp(b.file_name()))
}

/// Archive-relative name of `path`, always `/`-separated.
fn archive_name(root: &Path, path: &Path) -> Result<String> {
    let relative = path
        .strip_prefix(root)
        .map_err(|_| PackError::Invalid(format!("{} is outside the tree", path.display())))?;
    let parts: Vec<_> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect();
    Ok(parts.join("/"))
}
