//! Expansion of concatenated native-library blobs.
//!
//! Some packages ship their native libraries concatenated into one
//! xz-compressed (`libs.xzs`) or zstd-compressed (`libs.zstd`) file. The
//! transformation step scans native code for class names, so the blobs are
//! expanded into `lib/__extracted_libs__/lib_<n>.so` for the duration of the
//! run. Dropping the [`LibraryManager`] removes that scratch directory again;
//! it must never end up in the repacked archive.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use walkdir::WalkDir;

use crate::error::{PackError, Result};
use crate::fs_utils::create_dir;

/// Blob name for xz-compressed libraries.
pub const XZ_LIB_NAME: &str = "libs.xzs";

/// Blob name for zstd-compressed libraries.
pub const ZSTD_LIB_NAME: &str = "libs.zstd";

/// Scratch directory, relative to the extracted tree.
pub const EXTRACTED_LIBS_DIR: &str = "lib/__extracted_libs__";

/// Compression scheme of a library blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobFormat {
    /// `libs.xzs`, expanded with `xz`.
    Xz,
    /// `libs.zstd`, expanded with `zstd`.
    Zstd,
}

impl BlobFormat {
    fn from_file_name(name: &str) -> Option<Self> {
        match name {
            XZ_LIB_NAME => Some(Self::Xz),
            ZSTD_LIB_NAME => Some(Self::Zstd),
            _ => None,
        }
    }

    fn tool(self) -> &'static str {
        match self {
            Self::Xz => "xz",
            Self::Zstd => "zstd",
        }
    }
}

/// Every library blob under `extracted_dir` that has a payload, in walk
/// order. Empty `libs.zstd` files are placeholders for partitions without
/// native code and are skipped.
///
/// # Errors
///
/// Returns an error if the tree cannot be walked.
pub fn find_library_blobs(extracted_dir: &Path) -> Result<Vec<(PathBuf, BlobFormat)>> {
    let mut blobs = Vec::new();
    for entry in WalkDir::new(extracted_dir).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(format) = BlobFormat::from_file_name(&entry.file_name().to_string_lossy())
        else {
            continue;
        };
        if format == BlobFormat::Zstd && entry.metadata()?.len() == 0 {
            tracing::debug!("skipping empty {}", entry.path().display());
            continue;
        }
        blobs.push((entry.into_path(), format));
    }
    Ok(blobs)
}

/// Make sure `libs_dir` and `sub_dir` both exist. Returns the topmost
/// directory that had to be created, which is what teardown removes.
///
/// The pair is created together: if `sub_dir` fails, a freshly created
/// `libs_dir` is removed again.
///
/// # Errors
///
/// Returns an error if either directory cannot be created (including when
/// `sub_dir` already exists).
pub fn ensure_libs_dir(libs_dir: &Path, sub_dir: &Path) -> Result<PathBuf> {
    if libs_dir.exists() {
        create_dir(sub_dir)?;
        return Ok(sub_dir.to_path_buf());
    }

    create_dir(libs_dir)?;
    if let Err(e) = create_dir(sub_dir) {
        if let Err(cleanup) = fs::remove_dir_all(libs_dir) {
            tracing::warn!("failed to remove {}: {cleanup}", libs_dir.display());
        }
        return Err(e);
    }
    Ok(libs_dir.to_path_buf())
}

/// Native-library blobs expanded for scanning.
///
/// Created by [`enter`](Self::enter); the scratch directory is removed when
/// the manager is dropped, whether or not the run succeeded.
#[derive(Debug)]
pub struct LibraryManager {
    temporary_libs_dir: Option<PathBuf>,
    extracted_libs: Vec<PathBuf>,
}

impl LibraryManager {
    /// Expand every library blob in `extracted_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the tree cannot be walked, the scratch directory
    /// cannot be created, a decompressor is missing, or it exits
    /// unsuccessfully.
    pub fn enter(extracted_dir: &Path) -> Result<Self> {
        let blobs = find_library_blobs(extracted_dir)?;
        if blobs.is_empty() {
            return Ok(Self {
                temporary_libs_dir: None,
                extracted_libs: Vec::new(),
            });
        }

        let libs_dir = extracted_dir.join("lib");
        let extracted_libs_dir = extracted_dir.join(EXTRACTED_LIBS_DIR);
        // Owned from here on so an expansion failure still cleans up.
        let mut manager = Self {
            temporary_libs_dir: Some(ensure_libs_dir(&libs_dir, &extracted_libs_dir)?),
            extracted_libs: Vec::with_capacity(blobs.len()),
        };

        for (lib_count, (blob, format)) in blobs.iter().enumerate() {
            let extract_path = extracted_libs_dir.join(format!("lib_{lib_count}.so"));
            tracing::info!("Expanding {}", blob.display());
            decompress(*format, blob, &extract_path)?;
            manager.extracted_libs.push(extract_path);
        }
        Ok(manager)
    }

    /// Expanded library files, `lib_0.so` first.
    pub fn extracted_libs(&self) -> &[PathBuf] {
        &self.extracted_libs
    }

    /// Directory removed on drop, if any blob was expanded.
    pub fn scratch_dir(&self) -> Option<&Path> {
        self.temporary_libs_dir.as_deref()
    }
}

impl Drop for LibraryManager {
    fn drop(&mut self) {
        if let Some(dir) = self.temporary_libs_dir.take() {
            if let Err(e) = fs::remove_dir_all(&dir) {
                tracing::warn!("failed to remove {}: {e}", dir.display());
            }
        }
    }
}

/// Run the external decompressor for `format` on `blob`, writing `output`.
fn decompress(format: BlobFormat, blob: &Path, output: &Path) -> Result<()> {
    let tool = format.tool();
    let program = which::which(tool).map_err(|source| PackError::ToolNotFound { tool, source })?;

    let mut cmd = Command::new(program);
    match format {
        BlobFormat::Xz => {
            let out = File::create(output).map_err(|e| PackError::file(output, e))?;
            cmd.args(["-d", "--stdout"]).arg(blob).stdout(out);
        }
        BlobFormat::Zstd => {
            cmd.args(["-d", "-q", "-f"])
                .arg(blob)
                .arg("-o")
                .arg(output)
                .stdout(Stdio::null());
        }
    }

    let status = cmd.status().map_err(|e| PackError::file(blob, e))?;
    if !status.success() {
        return Err(PackError::ToolFailed {
            tool: tool.to_string(),
            status,
            path: blob.to_path_buf(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_find_blobs_skips_empty_zstd() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("assets/lib/a")).unwrap();
        fs::create_dir_all(dir.path().join("assets/lib/b")).unwrap();
        fs::write(dir.path().join("assets/lib/a/libs.zstd"), b"").unwrap();
        fs::write(dir.path().join("assets/lib/b/libs.zstd"), b"payload").unwrap();
        fs::write(dir.path().join("assets/lib/libs.xzs"), b"").unwrap();
        fs::write(dir.path().join("assets/lib/other.zstd"), b"x").unwrap();

        let blobs = find_library_blobs(dir.path()).unwrap();

        assert_eq!(
            blobs,
            vec![
                (dir.path().join("assets/lib/b/libs.zstd"), BlobFormat::Zstd),
                (dir.path().join("assets/lib/libs.xzs"), BlobFormat::Xz),
            ]
        );
    }

    #[test]
    fn test_empty_zstd_only_creates_nothing() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("assets")).unwrap();
        fs::write(dir.path().join("assets/libs.zstd"), b"").unwrap();

        let manager = LibraryManager::enter(dir.path()).unwrap();

        assert!(manager.scratch_dir().is_none());
        assert!(manager.extracted_libs().is_empty());
        assert!(!dir.path().join("lib").exists());
    }

    #[test]
    fn test_ensure_libs_dir_reuses_existing_lib() {
        let dir = tempdir().unwrap();
        let libs = dir.path().join("lib");
        let sub = libs.join("__extracted_libs__");
        fs::create_dir(&libs).unwrap();

        assert_eq!(ensure_libs_dir(&libs, &sub).unwrap(), sub);
        assert!(sub.is_dir());
    }

    #[test]
    fn test_ensure_libs_dir_creates_pair() {
        let dir = tempdir().unwrap();
        let libs = dir.path().join("lib");
        let sub = libs.join("__extracted_libs__");

        assert_eq!(ensure_libs_dir(&libs, &sub).unwrap(), libs);
        assert!(sub.is_dir());
    }

    #[test]
    fn test_ensure_libs_dir_removes_lib_when_subdir_fails() {
        let dir = tempdir().unwrap();
        let libs = dir.path().join("lib");
        let sub = libs.join("missing").join("__extracted_libs__");

        let err = ensure_libs_dir(&libs, &sub).unwrap_err();

        assert!(matches!(err, PackError::File { .. }));
        assert!(!libs.exists());
    }

    #[test]
    fn test_xz_blob_is_expanded_and_removed() {
        let Ok(xz) = which::which("xz") else {
            eprintln!("xz not installed, skipping");
            return;
        };
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("assets")).unwrap();
        let payload = b"\x7fELF native code mentioning com/example/Bar".repeat(8);
        let raw = dir.path().join("raw.so");
        fs::write(&raw, &payload).unwrap();
        let compressed = Command::new(xz).args(["-z", "-c"]).arg(&raw).output().unwrap();
        assert!(compressed.status.success());
        fs::remove_file(&raw).unwrap();
        fs::write(dir.path().join("assets").join(XZ_LIB_NAME), compressed.stdout).unwrap();

        let manager = LibraryManager::enter(dir.path()).unwrap();
        // no lib/ before, so the whole lib/ tree is owned
        assert_eq!(manager.scratch_dir(), Some(dir.path().join("lib").as_path()));
        assert_eq!(
            manager.extracted_libs(),
            [dir.path().join(EXTRACTED_LIBS_DIR).join("lib_0.so")]
        );
        assert_eq!(fs::read(&manager.extracted_libs()[0]).unwrap(), payload);

        drop(manager);
        assert!(!dir.path().join("lib").exists());
    }

    #[test]
    fn test_blobs_are_numbered_in_walk_order() {
        if which::which("zstd").is_err() {
            eprintln!("zstd not installed, skipping");
            return;
        }
        let dir = tempdir().unwrap();
        for (sub, payload) in [("a", &b"first"[..]), ("b", &b"second"[..])] {
            let blob_dir = dir.path().join("assets").join(sub);
            fs::create_dir_all(&blob_dir).unwrap();
            let compressed = zstd::encode_all(payload, 3).unwrap();
            fs::write(blob_dir.join(ZSTD_LIB_NAME), compressed).unwrap();
        }

        let manager = LibraryManager::enter(dir.path()).unwrap();

        let scratch = dir.path().join(EXTRACTED_LIBS_DIR);
        assert_eq!(
            manager.extracted_libs(),
            [scratch.join("lib_0.so"), scratch.join("lib_1.so")]
        );
        assert_eq!(fs::read(scratch.join("lib_0.so")).unwrap(), b"first");
        assert_eq!(fs::read(scratch.join("lib_1.so")).unwrap(), b"second");
    }

    #[test]
    fn test_zstd_blob_is_expanded_and_removed() {
        if which::which("zstd").is_err() {
            eprintln!("zstd not installed, skipping");
            return;
        }
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("lib/arm64-v8a")).unwrap();
        fs::create_dir_all(dir.path().join("assets")).unwrap();
        let payload = b"\x7fELF native code mentioning com/example/Foo".repeat(8);
        let compressed = zstd::encode_all(&payload[..], 3).unwrap();
        fs::write(dir.path().join("assets/libs.zstd"), compressed).unwrap();

        let manager = LibraryManager::enter(dir.path()).unwrap();
        let scratch = manager.scratch_dir().unwrap().to_path_buf();
        // lib/ already existed, so only the scratch subdirectory is owned
        assert_eq!(scratch, dir.path().join(EXTRACTED_LIBS_DIR));
        assert_eq!(
            fs::read(dir.path().join(EXTRACTED_LIBS_DIR).join("lib_0.so")).unwrap(),
            payload
        );

        drop(manager);
        assert!(!scratch.exists());
        assert!(dir.path().join("lib/arm64-v8a").is_dir());
    }

    #[test]
    fn test_corrupt_blob_is_fatal_and_cleaned() {
        if which::which("zstd").is_err() {
            eprintln!("zstd not installed, skipping");
            return;
        }
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("libs.zstd"), b"not zstd at all").unwrap();

        let err = LibraryManager::enter(dir.path()).unwrap_err();

        assert!(matches!(err, PackError::ToolFailed { .. }));
        assert!(!dir.path().join("lib").exists());
    }
}
