//! Run-scoped temporary directories.
//!
//! The orchestrator owns one [`TempDirs`] per run and hands it to every stage
//! that needs scratch space. Directories are removed once, at the end, and
//! only when the run succeeded (or cleanup is forced); a failed run leaves
//! them behind for inspection. Debug runs never remove them.

use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::error::Result;

/// Temporary directories created during one run.
#[derive(Debug)]
pub struct TempDirs {
    dirs: Vec<TempDir>,
    debug: bool,
}

impl TempDirs {
    /// Create an empty set. In `debug` mode directories are kept on disk.
    pub fn new(debug: bool) -> Self {
        Self {
            dirs: Vec::new(),
            debug,
        }
    }

    /// Create a fresh directory whose name ends with `suffix`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn make(&mut self, suffix: &str) -> Result<PathBuf> {
        let dir = tempfile::Builder::new()
            .prefix("dexpack")
            .suffix(suffix)
            .tempdir()?;
        if self.debug {
            let path = dir.keep();
            tracing::debug!("keeping temp dir {}", path.display());
            return Ok(path);
        }
        let path = dir.path().to_path_buf();
        self.dirs.push(dir);
        Ok(path)
    }

    /// Directories that will be removed by [`finish`](Self::finish).
    pub fn tracked(&self) -> impl Iterator<Item = &Path> {
        self.dirs.iter().map(TempDir::path)
    }

    /// Remove every tracked directory if `clean`, otherwise leave them on disk.
    /// Removal is best effort: failures are logged, not returned.
    pub fn finish(self, clean: bool) {
        for dir in self.dirs {
            if clean {
                let path = dir.path().to_path_buf();
                if let Err(e) = dir.close() {
                    tracing::warn!("failed to remove {}: {e}", path.display());
                }
            } else {
                let path = dir.keep();
                tracing::info!("leaving {} for inspection", path.display());
            }
        }
    }
}

/// Run `f` with a fresh [`TempDirs`], cleaning up afterwards when `f`
/// succeeded or `always_clean` is set.
///
/// # Errors
///
/// Returns whatever `f` returns.
pub fn with_temp_cleanup<T>(
    debug: bool,
    always_clean: bool,
    f: impl FnOnce(&mut TempDirs) -> Result<T>,
) -> Result<T> {
    let mut temps = TempDirs::new(debug);
    let result = f(&mut temps);
    temps.finish(result.is_ok() || always_clean);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PackError;

    #[test]
    fn test_cleanup_on_success() {
        let mut made = PathBuf::new();
        with_temp_cleanup(false, false, |temps| {
            made = temps.make(".work")?;
            assert!(made.is_dir());
            assert!(made.to_string_lossy().ends_with(".work"));
            Ok(())
        })
        .unwrap();
        assert!(!made.exists());
    }

    #[test]
    fn test_failure_keeps_dirs() {
        let mut made = PathBuf::new();
        let res: Result<()> = with_temp_cleanup(false, false, |temps| {
            made = temps.make(".work")?;
            Err(PackError::Invalid("boom".to_string()))
        });
        assert!(res.is_err());
        assert!(made.is_dir());
        std::fs::remove_dir_all(&made).unwrap();
    }

    #[test]
    fn test_always_clean_removes_after_failure() {
        let mut made = PathBuf::new();
        let _ = with_temp_cleanup(false, true, |temps| -> Result<()> {
            made = temps.make(".work")?;
            Err(PackError::Invalid("boom".to_string()))
        });
        assert!(!made.exists());
    }

    #[test]
    fn test_debug_dirs_are_untracked() {
        let mut temps = TempDirs::new(true);
        let made = temps.make(".dbg").unwrap();
        assert_eq!(temps.tracked().count(), 0);
        temps.finish(true);
        assert!(made.is_dir());
        std::fs::remove_dir_all(&made).unwrap();
    }
}
