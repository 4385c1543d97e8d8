//! Small filesystem helpers shared by the layout modules.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{PackError, Result};

/// Move a file, falling back to copy-and-delete when `rename` cannot cross
/// filesystems (temp dirs frequently live on a different mount).
///
/// # Errors
///
/// Returns an error if neither strategy succeeds.
pub fn move_file(from: &Path, to: &Path) -> Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    let mut options = fs_extra::file::CopyOptions::new();
    options.overwrite = true;
    fs_extra::file::move_file(from, to, &options)?;
    Ok(())
}

/// Move `file` into `dir`, keeping its name. Returns the new path.
///
/// # Errors
///
/// Returns an error if `file` has no name or the move fails.
pub fn move_into(file: &Path, dir: &Path) -> Result<PathBuf> {
    let name = file
        .file_name()
        .ok_or_else(|| PackError::Invalid(format!("not a file: {}", file.display())))?;
    let dest = dir.join(name);
    move_file(file, &dest)?;
    Ok(dest)
}

/// List files in `dir` matching a shell pattern such as `*.dex`, sorted by
/// path. `dir` itself is escaped so bracketed directory names are safe.
///
/// # Errors
///
/// Returns an error if the pattern is invalid or an entry cannot be read.
pub fn glob_in(dir: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let escaped = glob::Pattern::escape(&dir.to_string_lossy());
    let full = format!("{escaped}/{pattern}");
    let mut found = glob::glob(&full)?.collect::<std::result::Result<Vec<_>, _>>()?;
    found.sort();
    Ok(found)
}

/// Create a directory, attaching the path to any error.
pub(crate) fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir(path).map_err(|e| PackError::file(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_move_into_keeps_name() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("a.dex");
        fs::write(&src, b"dex").unwrap();
        let dest_dir = dir.path().join("out");
        fs::create_dir(&dest_dir).unwrap();

        let moved = move_into(&src, &dest_dir).unwrap();

        assert_eq!(moved, dest_dir.join("a.dex"));
        assert!(!src.exists());
        assert_eq!(fs::read(moved).unwrap(), b"dex");
    }

    #[test]
    fn test_glob_in_escapes_directory() {
        let dir = tempdir().unwrap();
        let odd = dir.path().join("odd[1]");
        fs::create_dir(&odd).unwrap();
        fs::write(odd.join("b.dex"), b"").unwrap();
        fs::write(odd.join("a.dex"), b"").unwrap();
        fs::write(odd.join("c.txt"), b"").unwrap();

        let found = glob_in(&odd, "*.dex").unwrap();

        assert_eq!(found, vec![odd.join("a.dex"), odd.join("b.dex")]);
    }
}
