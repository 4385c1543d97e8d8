//! Dex discovery and sequencing.
//!
//! A dex directory holds exactly one primary (`classes.dex`) and any number of
//! secondaries. Secondaries are ordered by the number embedded in their name:
//! the digits after `classes` (`classes2.dex`) or after the last hyphen of a
//! prefix (`secondary-3.dex`).

mod mode;

pub use mode::{DexMode, SECONDARY_DEX_DIR, SECONDARY_METADATA, UnpackedDexes};

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{PackError, Result};
use crate::fs_utils::{create_dir, glob_in, move_into};

/// File name of the primary dex.
pub const PRIMARY_DEX: &str = "classes.dex";

static DEX_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(classes|.*-)(\d+)").expect("valid dex number regex"));

/// Ordering number of a secondary dex.
///
/// # Errors
///
/// Returns [`PackError::BadSecondaryDexName`] when the file name has no digits
/// after `classes` or a hyphen.
pub fn extract_dex_number(dex_path: &Path) -> Result<u64> {
    let name = dex_path
        .file_name()
        .map(|n| n.to_string_lossy())
        .unwrap_or_default();
    DEX_NUMBER
        .captures(&name)
        .and_then(|caps| caps.get(2))
        .and_then(|m| m.as_str().parse().ok())
        .ok_or_else(|| PackError::BadSecondaryDexName(dex_path.to_path_buf()))
}

/// The dexes in `dir`, primary first, then secondaries by ordering number.
///
/// # Errors
///
/// Returns [`PackError::MissingPrimaryDex`] if `dir/classes.dex` is not a file,
/// or [`PackError::BadSecondaryDexName`] for an unnumbered secondary.
pub fn dex_glob(dir: &Path) -> Result<Vec<PathBuf>> {
    let primary = dir.join(PRIMARY_DEX);
    if !primary.is_file() {
        return Err(PackError::MissingPrimaryDex(dir.to_path_buf()));
    }

    let mut secondaries = glob_in(dir, "*.dex")?
        .into_iter()
        .filter(|p| *p != primary)
        .map(|p| extract_dex_number(&p).map(|n| (n, p)))
        .collect::<Result<Vec<_>>>()?;
    // stable: equal numbers keep name order
    secondaries.sort_by_key(|(n, _)| *n);

    let mut dexes = Vec::with_capacity(secondaries.len() + 1);
    dexes.push(primary);
    dexes.extend(secondaries.into_iter().map(|(_, p)| p));
    Ok(dexes)
}

/// Move each dex into its own fresh directory `root/dex<i>/` so a per-dex
/// step can process it in isolation. Returns the new paths, in input order.
///
/// # Errors
///
/// Returns an error if a directory already exists or a move fails.
pub fn move_dexen_to_directories(root: &Path, dex_paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut moved = Vec::with_capacity(dex_paths.len());
    for (idx, dex_path) in dex_paths.iter().enumerate() {
        let dir = root.join(format!("dex{idx}"));
        create_dir(&dir)?;
        moved.push(move_into(dex_path, &dir)?);
    }
    Ok(moved)
}

/// Where the dex files of an extracted package live: `base/dex` for bundles
/// (`.aab`), the tree root for everything else.
pub fn dex_file_path(input_archive: &Path, extracted_dir: &Path) -> PathBuf {
    let is_bundle = input_archive
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("aab"));
    if is_bundle {
        extracted_dir.join("base").join("dex")
    } else {
        extracted_dir.to_path_buf()
    }
}
