//! Dex packaging layouts.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use super::{PRIMARY_DEX, dex_glob, extract_dex_number};
use crate::error::{PackError, Result};
use crate::fs_utils::{glob_in, move_file, move_into};

/// Directory, relative to the dex path, that holds subdir-mode secondaries.
pub const SECONDARY_DEX_DIR: &str = "assets/secondary-program-dex-jars";

/// Manifest listing the subdir-mode secondaries.
pub const SECONDARY_METADATA: &str = "metadata.txt";

/// How the secondary dexes of a package are laid out.
///
/// Chosen once per run by [`DexMode::detect`]. `unpack` and `repack` are
/// inverses: unpacking and immediately repacking restores every dex file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DexMode {
    /// Native multi-dex: `classes.dex`, `classes2.dex`, ... next to each other.
    Api21,
    /// Secondaries stored as `secondary-N.dex` under
    /// [`SECONDARY_DEX_DIR`] with a [`SECONDARY_METADATA`] manifest.
    Subdir,
}

/// A subdir-mode secondary as it was found in the package.
#[derive(Debug, Clone, PartialEq, Eq)]
struct OriginalSecondary {
    name: String,
    sha256: String,
}

/// What [`DexMode::unpack`] saw, so [`DexMode::repack`] can restore it.
///
/// Empty for [`DexMode::Api21`], which keeps file names as they are.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnpackedDexes {
    secondaries: Vec<OriginalSecondary>,
    manifest: Option<Vec<u8>>,
}

impl UnpackedDexes {
    /// Original secondary file names, in ordering-number order.
    pub fn secondary_names(&self) -> impl Iterator<Item = &str> {
        self.secondaries.iter().map(|s| s.name.as_str())
    }

    /// Name for the `idx`-th secondary on repack: its original name, or the
    /// next free `secondary-N.dex` for dexes the transformation step added.
    fn secondary_name(&self, idx: usize, next_free: &mut u64) -> String {
        if let Some(original) = self.secondaries.get(idx) {
            return original.name.clone();
        }
        let name = format!("secondary-{next_free}.dex");
        *next_free += 1;
        name
    }

    fn first_free_number(&self) -> u64 {
        self.secondaries
            .iter()
            .filter_map(|s| extract_dex_number(Path::new(&s.name)).ok())
            .max()
            .map_or(1, |n| n + 1)
    }

    fn unchanged(&self, hashes: &[String]) -> bool {
        hashes.len() == self.secondaries.len()
            && hashes
                .iter()
                .zip(&self.secondaries)
                .all(|(hash, original)| *hash == original.sha256)
    }
}

impl DexMode {
    /// Inspect the dex path of an extracted package and pick its layout.
    pub fn detect(dex_file_path: &Path) -> Self {
        if dex_file_path
            .join(SECONDARY_DEX_DIR)
            .join(SECONDARY_METADATA)
            .is_file()
        {
            Self::Subdir
        } else {
            Self::Api21
        }
    }

    /// Name used in logs.
    pub fn name(self) -> &'static str {
        match self {
            Self::Api21 => "Api21DexMode",
            Self::Subdir => "SubdirDexMode",
        }
    }

    /// Move the package's dex files into `dex_dir` as a flat
    /// `classes.dex`, `classes2.dex`, ... sequence.
    ///
    /// All names are validated before anything is moved. The returned value
    /// must be handed back to [`repack`](Self::repack).
    ///
    /// # Errors
    ///
    /// Returns an error if the primary dex is missing, a secondary is
    /// unnumbered, or a file cannot be read or moved.
    pub fn unpack(self, dex_file_path: &Path, dex_dir: &Path) -> Result<UnpackedDexes> {
        match self {
            Self::Api21 => {
                for dex in dex_glob(dex_file_path)? {
                    move_into(&dex, dex_dir)?;
                }
                Ok(UnpackedDexes::default())
            }
            Self::Subdir => {
                let primary = dex_file_path.join(PRIMARY_DEX);
                if !primary.is_file() {
                    return Err(PackError::MissingPrimaryDex(dex_file_path.to_path_buf()));
                }
                let secondary_dir = dex_file_path.join(SECONDARY_DEX_DIR);
                let secondaries = ordered_secondaries(&secondary_dir)?;
                let manifest_path = secondary_dir.join(SECONDARY_METADATA);
                let manifest =
                    fs::read(&manifest_path).map_err(|e| PackError::file(&manifest_path, e))?;

                let mut unpacked = UnpackedDexes {
                    secondaries: Vec::with_capacity(secondaries.len()),
                    manifest: Some(manifest),
                };
                for dex in &secondaries {
                    let name = dex
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .ok_or_else(|| PackError::BadSecondaryDexName(dex.clone()))?;
                    unpacked.secondaries.push(OriginalSecondary {
                        name,
                        sha256: sha256_file(dex)?,
                    });
                }

                move_into(&primary, dex_dir)?;
                for (idx, dex) in secondaries.iter().enumerate() {
                    move_file(dex, &dex_dir.join(format!("classes{}.dex", idx + 2)))?;
                }
                Ok(unpacked)
            }
        }
    }

    /// Move the (transformed) dex files in `dex_dir` back into the package.
    ///
    /// In subdir mode every secondary gets its original file name back. When
    /// the secondaries are byte-identical to what was unpacked and no locators
    /// are requested, the original manifest is restored as is. Otherwise it is
    /// regenerated: a `.locators` header, then one line per secondary with its
    /// SHA-256 (or `-` under `fast_repackage`) and canary class.
    ///
    /// # Errors
    ///
    /// Returns an error if `dex_dir` has no primary dex, a secondary is
    /// unnumbered, or a file cannot be moved, hashed or written.
    pub fn repack(
        self,
        unpacked: &UnpackedDexes,
        dex_file_path: &Path,
        dex_dir: &Path,
        emit_locators: bool,
        fast_repackage: bool,
    ) -> Result<()> {
        let dexes = dex_glob(dex_dir)?;
        match self {
            Self::Api21 => {
                for dex in &dexes {
                    move_into(dex, dex_file_path)?;
                }
            }
            Self::Subdir => {
                let (primary, secondaries) = dexes
                    .split_first()
                    .ok_or_else(|| PackError::MissingPrimaryDex(dex_dir.to_path_buf()))?;
                move_into(primary, dex_file_path)?;

                let hashes = secondaries
                    .iter()
                    .map(|dex| sha256_file(dex))
                    .collect::<Result<Vec<_>>>()?;

                let secondary_dir = dex_file_path.join(SECONDARY_DEX_DIR);
                fs::create_dir_all(&secondary_dir)?;
                let mut next_free = unpacked.first_free_number();
                let mut manifest = format!(".locators {emit_locators}\n");
                for (idx, (dex, hash)) in secondaries.iter().zip(&hashes).enumerate() {
                    let name = unpacked.secondary_name(idx, &mut next_free);
                    move_file(dex, &secondary_dir.join(&name))?;

                    let hash = if fast_repackage { "-" } else { hash.as_str() };
                    manifest.push_str(&format!(
                        "{name} {hash} secondary.dex{:02}.Canary\n",
                        idx + 1
                    ));
                }

                let manifest_path = secondary_dir.join(SECONDARY_METADATA);
                let contents = match &unpacked.manifest {
                    Some(original) if !emit_locators && unpacked.unchanged(&hashes) => {
                        original.clone()
                    }
                    _ => manifest.into_bytes(),
                };
                fs::write(&manifest_path, contents)
                    .map_err(|e| PackError::file(&manifest_path, e))?;
            }
        }
        Ok(())
    }
}

/// Secondary dexes of a subdir-mode package, in ordering-number order.
fn ordered_secondaries(secondary_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut numbered = glob_in(secondary_dir, "*.dex")?
        .into_iter()
        .map(|p| extract_dex_number(&p).map(|n| (n, p)))
        .collect::<Result<Vec<_>>>()?;
    numbered.sort_by_key(|(n, _)| *n);
    Ok(numbered.into_iter().map(|(_, p)| p).collect())
}

fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|e| PackError::file(path, e))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}
