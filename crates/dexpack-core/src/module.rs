//! Application modules: independently packaged code partitions.
//!
//! Detection and the per-module storage format are pluggable through
//! [`ModuleDetector`] and [`ApplicationModule`]. [`AssetModules`] is the
//! default detector: every `assets/<name>/` directory carrying a
//! `metadata.txt` manifest is a module whose dex files sit next to it.
//!
//! ```text
//! assets/feed/metadata.txt   .canary_prefix com.app.feed
//!                            .requires base
//! assets/feed/feed-1.dex
//! assets/feed/feed-2.dex
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::dex::{SECONDARY_DEX_DIR, extract_dex_number};
use crate::error::{PackError, Result};
use crate::fs_utils::{glob_in, move_into};

/// Manifest file that marks a module directory.
pub const MODULE_MANIFEST: &str = "metadata.txt";

const CANARY_PREFIX_KEY: &str = ".canary_prefix";
const REQUIRES_KEY: &str = ".requires";
const LOCATOR_ID_KEY: &str = ".locator_id";

/// A code partition that is unpacked next to the primary dexes and repacked
/// after the transformation step.
pub trait ApplicationModule: std::fmt::Debug {
    /// Module name; also the name of its working directory.
    fn name(&self) -> &str;

    /// Prefix of the module's generated marker classes, when it has one.
    fn canary_prefix(&self) -> Option<&str>;

    /// Move the module's dex files into `store_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the module's files cannot be moved.
    fn unpack(&self, extracted_dir: &Path, store_dir: &Path) -> Result<()>;

    /// Describe the unpacked module for the transformation step.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata file cannot be written.
    fn write_metadata(&self, store_dir: &Path, metadata_path: &Path) -> Result<()>;

    /// Move the transformed dex files from `dex_dir/<name>` back into the
    /// package. `locator_id` is the module's 1-based position in discovery
    /// order.
    ///
    /// # Errors
    ///
    /// Returns an error if any file cannot be moved or rewritten.
    fn repack(
        &self,
        extracted_dir: &Path,
        dex_dir: &Path,
        emit_locators: bool,
        locator_id: u32,
        fast_repackage: bool,
    ) -> Result<()>;
}

/// Finds the application modules of an extracted package.
pub trait ModuleDetector {
    /// Modules in a stable order; the order is kept for the whole run.
    ///
    /// # Errors
    ///
    /// Returns an error if the package cannot be inspected.
    fn detect(&self, extracted_dir: &Path) -> Result<Vec<Box<dyn ApplicationModule>>>;
}

/// What the transformation step learns about a module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleMetadata {
    /// Module name.
    pub name: String,
    /// Canary class prefix, `null` when the module declares none.
    pub canary_prefix: Option<String>,
    /// Names of modules this one depends on.
    pub requires: Vec<String>,
    /// Unpacked dex files, in ordering-number order.
    pub files: Vec<PathBuf>,
}

/// Default detector for `assets/<name>/metadata.txt` modules.
#[derive(Debug, Default, Clone, Copy)]
pub struct AssetModules;

impl ModuleDetector for AssetModules {
    fn detect(&self, extracted_dir: &Path) -> Result<Vec<Box<dyn ApplicationModule>>> {
        let assets = extracted_dir.join("assets");
        if !assets.is_dir() {
            return Ok(Vec::new());
        }
        let skip = extracted_dir.join(SECONDARY_DEX_DIR);

        let mut modules: Vec<Box<dyn ApplicationModule>> = Vec::new();
        for manifest in glob_in(&assets, &format!("*/{MODULE_MANIFEST}"))? {
            let Some(dir) = manifest.parent() else {
                continue;
            };
            if dir == skip || !manifest.is_file() {
                continue;
            }
            modules.push(Box::new(AssetModule::load(dir)?));
        }
        Ok(modules)
    }
}

/// A module stored under `assets/<name>/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetModule {
    name: String,
    canary_prefix: Option<String>,
    requires: Vec<String>,
}

impl AssetModule {
    /// Read the module manifest in `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory has no usable name or the manifest
    /// cannot be read.
    pub fn load(dir: &Path) -> Result<Self> {
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| PackError::Invalid(format!("bad module dir {}", dir.display())))?;
        let manifest_path = dir.join(MODULE_MANIFEST);
        let manifest =
            fs::read_to_string(&manifest_path).map_err(|e| PackError::file(&manifest_path, e))?;

        let mut canary_prefix = None;
        let mut requires = Vec::new();
        for line in manifest.lines() {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some(CANARY_PREFIX_KEY), Some(prefix)) => canary_prefix = Some(prefix.to_string()),
                (Some(REQUIRES_KEY), Some(dep)) => requires.push(dep.to_string()),
                _ => {}
            }
        }

        Ok(Self {
            name,
            canary_prefix,
            requires,
        })
    }

    fn module_dir(&self, extracted_dir: &Path) -> PathBuf {
        extracted_dir.join("assets").join(&self.name)
    }
}

impl ApplicationModule for AssetModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn canary_prefix(&self) -> Option<&str> {
        self.canary_prefix.as_deref()
    }

    fn unpack(&self, extracted_dir: &Path, store_dir: &Path) -> Result<()> {
        for dex in ordered_dexes(&self.module_dir(extracted_dir))? {
            move_into(&dex, store_dir)?;
        }
        Ok(())
    }

    fn write_metadata(&self, store_dir: &Path, metadata_path: &Path) -> Result<()> {
        let metadata = ModuleMetadata {
            name: self.name.clone(),
            canary_prefix: self.canary_prefix.clone(),
            requires: self.requires.clone(),
            files: ordered_dexes(store_dir)?,
        };
        let json = serde_json::to_string_pretty(&metadata)?;
        fs::write(metadata_path, json).map_err(|e| PackError::file(metadata_path, e))
    }

    fn repack(
        &self,
        extracted_dir: &Path,
        dex_dir: &Path,
        emit_locators: bool,
        locator_id: u32,
        _fast_repackage: bool,
    ) -> Result<()> {
        let module_dir = self.module_dir(extracted_dir);
        for dex in ordered_dexes(&dex_dir.join(&self.name))? {
            move_into(&dex, &module_dir)?;
        }

        let manifest_path = module_dir.join(MODULE_MANIFEST);
        let manifest =
            fs::read_to_string(&manifest_path).map_err(|e| PackError::file(&manifest_path, e))?;
        let rewritten = with_locator_id(&manifest, emit_locators.then_some(locator_id));
        if rewritten == manifest {
            return Ok(());
        }
        fs::write(&manifest_path, rewritten).map_err(|e| PackError::file(&manifest_path, e))
    }
}

/// `manifest` with every `.locator_id` line removed and, when `locator_id` is
/// set, a fresh one appended. Other lines keep their exact bytes, line
/// endings included.
fn with_locator_id(manifest: &str, locator_id: Option<u32>) -> String {
    let mut rewritten: String = manifest
        .split_inclusive('\n')
        .filter(|l| l.split_whitespace().next() != Some(LOCATOR_ID_KEY))
        .collect();
    if let Some(id) = locator_id {
        let eol = if manifest.contains("\r\n") { "\r\n" } else { "\n" };
        if !rewritten.is_empty() && !rewritten.ends_with('\n') {
            rewritten.push_str(eol);
        }
        rewritten.push_str(&format!("{LOCATOR_ID_KEY} {id}{eol}"));
    }
    rewritten
}

/// Module dexes in `dir`, ordered by number; an unnumbered name sorts first.
fn ordered_dexes(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut dexes: Vec<_> = glob_in(dir, "*.dex")?
        .into_iter()
        .map(|p| (extract_dex_number(&p).ok(), p))
        .collect();
    dexes.sort_by_key(|(n, _)| *n);
    Ok(dexes.into_iter().map(|(_, p)| p).collect())
}
