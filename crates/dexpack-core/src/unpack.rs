//! Unpacks dexes and application modules for the transformation step and
//! packs them back afterwards.

use std::path::{Path, PathBuf};

use crate::dex::{DexMode, UnpackedDexes, dex_file_path};
use crate::error::{PackError, Result};
use crate::fs_utils::create_dir;
use crate::module::{ApplicationModule, ModuleDetector};
use crate::tempdirs::TempDirs;

/// Switches that only affect repacking.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepackOptions {
    /// Ask layouts and modules to emit locator information.
    pub emit_locators: bool,
    /// Skip optional repack work such as manifest hashing.
    pub fast_repackage: bool,
}

/// Dexes and modules moved out of an extracted package.
///
/// Created by [`enter`](Self::enter); [`exit`](Self::exit) must be called once
/// the transformation step succeeded. The discovered modules are kept so
/// repacking visits them in exactly the order they were unpacked.
#[derive(Debug)]
pub struct UnpackManager {
    dex_file_path: PathBuf,
    extracted_dir: PathBuf,
    dex_dir: PathBuf,
    dex_mode: DexMode,
    unpacked_dexes: UnpackedDexes,
    modules: Vec<Box<dyn ApplicationModule>>,
    options: RepackOptions,
}

impl UnpackManager {
    /// Move the package's dexes into `dex_dir`, unpack every detected module
    /// into `dex_dir/<module>`, and write one metadata file per module.
    ///
    /// Returns the manager and the metadata paths, in discovery order.
    ///
    /// # Errors
    ///
    /// Returns an error if the dex layout is invalid, detection fails, or a
    /// module cannot be unpacked.
    pub fn enter(
        input_archive: &Path,
        extracted_dir: &Path,
        dex_dir: &Path,
        temps: &mut TempDirs,
        detector: &dyn ModuleDetector,
        options: RepackOptions,
    ) -> Result<(Self, Vec<PathBuf>)> {
        let dex_file_path = dex_file_path(input_archive, extracted_dir);
        let dex_mode = DexMode::detect(&dex_file_path);
        tracing::info!("Detected dex mode {}", dex_mode.name());
        tracing::info!("Unpacking dex files");
        let unpacked_dexes = dex_mode.unpack(&dex_file_path, dex_dir)?;

        tracing::info!("Detecting Application Modules");
        let metadata_dir = temps.make(".application_module_metadata")?;
        let modules = detector.detect(extracted_dir)?;

        let mut metadata_files = Vec::with_capacity(modules.len());
        for module in &modules {
            let name = module.name();
            tracing::info!(
                "found module: {name} {}",
                module.canary_prefix().unwrap_or("(no canary prefix)")
            );

            let store_dir = dex_dir.join(name);
            let metadata = metadata_dir.join(format!("{name}.json"));
            create_dir(&store_dir)
                .and_then(|()| module.unpack(extracted_dir, &store_dir))
                .and_then(|()| module.write_metadata(&store_dir, &metadata))
                .map_err(|e| PackError::module(name, e))?;
            metadata_files.push(metadata);
        }

        let manager = Self {
            dex_file_path,
            extracted_dir: extracted_dir.to_path_buf(),
            dex_dir: dex_dir.to_path_buf(),
            dex_mode,
            unpacked_dexes,
            modules,
            options,
        };
        Ok((manager, metadata_files))
    }

    /// Layout chosen at enter time.
    pub fn dex_mode(&self) -> DexMode {
        self.dex_mode
    }

    /// Names of the unpacked modules, in discovery order.
    pub fn module_names(&self) -> impl Iterator<Item = &str> {
        self.modules.iter().map(|m| m.name())
    }

    /// Repack the primary dexes, then every module in discovery order with
    /// locator ids 1, 2, 3, ...
    ///
    /// # Errors
    ///
    /// Returns the first failure; a module failure names the module.
    pub fn exit(self) -> Result<()> {
        let RepackOptions {
            emit_locators,
            fast_repackage,
        } = self.options;
        tracing::info!("Repacking dex files");
        tracing::info!("Emit Locator Strings: {emit_locators}");

        self.dex_mode.repack(
            &self.unpacked_dexes,
            &self.dex_file_path,
            &self.dex_dir,
            emit_locators,
            fast_repackage,
        )?;

        for (locator_id, module) in (1..).zip(&self.modules) {
            let name = module.name();
            tracing::info!("repacking module: {name} with id {locator_id}");
            module
                .repack(
                    &self.extracted_dir,
                    &self.dex_dir,
                    emit_locators,
                    locator_id,
                    fast_repackage,
                )
                .map_err(|e| PackError::module(name, e))?;
        }
        Ok(())
    }
}
