//! One extract, unpack, transform, repack run.
//!
//! Stages nest like scopes: the archive is opened first and closed last, the
//! dex/module unpack wraps the library expansion, and the transformation step
//! sits in the middle. Any failure unwinds without reaching the repack stages,
//! so a failed run never writes an output package.

use std::path::PathBuf;

use crate::archive::{ExtractedArchive, remove_signature_files};
use crate::dex::DexMode;
use crate::error::{PackError, Result, StageExt};
use crate::libs::LibraryManager;
use crate::module::ModuleDetector;
use crate::sign::{SigningConfig, sign_apk};
use crate::tempdirs::{TempDirs, with_temp_cleanup};
use crate::transform::{Transform, TransformContext};
use crate::unpack::{RepackOptions, UnpackManager};

/// Inputs for [`run`].
#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    /// Package to read (`.apk` or `.aab`).
    pub input: PathBuf,
    /// Package to write; replaced if it exists.
    pub output: PathBuf,
    /// Repack switches.
    pub repack: RepackOptions,
    /// Keep temporary directories.
    pub debug: bool,
    /// Remove temporary directories even after a failure.
    pub always_clean: bool,
    /// Sign the output when set.
    pub signing: Option<SigningConfig>,
}

/// What a successful run found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    /// Dex layout of the input.
    pub dex_mode: DexMode,
    /// Application modules, in discovery order.
    pub modules: Vec<String>,
    /// Number of native libraries expanded from blobs.
    pub expanded_libs: usize,
}

/// Run the whole pipeline on `options.input`.
///
/// # Errors
///
/// Returns [`PackError::Stage`] naming the first stage that failed.
pub fn run(
    options: &PipelineOptions,
    detector: &dyn ModuleDetector,
    transform: &dyn Transform,
) -> Result<RunReport> {
    if !options.input.is_file() {
        return Err(PackError::Invalid(format!(
            "Input package not found: {}",
            options.input.display()
        )));
    }

    with_temp_cleanup(options.debug, options.always_clean, |temps| {
        run_in(options, detector, transform, temps)
    })
}

fn run_in(
    options: &PipelineOptions,
    detector: &dyn ModuleDetector,
    transform: &dyn Transform,
    temps: &mut TempDirs,
) -> Result<RunReport> {
    let extracted_dir = temps.make(".extracted_apk").stage("creating work directories")?;
    let dex_dir = temps.make(".dexen").stage("creating work directories")?;

    let archive = ExtractedArchive::open(&options.input, &extracted_dir).stage("extracting")?;

    let (unpacked, metadata) = UnpackManager::enter(
        &options.input,
        &extracted_dir,
        &dex_dir,
        temps,
        detector,
        options.repack,
    )
    .stage("unpacking dex files")?;

    let expanded_libs = {
        let libs = LibraryManager::enter(&extracted_dir).stage("expanding native libraries")?;
        let ctx = TransformContext {
            extracted_dir: &extracted_dir,
            dex_dir: &dex_dir,
            module_metadata: &metadata,
            extracted_libs: libs.extracted_libs(),
        };
        transform.run(&ctx).stage("transforming")?;
        libs.extracted_libs().len()
    };

    let report = RunReport {
        dex_mode: unpacked.dex_mode(),
        modules: unpacked.module_names().map(str::to_string).collect(),
        expanded_libs,
    };

    unpacked.exit().stage("repacking dex files")?;
    remove_signature_files(&extracted_dir).stage("removing signature files")?;
    archive.close(&options.output).stage("writing output")?;

    if let Some(signing) = &options.signing {
        sign_apk(signing, &options.output).stage("signing")?;
    }

    tracing::info!("Wrote {}", options.output.display());
    Ok(report)
}
