//! The transformation step run between unpack and repack.
//!
//! The pipeline does not know what the step does; it hands over the
//! extracted tree, the dex directory and the module metadata files and
//! expects the dexes to be where it left them afterwards.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::config::TransformConfig;
use crate::dex::{dex_glob, move_dexen_to_directories};
use crate::error::{PackError, Result};
use crate::fs_utils::{glob_in, move_into};

/// Environment variable holding the extracted package root.
pub const EXTRACTED_DIR_ENV: &str = "DEXPACK_EXTRACTED_DIR";
/// Environment variable holding the dex directory to process.
pub const DEX_DIR_ENV: &str = "DEXPACK_DEX_DIR";
/// Environment variable holding the module metadata files as a path list.
pub const MODULE_METADATA_ENV: &str = "DEXPACK_MODULE_METADATA";

/// What the transformation step gets to see.
#[derive(Debug, Clone, Copy)]
pub struct TransformContext<'a> {
    /// Root of the extracted package.
    pub extracted_dir: &'a Path,
    /// Unpacked dexes; module dexes live in `<dex_dir>/<module>/`.
    pub dex_dir: &'a Path,
    /// One metadata file per module, in discovery order.
    pub module_metadata: &'a [PathBuf],
    /// Native libraries expanded from blobs, if any.
    pub extracted_libs: &'a [PathBuf],
}

/// A transformation step.
pub trait Transform {
    /// Process the unpacked package in place.
    ///
    /// # Errors
    ///
    /// Any error aborts the run before anything is repacked.
    fn run(&self, ctx: &TransformContext<'_>) -> Result<()>;
}

impl<F> Transform for F
where
    F: Fn(&TransformContext<'_>) -> Result<()>,
{
    fn run(&self, ctx: &TransformContext<'_>) -> Result<()> {
        self(ctx)
    }
}

/// Leaves everything untouched; the pipeline then only repacks.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTransform;

impl Transform for NoTransform {
    fn run(&self, _ctx: &TransformContext<'_>) -> Result<()> {
        tracing::info!("No transformation configured, repacking as is");
        Ok(())
    }
}

/// Runs an external program on the unpacked package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalTransform {
    /// Program to execute.
    pub program: PathBuf,
    /// Arguments passed verbatim.
    pub args: Vec<String>,
    /// Run once per top-level dex, each moved into its own directory.
    pub per_dex: bool,
}

impl ExternalTransform {
    /// Build from config; `None` when no program is configured.
    pub fn from_config(config: &TransformConfig) -> Option<Self> {
        config.program.as_ref().map(|program| Self {
            program: program.clone(),
            args: config.args.clone(),
            per_dex: config.per_dex,
        })
    }

    fn invoke(&self, ctx: &TransformContext<'_>, dex_dir: &Path) -> Result<()> {
        let metadata = env::join_paths(ctx.module_metadata)
            .map_err(|e| PackError::Invalid(format!("module metadata path: {e}")))?;

        tracing::info!("Running {} on {}", self.program.display(), dex_dir.display());
        let status = Command::new(&self.program)
            .args(&self.args)
            .env(EXTRACTED_DIR_ENV, ctx.extracted_dir)
            .env(DEX_DIR_ENV, dex_dir)
            .env(MODULE_METADATA_ENV, metadata)
            .status()
            .map_err(|e| PackError::file(&self.program, e))?;

        if !status.success() {
            return Err(PackError::ToolFailed {
                tool: self.program.display().to_string(),
                status,
                path: dex_dir.to_path_buf(),
            });
        }
        Ok(())
    }

    fn run_per_dex(&self, ctx: &TransformContext<'_>) -> Result<()> {
        let dexes = dex_glob(ctx.dex_dir)?;
        let moved = move_dexen_to_directories(ctx.dex_dir, &dexes)?;

        for dex in &moved {
            let Some(dir) = dex.parent() else {
                continue;
            };
            self.invoke(ctx, dir)?;
            for output in glob_in(dir, "*.dex")? {
                move_into(&output, ctx.dex_dir)?;
            }
            fs::remove_dir_all(dir).map_err(|e| PackError::file(dir, e))?;
        }
        Ok(())
    }
}

impl Transform for ExternalTransform {
    fn run(&self, ctx: &TransformContext<'_>) -> Result<()> {
        if self.per_dex {
            self.run_per_dex(ctx)
        } else {
            self.invoke(ctx, ctx.dex_dir)
        }
    }
}
