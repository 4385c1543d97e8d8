//! dexpack - unpack an Android package for a bytecode transformation step
//! and repack it.
//!
//! Command-line handling lives here so it can be tested without spawning the
//! binary. Settings come from an optional JSON config file; every flag given
//! on the command line wins over the file.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;

use dexpack_core::config::PipelineConfig;
use dexpack_core::sign::SigningConfig;
use dexpack_core::{ExternalTransform, PipelineOptions, RepackOptions};

/// Command-line arguments.
#[derive(Debug, Parser)]
#[command(name = "dexpack")]
#[command(author, version, about = "Unpack an APK/AAB for a bytecode transformation step and repack it")]
pub struct Cli {
    /// Input package (.apk or .aab)
    pub input: PathBuf,

    /// Output package; replaced if it exists
    #[arg(short, long)]
    pub output: PathBuf,

    /// JSON config file (`#` comments allowed)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Program run on the unpacked package
    #[arg(long, value_name = "PROGRAM")]
    pub transform: Option<PathBuf>,

    /// Arguments for the transformation program (after `--`)
    #[arg(last = true)]
    pub transform_args: Vec<String>,

    /// Emit locator information for dexes and modules
    #[arg(long, overrides_with = "no_emit_locators")]
    pub emit_locators: bool,
    /// Undo --emit-locators
    #[arg(long, overrides_with = "emit_locators", hide = true)]
    pub no_emit_locators: bool,

    /// Skip optional repack work such as dex hashing
    #[arg(long, overrides_with = "no_fast_repackage")]
    pub fast_repackage: bool,
    /// Undo --fast-repackage
    #[arg(long, overrides_with = "fast_repackage", hide = true)]
    pub no_fast_repackage: bool,

    /// Keep temporary directories
    #[arg(long, overrides_with = "no_debug")]
    pub debug: bool,
    /// Undo --debug
    #[arg(long, overrides_with = "debug", hide = true)]
    pub no_debug: bool,

    /// Remove temporary directories even when the run fails
    #[arg(long, overrides_with = "no_always_clean")]
    pub always_clean: bool,
    /// Undo --always-clean
    #[arg(long, overrides_with = "always_clean", hide = true)]
    pub no_always_clean: bool,

    /// Run the transformation program once per dex
    #[arg(long, overrides_with = "no_per_dex")]
    pub per_dex: bool,
    /// Undo --per-dex
    #[arg(long, overrides_with = "per_dex", hide = true)]
    pub no_per_dex: bool,

    /// Keystore used to sign the output
    #[arg(long, requires_all = ["keyalias", "keypass"])]
    pub keystore: Option<PathBuf>,

    /// Alias of the signing key
    #[arg(long, requires = "keystore")]
    pub keyalias: Option<String>,

    /// Keystore password
    #[arg(long, requires = "keystore")]
    pub keypass: Option<String>,
}

/// Resolve a `--x` / `--no-x` pair; `None` when neither was given.
pub fn flag(on: bool, off: bool) -> Option<bool> {
    match (on, off) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    }
}

/// Everything needed to start a run.
#[derive(Debug)]
pub struct Settings {
    /// Pipeline inputs.
    pub options: PipelineOptions,
    /// External transformation step, if one is configured.
    pub transform: Option<ExternalTransform>,
}

impl Cli {
    /// Merge the config file (if any) with the command line.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be loaded or
    /// `--per-dex` is given without a transformation program.
    pub fn settings(&self) -> Result<Settings> {
        let config = match &self.config {
            Some(path) => PipelineConfig::load(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => PipelineConfig::default(),
        };
        self.merge(config)
    }

    fn merge(&self, mut config: PipelineConfig) -> Result<Settings> {
        let repack = RepackOptions {
            emit_locators: flag(self.emit_locators, self.no_emit_locators)
                .unwrap_or(config.emit_locators),
            fast_repackage: flag(self.fast_repackage, self.no_fast_repackage)
                .unwrap_or(config.fast_repackage),
        };

        if let Some(program) = &self.transform {
            config.transform.program = Some(program.clone());
            config.transform.args.clone_from(&self.transform_args);
        } else if !self.transform_args.is_empty() {
            bail!("Transformation arguments given without --transform");
        }
        if let Some(per_dex) = flag(self.per_dex, self.no_per_dex) {
            config.transform.per_dex = per_dex;
        }
        if config.transform.per_dex && config.transform.program.is_none() {
            bail!("--per-dex needs a transformation program");
        }

        let signing = match (&self.keystore, &self.keyalias, &self.keypass) {
            (Some(keystore), Some(keyalias), Some(keypass)) => Some(SigningConfig {
                keystore: keystore.clone(),
                keyalias: keyalias.clone(),
                keypass: keypass.clone(),
            }),
            _ => config.signing.take(),
        };

        Ok(Settings {
            options: PipelineOptions {
                input: self.input.clone(),
                output: self.output.clone(),
                repack,
                debug: flag(self.debug, self.no_debug).unwrap_or(config.debug),
                always_clean: flag(self.always_clean, self.no_always_clean)
                    .unwrap_or(config.always_clean),
                signing,
            },
            transform: ExternalTransform::from_config(&config.transform),
        })
    }
}
