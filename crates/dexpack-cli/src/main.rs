//! dexpack - unpack an APK/AAB for a bytecode transformation step and repack it

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use dexpack_cli::Cli;
use dexpack_core::{AssetModules, NoTransform, run};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = cli.settings()?;

    let report = match &settings.transform {
        Some(transform) => run(&settings.options, &AssetModules, transform),
        None => run(&settings.options, &AssetModules, &NoTransform),
    }
    .with_context(|| format!("Failed to repack {}", cli.input.display()))?;

    tracing::info!(
        dex_mode = report.dex_mode.name(),
        modules = report.modules.len(),
        expanded_libs = report.expanded_libs,
        "Done"
    );
    Ok(())
}
