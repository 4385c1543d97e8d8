//! Re-signing the repacked package with the SDK's `apksigner`.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

use crate::error::{PackError, Result};

/// Environment variable naming the Android SDK root.
pub const ANDROID_SDK_ENV: &str = "ANDROID_SDK";

static BUILD_TOOLS_VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+\.\d+\.\d+$").expect("valid version regex"));

/// Keystore settings for `apksigner`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SigningConfig {
    /// Path to the keystore; relative to the config file when loaded from one.
    pub keystore: PathBuf,
    /// Keystore password.
    pub keypass: String,
    /// Alias of the signing key.
    pub keyalias: String,
}

/// The newest `build-tools/<x.y.z>` directory of the SDK at `sdk_root`.
/// Only plain `major.minor.patch` names are considered; previews such as
/// `35.0.0-rc1` are ignored.
///
/// # Errors
///
/// Returns an error if `build-tools` cannot be read or holds no versioned
/// directory.
pub fn find_build_tools_in(sdk_root: &Path) -> Result<PathBuf> {
    let build_tools = sdk_root.join("build-tools");
    let entries = fs::read_dir(&build_tools).map_err(|e| PackError::file(&build_tools, e))?;

    entries
        .filter_map(std::result::Result::ok)
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|name| BUILD_TOOLS_VERSION.is_match(name))
        .filter_map(|name| semver::Version::parse(&name).ok().map(|v| (v, name)))
        .max_by(|a, b| a.0.cmp(&b.0))
        .map(|(_, name)| build_tools.join(name))
        .ok_or(PackError::NoBuildTools(build_tools))
}

/// [`find_build_tools_in`] for the SDK named by `$ANDROID_SDK`.
///
/// # Errors
///
/// Returns [`PackError::MissingEnv`] when the variable is unset, otherwise
/// whatever [`find_build_tools_in`] returns.
pub fn find_android_build_tools() -> Result<PathBuf> {
    let sdk = std::env::var_os(ANDROID_SDK_ENV).ok_or(PackError::MissingEnv(ANDROID_SDK_ENV))?;
    find_build_tools_in(Path::new(&sdk))
}

/// Arguments passed to `apksigner` for `apk`.
pub fn apksigner_args(config: &SigningConfig, apk: &Path) -> Vec<String> {
    vec![
        "sign".to_string(),
        "--v1-signing-enabled".to_string(),
        "--v2-signing-enabled".to_string(),
        "--ks".to_string(),
        config.keystore.to_string_lossy().into_owned(),
        "--ks-pass".to_string(),
        format!("pass:{}", config.keypass),
        "--ks-key-alias".to_string(),
        config.keyalias.clone(),
        apk.to_string_lossy().into_owned(),
    ]
}

/// Sign `apk` in place with v1 and v2 signatures.
///
/// The signer's output goes to stderr so stdout stays clean for callers.
///
/// # Errors
///
/// Returns an error if the build tools cannot be located, `apksigner` cannot
/// be started, or it exits unsuccessfully.
pub fn sign_apk(config: &SigningConfig, apk: &Path) -> Result<()> {
    let apksigner = find_android_build_tools()?.join("apksigner");
    tracing::info!("Signing {}", apk.display());

    let status = Command::new(&apksigner)
        .args(apksigner_args(config, apk))
        .stdout(Stdio::from(std::io::stderr()))
        .status()
        .map_err(|e| PackError::file(&apksigner, e))?;

    if !status.success() {
        return Err(PackError::ToolFailed {
            tool: "apksigner".to_string(),
            status,
            path: apk.to_path_buf(),
        });
    }
    Ok(())
}
