//! Run configuration.
//!
//! The config file is JSON that may carry `#` comments:
//!
//! ```text
//! {
//!   # emit locator ids for module dexes
//!   "emit_locators": true,
//!   "transform": { "program": "/opt/optimizer/bin/optimize", "args": ["-j", "4"] },
//!   "signing": { "keystore": "release.jks", "keypass": "...", "keyalias": "release" }
//! }
//! ```
//!
//! Command-line flags override whatever the file says.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{PackError, Result};
use crate::sign::SigningConfig;

/// Strip a trailing `#` comment from one line. A `#` inside a double-quoted
/// string does not start a comment, and `\"` does not end a string.
pub fn remove_comments_from_line(line: &str) -> &str {
    let mut escaped = false;
    let mut in_quote = false;
    for (idx, c) in line.char_indices() {
        match c {
            '\\' if !escaped => {
                escaped = true;
                continue;
            }
            '"' if !escaped => in_quote = !in_quote,
            '#' if !in_quote => return &line[..idx],
            _ => {}
        }
        escaped = false;
    }
    line
}

/// Strip comments from every line; each output line ends with `\n`.
pub fn remove_comments<'a>(lines: impl IntoIterator<Item = &'a str>) -> String {
    lines
        .into_iter()
        .map(|l| format!("{}\n", remove_comments_from_line(l)))
        .collect()
}

/// External transformation step settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TransformConfig {
    /// Program to run; `None` means the pipeline only unpacks and repacks.
    pub program: Option<PathBuf>,
    /// Extra arguments passed before anything the pipeline adds.
    pub args: Vec<String>,
    /// Run the program once per dex, each in its own directory.
    pub per_dex: bool,
}

/// Everything a run can be configured with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Emit locator information while repacking.
    pub emit_locators: bool,
    /// Skip optional repack work.
    pub fast_repackage: bool,
    /// Keep temporary directories.
    pub debug: bool,
    /// Remove temporary directories even when the run fails.
    pub always_clean: bool,
    /// The external transformation step.
    pub transform: TransformConfig,
    /// Sign the output when present.
    pub signing: Option<SigningConfig>,
}

impl PipelineConfig {
    /// Parse config text, ignoring `#` comments.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid JSON for this schema.
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(&remove_comments(text.lines()))?)
    }

    /// Read and parse a config file. Relative keystore paths are resolved
    /// against the file's directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| PackError::file(path, e))?;
        let mut config = Self::parse(&text)?;
        if let (Some(signing), Some(base)) = (config.signing.as_mut(), path.parent()) {
            if signing.keystore.is_relative() {
                signing.keystore = base.join(&signing.keystore);
            }
        }
        Ok(config)
    }
}
