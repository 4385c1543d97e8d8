//! Errors raised by the packaging pipeline.
//!
//! Every failure is fatal for the run. Stages wrap their failures in
//! [`PackError::Stage`] so the top-level message names where it happened.

use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

/// All failures the pipeline can report.
#[derive(Error, Debug)]
pub enum PackError {
    /// Plain I/O failure without a more specific location.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// I/O failure on a known path.
    #[error("{}: {source}", path.display())]
    File {
        /// Path being read, written or moved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The source archive is unreadable, or the output could not be written.
    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// A directory walk failed part-way.
    #[error("Walk error: {0}")]
    Walk(#[from] walkdir::Error),

    /// A glob pattern could not be evaluated.
    #[error("Glob error: {0}")]
    Glob(String),

    /// A file could not be relocated.
    #[error("Move failed: {0}")]
    Move(#[from] fs_extra::error::Error),

    /// Metadata or config (de)serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The dex directory has no `classes.dex`.
    #[error("No primary dex found in {}", .0.display())]
    MissingPrimaryDex(PathBuf),

    /// A secondary dex file name carries no ordering number.
    #[error("Bad secondary dex name: {}", .0.display())]
    BadSecondaryDexName(PathBuf),

    /// A required external program is not on `PATH`.
    #[error("'{tool}' not found on PATH: {source}")]
    ToolNotFound {
        /// Program name.
        tool: &'static str,
        /// Lookup failure.
        #[source]
        source: which::Error,
    },

    /// An external program exited unsuccessfully.
    #[error("{tool} failed on {} ({status})", path.display())]
    ToolFailed {
        /// Program name.
        tool: String,
        /// Exit status reported by the process.
        status: ExitStatus,
        /// File the tool was operating on.
        path: PathBuf,
    },

    /// A required environment variable is unset.
    #[error("Environment variable {0} is not set")]
    MissingEnv(&'static str),

    /// No versioned build-tools directory exists in the SDK.
    #[error("No versioned build-tools found under {}", .0.display())]
    NoBuildTools(PathBuf),

    /// An application module failed to unpack or repack.
    #[error("module '{name}': {source}")]
    Module {
        /// Module name.
        name: String,
        /// Underlying failure.
        #[source]
        source: Box<PackError>,
    },

    /// A pipeline stage failed.
    #[error("{stage} failed: {source}")]
    Stage {
        /// Human readable stage name.
        stage: &'static str,
        /// Underlying failure.
        #[source]
        source: Box<PackError>,
    },

    /// Invalid configuration or input that fits no other variant.
    #[error("{0}")]
    Invalid(String),
}

impl PackError {
    /// Attach a path to an I/O error.
    pub fn file(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::File {
            path: path.into(),
            source,
        }
    }

    /// Attribute an error to an application module.
    pub fn module(name: &str, source: PackError) -> Self {
        Self::Module {
            name: name.to_string(),
            source: Box::new(source),
        }
    }
}

impl From<glob::PatternError> for PackError {
    fn from(err: glob::PatternError) -> Self {
        Self::Glob(err.to_string())
    }
}

impl From<glob::GlobError> for PackError {
    fn from(err: glob::GlobError) -> Self {
        Self::Glob(err.to_string())
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = PackError> = std::result::Result<T, E>;

/// Label failures with the pipeline stage that produced them.
pub trait StageExt<T> {
    /// Wrap the error, if any, in [`PackError::Stage`].
    ///
    /// # Errors
    ///
    /// Returns the wrapped error when `self` is `Err`.
    fn stage(self, stage: &'static str) -> Result<T>;
}

impl<T, E: Into<PackError>> StageExt<T> for std::result::Result<T, E> {
    fn stage(self, stage: &'static str) -> Result<T> {
        self.map_err(|e| PackError::Stage {
            stage,
            source: Box::new(e.into()),
        })
    }
}
