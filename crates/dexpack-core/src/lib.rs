//! Extract, unpack and repack pipeline for Android application packages.
//!
//! A run unzips an `.apk`/`.aab`, moves its dexes and application modules
//! into working directories, expands compressed native-library blobs, hands
//! everything to a transformation step and then reverses each step to write
//! a deterministically ordered package. See [`pipeline::run`].

pub mod archive;
pub mod config;
pub mod dex;
pub mod error;
pub mod fs_utils;
pub mod libs;
pub mod module;
pub mod pipeline;
pub mod sign;
pub mod tempdirs;
pub mod transform;
pub mod unpack;

pub use error::{PackError, Result, StageExt};
pub use module::{ApplicationModule, AssetModules, ModuleDetector};
pub use pipeline::{PipelineOptions, RunReport, run};
pub use transform::{ExternalTransform, NoTransform, Transform, TransformContext};
pub use unpack::RepackOptions;
