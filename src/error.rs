//! Failure kinds surfaced by an import run.
//!
//! Every variant is fatal: the pipeline rolls the destination back and
//! reports the error. Functions in this crate return [`anyhow::Result`]
//! and raise these through it, so callers recover the kind with
//! `err.downcast_ref::<ImportError>()`.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImportError {
    #[error("unrecognized source: {} (expected a directory, tarball, or disk image)", .0.display())]
    UnrecognizedSource(PathBuf),

    #[error("source path does not exist: {}", .0.display())]
    SourceNotFound(PathBuf),

    #[error("{tool} not found; install it with: {hint}")]
    MissingExternalTool { tool: String, hint: String },

    #[error("failed to convert {} to a raw image: {reason}", .image.display())]
    ConversionFailed { image: PathBuf, reason: String },

    #[error("no Linux partitions found in {}", .0.display())]
    NoPartitionsFound(PathBuf),

    #[error(
        "could not determine the root partition ({marked} partitions carry etc/os-release); \
         retry with an image that has a single partition"
    )]
    AmbiguousRootPartition { marked: usize },

    #[error("failed to mount {} at offset {offset}", .image.display())]
    MountFailed { image: PathBuf, offset: u64 },

    #[error("failed to extract {}: {reason}", .archive.display())]
    ExtractFailed { archive: PathBuf, reason: String },

    #[error("failed to copy {}: {reason}", .entry.display())]
    CopyFailed { entry: PathBuf, reason: String },
}
