//! The import pipeline: from a source path to a populated stratum directory.
//!
//! Stages run strictly in order:
//!
//! ```text
//! Initializing -> Classifying -> Materializing -> Normalizing -> CleaningUp -> Done
//! ```
//!
//! The destination `{strata_dir}/{name}` is created up front, with the
//! working area (`.stratum-import`) inside it for the raw image and the
//! scratch mount point. On success only the working area is removed. On
//! any failure the whole destination is removed, so an aborted import
//! never leaves a half-populated stratum behind. A run killed from the
//! outside can still leave one; that is not recovered automatically.

use std::ffi::OsStr;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::config::Config;
use crate::copy::{copy_children, remove_tree};
use crate::image::{self, ConvertImage, QemuImg};
use crate::mount::{is_mount_point, LoopMount, MountPartition};
use crate::normalize::normalize;
use crate::partition::{Fdisk, ReadPartitionTable};
use crate::source::{classify, SourceKind};
use crate::{tarball, validate_name};

/// Working area created directly under the destination.
pub const WORK_DIR_NAME: &str = ".stratum-import";

/// The external capabilities the pipeline drives.
pub struct Tools {
    pub converter: Box<dyn ConvertImage>,
    pub inspector: Box<dyn ReadPartitionTable>,
    pub mounter: Box<dyn MountPartition>,
}

impl Tools {
    pub fn from_config(config: &Config) -> Self {
        Self {
            converter: Box::new(QemuImg::new(config.converter.as_str())),
            inspector: Box::new(Fdisk::new(config.inspector.as_str())),
            mounter: Box::new(LoopMount),
        }
    }
}

/// State of one import run, handed to every stage.
pub struct ImportContext<'a> {
    dest: PathBuf,
    work: PathBuf,
    tools: &'a Tools,
    config: &'a Config,
}

impl<'a> ImportContext<'a> {
    pub fn dest(&self) -> &Path {
        &self.dest
    }

    pub fn work(&self) -> &Path {
        &self.work
    }

    pub fn tools(&self) -> &'a Tools {
        self.tools
    }

    pub fn mount_backoff(&self) -> Duration {
        self.config.mount_backoff()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Initializing,
    Classifying,
    Materializing,
    Normalizing,
    CleaningUp,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Initializing => "initializing",
            Stage::Classifying => "classifying",
            Stage::Materializing => "materializing",
            Stage::Normalizing => "normalizing",
            Stage::CleaningUp => "cleaning up",
            Stage::Done => "done",
        };
        f.write_str(s)
    }
}

struct Pipeline<'a> {
    ctx: ImportContext<'a>,
    stage: Stage,
}

impl<'a> Pipeline<'a> {
    fn enter(&mut self, stage: Stage) {
        log::debug!("{} -> {}", self.stage, stage);
        self.stage = stage;
    }

    /// Create the working area inside the freshly created destination.
    fn initialize(&mut self) -> Result<()> {
        fs::create_dir(&self.ctx.work)
            .with_context(|| format!("failed to create {}", self.ctx.work.display()))?;
        Ok(())
    }

    fn ingest(&mut self, source: &Path) -> Result<()> {
        self.enter(Stage::Classifying);
        let source = classify(source)?;
        log::debug!("source {} is a {:?}", source.path().display(), source.kind());

        self.enter(Stage::Materializing);
        match source.kind() {
            SourceKind::Directory => {
                log::info!("copying {} -> {}", source.path().display(), self.ctx.dest.display());
                // A leftover working area in the source would land on ours.
                copy_children(
                    source.path(),
                    &self.ctx.dest,
                    &[OsStr::new(WORK_DIR_NAME)],
                    |i, total, name| log::info!("copied {i}/{total}: {}", name.to_string_lossy()),
                )?;
            }
            SourceKind::Tarball => tarball::extract(source.path(), &self.ctx.dest)?,
            SourceKind::DiskImage => image::materialize(&self.ctx, source.path())?,
        }

        self.enter(Stage::Normalizing);
        normalize(
            &self.ctx.dest,
            &self.ctx.config.wrapper_dir,
            &[OsStr::new(WORK_DIR_NAME)],
        )?;
        Ok(())
    }

    /// Remove `dir`, refusing to descend into a filesystem still mounted
    /// inside it.
    fn remove_checked(&self, dir: &Path) -> Result<()> {
        let mount_dir = self.ctx.work.join("mount");
        if is_mount_point(&mount_dir) {
            log::debug!("{} is still mounted; unmounting", mount_dir.display());
            self.ctx.tools.mounter.unmount(&mount_dir)?;
            if is_mount_point(&mount_dir) {
                bail!(
                    "refusing to remove {}: {} is still mounted",
                    dir.display(),
                    mount_dir.display()
                );
            }
        }
        remove_tree(dir)
    }

    fn finish(&mut self) -> Result<()> {
        self.enter(Stage::CleaningUp);
        self.remove_checked(&self.ctx.work)?;
        self.enter(Stage::Done);
        Ok(())
    }

    /// Roll back after `err`, returning the error to report.
    fn abort(&mut self, err: anyhow::Error) -> anyhow::Error {
        log::debug!("aborting while {}: {err:#}", self.stage);
        match self.remove_checked(&self.ctx.dest) {
            Ok(()) => {
                log::debug!("removed incomplete stratum {}", self.ctx.dest.display());
                err
            }
            Err(rm) => err.context(format!(
                "additionally failed to remove incomplete stratum {}: {rm:#}",
                self.ctx.dest.display()
            )),
        }
    }
}

/// Canonicalize the longest existing prefix of `path` and append the rest.
fn resolve_existing(path: &Path) -> PathBuf {
    let mut rest = Vec::new();
    let mut cur = path;
    loop {
        if let Ok(resolved) = cur.canonicalize() {
            return rest.iter().rev().fold(resolved, |acc, c| acc.join(c));
        }
        match (cur.parent(), cur.file_name()) {
            (Some(parent), Some(name)) => {
                rest.push(name.to_os_string());
                cur = parent;
            }
            _ => return path.to_path_buf(),
        }
    }
}

/// Validate `name` and return the destination an import would create.
///
/// Fails if the name is illegal, the destination already exists, or
/// `source` is a directory containing the destination.
pub fn destination(config: &Config, name: &str, source: &Path) -> Result<PathBuf> {
    validate_name(name)?;

    let dest = config.strata_dir.join(name);
    if fs::symlink_metadata(&dest).is_ok() {
        bail!("stratum already exists: {}", dest.display());
    }

    if source.is_dir() {
        let source = source
            .canonicalize()
            .with_context(|| format!("failed to resolve {}", source.display()))?;
        if resolve_existing(&dest).starts_with(&source) {
            bail!(
                "source {} contains the destination {}",
                source.display(),
                dest.display()
            );
        }
    }
    Ok(dest)
}

/// Import `source` as the new stratum `name`, returning its path.
///
/// On error nothing is left at the destination.
pub fn run(config: &Config, tools: &Tools, name: &str, source: &Path) -> Result<PathBuf> {
    let dest = destination(config, name, source)?;
    fs::create_dir_all(&config.strata_dir)
        .with_context(|| format!("failed to create {}", config.strata_dir.display()))?;
    import_into(config, tools, dest, source)
}

/// Run the pipeline into `dest`, which this call creates.
fn import_into(config: &Config, tools: &Tools, dest: PathBuf, source: &Path) -> Result<PathBuf> {
    // Fails if `dest` appeared since the pre-check; nothing to roll back then.
    fs::create_dir(&dest).with_context(|| format!("failed to create {}", dest.display()))?;

    let mut pipeline = Pipeline {
        ctx: ImportContext {
            work: dest.join(WORK_DIR_NAME),
            dest: dest.clone(),
            tools,
            config,
        },
        stage: Stage::Initializing,
    };

    let result = pipeline
        .initialize()
        .and_then(|()| pipeline.ingest(source))
        .and_then(|()| pipeline.finish());
    if let Err(e) = result {
        return Err(pipeline.abort(e));
    }

    log::info!("imported {} into {}", source.display(), dest.display());
    Ok(dest)
}
