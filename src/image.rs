//! Extracting the root filesystem out of a VM disk image.
//!
//! Steps:
//! 1. Convert the image to raw inside the working area (`qemu-img convert`)
//! 2. Read the partition table and collect candidate offsets
//! 3. Probe the candidates and pick the root partition
//! 4. Mount the chosen partition again on the scratch mount point
//! 5. Copy every top-level entry into the destination
//!
//! Nothing here cleans up a partial copy; the pipeline removes the whole
//! destination on failure.

use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{bail, Context, Result};

use crate::copy::copy_children;
use crate::import::{ImportContext, WORK_DIR_NAME};
use crate::mount::MountGuard;
use crate::partition::read_partitions;
use crate::select::select_root;
use crate::system_check::check_dependencies;
use crate::ImportError;

const RAW_IMAGE_NAME: &str = "raw.img";
const MOUNT_DIR_NAME: &str = "mount";

/// Writes a raw block-device image of `source` to `output`.
pub trait ConvertImage {
    fn convert(&self, source: &Path, output: &Path) -> Result<()>;
}

/// `qemu-img convert -p -O raw`.
pub struct QemuImg {
    program: String,
}

impl QemuImg {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for QemuImg {
    fn default() -> Self {
        Self::new("qemu-img")
    }
}

impl ConvertImage for QemuImg {
    fn convert(&self, source: &Path, output: &Path) -> Result<()> {
        check_dependencies(&[(self.program.as_str(), "apt install qemu-utils")])?;

        // -p draws its own progress bar on the inherited terminal.
        let status = Command::new(&self.program)
            .args(["convert", "-p", "-O", "raw"])
            .arg(source)
            .arg(output)
            .stdin(Stdio::null())
            .status()
            .with_context(|| format!("failed to run {}", self.program))?;
        if !status.success() {
            bail!(ImportError::ConversionFailed {
                image: source.to_path_buf(),
                reason: format!("{} exited with {status}", self.program),
            });
        }
        Ok(())
    }
}

/// Paths inside the working area used while materializing an image.
struct Scratch {
    raw_image: PathBuf,
    mount_dir: PathBuf,
}

impl Scratch {
    fn create(work: &Path) -> Result<Self> {
        let mount_dir = work.join(MOUNT_DIR_NAME);
        fs::create_dir_all(&mount_dir)
            .with_context(|| format!("failed to create mount point {}", mount_dir.display()))?;
        Ok(Self {
            raw_image: work.join(RAW_IMAGE_NAME),
            mount_dir,
        })
    }
}

/// Materialize the root filesystem of disk image `image` into `ctx.dest`.
pub fn materialize(ctx: &ImportContext<'_>, image: &Path) -> Result<()> {
    let scratch = Scratch::create(ctx.work())?;
    let tools = ctx.tools();

    log::info!("converting {} to a raw image", image.display());
    tools.converter.convert(image, &scratch.raw_image)?;
    if !scratch.raw_image.is_file() {
        bail!(ImportError::ConversionFailed {
            image: image.to_path_buf(),
            reason: format!("{} was not created", scratch.raw_image.display()),
        });
    }

    log::info!("finding partitions");
    let candidates = read_partitions(tools.inspector.as_ref(), &scratch.raw_image)?;

    log::info!("finding the root partition among {} candidates", candidates.len());
    let root = select_root(
        tools.mounter.as_ref(),
        &scratch.raw_image,
        &candidates,
        &scratch.mount_dir,
        ctx.mount_backoff(),
    )?
    .candidate();

    let mut guard = MountGuard::mount(
        tools.mounter.as_ref(),
        &scratch.raw_image,
        root.offset(),
        &scratch.mount_dir,
    )
    .map_err(|e| {
        log::debug!("{e:#}");
        ImportError::MountFailed {
            image: scratch.raw_image.clone(),
            offset: root.offset(),
        }
    })?;

    log::info!("copying partition at offset {} into {}", root.offset(), ctx.dest().display());
    copy_children(
        guard.path(),
        ctx.dest(),
        &[OsStr::new(WORK_DIR_NAME)],
        |i, total, name| log::info!("copied {i}/{total}: {}", name.to_string_lossy()),
    )?;

    guard.unmount()?;
    Ok(())
}
