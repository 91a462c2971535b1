//! Choosing the root partition among the candidates of a raw image.
//!
//! Each candidate is mounted on the same scratch directory, checked for
//! `etc/os-release`, and unmounted again before the next one is tried, so
//! at most one partition of the image is mounted at any time. The choice
//! is a heuristic: nested installs or chroots that carry their own
//! `etc/os-release` can make it pick the wrong partition.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::mount::{MountGuard, MountPartition};
use crate::partition::PartitionCandidate;
use crate::ImportError;

/// Marker whose presence (file or symlink) suggests a Linux root.
pub const OS_RELEASE_MARKER: &str = "etc/os-release";

/// Outcome of mounting and inspecting one candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountProbe {
    pub candidate: PartitionCandidate,
    pub mounted: bool,
    pub has_os_release: bool,
}

impl MountProbe {
    /// Every candidate that mounted already passed the type filter of the
    /// table reader.
    pub fn is_linux_typed(&self) -> bool {
        self.mounted
    }
}

/// How the root was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// The only candidate that mounted.
    OnlyMountable(PartitionCandidate),
    /// Several mounted; the only one carrying `etc/os-release`.
    Guessed(PartitionCandidate),
}

impl Selection {
    pub fn candidate(&self) -> PartitionCandidate {
        match *self {
            Selection::OnlyMountable(c) | Selection::Guessed(c) => c,
        }
    }
}

fn has_marker(root: &Path) -> bool {
    // symlink_metadata so a link into the host (absolute target) still counts.
    fs::symlink_metadata(root.join(OS_RELEASE_MARKER)).is_ok()
}

fn probe_one(
    mounter: &dyn MountPartition,
    image: &Path,
    candidate: PartitionCandidate,
    mount_point: &Path,
    backoff: Duration,
) -> Result<MountProbe> {
    let offset = candidate.offset();
    let mut guard = match MountGuard::mount(mounter, image, offset, mount_point) {
        Ok(guard) => guard,
        Err(first) => {
            // Loop device churn can briefly report the device as busy.
            log::debug!("{first:#}; retrying in {}ms", backoff.as_millis());
            std::thread::sleep(backoff);
            match MountGuard::mount(mounter, image, offset, mount_point) {
                Ok(guard) => guard,
                Err(e) => {
                    log::debug!("partition at offset {offset} is not mountable: {e:#}");
                    return Ok(MountProbe {
                        candidate,
                        mounted: false,
                        has_os_release: false,
                    });
                }
            }
        }
    };

    let has_os_release = has_marker(guard.path());
    log::debug!(
        "partition at offset {offset} mounted{}",
        if has_os_release { ", has etc/os-release" } else { "" }
    );
    // The next candidate reuses the mount point.
    guard.unmount().with_context(|| {
        format!("failed to unmount partition at offset {offset}; stopping the probe")
    })?;
    Ok(MountProbe {
        candidate,
        mounted: true,
        has_os_release,
    })
}

/// Mount, inspect, and unmount every candidate in order.
///
/// A candidate that cannot be unmounted ends the probe with an error.
pub fn probe_all(
    mounter: &dyn MountPartition,
    image: &Path,
    candidates: &[PartitionCandidate],
    mount_point: &Path,
    backoff: Duration,
) -> Result<Vec<MountProbe>> {
    candidates
        .iter()
        .map(|&c| probe_one(mounter, image, c, mount_point, backoff))
        .collect()
}

/// Apply the selection rule to a finished set of probes.
pub fn choose(image: &Path, probes: &[MountProbe]) -> Result<Selection> {
    let linux: Vec<&MountProbe> = probes.iter().filter(|p| p.is_linux_typed()).collect();
    if linux.is_empty() {
        let offset = probes.first().map(|p| p.candidate.offset()).unwrap_or(0);
        bail!(ImportError::MountFailed {
            image: PathBuf::from(image),
            offset,
        });
    }
    if let [only] = linux.as_slice() {
        return Ok(Selection::OnlyMountable(only.candidate));
    }

    let marked: Vec<&&MountProbe> = linux.iter().filter(|p| p.has_os_release).collect();
    match marked.as_slice() {
        [only] => Ok(Selection::Guessed(only.candidate)),
        _ => bail!(ImportError::AmbiguousRootPartition {
            marked: marked.len(),
        }),
    }
}

/// Probe all candidates and pick the root partition.
///
/// A [`Selection::Guessed`] result has already been reported with `warn!`.
pub fn select_root(
    mounter: &dyn MountPartition,
    image: &Path,
    candidates: &[PartitionCandidate],
    mount_point: &Path,
    backoff: Duration,
) -> Result<Selection> {
    let probes = probe_all(mounter, image, candidates, mount_point, backoff)?;
    let selection = choose(image, &probes)?;
    if let Selection::Guessed(c) = selection {
        log::warn!(
            "found {} Linux partitions; guessing the one at offset {} (it has {OS_RELEASE_MARKER})",
            probes.iter().filter(|p| p.is_linux_typed()).count(),
            c.offset()
        );
    }
    Ok(selection)
}
