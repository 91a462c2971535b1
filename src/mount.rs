//! Loop-mounting a partition of a raw image by byte offset.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};

use crate::copy::lstat_entry;

/// Mounts the filesystem found at `offset` bytes into `image` on `target`.
pub trait MountPartition {
    fn mount(&self, image: &Path, offset: u64, target: &Path) -> Result<()>;
    fn unmount(&self, target: &Path) -> Result<()>;
}

/// `mount -o loop,ro,offset=N` / `umount`.
#[derive(Default)]
pub struct LoopMount;

impl MountPartition for LoopMount {
    fn mount(&self, image: &Path, offset: u64, target: &Path) -> Result<()> {
        let output = Command::new("mount")
            .args(["-o", &format!("loop,ro,offset={offset}")])
            .arg(image)
            .arg(target)
            .output()
            .context("failed to run mount")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "mount of {} at offset {offset} failed: {}",
                image.display(),
                stderr.trim()
            );
        }
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        let output = Command::new("umount")
            .arg(target)
            .output()
            .context("failed to run umount")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("umount {} failed: {}", target.display(), stderr.trim());
        }
        Ok(())
    }
}

/// RAII guard for a mounted partition. Unmounts on drop.
pub struct MountGuard<'a> {
    mounter: &'a dyn MountPartition,
    path: PathBuf,
    mounted: bool,
}

impl<'a> MountGuard<'a> {
    /// Mount and return a guard, or the mount error.
    pub fn mount(
        mounter: &'a dyn MountPartition,
        image: &Path,
        offset: u64,
        target: &Path,
    ) -> Result<Self> {
        mounter.mount(image, offset, target)?;
        Ok(Self {
            mounter,
            path: target.to_path_buf(),
            mounted: true,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn unmount(&mut self) -> Result<()> {
        if self.mounted {
            self.mounted = false;
            self.mounter.unmount(&self.path)?;
        }
        Ok(())
    }
}

impl Drop for MountGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.unmount() {
            log::warn!("{e:#}");
        }
    }
}

/// True if `path` is the root of a mounted filesystem.
///
/// Compares the device of `path` with that of its parent; a bind mount of
/// a directory onto the same filesystem is not detected.
pub fn is_mount_point(path: &Path) -> bool {
    let Some(parent) = path.parent() else {
        return true;
    };
    let (Ok(stat), Ok(parent_stat)) = (lstat_entry(path), lstat_entry(parent)) else {
        return false;
    };
    stat.st_dev != parent_stat.st_dev
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::fs;

    #[derive(Default)]
    struct Recorder {
        calls: RefCell<Vec<String>>,
        fail_unmount: bool,
    }

    impl MountPartition for Recorder {
        fn mount(&self, _image: &Path, offset: u64, _target: &Path) -> Result<()> {
            self.calls.borrow_mut().push(format!("mount {offset}"));
            Ok(())
        }

        fn unmount(&self, _target: &Path) -> Result<()> {
            self.calls.borrow_mut().push("umount".to_string());
            if self.fail_unmount {
                bail!("target is busy");
            }
            Ok(())
        }
    }

    #[test]
    fn test_guard_unmounts_on_drop() {
        let rec = Recorder::default();
        {
            let guard =
                MountGuard::mount(&rec, Path::new("raw.img"), 1048576, Path::new("/mnt")).unwrap();
            assert_eq!(guard.path(), Path::new("/mnt"));
        }
        assert_eq!(*rec.calls.borrow(), vec!["mount 1048576", "umount"]);
    }

    #[test]
    fn test_guard_unmounts_once() {
        let rec = Recorder::default();
        let mut guard =
            MountGuard::mount(&rec, Path::new("raw.img"), 0, Path::new("/mnt")).unwrap();
        guard.unmount().unwrap();
        drop(guard);
        assert_eq!(*rec.calls.borrow(), vec!["mount 0", "umount"]);
    }

    #[test]
    fn test_guard_drop_tolerates_unmount_failure() {
        let rec = Recorder {
            fail_unmount: true,
            ..Default::default()
        };
        let guard = MountGuard::mount(&rec, Path::new("raw.img"), 0, Path::new("/mnt")).unwrap();
        drop(guard);
        assert_eq!(rec.calls.borrow().len(), 2);
    }

    #[test]
    fn test_is_mount_point() {
        assert!(is_mount_point(Path::new("/")));
        let dir = std::env::temp_dir().join(format!(
            "stratum-import-test-mountpoint-{}-{:?}",
            std::process::id(),
            std::thread::current().id()
        ));
        fs::create_dir_all(&dir).unwrap();
        assert!(!is_mount_point(&dir));
        assert!(!is_mount_point(&dir.join("missing")));
        let _ = fs::remove_dir_all(&dir);
    }
}
