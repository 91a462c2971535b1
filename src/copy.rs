//! Attribute-preserving tree copy and removal helpers.
//!
//! Copies preserve ownership, permission bits, nanosecond timestamps, and
//! extended attributes (except `security.selinux`). Symlinks are copied as
//! links, device nodes, FIFOs and sockets are recreated.

use std::ffi::{CString, OsStr};
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs as unix_fs;
use std::path::Path;

use anyhow::{Context, Result};

use crate::ImportError;

/// Copy every entry directly under `src_dir` into the existing `dst_dir`.
///
/// Entries whose names appear in `skip` are left out. `on_entry` is called
/// after each top-level entry with its 1-based index, the total count, and
/// its name. A failing entry aborts the copy with [`ImportError::CopyFailed`].
pub fn copy_children<F>(
    src_dir: &Path,
    dst_dir: &Path,
    skip: &[&OsStr],
    mut on_entry: F,
) -> Result<()>
where
    F: FnMut(usize, usize, &OsStr),
{
    let mut names = Vec::new();
    for entry in fs::read_dir(src_dir)
        .with_context(|| format!("failed to read directory {}", src_dir.display()))?
    {
        let entry =
            entry.with_context(|| format!("failed to read entry in {}", src_dir.display()))?;
        let name = entry.file_name();
        if skip.contains(&name.as_os_str()) {
            continue;
        }
        names.push(name);
    }
    names.sort();

    let total = names.len();
    for (i, name) in names.iter().enumerate() {
        let src_path = src_dir.join(name);
        copy_entry(&src_path, &dst_dir.join(name)).map_err(|e| ImportError::CopyFailed {
            entry: src_path.clone(),
            reason: format!("{e:#}"),
        })?;
        on_entry(i + 1, total, name);
    }
    Ok(())
}

fn copy_tree(src_dir: &Path, dst_dir: &Path) -> Result<()> {
    let entries = fs::read_dir(src_dir)
        .with_context(|| format!("failed to read directory {}", src_dir.display()))?;

    for entry in entries {
        let entry =
            entry.with_context(|| format!("failed to read entry in {}", src_dir.display()))?;
        let src_path = entry.path();
        let dst_path = dst_dir.join(entry.file_name());

        copy_entry(&src_path, &dst_path)
            .with_context(|| format!("failed to copy {}", src_path.display()))?;
    }

    Ok(())
}

/// Recursively copy a single entry of any file type.
pub fn copy_entry(src: &Path, dst: &Path) -> Result<()> {
    let stat = lstat_entry(src)?;
    let mode = stat.st_mode & libc::S_IFMT;

    match mode {
        libc::S_IFDIR => {
            fs::create_dir(dst)
                .with_context(|| format!("failed to create directory {}", dst.display()))?;
            copy_tree(src, dst)?;
            // Metadata last so a read-only directory can still be filled.
            copy_metadata_from_stat(dst, &stat)?;
            copy_xattrs(src, dst)?;
        }
        libc::S_IFREG => {
            fs::copy(src, dst)
                .with_context(|| format!("failed to copy file {}", src.display()))?;
            copy_metadata_from_stat(dst, &stat)?;
            copy_xattrs(src, dst)?;
        }
        libc::S_IFLNK => {
            let target = fs::read_link(src)
                .with_context(|| format!("failed to read symlink {}", src.display()))?;
            unix_fs::symlink(&target, dst)
                .with_context(|| format!("failed to create symlink {}", dst.display()))?;
            copy_metadata_from_stat(dst, &stat)?;
            copy_xattrs(src, dst)?;
        }
        libc::S_IFBLK | libc::S_IFCHR => {
            let c_path = path_to_cstring(dst)?;
            let ret = unsafe { libc::mknod(c_path.as_ptr(), stat.st_mode, stat.st_rdev) };
            if ret != 0 {
                return Err(std::io::Error::last_os_error())
                    .with_context(|| format!("mknod failed for {}", dst.display()));
            }
            copy_metadata_from_stat(dst, &stat)?;
            copy_xattrs(src, dst)?;
        }
        libc::S_IFIFO => {
            let c_path = path_to_cstring(dst)?;
            let ret = unsafe { libc::mkfifo(c_path.as_ptr(), stat.st_mode & 0o7777) };
            if ret != 0 {
                return Err(std::io::Error::last_os_error())
                    .with_context(|| format!("mkfifo failed for {}", dst.display()));
            }
            copy_metadata_from_stat(dst, &stat)?;
            copy_xattrs(src, dst)?;
        }
        libc::S_IFSOCK => {
            let c_path = path_to_cstring(dst)?;
            let ret = unsafe {
                libc::mknod(c_path.as_ptr(), libc::S_IFSOCK | (stat.st_mode & 0o7777), 0)
            };
            if ret != 0 {
                return Err(std::io::Error::last_os_error())
                    .with_context(|| format!("mknod (socket) failed for {}", dst.display()));
            }
            copy_metadata_from_stat(dst, &stat)?;
            copy_xattrs(src, dst)?;
        }
        _ => {
            log::warn!(
                "skipping unknown file type {:o} for {}",
                mode,
                src.display()
            );
        }
    }

    Ok(())
}

fn copy_metadata_from_stat(dst: &Path, stat: &libc::stat) -> Result<()> {
    let c_path = path_to_cstring(dst)?;

    // Ownership. Unprivileged runs can only keep their own ids.
    let ret = unsafe { libc::lchown(c_path.as_ptr(), stat.st_uid, stat.st_gid) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EPERM) || crate::is_privileged() {
            return Err(err).with_context(|| format!("lchown failed for {}", dst.display()));
        }
    }

    // chmod does not apply to symlinks.
    let file_type = stat.st_mode & libc::S_IFMT;
    if file_type != libc::S_IFLNK {
        let ret = unsafe { libc::chmod(c_path.as_ptr(), stat.st_mode & 0o7777) };
        if ret != 0 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("chmod failed for {}", dst.display()));
        }
    }

    let times = [
        libc::timespec {
            tv_sec: stat.st_atime,
            tv_nsec: stat.st_atime_nsec,
        },
        libc::timespec {
            tv_sec: stat.st_mtime,
            tv_nsec: stat.st_mtime_nsec,
        },
    ];
    let ret = unsafe {
        libc::utimensat(
            libc::AT_FDCWD,
            c_path.as_ptr(),
            times.as_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        // ENOTSUP on some filesystems for symlink timestamps.
        if err.raw_os_error() != Some(libc::ENOTSUP) {
            return Err(err).with_context(|| format!("utimensat failed for {}", dst.display()));
        }
    }

    Ok(())
}

fn copy_xattrs(src: &Path, dst: &Path) -> Result<()> {
    let c_src = path_to_cstring(src)?;
    let c_dst = path_to_cstring(dst)?;

    let size = unsafe { libc::llistxattr(c_src.as_ptr(), std::ptr::null_mut(), 0) };
    if size < 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENOTSUP) || err.raw_os_error() == Some(libc::ENODATA)
        {
            return Ok(());
        }
        return Err(err).with_context(|| format!("llistxattr failed for {}", src.display()));
    }
    if size == 0 {
        return Ok(());
    }

    let mut names_buf = vec![0u8; size as usize];
    let size = unsafe {
        libc::llistxattr(
            c_src.as_ptr(),
            names_buf.as_mut_ptr() as *mut libc::c_char,
            names_buf.len(),
        )
    };
    if size < 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("llistxattr failed for {}", src.display()));
    }

    for name_bytes in names_buf[..size as usize].split(|&b| b == 0) {
        if name_bytes.is_empty() || name_bytes.starts_with(b"security.selinux") {
            continue;
        }

        let c_name =
            CString::new(name_bytes).context("xattr name contains interior null byte")?;

        let val_size =
            unsafe { libc::lgetxattr(c_src.as_ptr(), c_name.as_ptr(), std::ptr::null_mut(), 0) };
        if val_size < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENODATA) {
                continue;
            }
            return Err(err).with_context(|| {
                format!(
                    "lgetxattr failed for {} attr {}",
                    src.display(),
                    c_name.to_string_lossy()
                )
            });
        }

        let mut val_buf = vec![0u8; val_size as usize];
        let val_size = unsafe {
            libc::lgetxattr(
                c_src.as_ptr(),
                c_name.as_ptr(),
                val_buf.as_mut_ptr() as *mut libc::c_void,
                val_buf.len(),
            )
        };
        if val_size < 0 {
            return Err(std::io::Error::last_os_error()).with_context(|| {
                format!(
                    "lgetxattr failed for {} attr {}",
                    src.display(),
                    c_name.to_string_lossy()
                )
            });
        }

        let ret = unsafe {
            libc::lsetxattr(
                c_dst.as_ptr(),
                c_name.as_ptr(),
                val_buf.as_ptr() as *const libc::c_void,
                val_size as usize,
                0,
            )
        };
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::ENOTSUP) => return Ok(()),
                // trusted.* and security.* need CAP_SYS_ADMIN.
                Some(libc::EPERM) if !crate::is_privileged() => continue,
                _ => {
                    return Err(err).with_context(|| {
                        format!(
                            "lsetxattr failed for {} attr {}",
                            dst.display(),
                            c_name.to_string_lossy()
                        )
                    })
                }
            }
        }
    }

    Ok(())
}

/// Recursively restore directory permissions so `remove_dir_all` can succeed.
pub fn make_removable(path: &Path) -> std::io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if meta.is_dir() {
        use std::os::unix::fs::PermissionsExt;
        let mode = meta.permissions().mode();
        if mode & 0o700 != 0o700 {
            fs::set_permissions(path, fs::Permissions::from_mode(mode | 0o700))?;
        }
        if let Ok(entries) = fs::read_dir(path) {
            for entry in entries.flatten() {
                let _ = make_removable(&entry.path());
            }
        }
    }
    Ok(())
}

/// Remove a directory tree, tolerating a tree that is already gone.
pub fn remove_tree(path: &Path) -> Result<()> {
    if fs::symlink_metadata(path).is_err() {
        return Ok(());
    }
    let _ = make_removable(path);
    fs::remove_dir_all(path).with_context(|| format!("failed to remove {}", path.display()))
}

pub(crate) fn lstat_entry(path: &Path) -> Result<libc::stat> {
    let c_path = path_to_cstring(path)?;
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::lstat(c_path.as_ptr(), &mut stat) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("lstat failed for {}", path.display()));
    }
    Ok(stat)
}

pub(crate) fn path_to_cstring(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .with_context(|| format!("path contains null byte: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;

    struct TempDir {
        dir: PathBuf,
    }

    impl TempDir {
        fn new(suffix: &str) -> Self {
            let dir = std::env::temp_dir().join(format!(
                "stratum-import-test-copy-{}-{:?}-{suffix}",
                std::process::id(),
                std::thread::current().id()
            ));
            let _ = remove_tree(&dir);
            fs::create_dir_all(dir.join("src")).unwrap();
            fs::create_dir_all(dir.join("dst")).unwrap();
            Self { dir }
        }

        fn src(&self) -> PathBuf {
            self.dir.join("src")
        }

        fn dst(&self) -> PathBuf {
            self.dir.join("dst")
        }
    }

    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = remove_tree(&self.dir);
        }
    }

    fn copy_all(tmp: &TempDir) -> Result<()> {
        copy_children(&tmp.src(), &tmp.dst(), &[], |_, _, _| {})
    }

    #[test]
    fn test_copy_files_and_dirs() {
        let tmp = TempDir::new("basic");
        fs::write(tmp.src().join("hello.txt"), "hello world\n").unwrap();
        fs::create_dir_all(tmp.src().join("etc/default")).unwrap();
        fs::write(tmp.src().join("etc/default/grub"), "GRUB_TIMEOUT=5\n").unwrap();
        fs::create_dir(tmp.src().join("empty")).unwrap();

        copy_all(&tmp).unwrap();

        assert_eq!(
            fs::read_to_string(tmp.dst().join("hello.txt")).unwrap(),
            "hello world\n"
        );
        assert_eq!(
            fs::read_to_string(tmp.dst().join("etc/default/grub")).unwrap(),
            "GRUB_TIMEOUT=5\n"
        );
        assert_eq!(fs::read_dir(tmp.dst().join("empty")).unwrap().count(), 0);
    }

    #[test]
    fn test_copy_preserves_permissions() {
        let tmp = TempDir::new("perms");
        let script = tmp.src().join("script.sh");
        fs::write(&script, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        let secret = tmp.src().join("shadow");
        fs::write(&secret, "root:*:19000::::::\n").unwrap();
        fs::set_permissions(&secret, fs::Permissions::from_mode(0o640)).unwrap();

        copy_all(&tmp).unwrap();

        let meta = fs::metadata(tmp.dst().join("script.sh")).unwrap();
        assert_eq!(meta.permissions().mode() & 0o7777, 0o755);
        let meta = fs::metadata(tmp.dst().join("shadow")).unwrap();
        assert_eq!(meta.permissions().mode() & 0o7777, 0o640);
    }

    #[test]
    fn test_copy_read_only_directory() {
        let tmp = TempDir::new("rodir");
        let ro = tmp.src().join("ro");
        fs::create_dir(&ro).unwrap();
        fs::write(ro.join("inside"), "x").unwrap();
        fs::set_permissions(&ro, fs::Permissions::from_mode(0o555)).unwrap();

        copy_all(&tmp).unwrap();

        assert_eq!(fs::read_to_string(tmp.dst().join("ro/inside")).unwrap(), "x");
        let meta = fs::metadata(tmp.dst().join("ro")).unwrap();
        assert_eq!(meta.permissions().mode() & 0o7777, 0o555);
        fs::set_permissions(&ro, fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn test_copy_preserves_symlinks() {
        let tmp = TempDir::new("symlinks");
        fs::write(tmp.src().join("target.txt"), "target\n").unwrap();
        unix_fs::symlink("target.txt", tmp.src().join("link.txt")).unwrap();
        unix_fs::symlink("/nonexistent", tmp.src().join("dangling")).unwrap();

        copy_all(&tmp).unwrap();

        assert_eq!(
            fs::read_link(tmp.dst().join("link.txt")).unwrap(),
            PathBuf::from("target.txt")
        );
        assert_eq!(
            fs::read_link(tmp.dst().join("dangling")).unwrap(),
            PathBuf::from("/nonexistent")
        );
    }

    #[test]
    fn test_copy_preserves_timestamps() {
        let tmp = TempDir::new("timestamps");
        let file_path = tmp.src().join("file.txt");
        fs::write(&file_path, "data\n").unwrap();

        let times = [
            libc::timespec {
                tv_sec: 1000000000,
                tv_nsec: 0,
            },
            libc::timespec {
                tv_sec: 1000000000,
                tv_nsec: 0,
            },
        ];
        let c_path = path_to_cstring(&file_path).unwrap();
        unsafe {
            libc::utimensat(libc::AT_FDCWD, c_path.as_ptr(), times.as_ptr(), 0);
        }

        copy_all(&tmp).unwrap();

        let dst_stat = lstat_entry(&tmp.dst().join("file.txt")).unwrap();
        assert_eq!(dst_stat.st_mtime, 1000000000);
    }

    #[test]
    fn test_copy_children_skip_and_progress() {
        let tmp = TempDir::new("skip");
        for name in ["bin", "etc", "usr", ".stratum-import"] {
            fs::create_dir(tmp.src().join(name)).unwrap();
        }

        let mut seen: Vec<(usize, usize, OsString)> = Vec::new();
        copy_children(
            &tmp.src(),
            &tmp.dst(),
            &[OsStr::new(".stratum-import")],
            |i, n, name| seen.push((i, n, name.to_os_string())),
        )
        .unwrap();

        assert!(!tmp.dst().join(".stratum-import").exists());
        assert_eq!(
            seen,
            vec![
                (1, 3, OsString::from("bin")),
                (2, 3, OsString::from("etc")),
                (3, 3, OsString::from("usr")),
            ]
        );
    }

    #[test]
    fn test_copy_children_failure_is_copy_failed() {
        let tmp = TempDir::new("fail");
        fs::write(tmp.src().join("taken"), "a").unwrap();
        fs::write(tmp.dst().join("taken"), "b").unwrap();
        fs::create_dir(tmp.src().join("dir")).unwrap();
        fs::create_dir(tmp.dst().join("dir")).unwrap();

        let err = copy_all(&tmp).unwrap_err();
        match err.downcast_ref::<ImportError>() {
            Some(ImportError::CopyFailed { entry, .. }) => {
                assert_eq!(entry, &tmp.src().join("dir"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_remove_tree_unwritable_and_missing() {
        let tmp = TempDir::new("remove");
        let locked = tmp.src().join("locked");
        fs::create_dir(&locked).unwrap();
        fs::write(locked.join("f"), "x").unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o500)).unwrap();

        remove_tree(&tmp.src()).unwrap();
        assert!(!tmp.src().exists());
        remove_tree(&tmp.src()).unwrap();
    }

    #[test]
    fn test_copy_preserves_user_xattrs() {
        let tmp = TempDir::new("xattrs");
        let file_path = tmp.src().join("tagged");
        fs::write(&file_path, "data\n").unwrap();
        let c_path = path_to_cstring(&file_path).unwrap();
        let name = CString::new("user.stratum.origin").unwrap();
        let value = b"debian-12";
        let ret = unsafe {
            libc::lsetxattr(
                c_path.as_ptr(),
                name.as_ptr(),
                value.as_ptr() as *const libc::c_void,
                value.len(),
                0,
            )
        };
        if ret != 0 {
            // tmpfs before 6.6 and some overlay setups reject user.* xattrs.
            eprintln!("skipping: {}", std::io::Error::last_os_error());
            return;
        }

        copy_all(&tmp).unwrap();

        let c_dst = path_to_cstring(&tmp.dst().join("tagged")).unwrap();
        let mut buf = [0u8; 64];
        let len = unsafe {
            libc::lgetxattr(
                c_dst.as_ptr(),
                name.as_ptr(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        assert!(len >= 0, "xattr missing: {}", std::io::Error::last_os_error());
        assert_eq!(&buf[..len as usize], value);
    }

    #[test]
    #[ignore] // Requires CAP_MKNOD (root).
    fn test_copy_preserves_devices() {
        let tmp = TempDir::new("devices");
        let dev_path = tmp.src().join("null");
        let c_path = path_to_cstring(&dev_path).unwrap();
        let dev = libc::makedev(1, 3);
        let ret = unsafe { libc::mknod(c_path.as_ptr(), libc::S_IFCHR | 0o666, dev) };
        assert_eq!(ret, 0, "mknod failed (need root)");

        copy_all(&tmp).unwrap();

        let dst_stat = lstat_entry(&tmp.dst().join("null")).unwrap();
        assert_eq!(dst_stat.st_mode & libc::S_IFMT, libc::S_IFCHR);
        assert_eq!(dst_stat.st_rdev, dev);
    }
}
