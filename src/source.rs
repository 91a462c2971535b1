//! Source classification by path suffix and file type.
//!
//! No content sniffing happens here: a directory is a directory, anything
//! else is classified by its (case-insensitive) file name suffix.

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};

use crate::ImportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Directory,
    Tarball,
    DiskImage,
}

/// A classified import source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    path: PathBuf,
    kind: SourceKind,
}

impl Source {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }
}

const TARBALL_SUFFIXES: &[&str] = &[
    ".tar", ".tar.gz", ".tgz", ".tar.bz2", ".tbz2", ".tar.xz", ".txz", ".tar.zst", ".tzst",
];

/// Formats `qemu-img` can convert; `.raw` and `.img` are already raw.
const DISK_IMAGE_SUFFIXES: &[&str] = &[
    ".qcow", ".qcow2", ".qcow3", ".vdi", ".vmdk", ".raw", ".img",
];

fn has_suffix(filename: &str, suffixes: &[&str]) -> bool {
    let lower = filename.to_lowercase();
    suffixes.iter().any(|ext| lower.ends_with(ext))
}

/// Classify `path` as a directory, tarball, or disk image.
pub fn classify(path: &Path) -> Result<Source> {
    if path.is_dir() {
        return Ok(Source {
            path: path.to_path_buf(),
            kind: SourceKind::Directory,
        });
    }
    if !path.exists() {
        bail!(ImportError::SourceNotFound(path.to_path_buf()));
    }

    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let kind = if has_suffix(&filename, TARBALL_SUFFIXES) {
        SourceKind::Tarball
    } else if has_suffix(&filename, DISK_IMAGE_SUFFIXES) {
        SourceKind::DiskImage
    } else {
        bail!(ImportError::UnrecognizedSource(path.to_path_buf()));
    };

    Ok(Source {
        path: path.to_path_buf(),
        kind,
    })
}
