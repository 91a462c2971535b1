//! Collapsing one superfluous wrapping directory around an imported tree.
//!
//! Two shapes are recognised, in order:
//!
//! 1. A non-empty directory with a fixed single-character name (a common
//!    VM export artifact), whatever else sits next to it.
//! 2. A tree whose only top-level entry is a directory.
//!
//! The wrapper's children are moved up one level and the wrapper removed.
//! Only the tree's shape changes, never file contents.

use std::ffi::{OsStr, OsString};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

fn is_real_dir(path: &Path) -> bool {
    fs::symlink_metadata(path)
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

fn list(dir: &Path, ignore: &[&OsStr]) -> Result<Vec<OsString>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))? {
        let name = entry
            .with_context(|| format!("failed to read entry in {}", dir.display()))?
            .file_name();
        if !ignore.contains(&name.as_os_str()) {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

/// Find the wrapper to collapse, if any.
fn find_wrapper(root: &Path, wrapper_name: &str, ignore: &[&OsStr]) -> Result<Option<OsString>> {
    let named = root.join(wrapper_name);
    if is_real_dir(&named) && !list(&named, &[])?.is_empty() {
        return Ok(Some(OsString::from(wrapper_name)));
    }

    let entries = list(root, ignore)?;
    if let [only] = entries.as_slice() {
        if is_real_dir(&root.join(only)) {
            return Ok(Some(only.clone()));
        }
    }
    Ok(None)
}

/// Pick a name in `root` that does not exist yet.
fn unused_name(root: &Path, base: &OsStr) -> PathBuf {
    let mut n = 0u32;
    loop {
        let mut name = OsString::from(".");
        name.push(base);
        name.push(format!(".hoisting{n}"));
        let candidate = root.join(name);
        if fs::symlink_metadata(&candidate).is_err() {
            return candidate;
        }
        n += 1;
    }
}

fn hoist(root: &Path, wrapper: &OsStr) -> Result<()> {
    // Move the wrapper aside first so a child sharing its name can land.
    let parked = unused_name(root, wrapper);
    fs::rename(root.join(wrapper), &parked).with_context(|| {
        format!(
            "failed to rename {} to {}",
            root.join(wrapper).display(),
            parked.display()
        )
    })?;

    for name in list(&parked, &[])? {
        let from = parked.join(&name);
        let to = root.join(&name);
        if fs::symlink_metadata(&to).is_ok() {
            bail!(
                "cannot move {} up: {} already exists",
                from.display(),
                to.display()
            );
        }
        fs::rename(&from, &to)
            .with_context(|| format!("failed to move {} to {}", from.display(), to.display()))?;
    }

    fs::remove_dir(&parked).with_context(|| format!("failed to remove {}", parked.display()))
}

/// Collapse one wrapping directory in `root` if present.
///
/// Entries named in `ignore` do not count towards "only top-level entry".
/// Returns whether the tree was changed.
pub fn normalize(root: &Path, wrapper_name: &str, ignore: &[&OsStr]) -> Result<bool> {
    let Some(wrapper) = find_wrapper(root, wrapper_name, ignore)? else {
        return Ok(false);
    };
    log::info!(
        "moving contents of wrapper directory {} up",
        root.join(&wrapper).display()
    );
    hoist(root, &wrapper)?;
    Ok(true)
}
