use std::path::{Path, PathBuf};

use anyhow::{bail, Result};

use crate::ImportError;

/// Find a program in PATH, returning its full path.
///
/// A name containing a `/` is taken as a path and only checked for existence.
pub fn find_program(name: &str) -> Result<PathBuf> {
    if name.contains('/') {
        let path = Path::new(name);
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        bail!("{name} does not exist");
    }
    let path_var = std::env::var("PATH").unwrap_or_default();
    for dir in path_var.split(':') {
        if dir.is_empty() {
            continue;
        }
        let candidate = PathBuf::from(dir).join(name);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    bail!("{name} not found in PATH")
}

/// Check that all required external programs are available.
///
/// `programs` is a slice of `(binary_name, package_hint)` pairs. The first
/// missing program fails with [`ImportError::MissingExternalTool`].
pub fn check_dependencies(programs: &[(&str, &str)]) -> Result<()> {
    for (name, hint) in programs {
        match find_program(name) {
            Ok(path) => log::debug!("found {name}: {}", path.display()),
            Err(_) => bail!(ImportError::MissingExternalTool {
                tool: name.to_string(),
                hint: hint.to_string(),
            }),
        }
    }
    Ok(())
}
