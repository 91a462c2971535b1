pub mod config;
pub mod copy;
pub mod error;
pub mod image;
pub mod import;
pub mod mount;
pub mod normalize;
pub mod partition;
pub mod select;
pub mod source;
pub mod system_check;
pub mod tarball;

use std::ffi::CString;
use std::path::PathBuf;

use anyhow::{bail, Result};

pub use error::ImportError;

pub struct SudoUser {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: PathBuf,
}

/// Returns info about the real user behind `sudo`, if applicable.
///
/// Looks up `SUDO_USER` in the environment. Returns `None` if the variable
/// is unset, empty, or set to "root" (running `sudo` as root is a no-op).
pub fn sudo_user() -> Option<SudoUser> {
    let name = std::env::var("SUDO_USER").ok()?;
    if name.is_empty() || name == "root" {
        return None;
    }
    let c_name = CString::new(name.as_bytes()).ok()?;
    let pw = unsafe { libc::getpwnam(c_name.as_ptr()) };
    if pw.is_null() {
        return None;
    }
    let home = unsafe { std::ffi::CStr::from_ptr((*pw).pw_dir) }
        .to_str()
        .ok()?;
    Some(SudoUser {
        name,
        uid: unsafe { (*pw).pw_uid },
        gid: unsafe { (*pw).pw_gid },
        home: PathBuf::from(home),
    })
}

pub fn is_privileged() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Check that `name` can be used as a directory name under the strata dir.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("stratum name cannot be empty");
    }
    if name == "." || name == ".." {
        bail!("stratum name cannot be '{name}'");
    }
    let first = name.as_bytes()[0];
    if !first.is_ascii_alphanumeric() {
        bail!("stratum name must start with a letter or digit");
    }
    for ch in name.chars() {
        if !ch.is_ascii_alphanumeric() && ch != '-' && ch != '_' && ch != '.' {
            bail!("stratum name may only contain letters, digits, '-', '_', and '.'");
        }
    }
    Ok(())
}
