use crate::error::{Error, Result};
use nix::{
    libc::PATH_MAX,
    sys::stat::{Mode, SFlag, stat},
};
use std::{
    ffi::OsString,
    os::unix::ffi::{OsStrExt, OsStringExt},
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    Missing,
    File,
    Directory,
}

/// Stat-based view of the filesystem used while building and executing a mount plan.
pub trait PathOracle {
    fn exists_as(&self, path: &Path) -> PathKind;
    fn is_executable(&self, path: &Path) -> bool;
}

/// `PathOracle` backed by `stat(2)` on the live filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostPaths;

impl PathOracle for HostPaths {
    fn exists_as(&self, path: &Path) -> PathKind {
        match stat(path) {
            Ok(st) if file_type(st.st_mode) == SFlag::S_IFDIR => PathKind::Directory,
            Ok(_) => PathKind::File,
            Err(_) => PathKind::Missing,
        }
    }

    fn is_executable(&self, path: &Path) -> bool {
        match stat(path) {
            Ok(st) => {
                file_type(st.st_mode) != SFlag::S_IFDIR
                    && Mode::from_bits_truncate(st.st_mode).contains(Mode::S_IXUSR)
            }
            Err(error) => {
                tracing::debug!("stat({}): {error}", path.display());
                false
            }
        }
    }
}

fn file_type(mode: nix::libc::mode_t) -> SFlag {
    SFlag::from_bits_truncate(mode) & SFlag::S_IFMT
}

/// Returns the permission bits (including setuid/setgid/sticky) of `path`.
pub fn permission_bits(path: &Path) -> Result<Mode> {
    let st = stat(path).map_err(|errno| Error::sys("stat", path, errno))?;
    Ok(Mode::from_bits_truncate(st.st_mode & 0o7777))
}

/// Concatenates `prefix` and `target` byte-wise, the way a container root is
/// prepended to an absolute host path.
///
/// Fails instead of truncating when the result would not fit in `PATH_MAX`
/// (including the terminating NUL).
pub fn join_prefixed(prefix: &Path, target: &Path) -> Result<PathBuf> {
    let prefix_bytes = prefix.as_os_str().as_bytes();
    let target_bytes = target.as_os_str().as_bytes();

    if prefix_bytes.len() + target_bytes.len() >= PATH_MAX as usize {
        return Err(Error::PathTooLong {
            prefix: prefix.to_path_buf(),
            target: target.to_path_buf(),
        });
    }

    let mut joined = Vec::with_capacity(prefix_bytes.len() + target_bytes.len());
    joined.extend_from_slice(prefix_bytes);
    joined.extend_from_slice(target_bytes);
    Ok(PathBuf::from(OsString::from_vec(joined)))
}

/// Rejects a standalone path that could not be passed to a syscall.
pub fn ensure_fits(path: &Path) -> Result<()> {
    if path.as_os_str().len() >= PATH_MAX as usize {
        return Err(Error::PathTooLong {
            prefix: path.to_path_buf(),
            target: PathBuf::new(),
        });
    }
    Ok(())
}

/// Root directory of an alternate tree, taken from a flag or the `var`
/// environment variable; it has to exist as a directory.
pub fn resolve_root<O: PathOracle>(
    oracle: &O,
    root: Option<&Path>,
    var: &'static str,
) -> Result<PathBuf> {
    let root = root
        .filter(|root| !root.as_os_str().is_empty())
        .ok_or(Error::MissingEnv(var))?;

    if oracle.exists_as(root) != PathKind::Directory {
        return Err(Error::NotADirectory(root.to_path_buf()));
    }
    Ok(root.to_path_buf())
}

/// Final component of an invocation string, i.e. everything after the last `/`.
pub fn basename(invocation: &Path) -> &[u8] {
    let bytes = invocation.as_os_str().as_bytes();
    match bytes.iter().rposition(|&b| b == b'/') {
        Some(slash) => &bytes[slash + 1..],
        None => bytes,
    }
}
