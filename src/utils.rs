use crate::error::{Error, Result};
use nix::{
    NixPath,
    errno::Errno,
    fcntl::{FcntlArg, OFlag, fcntl, open},
    libc,
    sys::stat::Mode,
    unistd::{mkdir, unlink},
};
use std::{
    fs::Permissions,
    os::{
        fd::{AsFd, AsRawFd, RawFd},
        unix::fs::PermissionsExt,
    },
    path::Path,
};

/// Checks whether a given FD is valid.
pub fn is_fd_valid<Fd: AsFd>(fd: Fd) -> Result<RawFd> {
    let fd = fd.as_fd();
    fcntl(fd, FcntlArg::F_GETFD).map_err(|_| Error::Protocol("received an invalid descriptor"))?;
    Ok(fd.as_raw_fd())
}

/// Creates a single directory with exactly `mode`, regardless of the umask.
pub fn create_directory(path: &Path, mode: Mode) -> Result<()> {
    mkdir(path, mode).map_err(|errno| Error::sys("mkdir", path, errno))?;

    // mkdir(2) masks the mode with the umask; the mountpoint should mirror its source.
    std::fs::set_permissions(path, Permissions::from_mode(mode.bits()))?;
    Ok(())
}

/// Creates an empty regular file (mode 0700) to bind a single file onto.
pub fn create_placeholder_file(path: &Path) -> Result<()> {
    let flags = OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_WRONLY | OFlag::O_CLOEXEC;
    let fd = open(path, flags, Mode::S_IRWXU).map_err(|errno| Error::sys("creat", path, errno))?;
    drop(fd);
    Ok(())
}

/// Unlinks `path`; a path that is already gone is not an error.
pub fn remove_file(path: &Path) -> Result<()> {
    match unlink(path) {
        Ok(()) | Err(Errno::ENOENT) => Ok(()),
        Err(errno) => Err(Error::sys("unlink", path, errno)),
    }
}

/// Removes an empty directory; a path that is already gone is not an error.
pub fn remove_directory(path: &Path) -> Result<()> {
    // SAFETY: the pointer is a NUL-terminated copy of `path`, valid for the call.
    let res = path.with_nix_path(|cstr| unsafe { libc::rmdir(cstr.as_ptr()) })?;

    match Errno::result(res) {
        Ok(_) | Err(Errno::ENOENT) => Ok(()),
        Err(errno) => Err(Error::sys("rmdir", path, errno)),
    }
}
