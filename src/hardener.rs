use crate::error::{Error, Result};
use nix::{
    errno::Errno,
    mount::{MsFlags, mount},
    sched::{CloneFlags, setns, unshare},
    unistd::{Gid, Uid, execvp, getresgid, getresuid, setresgid, setresuid},
};
use std::{
    convert::Infallible,
    ffi::{CString, OsString},
    os::{fd::AsFd, unix::ffi::OsStringExt},
    path::{Path, PathBuf},
};
use tracing::{debug, error};

/// Enters a fresh mount namespace and stops mount events from leaking back
/// to the host.
pub fn enter_private_mount_namespace() -> Result<()> {
    unshare(CloneFlags::CLONE_NEWNS).map_err(|errno| Error::sys("unshare", "CLONE_NEWNS", errno))?;
    set_mounts_slave_recursive()
}

/// Recursively marks `/` as a *slave* so propagation only flows from the host
/// into this namespace.
pub fn set_mounts_slave_recursive() -> Result<()> {
    let flags = MsFlags::MS_REC | MsFlags::MS_SLAVE | MsFlags::MS_SILENT;
    mount::<str, str, str, str>(None, "/", None, flags, None)
        .map_err(|errno| Error::sys("mount", "/", errno))
}

/// Switches the calling process into the mount namespace behind `fd`.
pub fn join_mount_namespace<Fd: AsFd>(fd: Fd) -> Result<()> {
    setns(fd, CloneFlags::CLONE_NEWNS).map_err(|errno| Error::sys("setns", "CLONE_NEWNS", errno))
}

/// Permanently drops to `uid`/`gid`: real, effective and saved IDs alike.
///
/// The group goes first, while the process still has the privilege to change
/// it. Afterwards regaining root must be impossible.
pub fn drop_privileges(uid: Uid, gid: Gid) -> Result<()> {
    setresgid(gid, gid, gid).map_err(|errno| Error::sys("setresgid", gid.to_string(), errno))?;
    setresuid(uid, uid, uid).map_err(|errno| Error::sys("setresuid", uid.to_string(), errno))?;

    let ids = getresuid()?;
    let gids = getresgid()?;
    if [ids.real, ids.effective, ids.saved] != [uid; 3]
        || [gids.real, gids.effective, gids.saved] != [gid; 3]
    {
        return Err(Error::sys("setresuid", uid.to_string(), Errno::EPERM));
    }

    if !uid.is_root() && setresuid(Uid::from_raw(0), Uid::from_raw(0), Uid::from_raw(0)).is_ok() {
        return Err(Error::sys("setresuid", "0", Errno::EPERM));
    }

    debug!("dropped privileges to uid={uid} gid={gid}");
    Ok(())
}

/// Working directory to come back to after the namespace switch, if it can
/// still be named (it may have been removed).
pub fn capture_cwd() -> Option<PathBuf> {
    match nix::unistd::getcwd() {
        Ok(cwd) => Some(cwd),
        Err(errno) => {
            debug!("getcwd: {errno}");
            None
        }
    }
}

/// Restores the working directory captured before the namespace switch.
/// Failure is logged only; the program still runs from wherever it is.
pub fn restore_cwd(cwd: Option<&Path>) {
    let Some(cwd) = cwd else {
        return;
    };
    if let Err(errno) = nix::unistd::chdir(cwd) {
        debug!("chdir({}): {errno}", cwd.display());
    }
}

/// Replaces the process image with `argv[0]`, searched in `PATH`.
///
/// Only returns on failure.
pub fn exec(argv: &[OsString]) -> Result<Infallible> {
    let args = argv
        .iter()
        .map(|arg| CString::new(arg.clone().into_vec()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| Error::Protocol("argument contains a NUL byte"))?;

    let Some(program) = args.first() else {
        return Err(Error::Protocol("no program to execute"));
    };

    debug!("execvp({:?})", program);
    let errno = match execvp(program, &args) {
        Ok(never) => match never {},
        Err(errno) => errno,
    };

    let program = Path::new(argv[0].as_os_str());
    error!("execvp({}): {errno}", program.display());
    Err(Error::sys("execvp", program, errno))
}
