//! Descriptor passing over the namespace-private Unix socket.
//!
//! One connection carries exactly one message: a single byte of payload with
//! one `SCM_RIGHTS` descriptor attached. Nothing else is exchanged.

use crate::{
    error::{Error, Result},
    utils::is_fd_valid,
};
use nix::{
    cmsg_space,
    sys::socket::{
        AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags, SockFlag, SockType,
        UnixAddr, connect, recvmsg, sendmsg, socket,
    },
};
use std::{
    ffi::OsStr,
    io::{IoSlice, IoSliceMut},
    os::{
        fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd},
        unix::ffi::OsStrExt,
    },
    path::{Path, PathBuf},
};

/// Size of `sockaddr_un.sun_path` on Linux.
pub const SUN_PATH_MAX: usize = 108;

/// Socket path: a directory plus the fixed socket file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketPath {
    dir: PathBuf,
}

impl SocketPath {
    /// Longest directory that still leaves room for the socket name and NUL.
    pub const DIR_MAX: usize = SUN_PATH_MAX - crate::SOCK_NAME.len() - 1;

    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        if dir.as_os_str().len() > Self::DIR_MAX {
            return Err(Error::SocketPathTooLong(dir));
        }
        Ok(Self { dir })
    }

    /// Socket directory from `explicit`, else `env`, else the compiled-in default.
    pub fn resolve(explicit: Option<PathBuf>, env: Option<&OsStr>) -> Result<Self> {
        let dir = explicit
            .or_else(|| env.filter(|value| !value.is_empty()).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(crate::SOCK_DIR_DEFAULT));
        Self::new(dir)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn socket(&self) -> PathBuf {
        let mut bytes = self.dir.as_os_str().as_bytes().to_vec();
        bytes.extend_from_slice(crate::SOCK_NAME.as_bytes());
        PathBuf::from(OsStr::from_bytes(&bytes))
    }

    pub fn address(&self) -> Result<UnixAddr> {
        Ok(UnixAddr::new(self.socket().as_path())?)
    }
}

pub fn stream_socket() -> Result<OwnedFd> {
    Ok(socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::SOCK_CLOEXEC,
        None,
    )?)
}

/// Sends a duplicate of `fd` to the peer of `conn`.
///
/// The kernel installs a new descriptor in the receiver; the sender's copy
/// stays open and valid.
pub fn send_fd<C: AsFd, F: AsFd>(conn: C, fd: F) -> Result<()> {
    let payload = [b' '];
    let iov = [IoSlice::new(&payload)];
    let fds = [fd.as_fd().as_raw_fd()];
    let cmsgs = [ControlMessage::ScmRights(&fds)];

    sendmsg::<UnixAddr>(
        conn.as_fd().as_raw_fd(),
        &iov,
        &cmsgs,
        MsgFlags::MSG_NOSIGNAL,
        None,
    )?;
    Ok(())
}

/// Receives exactly one descriptor from `conn`.
///
/// A message without a well-formed `SCM_RIGHTS` header is a protocol error;
/// it is never mistaken for descriptor 0.
pub fn recv_fd<C: AsFd>(conn: C) -> Result<OwnedFd> {
    let mut payload = [0u8; 1];
    let mut iov = [IoSliceMut::new(&mut payload)];
    let mut space = cmsg_space!(RawFd);

    let msg = recvmsg::<UnixAddr>(
        conn.as_fd().as_raw_fd(),
        &mut iov,
        Some(&mut space),
        MsgFlags::MSG_CMSG_CLOEXEC,
    )?;

    if msg.bytes == 0 {
        return Err(Error::Protocol("connection closed before a descriptor arrived"));
    }

    if msg.flags.contains(MsgFlags::MSG_CTRUNC) {
        return Err(Error::Protocol("ancillary data truncated"));
    }

    let mut received: Vec<OwnedFd> = Vec::new();
    for cmsg in msg.cmsgs()? {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            // SAFETY: SCM_RIGHTS descriptors are freshly installed in this process and owned by nobody else.
            received.extend(fds.into_iter().map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }));
        }
    }

    if received.len() != 1 {
        return Err(Error::Protocol("expected exactly one descriptor"));
    }

    let fd = received.remove(0);
    is_fd_valid(&fd)?;
    Ok(fd)
}

/// Connects to the broker at `path` and receives the namespace descriptor.
pub fn fetch_namespace(path: &SocketPath) -> Result<OwnedFd> {
    let sock = stream_socket()?;
    let addr = path.address()?;

    connect(sock.as_raw_fd(), &addr).map_err(|errno| Error::sys("connect", path.socket(), errno))?;
    recv_fd(&sock)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        fs::File,
        io::Write,
        os::unix::{fs::MetadataExt, net::UnixStream},
    };

    #[test]
    fn test_socket_path() -> Result<()> {
        let path = SocketPath::new("/run/voidnsrun")?;
        assert_eq!(path.socket(), PathBuf::from("/run/voidnsrun/sock"));
        Ok(())
    }

    #[test]
    fn test_socket_dir_length_limit() {
        let ok = "d".repeat(SocketPath::DIR_MAX);
        assert!(SocketPath::new(&ok).is_ok());

        let too_long = "d".repeat(SocketPath::DIR_MAX + 1);
        assert!(matches!(
            SocketPath::new(&too_long),
            Err(Error::SocketPathTooLong(_))
        ));
    }

    #[test]
    fn test_resolve_precedence() -> Result<()> {
        let env = OsStr::new("/from/env");

        let path = SocketPath::resolve(Some("/explicit".into()), Some(env))?;
        assert_eq!(path.dir(), Path::new("/explicit"));

        let path = SocketPath::resolve(None, Some(env))?;
        assert_eq!(path.dir(), Path::new("/from/env"));

        let path = SocketPath::resolve(None, None)?;
        assert_eq!(path.dir(), Path::new(crate::SOCK_DIR_DEFAULT));

        let path = SocketPath::resolve(None, Some(OsStr::new("")))?;
        assert_eq!(path.dir(), Path::new(crate::SOCK_DIR_DEFAULT));
        Ok(())
    }

    #[test]
    fn test_send_recv_duplicates_descriptor() -> Result<()> {
        let (a, b) = UnixStream::pair()?;
        let ns = File::open("/proc/self/ns/mnt")?;

        send_fd(&a, &ns)?;
        let received = File::from(recv_fd(&b)?);

        assert_ne!(received.as_raw_fd(), ns.as_raw_fd());
        assert_eq!(received.metadata()?.ino(), ns.metadata()?.ino());

        // The sender's copy is untouched.
        is_fd_valid(&ns)?;
        Ok(())
    }

    #[test]
    fn test_payload_without_descriptor_is_protocol_error() -> Result<()> {
        let (mut a, b) = UnixStream::pair()?;
        a.write_all(b" ")?;

        assert!(matches!(recv_fd(&b), Err(Error::Protocol(_))));
        Ok(())
    }

    #[test]
    fn test_closed_connection_is_protocol_error() -> Result<()> {
        let (a, b) = UnixStream::pair()?;
        drop(a);

        assert!(matches!(recv_fd(&b), Err(Error::Protocol(_))));
        Ok(())
    }

    #[test]
    fn test_fetch_without_broker() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = SocketPath::new(dir.path())?;

        assert!(matches!(
            fetch_namespace(&path),
            Err(Error::Sys { op: "connect", .. })
        ));
        Ok(())
    }
}
