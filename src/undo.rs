use crate::{
    UNDO_TOOL_NAME,
    config::UndoConfig,
    context::GlobalContext,
    error::{Error, Result},
    hardener::{capture_cwd, drop_privileges, exec, join_mount_namespace, restore_cwd},
    paths::{HostPaths, PathKind, PathOracle, basename},
    rendezvous::{SocketPath, fetch_namespace},
};
use clap::Parser;
use std::{
    convert::Infallible,
    ffi::{OsStr, OsString},
    path::{Path, PathBuf},
};
use tracing::debug;

/// Where the running executable actually lives.
pub trait SelfExe {
    fn resolve(&self) -> Result<PathBuf>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ProcSelfExe;

impl SelfExe for ProcSelfExe {
    fn resolve(&self) -> Result<PathBuf> {
        let link = Path::new("/proc/self/exe");
        std::fs::read_link(link).map_err(Error::from)
    }
}

#[derive(Debug)]
pub enum InvocationMode {
    /// Called as `voidnsundo`: own flags, then the target program.
    Direct(UndoConfig),
    /// Bind-mounted over some other program: run that program on the host with
    /// the arguments untouched.
    Forwarded(Vec<OsString>),
}

impl InvocationMode {
    /// Picks the mode from the basename of `args[0]`.
    ///
    /// In direct mode `--help`, `--version` and usage errors exit the process.
    pub fn detect<S: SelfExe>(args: Vec<OsString>, exe: &S) -> Result<Self> {
        let Some(arg0) = args.first() else {
            return Ok(Self::Direct(UndoConfig::parse_from([UNDO_TOOL_NAME])));
        };

        if basename(Path::new(arg0)) == UNDO_TOOL_NAME.as_bytes() {
            return Ok(Self::Direct(UndoConfig::parse_from(args)));
        }

        let mut argv = args;
        argv[0] = exe.resolve()?.into_os_string();
        Ok(Self::Forwarded(argv))
    }

    pub fn verbose(&self) -> bool {
        match self {
            Self::Direct(config) => config.debug.verbose,
            Self::Forwarded(_) => false,
        }
    }
}

/// Runs a program back in the host's mount namespace, fetched from the broker.
#[derive(Debug)]
pub struct UndoClient {
    context: GlobalContext,
    socket: SocketPath,
    cwd: Option<PathBuf>,
    argv: Vec<OsString>,
}

impl UndoClient {
    /// `env` is the value of `VOIDNSUNDO_SOCK_DIR`, consulted when `-s` is absent.
    pub fn new(mode: InvocationMode, env: Option<&OsStr>, context: GlobalContext) -> Result<Self> {
        let (explicit, argv) = match mode {
            InvocationMode::Direct(config) => (config.socket_dir, config.command),
            InvocationMode::Forwarded(argv) => (None, argv),
        };

        Ok(Self {
            context,
            socket: SocketPath::resolve(explicit, env)?,
            cwd: capture_cwd(),
            argv,
        })
    }

    pub fn socket(&self) -> &SocketPath {
        &self.socket
    }

    pub fn argv(&self) -> &[OsString] {
        &self.argv
    }

    pub fn cwd(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    pub fn run(self) -> Result<Infallible> {
        if HostPaths.exists_as(self.socket.dir()) != PathKind::Directory {
            return Err(Error::NotADirectory(self.socket.dir().to_path_buf()));
        }

        let namespace = fetch_namespace(&self.socket)?;
        join_mount_namespace(&namespace)?;
        drop(namespace);
        debug!("joined the original mount namespace");

        drop_privileges(self.context.ruid(), self.context.rgid())?;
        restore_cwd(self.cwd.as_deref());
        exec(&self.argv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeExe(&'static str);

    impl SelfExe for FakeExe {
        fn resolve(&self) -> Result<PathBuf> {
            Ok(PathBuf::from(self.0))
        }
    }

    struct BrokenExe;

    impl SelfExe for BrokenExe {
        fn resolve(&self) -> Result<PathBuf> {
            Err(Error::Protocol("no /proc"))
        }
    }

    fn args(list: &[&str]) -> Vec<OsString> {
        list.iter().map(OsString::from).collect()
    }

    #[test]
    fn test_direct_mode_parses_flags() -> Result<()> {
        let mode = InvocationMode::detect(
            args(&["/usr/bin/voidnsundo", "-V", "-s", "/tmp/ns", "xbps-install", "-S"]),
            &BrokenExe,
        )?;

        assert!(mode.verbose());
        let InvocationMode::Direct(config) = mode else {
            panic!("expected direct mode");
        };
        assert_eq!(config.socket_dir, Some(PathBuf::from("/tmp/ns")));
        assert_eq!(config.command, args(&["xbps-install", "-S"]));
        Ok(())
    }

    #[test]
    fn test_forwarded_mode_keeps_arguments() -> Result<()> {
        let mode = InvocationMode::detect(
            args(&["xbps-install", "-s", "-V", "--yes"]),
            &FakeExe("/usr/bin/xbps-install"),
        )?;

        assert!(!mode.verbose());
        let InvocationMode::Forwarded(argv) = mode else {
            panic!("expected forwarded mode");
        };
        assert_eq!(argv, args(&["/usr/bin/xbps-install", "-s", "-V", "--yes"]));
        Ok(())
    }

    #[test]
    fn test_similar_name_is_forwarded() -> Result<()> {
        let mode = InvocationMode::detect(args(&["voidnsundo2", "ls"]), &FakeExe("/bin/x"))?;
        assert!(matches!(mode, InvocationMode::Forwarded(_)));
        Ok(())
    }

    #[test]
    fn test_forwarded_mode_needs_self_exe() {
        let result = InvocationMode::detect(args(&["xbps-remove"]), &BrokenExe);
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[test]
    fn test_socket_dir_precedence() -> anyhow::Result<()> {
        let context = GlobalContext::current()?;

        let direct = InvocationMode::detect(args(&["voidnsundo", "-s", "/a", "true"]), &BrokenExe)?;
        let client = UndoClient::new(direct, Some(OsStr::new("/b")), context)?;
        assert_eq!(client.socket().dir(), Path::new("/a"));
        assert_eq!(client.argv(), args(&["true"]).as_slice());

        let forwarded = InvocationMode::Forwarded(args(&["/usr/bin/true"]));
        let client = UndoClient::new(forwarded, Some(OsStr::new("/b")), context)?;
        assert_eq!(client.socket().dir(), Path::new("/b"));

        let forwarded = InvocationMode::Forwarded(args(&["/usr/bin/true"]));
        let client = UndoClient::new(forwarded, None, context)?;
        assert_eq!(client.socket().dir(), Path::new(crate::SOCK_DIR_DEFAULT));
        Ok(())
    }

    #[test]
    fn test_overlong_socket_dir_rejected() -> anyhow::Result<()> {
        let context = GlobalContext::current()?;
        let long = "/".to_string() + &"d".repeat(SocketPath::DIR_MAX);

        let mode = InvocationMode::Forwarded(args(&["/usr/bin/true"]));
        let result = UndoClient::new(mode, Some(OsStr::new(&long)), context);
        assert!(matches!(result, Err(Error::SocketPathTooLong(_))));
        Ok(())
    }

    #[test]
    fn test_removed_cwd_is_not_fatal() -> anyhow::Result<()> {
        use crate::privsep::{Role, split_roles};
        use nix::{
            libc,
            sys::wait::{WaitStatus, waitpid},
        };

        let context = GlobalContext::current()?;
        let dir = tempfile::TempDir::new()?;
        let doomed = dir.path().join("gone");
        std::fs::create_dir(&doomed)?;

        match split_roles()? {
            Role::Launcher { broker: child } => {
                let status = waitpid(child, None)?;
                assert_eq!(status, WaitStatus::Exited(child, 0));
            }
            Role::Broker { .. } => {
                let code = (|| -> anyhow::Result<i32> {
                    std::env::set_current_dir(&doomed)?;
                    std::fs::remove_dir(&doomed)?;

                    let mode = InvocationMode::Forwarded(args(&["/usr/bin/true"]));
                    let client = UndoClient::new(mode, None, context)?;
                    Ok(if client.cwd().is_none() { 0 } else { 2 })
                })()
                .unwrap_or(1);
                // SAFETY: leave the forked test harness without running its destructors.
                unsafe { libc::_exit(code) };
            }
        }
        Ok(())
    }

    #[test]
    fn test_run_rejects_missing_socket_dir() -> anyhow::Result<()> {
        let context = GlobalContext::current()?;
        let mode = InvocationMode::Forwarded(args(&["/usr/bin/true"]));
        let client = UndoClient::new(mode, Some(OsStr::new("/nonexistent/voidnsrun")), context)?;

        assert!(matches!(client.run(), Err(Error::NotADirectory(_))));
        Ok(())
    }
}
