use crate::{
    CONTAINER_DIR_VAR, OLDROOT, SOCK_DIR_DEFAULT, UNDO_BIN_VAR,
    broker::NamespaceBroker,
    checks,
    config::Config,
    context::GlobalContext,
    error::Error,
    hardener,
    launcher::SandboxLauncher,
    mount::{MountOrchestrator, SysMounter},
    oldroot::OldRootPreserver,
    paths::{HostPaths, PathKind, PathOracle, join_prefixed, resolve_root},
    plan::{MountPlan, MountPlanBuilder},
    privsep::{Role, split_roles},
    rendezvous::SocketPath,
    utils,
};
use anyhow::{Context, Result};
use nix::{fcntl::OFlag, sys::stat::Mode};
use std::{
    os::fd::OwnedFd,
    path::{Path, PathBuf},
};
use tracing::{debug, error, info};

#[derive(Debug)]
pub struct Sandbox {
    config: Config,
    context: GlobalContext,
    container: PathBuf,
    socket: SocketPath,
}

impl Sandbox {
    /// Validates the command line and the host before anything is mounted.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let context = GlobalContext::current()?;
        context.require_root("voidnsrun")?;
        checks::ensure_mount_namespaces()?;
        debug!("privilege level: {:?}", context.privilege_level());

        let container = resolve_root(&HostPaths, config.mount.root.as_deref(), CONTAINER_DIR_VAR)?;
        if !config.undo.undo_mount.is_empty() {
            check_undo_binary(&HostPaths, &container, config.undo.undo_bin.as_deref())?;
        }

        Ok(Self {
            config,
            context,
            container,
            socket: SocketPath::new(SOCK_DIR_DEFAULT)?,
        })
    }

    pub fn plan(&self) -> Result<MountPlan> {
        let mut builder = MountPlanBuilder::new(&self.container, self.config.program())
            .with_ignore_missing(self.config.mount.ignore_missing)
            .with_user_mounts(self.config.mount.bind.clone())
            .with_usr_subdirs(self.config.mount.usr_dir.clone())
            .with_oldroot(OLDROOT)
            .with_socket_dir(self.socket.dir());

        if let Some(binary) = &self.config.undo.undo_bin {
            builder = builder.with_undo_mounts(binary, self.config.undo.undo_mount.clone());
        }

        Ok(builder.build()?)
    }

    /// Builds the namespace and forks. Returns in the broker once it is done
    /// serving; in the launcher only on failure.
    pub fn spawn(self) -> Result<()> {
        let plan = self.plan()?;

        let namespace = open_namespace().context("Failed to open the current mount namespace")?;
        prepare_socket_dir(&HostPaths, &self.socket)?;
        let cwd = hardener::capture_cwd();

        hardener::enter_private_mount_namespace()?;

        let mut orchestrator = MountOrchestrator::new(
            SysMounter,
            HostPaths,
            OldRootPreserver::new(OLDROOT, "/usr"),
        );
        if let Err(err) = orchestrator.execute(&plan) {
            orchestrator.rollback();
            return Err(err).context("Failed to set up the sandbox mounts");
        }

        let role = match split_roles() {
            Ok(role) => role,
            Err(err) => {
                orchestrator.rollback();
                return Err(err).context("Failed to fork the namespace broker");
            }
        };

        match role {
            Role::Broker { parent_before_fork } => {
                let result = NamespaceBroker::new(namespace, self.socket, parent_before_fork).run();
                orchestrator.rollback();

                let served = result.context("Namespace broker failed")?;
                info!("broker exiting after {served} connection(s)");
                Ok(())
            }
            Role::Launcher { broker } => {
                debug!("namespace broker running as pid {broker}");
                drop(namespace);

                let launcher = SandboxLauncher::new(self.context, cwd, self.config.command);
                match launcher.launch() {
                    Ok(never) => match never {},
                    Err(err) => Err(err).context("Failed to launch the target program"),
                }
            }
        }
    }
}

fn open_namespace() -> crate::Result<OwnedFd> {
    let path = Path::new("/proc/self/ns/mnt");
    nix::fcntl::open(path, OFlag::O_RDONLY | OFlag::O_CLOEXEC, Mode::empty())
        .map_err(|errno| Error::sys("open", path, errno))
}

/// The undo binary is looked up inside the container, where it gets bound from.
pub fn check_undo_binary<O: PathOracle>(
    oracle: &O,
    container: &Path,
    binary: Option<&Path>,
) -> crate::Result<PathBuf> {
    let binary = binary.ok_or(Error::MissingEnv(UNDO_BIN_VAR))?;
    let full = join_prefixed(container, binary)?;

    if !oracle.is_executable(&full) {
        return Err(Error::NotExecutable(full));
    }
    Ok(full)
}

/// The host side of the socket directory: it becomes the mountpoint of the
/// private tmpfs inside the namespace.
pub fn prepare_socket_dir<O: PathOracle>(oracle: &O, socket: &SocketPath) -> crate::Result<()> {
    match oracle.exists_as(socket.dir()) {
        PathKind::Missing => utils::create_directory(socket.dir(), Mode::S_IRWXU)?,
        PathKind::Directory => {}
        PathKind::File => return Err(Error::NotADirectory(socket.dir().to_path_buf())),
    }

    if let Err(err) = utils::remove_file(&socket.socket()) {
        error!("Failed to remove stale socket: {err}");
    }
    Ok(())
}
