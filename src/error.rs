use crate::plan::Stage;
use nix::errno::Errno;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("path {}{} is too long", prefix.display(), target.display())]
    PathTooLong { prefix: PathBuf, target: PathBuf },

    #[error("only up to {max} {what} allowed (got {got})")]
    CapacityExceeded {
        what: &'static str,
        max: usize,
        got: usize,
    },

    #[error("only subdirectories of /usr are allowed for bind mounting this way: {}", .0.display())]
    NotUsrSubdirectory(PathBuf),

    #[error("environment variable {0} not found")]
    MissingEnv(&'static str),

    #[error("{} is not a directory", .0.display())]
    NotADirectory(PathBuf),

    #[error("{} is not an executable", .0.display())]
    NotExecutable(PathBuf),

    #[error("source {} does not exist", .0.display())]
    SourceMissing(PathBuf),

    #[error("mount point {} does not exist", .0.display())]
    MountpointMissing(PathBuf),

    #[error("mount point {} is not a {expected}", path.display())]
    MountpointKind {
        path: PathBuf,
        expected: &'static str,
    },

    #[error("{stage} stage: {failed} of {total} mounts failed")]
    PartialStage {
        stage: Stage,
        failed: usize,
        total: usize,
    },

    #[error("socket directory path {} is too long", .0.display())]
    SocketPathTooLong(PathBuf),

    #[error("protocol error: {0}")]
    Protocol(&'static str),

    #[error("parent process has already exited")]
    ParentGone,

    #[error("{op}({}): {errno}", path.display())]
    Sys {
        op: &'static str,
        path: PathBuf,
        errno: Errno,
    },

    #[error(transparent)]
    Nix(#[from] Errno),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn sys(op: &'static str, path: impl Into<PathBuf>, errno: Errno) -> Self {
        Self::Sys {
            op,
            path: path.into(),
            errno,
        }
    }

    /// The errno behind this error, when it came from a system call.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Self::Sys { errno, .. } | Self::Nix(errno) => Some(*errno),
            _ => None,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
