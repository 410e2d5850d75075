use crate::{
    error::{Error, Result},
    paths::{self, join_prefixed},
};
use std::{
    fmt,
    path::{Path, PathBuf},
};

/// Package manager commands that also get the container's `/var` and `/etc`.
const PACKAGE_MANAGER_COMMANDS: [&str; 3] = ["xbps-install", "xbps-remove", "xbps-reconfigure"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    User,
    Default,
    OldrootSubdir,
    Undo,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::User => "user",
            Stage::Default => "default",
            Stage::OldrootSubdir => "oldroot-subdir",
            Stage::Undo => "undo",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountKind {
    UserBind,
    DefaultBind,
    OldrootSubdirBind,
    UndoBind,
}

impl MountKind {
    /// Undo binds put a single file on a placeholder; everything else binds a tree.
    pub fn is_file_bind(self) -> bool {
        matches!(self, MountKind::UndoBind)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountSource {
    /// Joined with the target: `<prefix><target>`.
    Prefixed(PathBuf),
    /// Used as is, whatever the target.
    Exact(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub source: MountSource,
    pub target: PathBuf,
    pub kind: MountKind,
    /// A missing source aborts the whole plan instead of counting as a failure.
    pub required: bool,
}

impl MountSpec {
    pub fn resolve_source(&self) -> Result<PathBuf> {
        match &self.source {
            MountSource::Prefixed(prefix) => join_prefixed(prefix, &self.target),
            MountSource::Exact(path) => {
                paths::ensure_fits(path)?;
                Ok(path.clone())
            }
        }
    }
}

/// How a stage reacts to entries that could not be mounted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagePolicy {
    /// Missing directory mountpoints are created and tracked for rollback.
    pub create_mountpoints: bool,
    /// Fewer successes than entries is acceptable.
    pub tolerate_partial: bool,
}

#[derive(Debug, Clone)]
pub struct StagePlan {
    pub stage: Stage,
    pub policy: StagePolicy,
    pub entries: Vec<MountSpec>,
}

impl StagePlan {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn targets(&self) -> impl Iterator<Item = &Path> {
        self.entries.iter().map(|spec| spec.target.as_path())
    }
}

/// Ordered bind-mount stages for one sandbox invocation.
///
/// Stages run in the order they are stored; `preserve_oldroot` is performed
/// between the user and default stages, and `socket_dir` is mounted after
/// every stage.
#[derive(Debug, Clone)]
pub struct MountPlan {
    pub stages: Vec<StagePlan>,
    pub preserve_oldroot: bool,
    pub socket_dir: PathBuf,
}

impl MountPlan {
    pub fn stage(&self, stage: Stage) -> Option<&StagePlan> {
        self.stages.iter().find(|plan| plan.stage == stage)
    }
}

pub struct MountPlanBuilder {
    container: PathBuf,
    command: PathBuf,
    oldroot: PathBuf,
    socket_dir: PathBuf,
    ignore_missing: bool,
    user_mounts: Vec<PathBuf>,
    usr_subdirs: Vec<PathBuf>,
    undo_mounts: Vec<PathBuf>,
    undo_binary: Option<PathBuf>,
}

impl MountPlanBuilder {
    pub fn new(container: impl Into<PathBuf>, command: impl Into<PathBuf>) -> Self {
        Self {
            container: container.into(),
            command: command.into(),
            oldroot: PathBuf::from(crate::OLDROOT),
            socket_dir: PathBuf::from(crate::SOCK_DIR_DEFAULT),
            ignore_missing: false,
            user_mounts: Vec::new(),
            usr_subdirs: Vec::new(),
            undo_mounts: Vec::new(),
            undo_binary: None,
        }
    }

    pub fn with_ignore_missing(mut self, ignore_missing: bool) -> Self {
        self.ignore_missing = ignore_missing;
        self
    }

    pub fn with_user_mounts(mut self, mounts: Vec<PathBuf>) -> Self {
        self.user_mounts = mounts;
        self
    }

    pub fn with_usr_subdirs(mut self, subdirs: Vec<PathBuf>) -> Self {
        self.usr_subdirs = subdirs;
        self
    }

    /// Placeholders in `targets` get `binary` bound onto them.
    /// `binary` is the undo tool's path inside the container.
    pub fn with_undo_mounts(mut self, binary: impl Into<PathBuf>, targets: Vec<PathBuf>) -> Self {
        self.undo_binary = Some(binary.into());
        self.undo_mounts = targets;
        self
    }

    pub fn with_oldroot(mut self, oldroot: impl Into<PathBuf>) -> Self {
        self.oldroot = oldroot.into();
        self
    }

    pub fn with_socket_dir(mut self, socket_dir: impl Into<PathBuf>) -> Self {
        self.socket_dir = socket_dir.into();
        self
    }

    pub fn build(self) -> Result<MountPlan> {
        validate_capacity("user mounts", self.user_mounts.len())?;
        validate_capacity("undo mounts", self.undo_mounts.len())?;
        validate_capacity("dir mounts", self.usr_subdirs.len())?;

        for subdir in &self.usr_subdirs {
            if !subdir.as_os_str().to_string_lossy().starts_with("/usr/") {
                return Err(Error::NotUsrSubdirectory(subdir.clone()));
            }
        }

        let mut stages = Vec::with_capacity(4);

        if !self.user_mounts.is_empty() {
            stages.push(StagePlan {
                stage: Stage::User,
                policy: StagePolicy {
                    create_mountpoints: false,
                    tolerate_partial: self.ignore_missing,
                },
                entries: prefixed(&self.container, &self.user_mounts, MountKind::UserBind, false),
            });
        }

        stages.push(StagePlan {
            stage: Stage::Default,
            policy: StagePolicy {
                create_mountpoints: false,
                tolerate_partial: false,
            },
            entries: prefixed(
                &self.container,
                &default_mounts(&self.command),
                MountKind::DefaultBind,
                true,
            ),
        });

        if !self.usr_subdirs.is_empty() {
            stages.push(StagePlan {
                stage: Stage::OldrootSubdir,
                policy: StagePolicy {
                    create_mountpoints: true,
                    tolerate_partial: false,
                },
                entries: prefixed(
                    &self.oldroot,
                    &self.usr_subdirs,
                    MountKind::OldrootSubdirBind,
                    false,
                ),
            });
        }

        if !self.undo_mounts.is_empty() {
            let binary = self.undo_binary.ok_or(Error::MissingEnv(crate::UNDO_BIN_VAR))?;
            let source = join_prefixed(&self.container, &binary)?;

            stages.push(StagePlan {
                stage: Stage::Undo,
                policy: StagePolicy {
                    create_mountpoints: true,
                    tolerate_partial: self.ignore_missing,
                },
                entries: self
                    .undo_mounts
                    .iter()
                    .map(|target| MountSpec {
                        source: MountSource::Exact(source.clone()),
                        target: target.clone(),
                        kind: MountKind::UndoBind,
                        required: false,
                    })
                    .collect(),
            });
        }

        Ok(MountPlan {
            stages,
            preserve_oldroot: !self.usr_subdirs.is_empty(),
            socket_dir: self.socket_dir,
        })
    }
}

fn prefixed(prefix: &Path, targets: &[PathBuf], kind: MountKind, required: bool) -> Vec<MountSpec> {
    targets
        .iter()
        .map(|target| MountSpec {
            source: MountSource::Prefixed(prefix.to_path_buf()),
            target: target.clone(),
            kind,
            required,
        })
        .collect()
}

pub fn validate_capacity(what: &'static str, got: usize) -> Result<()> {
    if got > crate::USER_LISTS_MAX {
        return Err(Error::CapacityExceeded {
            what,
            max: crate::USER_LISTS_MAX,
            got,
        });
    }
    Ok(())
}

/// `/usr` always; `/var` and `/etc` as well for package manager commands.
pub fn default_mounts(command: &Path) -> Vec<PathBuf> {
    let mut mounts = vec![PathBuf::from("/usr")];
    if is_package_manager_command(command) {
        mounts.push(PathBuf::from("/var"));
        mounts.push(PathBuf::from("/etc"));
    }
    mounts
}

/// Matches `xbps-install` as well as `/usr/bin/xbps-install`, but not
/// `xbps-install-foo` or `foo/xbps-installer`.
pub fn is_package_manager_command(command: &Path) -> bool {
    let whole = command.as_os_str().as_encoded_bytes();
    let base = paths::basename(command);

    PACKAGE_MANAGER_COMMANDS
        .iter()
        .any(|name| whole == name.as_bytes() || base == name.as_bytes())
}
