use crate::{
    error::{Error, Result},
    oldroot::OldRootPreserver,
    paths::{PathKind, PathOracle, permission_bits},
    plan::{MountPlan, MountSpec, Stage, StagePlan},
    utils,
};
use nix::mount::{MsFlags, mount, umount};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Mount operations the orchestrator needs from the kernel.
pub trait Mounter {
    fn bind(&self, source: &Path, target: &Path, recursive: bool) -> Result<()>;
    fn tmpfs(&self, target: &Path, options: &str) -> Result<()>;
    fn unmount(&self, target: &Path) -> Result<()>;
}

/// `Mounter` issuing real `mount(2)` / `umount(2)` calls.
#[derive(Debug, Default, Clone, Copy)]
pub struct SysMounter;

impl Mounter for SysMounter {
    fn bind(&self, source: &Path, target: &Path, recursive: bool) -> Result<()> {
        let mut flags = MsFlags::MS_BIND;
        if recursive {
            flags |= MsFlags::MS_REC;
        }

        mount(Some(source), target, None::<&str>, flags, None::<&str>)
            .map_err(|errno| Error::sys("mount", target, errno))
    }

    fn tmpfs(&self, target: &Path, options: &str) -> Result<()> {
        mount(
            Some("tmpfs"),
            target,
            Some("tmpfs"),
            MsFlags::empty(),
            Some(options),
        )
        .map_err(|errno| Error::sys("mount", target, errno))
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        umount(target).map_err(|errno| Error::sys("umount", target, errno))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    File,
    Directory,
}

/// A mountpoint the orchestrator had to create; removed again on rollback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedArtifact {
    pub stage: Stage,
    /// Position of the entry within its stage.
    pub index: usize,
    pub path: PathBuf,
    pub kind: ArtifactKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageOutcome {
    pub succeeded: usize,
    pub total: usize,
}

impl StageOutcome {
    pub fn failed(&self) -> usize {
        self.total - self.succeeded
    }
}

pub struct MountOrchestrator<M: Mounter, O: PathOracle> {
    mounter: M,
    oracle: O,
    oldroot: OldRootPreserver,
    artifacts: Vec<CreatedArtifact>,
    /// Targets of the oldroot-subdir stage, all of which are unmounted on rollback.
    subdir_targets: Vec<PathBuf>,
}

impl<M: Mounter, O: PathOracle> MountOrchestrator<M, O> {
    pub fn new(mounter: M, oracle: O, oldroot: OldRootPreserver) -> Self {
        Self {
            mounter,
            oracle,
            oldroot,
            artifacts: Vec::new(),
            subdir_targets: Vec::new(),
        }
    }

    pub fn artifacts(&self) -> &[CreatedArtifact] {
        &self.artifacts
    }

    pub fn mounter(&self) -> &M {
        &self.mounter
    }

    /// Runs every stage of `plan` in order, then mounts the private socket tmpfs.
    ///
    /// On error the caller is expected to call [`Self::rollback`].
    pub fn execute(&mut self, plan: &MountPlan) -> Result<()> {
        for stage in &plan.stages {
            if stage.stage == Stage::Default && plan.preserve_oldroot {
                self.oldroot.preserve(&self.mounter)?;
            }

            let outcome = self.mount_stage(stage)?;
            debug!(
                "{} stage: {}/{} mounted",
                stage.stage, outcome.succeeded, outcome.total
            );

            if outcome.failed() > 0 {
                if stage.policy.tolerate_partial {
                    warn!(
                        "{} stage: ignoring {} failed mount(s)",
                        stage.stage,
                        outcome.failed()
                    );
                } else {
                    return Err(Error::PartialStage {
                        stage: stage.stage,
                        failed: outcome.failed(),
                        total: outcome.total,
                    });
                }
            }
        }

        self.mounter
            .tmpfs(&plan.socket_dir, crate::PRIVATE_TMPFS_OPTIONS)?;
        info!("namespace ready, socket directory {}", plan.socket_dir.display());

        Ok(())
    }

    /// Mounts every entry of one stage, returning how many succeeded.
    ///
    /// Per-entry failures are logged and counted; only a missing source of a
    /// required entry aborts.
    pub fn mount_stage(&mut self, stage: &StagePlan) -> Result<StageOutcome> {
        let mut succeeded = 0;

        for (index, spec) in stage.entries.iter().enumerate() {
            match self.mount_entry(stage, index, spec) {
                Ok(()) => succeeded += 1,
                Err(error @ Error::SourceMissing(_)) if spec.required => {
                    return Err(error);
                }
                Err(error) => error!("{error}"),
            }
        }

        Ok(StageOutcome {
            succeeded,
            total: stage.len(),
        })
    }

    fn mount_entry(&mut self, stage: &StagePlan, index: usize, spec: &MountSpec) -> Result<()> {
        let source = spec.resolve_source()?;
        let target = spec.target.as_path();
        let file_bind = spec.kind.is_file_bind();

        let expected = if file_bind {
            PathKind::File
        } else {
            PathKind::Directory
        };

        if self.oracle.exists_as(&source) != expected {
            return Err(Error::SourceMissing(source));
        }

        if stage.stage == Stage::OldrootSubdir {
            self.subdir_targets.push(target.to_path_buf());
        }

        if self.oracle.exists_as(target) == PathKind::Missing {
            if !stage.policy.create_mountpoints {
                return Err(Error::MountpointMissing(target.to_path_buf()));
            }

            let kind = if file_bind {
                utils::create_placeholder_file(target)?;
                ArtifactKind::File
            } else {
                utils::create_directory(target, permission_bits(&source)?)?;
                ArtifactKind::Directory
            };

            debug!("created mountpoint {} ({kind:?})", target.display());
            self.artifacts.push(CreatedArtifact {
                stage: stage.stage,
                index,
                path: target.to_path_buf(),
                kind,
            });
        }

        if self.oracle.exists_as(target) != expected {
            return Err(Error::MountpointKind {
                path: target.to_path_buf(),
                expected: if file_bind { "file" } else { "directory" },
            });
        }

        debug!(
            "{}: source={}, target={}",
            stage.stage,
            source.display(),
            target.display()
        );
        self.mounter.bind(&source, target, !file_bind)
    }

    /// Undoes the filesystem side effects of [`Self::execute`].
    ///
    /// Best effort: failures are logged and the remaining artifacts are still
    /// processed. Tracking is drained, so a second call does nothing.
    pub fn rollback(&mut self) {
        let artifacts = std::mem::take(&mut self.artifacts);
        let (undo, dirs): (Vec<_>, Vec<_>) = artifacts
            .into_iter()
            .partition(|artifact| artifact.stage == Stage::Undo);

        for artifact in undo.iter().rev() {
            let path = artifact.path.as_path();

            if let Err(error) = self.mounter.unmount(path) {
                debug!("{error}");
            }

            match utils::remove_file(path) {
                Ok(()) => debug!("unlink({})", path.display()),
                Err(error) => error!("{error}"),
            }
        }

        for target in std::mem::take(&mut self.subdir_targets).iter().rev() {
            if let Err(error) = self.mounter.unmount(target) {
                error!("{error}");
            }
        }

        for artifact in dirs.iter().rev() {
            let path = artifact.path.as_path();
            match utils::remove_directory(path) {
                Ok(()) => debug!("rmdir({})", path.display()),
                Err(error) => error!("{error}"),
            }
        }

        self.oldroot.teardown(&self.mounter);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{paths::HostPaths, plan::MountPlanBuilder};
    use std::{cell::RefCell, fs, os::unix::fs::PermissionsExt};
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Call {
        Bind {
            source: PathBuf,
            target: PathBuf,
            recursive: bool,
        },
        Tmpfs(PathBuf),
        Unmount(PathBuf),
    }

    /// Records calls instead of touching the mount table.
    #[derive(Debug, Default)]
    pub struct RecordingMounter {
        pub calls: RefCell<Vec<Call>>,
    }

    impl RecordingMounter {
        pub fn binds(&self) -> Vec<(PathBuf, PathBuf)> {
            self.calls
                .borrow()
                .iter()
                .filter_map(|call| match call {
                    Call::Bind { source, target, .. } => Some((source.clone(), target.clone())),
                    _ => None,
                })
                .collect()
        }

        pub fn unmounts(&self) -> Vec<PathBuf> {
            self.calls
                .borrow()
                .iter()
                .filter_map(|call| match call {
                    Call::Unmount(path) => Some(path.clone()),
                    _ => None,
                })
                .collect()
        }
    }

    impl Mounter for RecordingMounter {
        fn bind(&self, source: &Path, target: &Path, recursive: bool) -> Result<()> {
            self.calls.borrow_mut().push(Call::Bind {
                source: source.to_path_buf(),
                target: target.to_path_buf(),
                recursive,
            });
            Ok(())
        }

        fn tmpfs(&self, target: &Path, _options: &str) -> Result<()> {
            self.calls.borrow_mut().push(Call::Tmpfs(target.to_path_buf()));
            Ok(())
        }

        fn unmount(&self, target: &Path) -> Result<()> {
            self.calls
                .borrow_mut()
                .push(Call::Unmount(target.to_path_buf()));
            Ok(())
        }
    }

    /// A host tree and a container tree side by side in a temp dir.
    pub struct Fixture {
        pub dir: TempDir,
    }

    impl Fixture {
        pub fn new() -> std::io::Result<Self> {
            let dir = TempDir::new()?;
            fs::create_dir_all(dir.path().join("container"))?;
            fs::create_dir_all(dir.path().join("host"))?;
            fs::create_dir_all(dir.path().join("oldroot"))?;
            fs::create_dir_all(dir.path().join("sock"))?;
            Ok(Self { dir })
        }

        pub fn container(&self) -> PathBuf {
            self.dir.path().join("container")
        }

        pub fn host(&self, path: &str) -> PathBuf {
            self.dir.path().join("host").join(path)
        }

        /// Creates `path` both on the host side and inside the container.
        pub fn mkdir_both(&self, path: &str) -> std::io::Result<PathBuf> {
            let host = self.host(path);
            fs::create_dir_all(&host)?;
            fs::create_dir_all(self.in_container(&host))?;
            Ok(host)
        }

        pub fn in_container(&self, host: &Path) -> PathBuf {
            crate::paths::join_prefixed(&self.container(), host).unwrap()
        }

        pub fn orchestrator(&self) -> MountOrchestrator<RecordingMounter, HostPaths> {
            let oldroot =
                OldRootPreserver::new(self.dir.path().join("oldroot"), self.host("usr"));
            MountOrchestrator::new(RecordingMounter::default(), HostPaths, oldroot)
        }
    }

    #[test]
    fn test_existing_targets_bind_once_each() -> Result<()> {
        let fx = Fixture::new()?;
        let a = fx.mkdir_both("a")?;
        let b = fx.mkdir_both("b")?;

        let plan = MountPlanBuilder::new(fx.container(), "vim")
            .with_user_mounts(vec![a.clone(), b.clone()])
            .build()?;
        let user = plan.stage(Stage::User).unwrap();

        let mut orchestrator = fx.orchestrator();
        let outcome = orchestrator.mount_stage(user)?;

        assert_eq!(outcome, StageOutcome { succeeded: 2, total: 2 });
        assert!(orchestrator.artifacts().is_empty());
        assert_eq!(
            orchestrator.mounter().binds(),
            vec![(fx.in_container(&a), a), (fx.in_container(&b), b)]
        );
        Ok(())
    }

    #[test]
    fn test_missing_optional_source_is_counted() -> Result<()> {
        let fx = Fixture::new()?;
        let present = fx.mkdir_both("present")?;
        let absent = fx.host("absent");
        fs::create_dir_all(&absent)?;

        let plan = MountPlanBuilder::new(fx.container(), "vim")
            .with_user_mounts(vec![absent, present])
            .build()?;

        let mut orchestrator = fx.orchestrator();
        let outcome = orchestrator.mount_stage(plan.stage(Stage::User).unwrap())?;

        assert_eq!(outcome, StageOutcome { succeeded: 1, total: 2 });
        assert_eq!(orchestrator.mounter().binds().len(), 1);
        Ok(())
    }

    #[test]
    fn test_missing_default_source_is_fatal() -> Result<()> {
        let fx = Fixture::new()?;
        let plan = MountPlanBuilder::new(fx.container(), "vim").build()?;

        let mut orchestrator = fx.orchestrator();
        let result = orchestrator.mount_stage(plan.stage(Stage::Default).unwrap());

        assert!(matches!(result, Err(Error::SourceMissing(_))));
        assert!(orchestrator.mounter().calls.borrow().is_empty());
        Ok(())
    }

    #[test]
    fn test_required_flag_is_per_entry() -> Result<()> {
        let fx = Fixture::new()?;
        let present = fx.mkdir_both("present")?;
        let optional = fx.host("optional");
        let needed = fx.host("needed");
        fs::create_dir_all(&optional)?;
        fs::create_dir_all(&needed)?;

        let spec = |target: &PathBuf, required| MountSpec {
            source: crate::plan::MountSource::Prefixed(fx.container()),
            target: target.clone(),
            kind: crate::plan::MountKind::UserBind,
            required,
        };
        let policy = crate::plan::StagePolicy {
            create_mountpoints: false,
            tolerate_partial: false,
        };

        let mixed = StagePlan {
            stage: Stage::User,
            policy,
            entries: vec![spec(&optional, false), spec(&present, true)],
        };
        let mut orchestrator = fx.orchestrator();
        let outcome = orchestrator.mount_stage(&mixed)?;
        assert_eq!(outcome, StageOutcome { succeeded: 1, total: 2 });

        let fatal = StagePlan {
            stage: Stage::User,
            policy,
            entries: vec![spec(&present, false), spec(&needed, true)],
        };
        let mut orchestrator = fx.orchestrator();
        let result = orchestrator.mount_stage(&fatal);
        assert!(matches!(result, Err(Error::SourceMissing(path)) if path == fx.in_container(&needed)));
        Ok(())
    }

    #[test]
    fn test_missing_mountpoint_without_creation() -> Result<()> {
        let fx = Fixture::new()?;
        let target = fx.host("only-in-container");
        fs::create_dir_all(fx.in_container(&target))?;

        let plan = MountPlanBuilder::new(fx.container(), "vim")
            .with_user_mounts(vec![target.clone()])
            .build()?;

        let mut orchestrator = fx.orchestrator();
        let outcome = orchestrator.mount_stage(plan.stage(Stage::User).unwrap())?;

        assert_eq!(outcome.succeeded, 0);
        assert!(!target.exists());
        assert!(orchestrator.artifacts().is_empty());
        Ok(())
    }

    #[test]
    fn test_overlong_path_rejected_before_mount() -> Result<()> {
        let fx = Fixture::new()?;
        let target = PathBuf::from(format!("/{}", "x".repeat(nix::libc::PATH_MAX as usize)));

        let plan = MountPlanBuilder::new(fx.container(), "vim")
            .with_user_mounts(vec![target])
            .build()?;

        let mut orchestrator = fx.orchestrator();
        let outcome = orchestrator.mount_stage(plan.stage(Stage::User).unwrap())?;

        assert_eq!(outcome, StageOutcome { succeeded: 0, total: 1 });
        assert!(orchestrator.mounter().calls.borrow().is_empty());
        Ok(())
    }

    #[test]
    fn test_kind_mismatch_is_an_error() -> Result<()> {
        let fx = Fixture::new()?;
        let target = fx.host("file-on-host");
        fs::write(&target, b"")?;
        fs::create_dir_all(fx.in_container(&target))?;

        let plan = MountPlanBuilder::new(fx.container(), "vim")
            .with_user_mounts(vec![target])
            .build()?;

        let mut orchestrator = fx.orchestrator();
        let outcome = orchestrator.mount_stage(plan.stage(Stage::User).unwrap())?;

        assert_eq!(outcome.succeeded, 0);
        assert!(orchestrator.mounter().binds().is_empty());
        Ok(())
    }

    #[test]
    fn test_undo_placeholders_created_and_removed() -> Result<()> {
        let fx = Fixture::new()?;
        fx.mkdir_both("usr/bin")?;
        let binary = fx.host("usr/bin/voidnsundo");
        let undo_source = fx.in_container(&binary);
        fs::write(&undo_source, b"#!/bin/sh\n")?;
        fs::set_permissions(&undo_source, fs::Permissions::from_mode(0o755))?;

        let placeholder = fx.host("usr/bin/xbps-install-undo");
        let plan = MountPlanBuilder::new(fx.container(), "vim")
            .with_undo_mounts(binary, vec![placeholder.clone()])
            .build()?;

        let mut orchestrator = fx.orchestrator();
        let outcome = orchestrator.mount_stage(plan.stage(Stage::Undo).unwrap())?;
        assert_eq!(outcome.succeeded, 1);

        assert!(placeholder.is_file());
        assert_eq!(
            orchestrator.artifacts(),
            &[CreatedArtifact {
                stage: Stage::Undo,
                index: 0,
                path: placeholder.clone(),
                kind: ArtifactKind::File,
            }]
        );
        assert_eq!(
            orchestrator.mounter().calls.borrow()[0],
            Call::Bind {
                source: undo_source,
                target: placeholder.clone(),
                recursive: false,
            }
        );

        orchestrator.rollback();
        assert!(!placeholder.exists());
        assert_eq!(orchestrator.mounter().unmounts(), vec![placeholder]);
        Ok(())
    }

    #[test]
    fn test_created_dirs_rolled_back_in_reverse() -> Result<()> {
        let fx = Fixture::new()?;
        let first = fx.host("usr/share/first");
        let second = fx.host("usr/share/second");
        fs::create_dir_all(fx.host("usr/share"))?;

        // The preserved copy lives under <oldroot><host path>.
        let oldroot = fx.dir.path().join("oldroot");
        for dir in [&first, &second] {
            let preserved = crate::paths::join_prefixed(&oldroot, dir)?;
            fs::create_dir_all(&preserved)?;
            fs::set_permissions(&preserved, fs::Permissions::from_mode(0o711))?;
        }

        let stage = StagePlan {
            stage: Stage::OldrootSubdir,
            policy: crate::plan::StagePolicy {
                create_mountpoints: true,
                tolerate_partial: false,
            },
            entries: [&first, &second]
                .iter()
                .map(|target| MountSpec {
                    source: crate::plan::MountSource::Prefixed(oldroot.clone()),
                    target: target.to_path_buf(),
                    kind: crate::plan::MountKind::OldrootSubdirBind,
                    required: false,
                })
                .collect(),
        };

        let mut orchestrator = fx.orchestrator();
        let outcome = orchestrator.mount_stage(&stage)?;
        assert_eq!(outcome.succeeded, 2);

        let created: Vec<_> = orchestrator
            .artifacts()
            .iter()
            .map(|a| (a.index, a.path.clone(), a.kind))
            .collect();
        assert_eq!(
            created,
            vec![
                (0, first.clone(), ArtifactKind::Directory),
                (1, second.clone(), ArtifactKind::Directory),
            ]
        );
        assert_eq!(permission_bits(&first)?.bits(), 0o711);

        orchestrator.rollback();
        assert!(!first.exists());
        assert!(!second.exists());
        assert!(fx.host("usr/share").is_dir());
        assert_eq!(orchestrator.mounter().unmounts(), vec![second, first]);

        // Second pass has nothing left to undo.
        orchestrator.mounter().calls.borrow_mut().clear();
        orchestrator.rollback();
        assert!(orchestrator.mounter().calls.borrow().is_empty());
        Ok(())
    }

    #[test]
    fn test_execute_full_plan() -> Result<()> {
        let fx = Fixture::new()?;
        let usr = fx.mkdir_both("usr")?;
        let var = fx.mkdir_both("var")?;
        let etc = fx.mkdir_both("etc")?;
        fs::create_dir_all(fx.in_container(&fx.host("etc/xbps.d")))?;

        let default = StagePlan {
            stage: Stage::Default,
            policy: crate::plan::StagePolicy {
                create_mountpoints: false,
                tolerate_partial: false,
            },
            entries: [&usr, &var, &etc]
                .iter()
                .map(|target| MountSpec {
                    source: crate::plan::MountSource::Prefixed(fx.container()),
                    target: target.to_path_buf(),
                    kind: crate::plan::MountKind::DefaultBind,
                    required: true,
                })
                .collect(),
        };
        let socket_dir = fx.dir.path().join("sock");
        let plan = MountPlan {
            stages: vec![default],
            preserve_oldroot: false,
            socket_dir: socket_dir.clone(),
        };

        let mut orchestrator = fx.orchestrator();
        orchestrator.execute(&plan)?;

        let calls = orchestrator.mounter().calls.borrow().clone();
        assert_eq!(calls.len(), 4);
        assert_eq!(calls.last(), Some(&Call::Tmpfs(socket_dir)));
        assert!(orchestrator.artifacts().is_empty());
        Ok(())
    }

    #[test]
    fn test_execute_fails_on_intolerable_partial_stage() -> Result<()> {
        let fx = Fixture::new()?;
        fx.mkdir_both("usr")?;
        let absent = fx.host("absent");
        fs::create_dir_all(&absent)?;

        let plan = MountPlanBuilder::new(fx.container(), "vim")
            .with_user_mounts(vec![absent.clone()])
            .with_socket_dir(fx.dir.path().join("sock"))
            .build()?;

        let mut orchestrator = fx.orchestrator();
        let result = orchestrator.execute(&plan);
        assert!(matches!(
            result,
            Err(Error::PartialStage { stage: Stage::User, failed: 1, total: 1 })
        ));

        let mut plan = MountPlanBuilder::new(fx.container(), "vim")
            .with_user_mounts(vec![absent])
            .with_ignore_missing(true)
            .with_socket_dir(fx.dir.path().join("sock"))
            .build()?;
        // Point the default stage at the fixture's host tree.
        plan.stages[1].entries[0].target = fx.host("usr");

        let mut orchestrator = fx.orchestrator();
        orchestrator.execute(&plan)?;
        Ok(())
    }
}
