use crate::{
    error::{Error, Result},
    mount::Mounter,
    paths::{join_prefixed, permission_bits},
    utils,
};
use std::path::PathBuf;
use tracing::{debug, error};

/// Keeps the host's pristine `/usr` reachable under a private tmpfs after the
/// sandbox replaced `/usr`, so selected subdirectories can be punched through.
#[derive(Debug)]
pub struct OldRootPreserver {
    /// Private tmpfs mountpoint, e.g. `/oldroot`.
    root: PathBuf,
    /// The `/usr` to preserve.
    usr: PathBuf,
    tmpfs_mounted: bool,
    usr_mounted: bool,
}

impl OldRootPreserver {
    pub fn new(root: impl Into<PathBuf>, usr: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            usr: usr.into(),
            tmpfs_mounted: false,
            usr_mounted: false,
        }
    }

    /// Where the preserved `/usr` ends up: `<root><usr>`.
    pub fn preserved_usr(&self) -> Result<PathBuf> {
        join_prefixed(&self.root, &self.usr)
    }

    pub fn is_active(&self) -> bool {
        self.tmpfs_mounted
    }

    /// Must run before the container's `/usr` is bound over the host's.
    pub fn preserve<M: Mounter>(&mut self, mounter: &M) -> Result<()> {
        if !self.root.is_dir() {
            return Err(Error::MountpointMissing(self.root.clone()));
        }

        let mode = permission_bits(&self.usr)?;
        let preserved = self.preserved_usr()?;

        mounter.tmpfs(&self.root, crate::PRIVATE_TMPFS_OPTIONS)?;
        self.tmpfs_mounted = true;

        if let Some(parent) = preserved.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if !preserved.is_dir() {
            utils::create_directory(&preserved, mode)?;
        }

        mounter.bind(&self.usr, &preserved, true)?;
        self.usr_mounted = true;

        debug!(
            "preserved {} at {}",
            self.usr.display(),
            preserved.display()
        );
        Ok(())
    }

    /// Unmounts the preserved `/usr`, then the tmpfs root.
    ///
    /// A busy tmpfs is only reported at debug level.
    pub fn teardown<M: Mounter>(&mut self, mounter: &M) {
        if self.usr_mounted {
            self.usr_mounted = false;
            match self.preserved_usr().and_then(|path| mounter.unmount(&path)) {
                Ok(()) => {}
                Err(error) => error!("{error}"),
            }
        }

        if self.tmpfs_mounted {
            self.tmpfs_mounted = false;
            if let Err(error) = mounter.unmount(&self.root) {
                debug!("{error}");
            }
        }
    }
}
