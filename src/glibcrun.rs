//! A program (or the user's shell) running against a glibc tree's `/usr` and
//! xbps database, in a private mount namespace of its own.

use crate::{
    context::GlobalContext,
    error::Result,
    hardener::{drop_privileges, enter_private_mount_namespace, exec},
    mount::Mounter,
    paths::join_prefixed,
};
use std::{
    convert::Infallible,
    ffi::OsString,
    path::{Path, PathBuf},
};
use tracing::debug;

/// Host paths replaced by their counterparts from the glibc tree.
pub const GLIBC_MOUNTS: [&str; 2] = ["/usr", "/var/db/xbps"];

pub const FALLBACK_SHELL: &str = "/bin/sh";

/// `command` as given, or the shell when no program was named.
pub fn target_argv(command: Vec<OsString>, shell: Option<OsString>) -> Vec<OsString> {
    if !command.is_empty() {
        return command;
    }

    let shell = shell
        .filter(|shell| !shell.is_empty())
        .unwrap_or_else(|| OsString::from(FALLBACK_SHELL));
    vec![shell]
}

#[derive(Debug)]
pub struct GlibcRun {
    context: GlobalContext,
    root: PathBuf,
    argv: Vec<OsString>,
}

impl GlibcRun {
    pub fn new(context: GlobalContext, root: PathBuf, argv: Vec<OsString>) -> Self {
        Self {
            context,
            root,
            argv,
        }
    }

    /// Stops at the first failed bind.
    pub fn mount_all<M: Mounter>(&self, mounter: &M) -> Result<()> {
        for target in GLIBC_MOUNTS.map(Path::new) {
            let source = join_prefixed(&self.root, target)?;
            mounter.bind(&source, target, true)?;
            debug!("bound {} onto {}", source.display(), target.display());
        }
        Ok(())
    }

    pub fn run<M: Mounter>(self, mounter: &M) -> Result<Infallible> {
        enter_private_mount_namespace()?;
        self.mount_all(mounter)?;
        drop_privileges(self.context.ruid(), self.context.rgid())?;
        exec(&self.argv)
    }
}
