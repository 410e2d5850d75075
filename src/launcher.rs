use crate::{
    context::GlobalContext,
    error::Result,
    hardener::{drop_privileges, exec, restore_cwd},
};
use std::{convert::Infallible, ffi::OsString, path::PathBuf};

/// Parent role after fork: leaves root behind and becomes the target program.
#[derive(Debug)]
pub struct SandboxLauncher {
    context: GlobalContext,
    cwd: Option<PathBuf>,
    argv: Vec<OsString>,
}

impl SandboxLauncher {
    pub fn new(context: GlobalContext, cwd: Option<PathBuf>, argv: Vec<OsString>) -> Self {
        Self { context, cwd, argv }
    }

    /// Only returns if something went wrong; the broker is then left to
    /// clean up once it notices this process is gone.
    pub fn launch(self) -> Result<Infallible> {
        drop_privileges(self.context.ruid(), self.context.rgid())?;
        restore_cwd(self.cwd.as_deref());
        exec(&self.argv)
    }
}
