use anyhow::{Context, Result, bail};
use caps::CapSet;
use nix::unistd::{Gid, Uid, geteuid, getgid, getuid};
use std::cell::RefCell;

thread_local! {
    static GLOBAL_CONTEXT: RefCell<Option<GlobalContext>> = const { RefCell::new(None) };
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PrivilegeLevel {
    Root,
    Rootless,
    Setuid,
    RootlessWithCapabilities,
}

/// Identity of the invoking user, captured once before anything is changed.
#[derive(Debug, Clone, Copy)]
pub struct GlobalContext {
    ruid: Uid,
    euid: Uid,
    rgid: Gid,
    level: PrivilegeLevel,
}

impl GlobalContext {
    pub fn init() -> Result<()> {
        let context = GlobalContext::new().context("Failed to create global context")?;

        GLOBAL_CONTEXT.with(|cell| {
            *cell.borrow_mut() = Some(context);
        });

        Ok(())
    }

    /// Get the current context, initializing it on first use.
    pub fn current() -> Result<Self> {
        if let Some(context) = GLOBAL_CONTEXT.with(|cell| *cell.borrow()) {
            return Ok(context);
        }

        Self::init()?;
        Self::current()
    }

    #[inline]
    pub fn ruid(&self) -> Uid {
        self.ruid
    }

    #[inline]
    pub fn euid(&self) -> Uid {
        self.euid
    }

    #[inline]
    pub fn rgid(&self) -> Gid {
        self.rgid
    }

    #[inline]
    pub fn privilege_level(&self) -> PrivilegeLevel {
        self.level
    }

    /// Mounting and joining namespaces both need an effective uid of 0.
    pub fn require_root(&self, program: &str) -> Result<()> {
        match self.level {
            PrivilegeLevel::Root | PrivilegeLevel::Setuid => Ok(()),
            PrivilegeLevel::Rootless => {
                bail!("{program} must be run as root or installed setuid root")
            }
            PrivilegeLevel::RootlessWithCapabilities => {
                bail!(ROOTLESS_WITH_CAPABILITY_ERROR_MESSAGE)
            }
        }
    }

    fn new() -> Result<Self> {
        let ruid = getuid();
        let euid = geteuid();
        let rgid = getgid();

        let level = classify(ruid, euid, has_any_permitted_capabilities)?;

        Ok(Self {
            ruid,
            euid,
            rgid,
            level,
        })
    }
}

fn classify<F>(ruid: Uid, euid: Uid, has_capabilities: F) -> Result<PrivilegeLevel>
where
    F: FnOnce() -> Result<bool>,
{
    let level = if ruid != euid {
        if !euid.is_root() {
            bail!(
                "FATAL: setuid binary must elevate to root (euid=0), but got euid={}",
                euid
            );
        }
        PrivilegeLevel::Setuid
    } else if euid.is_root() {
        PrivilegeLevel::Root
    } else if has_capabilities()? {
        PrivilegeLevel::RootlessWithCapabilities
    } else {
        PrivilegeLevel::Rootless
    };

    Ok(level)
}

fn has_any_permitted_capabilities() -> Result<bool> {
    let permitted =
        caps::read(None, CapSet::Permitted).context("Failed to read permitted capabilities")?;
    Ok(!permitted.is_empty())
}

pub(crate) const ROOTLESS_WITH_CAPABILITY_ERROR_MESSAGE: &str = "Unsupported configuration: Detected capabilities without setuid or root privileges. \
This may indicate that the binary is using file capabilities (setcap), which is not supported. \
Please install the binary setuid root instead, and retry.";
