use crate::error::Result;
use nix::unistd::{ForkResult, Pid, fork, getpid};

/// Which side of the fork the current process ended up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The original process; goes on to drop privileges and exec the target.
    Launcher { broker: Pid },
    /// The child; keeps root and serves the namespace handle.
    Broker { parent_before_fork: Pid },
}

/// Forks the current process into the launcher (parent) and broker (child).
///
/// Privilege drop and namespace joins are process-wide, so each role gets
/// its own process.
pub fn split_roles() -> Result<Role> {
    let parent_before_fork = getpid();

    // SAFETY: the process is single-threaded at this point.
    match unsafe { fork()? } {
        ForkResult::Parent { child } => Ok(Role::Launcher { broker: child }),
        ForkResult::Child => Ok(Role::Broker { parent_before_fork }),
    }
}
