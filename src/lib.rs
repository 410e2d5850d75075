//! Run a program against a container's `/usr` in a private mount namespace,
//! with a broker that lets selected programs get back to the host.

pub mod broker;
pub mod checks;
pub mod config;
pub mod context;
pub mod error;
pub mod glibcrun;
pub mod hardener;
pub mod launcher;
pub mod logging;
pub mod mount;
pub mod oldroot;
pub mod paths;
pub mod plan;
pub mod privsep;
pub mod rendezvous;
pub mod sandbox;
pub mod undo;
pub mod utils;

pub use error::{Error, Result};

/// Upper bound for each of the `-m`, `-u` and `-d` lists.
pub const USER_LISTS_MAX: usize = 50;

pub const CONTAINER_DIR_VAR: &str = "VOIDNSRUN_DIR";
pub const UNDO_BIN_VAR: &str = "VOIDNSUNDO_BIN";
pub const SOCK_DIR_VAR: &str = "VOIDNSUNDO_SOCK_DIR";
pub const GLIBC_DIR_VAR: &str = "GLIBCRUN_DIR";

/// Name under which the undo tool parses its own flags.
pub const UNDO_TOOL_NAME: &str = "voidnsundo";

pub const SOCK_DIR_DEFAULT: &str = "/run/voidnsrun";
pub const SOCK_NAME: &str = "/sock";

/// Host path where the original `/usr` stays reachable inside the sandbox.
pub const OLDROOT: &str = "/oldroot";

pub const PRIVATE_TMPFS_OPTIONS: &str = "size=4k,mode=0700,uid=0,gid=0";
