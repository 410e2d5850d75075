use crate::{
    CONTAINER_DIR_VAR, GLIBC_DIR_VAR, SOCK_DIR_VAR, UNDO_BIN_VAR, USER_LISTS_MAX,
    error::{Error, Result},
    plan::validate_capacity,
};
use clap::{ArgAction, Args, Parser};
use std::{ffi::OsString, path::PathBuf};

const HEADING_GENERAL: &str = "General";
const HEADING_MOUNT: &str = "Mount";
const HEADING_UNDO: &str = "Undo";
const HEADING_DEBUG: &str = "Debug";

#[derive(Parser, Debug)]
#[command(
    name = "voidnsrun",
    version,
    about = "Run a program with /usr (and more) bind-mounted from a container",
    disable_version_flag = true
)]
pub struct Config {
    #[command(flatten)]
    pub general: GeneralOptions,

    #[command(flatten)]
    pub mount: MountOptions,

    #[command(flatten)]
    pub undo: UndoOptions,

    #[command(flatten)]
    pub debug: DebugOptions,

    #[arg(
        value_name = "PROGRAM",
        required = true,
        trailing_var_arg = true,
        allow_hyphen_values = true,
        num_args = 1..,
        help = "Program to run, followed by its arguments"
    )]
    pub command: Vec<OsString>,
}

impl Config {
    /// Checks that clap cannot express: list capacities and `/usr` prefixes.
    pub fn validate(&self) -> Result<()> {
        validate_capacity("user mounts", self.mount.bind.len())?;
        validate_capacity("undo mounts", self.undo.undo_mount.len())?;
        validate_capacity("dir mounts", self.mount.usr_dir.len())?;

        for dir in &self.mount.usr_dir {
            if !dir.as_os_str().to_string_lossy().starts_with("/usr/") {
                return Err(Error::NotUsrSubdirectory(dir.clone()));
            }
        }

        Ok(())
    }

    pub fn program(&self) -> PathBuf {
        PathBuf::from(&self.command[0])
    }
}

#[derive(Args, Debug)]
pub struct GeneralOptions {
    #[arg(
        short = 'v',
        long,
        action = ArgAction::Version,
        help = "Print version",
        help_heading = HEADING_GENERAL
    )]
    pub version: Option<bool>,
}

#[derive(Args, Debug)]
pub struct MountOptions {
    #[arg(
        short = 'r',
        long,
        env = CONTAINER_DIR_VAR,
        value_name = "PATH",
        help = "Container path",
        help_heading = HEADING_MOUNT
    )]
    pub root: Option<PathBuf>,

    #[arg(
        short = 'm',
        long,
        value_name = "PATH",
        help = format!("Add bind mount (up to {USER_LISTS_MAX})"),
        help_heading = HEADING_MOUNT
    )]
    pub bind: Vec<PathBuf>,

    #[arg(
        short = 'd',
        long,
        value_name = "PATH",
        help = "Expose the host's /usr subdirectory instead of the container's",
        help_heading = HEADING_MOUNT
    )]
    pub usr_dir: Vec<PathBuf>,

    #[arg(
        short = 'i',
        long,
        help = "Don't treat missing source or target for added mounts as error",
        help_heading = HEADING_MOUNT
    )]
    pub ignore_missing: bool,
}

#[derive(Args, Debug)]
pub struct UndoOptions {
    #[arg(
        short = 'u',
        long,
        value_name = "PATH",
        help = format!("Add undo bind mount (up to {USER_LISTS_MAX})"),
        help_heading = HEADING_UNDO
    )]
    pub undo_mount: Vec<PathBuf>,

    #[arg(
        short = 'U',
        long,
        env = UNDO_BIN_VAR,
        value_name = "PATH",
        help = "Path to voidnsundo inside the container",
        help_heading = HEADING_UNDO
    )]
    pub undo_bin: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct DebugOptions {
    #[arg(short = 'V', long, help = "Enable verbose output", help_heading = HEADING_DEBUG)]
    pub verbose: bool,
}

/// Flags of `voidnsundo` when invoked under its own name.
#[derive(Parser, Debug)]
#[command(
    name = "voidnsundo",
    version,
    about = "Run a program in the original mount namespace from inside voidnsrun",
    disable_version_flag = true
)]
pub struct UndoConfig {
    #[command(flatten)]
    pub general: GeneralOptions,

    #[arg(
        short = 's',
        long,
        value_name = "DIR",
        help = format!("Socket directory (default: ${SOCK_DIR_VAR}, then {})", crate::SOCK_DIR_DEFAULT),
        help_heading = HEADING_GENERAL
    )]
    pub socket_dir: Option<PathBuf>,

    #[command(flatten)]
    pub debug: DebugOptions,

    #[arg(
        value_name = "PROGRAM",
        required = true,
        trailing_var_arg = true,
        allow_hyphen_values = true,
        num_args = 1..,
        help = "Program to run, followed by its arguments"
    )]
    pub command: Vec<OsString>,
}

/// Flags of `glibcrun`.
#[derive(Parser, Debug)]
#[command(
    name = "glibcrun",
    version,
    about = "Run a program or shell with /usr and the xbps database taken from a glibc tree",
    disable_version_flag = true
)]
pub struct GlibcConfig {
    #[command(flatten)]
    pub general: GeneralOptions,

    #[arg(
        short = 'r',
        long,
        env = GLIBC_DIR_VAR,
        value_name = "PATH",
        help = "Root of the glibc tree",
        help_heading = HEADING_MOUNT
    )]
    pub root: Option<PathBuf>,

    #[command(flatten)]
    pub debug: DebugOptions,

    #[arg(
        value_name = "PROGRAM",
        trailing_var_arg = true,
        allow_hyphen_values = true,
        num_args = 0..,
        help = "Program to run, followed by its arguments (default: $SHELL)"
    )]
    pub command: Vec<OsString>,
}
