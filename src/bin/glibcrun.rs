use clap::Parser;
use std::{convert::Infallible, process::ExitCode};
use voidnsrun::{
    GLIBC_DIR_VAR, checks,
    config::GlibcConfig,
    context::GlobalContext,
    glibcrun::{GlibcRun, target_argv},
    logging,
    mount::SysMounter,
    paths::{HostPaths, resolve_root},
};

fn main() -> ExitCode {
    let config = GlibcConfig::parse();
    logging::init(config.debug.verbose);

    match run(config) {
        Ok(never) => match never {},
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(config: GlibcConfig) -> anyhow::Result<Infallible> {
    let root = resolve_root(&HostPaths, config.root.as_deref(), GLIBC_DIR_VAR)?;

    GlobalContext::init()?;
    let context = GlobalContext::current()?;
    context.require_root("glibcrun")?;
    checks::ensure_mount_namespaces()?;

    let argv = target_argv(config.command, std::env::var_os("SHELL"));
    Ok(GlibcRun::new(context, root, argv).run(&SysMounter)?)
}
