use anyhow::Context;
use std::process::ExitCode;
use voidnsrun::{
    SOCK_DIR_VAR, checks,
    context::GlobalContext,
    logging,
    undo::{InvocationMode, ProcSelfExe, UndoClient},
};

fn main() -> ExitCode {
    match run() {
        Ok(never) => match never {},
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> anyhow::Result<std::convert::Infallible> {
    let mode = InvocationMode::detect(std::env::args_os().collect(), &ProcSelfExe)
        .context("Failed to resolve the executable path")?;
    logging::init(mode.verbose());

    GlobalContext::init()?;
    let context = GlobalContext::current()?;

    let client = UndoClient::new(mode, std::env::var_os(SOCK_DIR_VAR).as_deref(), context)?;

    context.require_root("voidnsundo")?;
    checks::ensure_mount_namespaces()?;

    Ok(client.run()?)
}
