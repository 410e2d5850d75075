use clap::Parser;
use std::process::ExitCode;
use voidnsrun::{config::Config, context::GlobalContext, logging, sandbox::Sandbox};

fn main() -> ExitCode {
    let config = Config::parse();
    logging::init(config.debug.verbose);

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(config: Config) -> anyhow::Result<()> {
    GlobalContext::init()?;

    let sandbox = Sandbox::new(config)?;
    sandbox.spawn()
}
