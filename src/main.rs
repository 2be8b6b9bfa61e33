//! Delta - an interactive shell enhancement layer.
//!
//! Thin binary entry point: builds the runtime, wires the capability graph,
//! and hands lines to the facade.

use anyhow::{Context, Result};
use clap::Parser;
use std::process::ExitCode;

mod cli;
mod session;

use cli::args::Cli;

/// Exit code for configuration and initialization failures.
const EXIT_CONFIG: u8 = 2;

fn main() -> ExitCode {
    let args = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build Tokio runtime")
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("delta: {err:#}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    match runtime.block_on(run(args)) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("delta: {err:#}");
            ExitCode::from(EXIT_CONFIG)
        }
    }
}

async fn run(args: Cli) -> Result<ExitCode> {
    session::init_tracing(&args)?;

    let mut session = session::Session::bootstrap(&args).await?;

    let code = if let Some(command) = &args.command {
        session.run_single(command).await?
    } else {
        session.run_repl().await?
    };

    session.shutdown().await;
    Ok(code)
}
