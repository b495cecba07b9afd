//! divvy - fork-based parallel task runner

mod cli;
mod error;
mod logging;
mod master;
mod protocol;
mod signals;
mod task;
mod taskfile;
mod worker;

use anyhow::Result;
use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stderr};

use cli::Cli;
use master::Master;
use taskfile::ScriptTask;

fn main() {
    let cli = Cli::parse();
    logging::init(cli.log_config());

    if let Err(e) = run(&cli) {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

/// Load the task definition and run it to completion.
fn run(cli: &Cli) -> Result<()> {
    let task = ScriptTask::load(&cli.taskfile)?;
    let master = Master::new(task, cli.workers, cli.verbose > 0)?;
    master.run()?;
    Ok(())
}
