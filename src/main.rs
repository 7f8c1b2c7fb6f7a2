//! The `cwl-oscar` command line tool.

use anyhow::Result;
use clap::Parser;
use cwl_oscar::Cli;
use cwl_oscar::Command;
use cwl_oscar::logging;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbosity());

    let result = match cli.command {
        Command::Run(cmd) => cmd.exec().await,
        Command::LocalRunner(cmd) => cmd.exec().await,
    };

    if let Err(e) = result {
        eprintln!("error: {e:?}");
        std::process::exit(1);
    }

    Ok(())
}
