mod cli;
mod config;
mod live;
mod server;

use clap::Parser;

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    cli::dispatch(cli::Cli::parse())
}
