mod cli;
mod demo;
mod ui;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Command};
use webpatcher::config::WebPatcherConfig;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = WebPatcherConfig::load()?;

    let filter = if cli.verbose {
        "webpatcher=debug"
    } else {
        config.log_filter.as_str()
    };
    webpatcher::logging::init(filter);
    tracing::debug!(signer = %config.signer, replay = config.event_replay, "configuration loaded");

    match cli.command {
        Command::Demo(args) => demo::run(&config, args, cli.verbose).await,
        Command::Describe(args) => demo::describe(args),
    }
}
