//! Command line interface of the `webpatcher` binary.

use clap::{Args, Parser, Subcommand};

/// Runs patch jobs against the built-in scripted engine.
#[derive(Debug, Parser)]
#[command(name = "webpatcher", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run one job over the sample bundles and print its event timeline.
    Demo(DemoArgs),

    /// Print the metadata report for the sample bundles as JSON.
    Describe(DescribeArgs),
}

#[derive(Debug, Clone, Default, Args)]
pub struct DemoArgs {
    /// Patch options as JSON, e.g. '{"Custom theme": {"color": "#ff0000"}}'.
    #[arg(long)]
    pub options: Option<String>,

    /// Explicit patch selection as a JSON array of names.
    #[arg(long)]
    pub select: Option<String>,

    /// Ignore compatibility constraints.
    #[arg(long, default_value_t = false)]
    pub force: bool,

    /// Make the named patch fail.
    #[arg(long, value_name = "PATCH")]
    pub fail: Option<String>,

    /// Report completions in reverse submission order.
    #[arg(long, default_value_t = false)]
    pub reverse: bool,
}

#[derive(Debug, Clone, Default, Args)]
pub struct DescribeArgs {
    /// Package name of the target to evaluate compatibility against.
    #[arg(long)]
    pub package: Option<String>,

    /// Version of the target package.
    #[arg(long = "package-version", requires = "package")]
    pub package_version: Option<String>,
}
