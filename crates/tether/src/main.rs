//! tether - closure lifetime driver
//!
//! Runs built-in lifetime scenarios against the reference engine and prints
//! what the bridge did, with memory reports before and after teardown.

mod commands;
mod scenarios;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};

/// Closure lifetime scenarios
#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(author, version, about = "Run closure lifetime scenarios against the reference engine")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Output format
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Clone, Copy, Debug, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a lifetime scenario
    Run(commands::run::RunArgs),

    /// List the built-in scenarios
    List(commands::list::ListArgs),
}

/// `RUST_LOG` wins; otherwise `-v` raises the default level.
fn init_logging(verbose: u8, quiet: bool) {
    let level = match (quiet, verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info",
        (false, 2) => "debug",
        (false, _) => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    // Determine if colors should be used
    let use_color = !cli.no_color && !cli.quiet && atty::is(atty::Stream::Stdout);

    let command = match cli.command {
        Some(command) => command,
        None => {
            let mut cmd = <Cli as clap::CommandFactory>::command();
            cmd.print_help()?;
            println!();
            return Ok(());
        }
    };

    match command {
        Commands::Run(args) => commands::run::run(args, cli.format, use_color, cli.quiet),
        Commands::List(args) => commands::list::run(args, cli.format, use_color),
    }
}
