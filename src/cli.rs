//! CLI argument definitions using clap derive macros.

use clap::{Parser, Subcommand};

/// Run a crawl with one of the bundled spiders.
#[derive(Parser, Debug)]
#[command(name = "spider")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Crawl with the named spider
    Run {
        /// Spider name (see `spider run --help` for the list)
        spider: String,

        /// Override a setting, e.g. --set DOWNLOAD_DELAY=2 (repeatable)
        #[arg(short = 's', long = "set", value_name = "KEY=VALUE")]
        set: Vec<String>,
    },
}

impl Args {
    /// Default filter directive when `RUST_LOG` is unset. Flags win over
    /// the `LOG_LEVEL` setting.
    pub fn log_level<'a>(&self, setting: Option<&'a str>) -> &'a str {
        if self.quiet {
            "error"
        } else {
            match self.verbose {
                0 => setting.unwrap_or("info"),
                1 => "debug",
                _ => "trace",
            }
        }
    }
}
