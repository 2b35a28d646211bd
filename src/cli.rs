// src/cli.rs

//! CLI argument parsing using `clap`.

use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};

/// Command-line arguments for `multifork`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "multifork",
    version,
    about = "Run queued jobs in short-lived forked executors.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    ///
    /// Default: `Multifork.toml` in the current working directory. A missing
    /// default file means built-in defaults.
    #[arg(long, global = true, value_name = "PATH", default_value = "Multifork.toml")]
    pub config: String,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `MULTIFORK_LOG` or a default level will be used.
    #[arg(long, global = true, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Run the supervisor until shutdown.
    Work {
        /// Poll interval, overriding `worker.interval`. `0s` drains the
        /// queue and exits.
        #[arg(long, value_name = "DURATION", value_parser = humantime::parse_duration)]
        interval: Option<Duration>,

        /// Print the effective policies without running anything.
        #[arg(long)]
        dry_run: bool,
    },

    /// Add a shell command to the queue.
    Enqueue {
        #[arg(value_name = "COMMAND")]
        command: String,
    },

    /// Print queue counts and the claim table.
    Status,

    /// Run one orphan recovery scan.
    Recover,

    /// Executor mode, started by the supervisor.
    #[command(hide = true)]
    Executor,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn executor_args_match_what_the_supervisor_passes() {
        let args = CliArgs::try_parse_from(["multifork", "--config", "/tmp/m.toml", "executor"])
            .unwrap();
        assert_eq!(args.config, "/tmp/m.toml");
        assert!(matches!(args.command, Command::Executor));
    }

    #[test]
    fn work_interval_uses_humantime() {
        let args = CliArgs::try_parse_from(["multifork", "work", "--interval", "1m 30s"]).unwrap();
        match args.command {
            Command::Work { interval, dry_run } => {
                assert_eq!(interval, Some(Duration::from_secs(90)));
                assert!(!dry_run);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
