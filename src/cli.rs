//! Command-line interface definitions using clap.

use std::path::PathBuf;

use clap::Parser;
use tracing::Level;

use crate::logging::{LogConfig, LogFormat, parse_level};

/// divvy - fork-based parallel task runner
#[derive(Parser, Debug)]
#[command(name = "divvy")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the task definition file (YAML).
    pub taskfile: PathBuf,

    /// Number of worker processes.
    #[arg(short = 'n', long = "workers", default_value_t = 1)]
    pub workers: usize,

    /// Enable verbose output (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Log level: error, warn, info, debug, trace.
    #[arg(long, env = "DIVVY_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Log format: pretty, compact, json.
    #[arg(long, env = "DIVVY_LOG_FORMAT")]
    pub log_format: Option<String>,
}

impl Cli {
    /// Build the logging configuration from flags and environment.
    pub fn log_config(&self) -> LogConfig {
        let level = match self.verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        };
        let mut config = LogConfig::new().with_level(level);
        if let Some(ref level) = self.log_level
            && let Some(level) = parse_level(level)
        {
            config.level = level;
        }
        if let Some(ref format) = self.log_format
            && let Ok(format) = format.parse::<LogFormat>()
        {
            config = config.with_format(format);
        }
        config.with_env_overrides()
    }
}
