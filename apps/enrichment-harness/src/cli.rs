use clap::{Args, Parser};
use std::path::PathBuf;

use crate::telemetry::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "enrichment-harness",
    about = "Replay an enrichment table scenario and print the resulting grid",
    version
)]
pub struct Cli {
    #[arg(long, value_name = "PATH", help = "Scenario file (JSON)")]
    pub scenario: PathBuf,

    #[arg(long, help = "Pretty-print the summary")]
    pub pretty: bool,

    #[command(flatten)]
    pub logging: LoggingArgs,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "ENRICH_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "ENRICH_LOG_FILE",
        help = "Write logs to the specified file instead of stderr"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}
