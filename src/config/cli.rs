use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

/// Command-line arguments for the cachekeeper binary.
#[derive(Debug, Parser)]
#[command(
    name = "cachekeeper",
    version,
    about = "Cache consistency and memory governance tools"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "CACHEKEEPER_CONFIG_FILE",
        value_name = "PATH"
    )]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: GlobalOverrides,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Enforce image memory quotas, periodically or once.
    Govern(GovernArgs),
    /// Print store memory usage per image category.
    Memory(MemoryArgs),
    /// Delete every key in the namespace matching a glob pattern.
    Flush(FlushArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct GlobalOverrides {
    /// Override the store connection URL.
    #[arg(long = "store-url", value_name = "URL")]
    pub store_url: Option<String>,

    /// Override the key namespace.
    #[arg(long = "cache-namespace", value_name = "PREFIX")]
    pub cache_namespace: Option<String>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct GovernArgs {
    /// Run a single check and exit.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub once: bool,

    /// Override the interval between checks.
    #[arg(long = "interval-seconds", value_name = "SECONDS")]
    pub interval_seconds: Option<u64>,

    /// Override the usage fraction above which quotas are enforced.
    #[arg(long = "memory-threshold", value_name = "FRACTION")]
    pub memory_threshold: Option<f64>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct MemoryArgs {
    /// Print the report as JSON.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub json: bool,
}

#[derive(Debug, Args, Clone)]
pub struct FlushArgs {
    /// Glob pattern relative to the namespace, e.g. `image:cover:*`.
    #[arg(value_name = "PATTERN")]
    pub pattern: String,
}
