use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the shopdesk binary.
#[derive(Debug, Parser)]
#[command(
    name = "shopdesk",
    version,
    about = "Read the shop admin API through the query cache"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "SHOPDESK_CONFIG_FILE",
        value_name = "PATH",
        value_hint = ValueHint::FilePath
    )]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: Overrides,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Fetch a resource once and print the JSON payload.
    Get(GetArgs),
    /// Keep a resource observed and refetch it on an interval.
    Watch(WatchArgs),
}

#[derive(Debug, Args, Clone)]
pub struct ResourceArgs {
    /// Path relative to the API base URL, e.g. `/products`.
    #[arg(value_name = "PATH")]
    pub path: String,

    /// Query parameter as `key=value`; may be repeated.
    #[arg(long = "param", value_name = "KEY=VALUE", value_parser = parse_param)]
    pub params: Vec<(String, String)>,
}

#[derive(Debug, Args, Clone)]
pub struct GetArgs {
    #[command(flatten)]
    pub resource: ResourceArgs,
}

#[derive(Debug, Args, Clone)]
pub struct WatchArgs {
    #[command(flatten)]
    pub resource: ResourceArgs,

    /// Seconds between refetches.
    #[arg(long = "interval-seconds", value_name = "SECONDS", default_value_t = 30)]
    pub interval_seconds: u64,

    /// Stop after this many refetches; runs until interrupted when omitted.
    #[arg(long, value_name = "COUNT")]
    pub count: Option<u64>,
}

/// Settings overrides accepted by every command.
#[derive(Debug, Args, Default, Clone)]
pub struct Overrides {
    /// Override the API base URL.
    #[arg(long = "api-url", value_name = "URL", global = true)]
    pub api_url: Option<String>,

    /// Override the API bearer token.
    #[arg(
        long = "api-token",
        env = "SHOPDESK_API_TOKEN",
        value_name = "TOKEN",
        hide_env_values = true,
        global = true
    )]
    pub api_token: Option<String>,

    /// Override the API request timeout.
    #[arg(long = "api-timeout-seconds", value_name = "SECONDS", global = true)]
    pub api_timeout_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub log_json: Option<bool>,

    /// Override how long fetched data is served without refetching.
    #[arg(long = "stale-time-ms", value_name = "MILLIS", global = true)]
    pub stale_time_ms: Option<u64>,

    /// Override how long fetched data stays cached.
    #[arg(long = "cache-time-ms", value_name = "MILLIS", global = true)]
    pub cache_time_ms: Option<u64>,
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got `{raw}`"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("parameter name is empty in `{raw}`"));
    }
    Ok((key.to_string(), value.to_string()))
}
