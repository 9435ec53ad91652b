use anyhow::{anyhow, Context, Result};
use clap::Parser;

/// Guildhall sync core configuration.
///
/// Configuration priority: CLI args > Environment variables > Defaults
#[derive(Parser, Debug, Default)]
#[command(name = "guildhall-sync")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Guildhall client sync core", long_about = None)]
pub struct CliArgs {
    /// REST API base URL
    #[arg(long, env = "API_URL")]
    pub api_url: Option<String>,

    /// Realtime push channel URL
    #[arg(long, env = "CHANNEL_URL")]
    pub channel_url: Option<String>,

    /// Session token attached to HTTP calls and the channel handshake
    #[arg(long, env = "AUTH_TOKEN")]
    pub auth_token: Option<String>,

    /// Path of the durable cache snapshot
    #[arg(long, env = "CACHE_PATH")]
    pub cache_path: Option<String>,

    /// Number of recent activity records to keep in memory (10-10000)
    #[arg(long, env = "KEEP_ACTIVITY")]
    pub keep_activity: Option<usize>,

    /// HTTP request timeout in milliseconds (1000-60000)
    #[arg(long, env = "HTTP_TIMEOUT_MS")]
    pub http_timeout_ms: Option<u64>,

    /// Number of retry attempts for rate-limited HTTP requests (0-10)
    #[arg(long, env = "HTTP_RETRIES")]
    pub http_retries: Option<u32>,

    /// Base reconnect delay in milliseconds (100-10000)
    #[arg(long, env = "RECONNECT_BASE_MS")]
    pub reconnect_base_ms: Option<u64>,

    /// Reconnect delay ceiling in milliseconds (1000-300000)
    #[arg(long, env = "RECONNECT_MAX_MS")]
    pub reconnect_max_ms: Option<u64>,

    /// Reconnect attempts before giving up (0-100)
    #[arg(long, env = "RECONNECT_MAX_RETRIES")]
    pub reconnect_max_retries: Option<u32>,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub api_url: String,
    pub channel_url: String,
    pub auth_token: Option<String>,
    pub cache_path: String,
    pub keep_activity: usize,
    pub http_timeout_ms: u64,
    pub http_retries: u32,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub reconnect_max_retries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            api_url: "https://api.guildhall.dev".into(),
            channel_url: "wss://push.guildhall.dev/ws".into(),
            auth_token: None,
            cache_path: "./guildhall_cache.json".into(),
            keep_activity: 200,
            http_timeout_ms: 8000,
            http_retries: 2,
            reconnect_base_ms: 500,
            reconnect_max_ms: 30_000,
            reconnect_max_retries: 10,
        }
    }
}

/// Validate that a value is within a given range (inclusive)
fn validate_in_range<T>(val: T, min: T, max: T, name: &str) -> Result<T>
where
    T: PartialOrd + std::fmt::Display + Copy,
{
    if val < min || val > max {
        Err(anyhow!("{name} must be in range [{min}, {max}], got {val}"))
    } else {
        Ok(val)
    }
}

/// Validate URL format (basic scheme check)
fn validate_url(url: &str, name: &str) -> Result<()> {
    if url.is_empty() {
        return Err(anyhow!("{name} cannot be empty"));
    }
    if url.starts_with("ws://")
        || url.starts_with("wss://")
        || url.starts_with("http://")
        || url.starts_with("https://")
    {
        Ok(())
    } else {
        Err(anyhow!(
            "{name} must start with ws://, wss://, http://, or https://"
        ))
    }
}

/// Load configuration from CLI args and environment variables.
pub fn load() -> Result<Config> {
    dotenvy::dotenv().ok();
    from_args(CliArgs::parse()).context("failed to load configuration")
}

/// Build a validated config from parsed args (env fallbacks are applied by
/// clap's `env` attribute).
pub fn from_args(args: CliArgs) -> Result<Config> {
    let defaults = Config::default();

    let api_url = args.api_url.unwrap_or(defaults.api_url);
    validate_url(&api_url, "API_URL")?;

    let channel_url = args.channel_url.unwrap_or(defaults.channel_url);
    validate_url(&channel_url, "CHANNEL_URL")?;

    let keep_activity = validate_in_range(
        args.keep_activity.unwrap_or(defaults.keep_activity),
        10,
        10_000,
        "KEEP_ACTIVITY",
    )?;

    let http_timeout_ms = validate_in_range(
        args.http_timeout_ms.unwrap_or(defaults.http_timeout_ms),
        1000,
        60_000,
        "HTTP_TIMEOUT_MS",
    )?;

    let http_retries = validate_in_range(
        args.http_retries.unwrap_or(defaults.http_retries),
        0,
        10,
        "HTTP_RETRIES",
    )?;

    let reconnect_base_ms = validate_in_range(
        args.reconnect_base_ms.unwrap_or(defaults.reconnect_base_ms),
        100,
        10_000,
        "RECONNECT_BASE_MS",
    )?;

    let reconnect_max_ms = validate_in_range(
        args.reconnect_max_ms.unwrap_or(defaults.reconnect_max_ms),
        1000,
        300_000,
        "RECONNECT_MAX_MS",
    )?;

    if reconnect_base_ms > reconnect_max_ms {
        return Err(anyhow!(
            "RECONNECT_BASE_MS ({reconnect_base_ms}) must not exceed RECONNECT_MAX_MS ({reconnect_max_ms})"
        ));
    }

    let reconnect_max_retries = validate_in_range(
        args.reconnect_max_retries
            .unwrap_or(defaults.reconnect_max_retries),
        0,
        100,
        "RECONNECT_MAX_RETRIES",
    )?;

    Ok(Config {
        api_url,
        channel_url,
        auth_token: args.auth_token,
        cache_path: args.cache_path.unwrap_or(defaults.cache_path),
        keep_activity,
        http_timeout_ms,
        http_retries,
        reconnect_base_ms,
        reconnect_max_ms,
        reconnect_max_retries,
    })
}
