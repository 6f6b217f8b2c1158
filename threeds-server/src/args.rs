//! CLI argument parsing.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use eyre::{eyre, WrapErr};
use threeds_core::{Environment, ThreeDsConfig};

/// 3-D Secure authentication server.
///
/// Settings come from flags, their environment variables, or a JSON config file.
#[derive(Parser)]
#[command(name = "threeds-server", version)]
pub struct Args {
    /// Address to listen on
    #[arg(long, env = "THREEDS_BIND", default_value = "127.0.0.1:9943")]
    pub bind: SocketAddr,

    /// JSON configuration file. Takes precedence over the individual settings below
    #[arg(long, env = "THREEDS_CONFIG", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Vendor environment: staging or production
    #[arg(long, env = "THREEDS_ENVIRONMENT", default_value = "staging")]
    pub environment: Environment,

    /// Base URL overriding the environment's, e.g. a local mock
    #[arg(long, env = "THREEDS_BASE_URL", value_name = "URL")]
    pub base_url: Option<String>,

    /// Vendor account identifier
    #[arg(long, env = "THREEDS_TOKENEX_ID")]
    pub tokenex_id: Option<String>,

    /// Vendor API key
    #[arg(long, env = "THREEDS_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Public URL the ACS posts the challenge response to
    #[arg(long, env = "THREEDS_CHALLENGE_NOTIFICATION_URL", value_name = "URL")]
    pub challenge_notification_url: Option<String>,

    /// Public URL the ACS posts the 3DS method notification to
    #[arg(long, env = "THREEDS_METHOD_NOTIFICATION_URL", value_name = "URL")]
    pub method_notification_url: Option<String>,

    /// Seconds between sweeps of stale correlation records
    #[arg(
        long,
        env = "THREEDS_SWEEP_INTERVAL_SECS",
        default_value_t = 60,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub sweep_interval_secs: u64,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info,threeds_core=debug,tower_http=debug")]
    pub log_filter: String,
}

impl Args {
    /// Resolves the core configuration.
    pub fn to_config(&self) -> eyre::Result<ThreeDsConfig> {
        if let Some(path) = &self.config {
            let json = std::fs::read_to_string(path)
                .wrap_err_with(|| format!("failed to read {}", path.display()))?;
            return ThreeDsConfig::from_json(&json)
                .wrap_err_with(|| format!("invalid configuration in {}", path.display()));
        }

        let config = ThreeDsConfig::from_environment(
            self.environment,
            required(self.tokenex_id.as_deref(), "--tokenex-id", "THREEDS_TOKENEX_ID")?,
            required(self.api_key.as_deref(), "--api-key", "THREEDS_API_KEY")?,
            required(
                self.challenge_notification_url.as_deref(),
                "--challenge-notification-url",
                "THREEDS_CHALLENGE_NOTIFICATION_URL",
            )?,
            required(
                self.method_notification_url.as_deref(),
                "--method-notification-url",
                "THREEDS_METHOD_NOTIFICATION_URL",
            )?,
        )?;
        let config = match &self.base_url {
            Some(base_url) => config.with_base_url(base_url),
            None => config,
        };
        config.validate()?;
        Ok(config)
    }

    /// Interval of the correlation record sweeper.
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn required<'a>(value: Option<&'a str>, flag: &str, env: &str) -> eyre::Result<&'a str> {
    value.ok_or_else(|| eyre!("{flag} (or {env}) is required"))
}
