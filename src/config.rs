//! Configuration parsing and validation for the gateway
//!
//! This module handles command-line argument parsing and validation using clap. Every flag can
//! also be given through the environment.
use anyhow::anyhow;
use clap::{Parser, ValueEnum};
use hordegate::client::ClientSettings;
use hordegate::horde::PollPolicy;
use hordegate::settings::{DEFAULT_UPSTREAM_URL, HordeDefaults, HordeSettings};
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TunnelKind {
    None,
    Cloudflared,
}

#[derive(Debug, Clone, Parser)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// The address on which the gateway will listen.
    #[arg(long, env = "HORDEGATE_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// The port on which the gateway will listen.
    #[arg(short = 'p', long, env = "HORDEGATE_PORT", default_value_t = 5000)]
    pub port: u16,

    /// Base URL of the horde API; every upstream path is joined onto it.
    #[arg(long, env = "HORDEGATE_UPSTREAM_URL", default_value = DEFAULT_UPSTREAM_URL)]
    pub upstream_url: Url,

    /// Prompts longer than this many characters lose their oldest text.
    #[arg(long, env = "HORDEGATE_MAX_PROMPT_LENGTH", default_value_t = 2048)]
    pub max_prompt_length: usize,

    /// Models submitted when a request asks for the `list` model.
    #[arg(long, env = "HORDEGATE_PREDEFINED_MODELS", value_delimiter = ',')]
    pub predefined_models: Vec<String>,

    /// JSON file with default generation `params` and extra request `settings`.
    #[arg(short = 'f', long, env = "HORDEGATE_DEFAULTS_FILE")]
    pub defaults_file: Option<PathBuf>,

    /// Delay between job status checks.
    #[arg(long, env = "HORDEGATE_POLL_INTERVAL_MS", default_value_t = 1000)]
    pub poll_interval_ms: u64,

    /// How long to wait for a generation before giving up on it.
    #[arg(long, env = "HORDEGATE_GENERATION_TIMEOUT_SECS", default_value_t = 120)]
    pub generation_timeout_secs: u64,

    /// Timeout for establishing upstream connections.
    #[arg(long, default_value_t = 10)]
    pub connect_timeout_secs: u64,

    /// Timeout for receiving the response head of a single upstream call.
    #[arg(long, default_value_t = 60)]
    pub request_timeout_secs: u64,

    /// Maximum number of idle HTTP connections to keep alive per upstream host.
    #[arg(long, default_value_t = 100)]
    pub pool_max_idle_per_host: usize,

    /// How long (in seconds) to keep idle HTTP connections alive.
    #[arg(long, default_value_t = 90)]
    pub pool_idle_timeout_secs: u64,

    /// Whether to enable the metrics endpoint.
    #[arg(short = 'm', long, env = "HORDEGATE_METRICS", default_value_t = false)]
    pub metrics: bool,

    /// The port on which the metrics server will listen.
    #[arg(long, default_value_t = 9090)]
    pub metrics_port: u16,

    /// The prefix to use for metrics.
    #[arg(long, default_value = "hordegate")]
    pub metrics_prefix: String,

    /// Expose the gateway through a public tunnel.
    #[arg(long, env = "HORDEGATE_TUNNEL", value_enum, default_value = "none")]
    pub tunnel: TunnelKind,

    /// Token for a named cloudflared tunnel.
    #[arg(long, env = "CLOUDFLARED_TOKEN", hide_env_values = true)]
    pub cloudflared_token: Option<String>,

    /// File the tunnel's output is appended to.
    #[arg(long, env = "HORDEGATE_TUNNEL_LOG_FILE", default_value = "tunnel.log")]
    pub tunnel_log_file: PathBuf,
}

impl Config {
    pub fn validate(mut self) -> Result<Self, anyhow::Error> {
        if self.max_prompt_length == 0 {
            return Err(anyhow!("--max-prompt-length must be greater than zero"));
        }
        if self.poll_interval_ms == 0 {
            return Err(anyhow!("--poll-interval-ms must be greater than zero"));
        }
        if let Some(path) = &self.defaults_file
            && !path.exists()
        {
            return Err(anyhow!(
                "Defaults file '{}' does not exist",
                path.display()
            ));
        }

        self.predefined_models = self
            .predefined_models
            .into_iter()
            .map(|model| model.trim().to_string())
            .filter(|model| !model.is_empty())
            .collect();
        Ok(self)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            pool_idle_timeout: Duration::from_secs(self.pool_idle_timeout_secs),
            pool_max_idle_per_host: self.pool_max_idle_per_host,
        }
    }

    pub fn horde_settings(&self, defaults: HordeDefaults) -> HordeSettings {
        HordeSettings::builder()
            .upstream_url(self.upstream_url.clone())
            .max_prompt_length(self.max_prompt_length)
            .predefined_models(self.predefined_models.clone())
            .default_params(defaults.params)
            .request_settings(defaults.settings)
            .poll_policy(PollPolicy {
                interval: Duration::from_millis(self.poll_interval_ms),
                timeout: Duration::from_secs(self.generation_timeout_secs),
            })
            .request_timeout(Duration::from_secs(self.request_timeout_secs))
            .build()
    }
}
