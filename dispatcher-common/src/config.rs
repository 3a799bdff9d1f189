//! Runtime configuration, loaded from the environment the way
//! `hook-worker::config::Config` is: an `envconfig::Envconfig` derive with
//! small `FromStr` newtypes for anything that isn't a bare scalar.

use std::str::FromStr;
use std::time::Duration;

use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(default = "128")]
    pub max_connections: usize,

    #[envconfig(default = "30000")]
    pub request_timeout: EnvMsDuration,

    #[envconfig(default = "5000")]
    pub shutdown_timeout: EnvMsDuration,

    #[envconfig(default = "10485760")]
    pub max_response_size: usize,

    pub user_agent: Option<String>,

    #[envconfig(default = "false")]
    pub raise_error_responses: bool,

    #[envconfig(default = "10")]
    pub max_redirects: u32,

    #[envconfig(default = "32")]
    pub connection_pool_size: usize,

    pub connection_timeout: Option<EnvMsDuration>,

    pub proxy_url: Option<String>,

    #[envconfig(default = "0")]
    pub retries: u32,

    #[envconfig(default = "65536")]
    pub payload_store_threshold: usize,

    #[envconfig(default = "5000")]
    pub heartbeat_interval: EnvMsDuration,

    #[envconfig(default = "60000")]
    pub orphan_threshold: EnvMsDuration,

    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3302")]
    pub port: u16,

    #[envconfig(default = "redis://localhost:6379/")]
    pub redis_url: String,
}

impl Config {
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Cross-field invariants that cannot be expressed per-field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval.0 >= self.orphan_threshold.0 {
            return Err(ConfigError::HeartbeatNotBelowOrphanThreshold {
                heartbeat_interval: self.heartbeat_interval.0,
                orphan_threshold: self.orphan_threshold.0,
            });
        }
        if self.max_connections == 0 {
            return Err(ConfigError::ZeroMaxConnections);
        }
        Ok(())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("heartbeat_interval ({heartbeat_interval:?}) must be less than orphan_threshold ({orphan_threshold:?})")]
    HeartbeatNotBelowOrphanThreshold {
        heartbeat_interval: Duration,
        orphan_threshold: Duration,
    },
    #[error("max_connections must be positive")]
    ZeroMaxConnections,
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub Duration);

impl EnvMsDuration {
    pub fn get(self) -> Duration {
        self.0
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("{0} is not a valid millisecond duration")]
pub struct ParseEnvMsDurationError(String);

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError(s.to_owned()))?;
        Ok(EnvMsDuration(Duration::from_millis(ms)))
    }
}
