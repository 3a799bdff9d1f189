//! Error taxonomy for the dispatcher core: admission, transport/HTTP
//! (delivered via `TaskHandler`, not returned here), redirect,
//! infrastructure, and lifecycle errors.

use dispatcher_common::config::ConfigError;

#[derive(thiserror::Error, Debug)]
pub enum DispatcherError {
    #[error("dispatcher is not running")]
    NotRunning,
    #[error("dispatcher is at capacity (max_connections reached)")]
    Refused,
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("timed out waiting for the dispatcher to reach the target state")]
    WaitTimedOut,
}

#[derive(thiserror::Error, Debug)]
pub enum PoolError {
    #[error("failed to build http client: {0}")]
    ClientBuild(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),
}
