//! Command-line and environment configuration for the recent-tracks server
//!
//! This module parses CLI arguments using clap, falling back to the
//! environment variables the service has always read (`LASTFM_API_KEY`,
//! `LASTFM_USER`, `LISTEN`), and resolves them into a `ServerConfig`.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;

use crate::cache::DEFAULT_TTL;
use crate::data::lastfm::{DEFAULT_TIMEOUT, LASTFM_BASE_URL};

/// Listen address used when neither `--listen` nor `LISTEN` is set
pub const DEFAULT_LISTEN: &str = ":9123";

/// Error types for CLI argument parsing
#[derive(Debug, Error)]
pub enum CliError {
    /// The listen address is neither `host:port` nor `:port`
    #[error("Invalid listen address: '{0}'. Expected ':port' or 'ip:port'")]
    InvalidListen(String),

    /// A required credential is empty
    #[error("Missing {0}: set it with the flag or its environment variable")]
    MissingCredential(&'static str),

    /// A duration that must be positive is zero
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
}

/// nowplaying - serve a Last.fm user's recent tracks as cached JSON
#[derive(Parser, Debug)]
#[command(name = "nowplaying")]
#[command(about = "Serve a Last.fm user's recent tracks as cached JSON")]
#[command(version)]
pub struct Cli {
    /// Last.fm API key
    #[arg(long, env = "LASTFM_API_KEY", hide_env_values = true)]
    pub api_key: String,

    /// Last.fm user whose recent tracks are served
    #[arg(long, env = "LASTFM_USER")]
    pub user: String,

    /// Address to listen on, ':port' binds every interface
    #[arg(long, env = "LISTEN", default_value = DEFAULT_LISTEN)]
    pub listen: String,

    /// Seconds a fetched snapshot is served before refreshing
    #[arg(long, env = "CACHE_TTL_SECS", default_value_t = DEFAULT_TTL.as_secs())]
    pub cache_ttl_secs: u64,

    /// Seconds before an upstream request is abandoned
    #[arg(long, env = "UPSTREAM_TIMEOUT_SECS", default_value_t = DEFAULT_TIMEOUT.as_secs())]
    pub upstream_timeout_secs: u64,

    /// Last.fm API endpoint
    #[arg(long, env = "LASTFM_API_URL", default_value = LASTFM_BASE_URL)]
    pub upstream_url: String,
}

/// Configuration derived from CLI arguments for server startup
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub api_key: String,
    pub user: String,
    pub cache_ttl: Duration,
    pub upstream_timeout: Duration,
    pub upstream_url: String,
}

/// Parses a listen address, accepting the `:port` shorthand for all interfaces
///
/// # Returns
/// * `Ok(SocketAddr)` for `:9123`, `127.0.0.1:8080`, `[::1]:80`, ...
/// * `Err(CliError::InvalidListen)` otherwise
pub fn parse_listen_addr(s: &str) -> Result<SocketAddr, CliError> {
    let s = s.trim();
    let candidate = if s.starts_with(':') {
        format!("0.0.0.0{}", s)
    } else {
        s.to_string()
    };

    candidate
        .parse()
        .map_err(|_| CliError::InvalidListen(s.to_string()))
}

impl ServerConfig {
    /// Creates a ServerConfig from parsed CLI arguments.
    ///
    /// # Returns
    /// * `Ok(ServerConfig)` with resolved address and durations
    /// * `Err(CliError)` if a value is unusable
    pub fn from_cli(cli: &Cli) -> Result<Self, CliError> {
        if cli.api_key.trim().is_empty() {
            return Err(CliError::MissingCredential("LASTFM_API_KEY"));
        }
        if cli.user.trim().is_empty() {
            return Err(CliError::MissingCredential("LASTFM_USER"));
        }
        if cli.cache_ttl_secs == 0 {
            return Err(CliError::ZeroDuration("cache TTL"));
        }
        if cli.upstream_timeout_secs == 0 {
            return Err(CliError::ZeroDuration("upstream timeout"));
        }

        Ok(ServerConfig {
            listen: parse_listen_addr(&cli.listen)?,
            api_key: cli.api_key.trim().to_string(),
            user: cli.user.trim().to_string(),
            cache_ttl: Duration::from_secs(cli.cache_ttl_secs),
            upstream_timeout: Duration::from_secs(cli.upstream_timeout_secs),
            upstream_url: cli.upstream_url.clone(),
        })
    }
}
