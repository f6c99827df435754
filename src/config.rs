//! This module controls configuration parsing from the environment,
//! providing a convenience mechanism for the rest of the program. Per the
//! wire protocol, every field here has a documented default; nothing here
//! is required to run the controller in its default topology.

use std::net::IpAddr;
use std::time::Duration;

/// Errors produced by [`Config`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A configured env var could not be parsed as the expected type.
    #[error("invalid value for {name}: {value:?}")]
    InvalidValue { name: &'static str, value: String },
}

fn env_or<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, Error> {
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .map_err(|_| Error::InvalidValue { name, value }),
        Err(_) => Ok(default),
    }
}

/// Runtime configuration for the head controller. All fields may be
/// supplied via environment variable (documented defaults in parens); see
/// [`Config::from_env`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// `CLIENT_PORT` (7777) — ingress datagram port.
    pub client_port: u16,
    /// `WORKER_PORT` (7778) — worker bus datagram port.
    pub worker_port: u16,
    /// `HEALTH_PORT` (8080) — observability surface.
    pub health_port: u16,
    /// `WORKER_TIMEOUT` (30s) — liveness window.
    pub worker_timeout: Duration,
    /// `REQUEST_TIMEOUT` (60s) — pending-request TTL.
    pub request_timeout: Duration,
    /// `MAX_PENDING` (10000) — tracker capacity.
    pub max_pending: usize,
    /// Interface to bind all sockets on. Not independently configurable;
    /// always all interfaces.
    pub bind_addr: IpAddr,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client_port: 7777,
            worker_port: 7778,
            health_port: 8080,
            worker_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(60),
            max_pending: 10_000,
            bind_addr: IpAddr::from([0, 0, 0, 0]),
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to the
    /// documented defaults for any variable that is unset.
    pub fn from_env() -> Result<Self, Error> {
        let default = Self::default();
        Ok(Self {
            client_port: env_or("CLIENT_PORT", default.client_port)?,
            worker_port: env_or("WORKER_PORT", default.worker_port)?,
            health_port: env_or("HEALTH_PORT", default.health_port)?,
            worker_timeout: Duration::from_secs(env_or(
                "WORKER_TIMEOUT",
                default.worker_timeout.as_secs(),
            )?),
            request_timeout: Duration::from_secs(env_or(
                "REQUEST_TIMEOUT",
                default.request_timeout.as_secs(),
            )?),
            max_pending: env_or("MAX_PENDING", default.max_pending)?,
            bind_addr: default.bind_addr,
        })
    }
}
