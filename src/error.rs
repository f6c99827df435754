//! Crate-wide error type. Only startup failures are fatal; per-datagram
//! failures are logged and handled in-place by the controller loop (see
//! [`crate::controller`]).

/// Errors produced at startup: binding endpoints, parsing configuration, or
/// installing the metrics recorder.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Failed to bind a UDP endpoint.
    #[error("failed to bind UDP socket on {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: crate::net::endpoint::Error,
    },
    /// Failed to bind the observability HTTP listener.
    #[error("failed to bind health surface on {addr}: {source}")]
    HealthBind {
        addr: std::net::SocketAddr,
        #[source]
        source: crate::observer::Error,
    },
    /// Configuration could not be parsed from the environment.
    #[error(transparent)]
    Config(#[from] crate::config::Error),
    /// Generic IO error surfaced during startup.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
