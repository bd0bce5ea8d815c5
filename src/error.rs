use std::io;
use std::sync::Arc;

/// Errors surfaced by [`NetworkResource`](crate::NetworkResource).
///
/// Bind and close results are handed to every concurrent caller, so the
/// error is `Clone` and keeps io causes behind an `Arc`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Every attempt to bind TCP and UDP to one port failed.
    #[error("could not bind tcp and udp to one port after {attempts} attempts")]
    BindExhausted {
        attempts: usize,
        #[source]
        source: Arc<io::Error>,
    },

    /// A discovery operation was invoked before the resource was bound.
    #[error("bind before {0}")]
    NotBound(&'static str),

    /// No path produced a connection before the deadline.
    #[error("request timed out")]
    Timeout,

    /// The direct path was the only one and it failed.
    #[error("connection failed")]
    ConnectionFailed,

    /// A holepunch was requested but failed before a udp socket existed,
    /// and the direct path failed too.
    #[error("could not connect")]
    CouldNotEstablish,

    /// Both the direct and the holepunched socket failed.
    #[error("all sockets failed")]
    AllPathsFailed,

    /// The resource has been closed and cannot be bound again.
    #[error("network resource is closed")]
    Closed,

    /// The discovery session could not be created.
    #[error("discovery: {0}")]
    Discovery(#[source] Arc<io::Error>),
}

impl Error {
    pub(crate) fn discovery(e: io::Error) -> Self {
        Error::Discovery(Arc::new(e))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
