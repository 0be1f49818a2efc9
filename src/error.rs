//! Unified error type.

use thiserror::Error;

use crate::context::ContextError;

/// The error type returned by minserver's fallible operations.
///
/// Application-level errors (404, 405, etc.) are expressed as HTTP
/// [`Response`](crate::Response) values, not as `Error`s. This type surfaces
/// lifecycle misuse and infrastructure failures: binding to a port,
/// accepting a connection, or a shutdown that outlived its deadline.
#[derive(Debug, Error)]
pub enum Error {
    /// [`Server::shutdown`](crate::Server::shutdown) before any `start`.
    #[error("not started")]
    NotStarted,

    /// [`Server::shutdown`](crate::Server::shutdown) on a server that is no
    /// longer running.
    #[error("not running")]
    NotRunning,

    /// [`Server::start`](crate::Server::start) on a server that is running
    /// or has already been shut down.
    #[error("already running")]
    AlreadyStarted,

    /// Transport failure, surfaced verbatim.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// The shutdown context finished before in-flight requests drained.
    #[error("shutdown: {0}")]
    Context(#[from] ContextError),

    /// The static handler could not resolve its default filesystem root.
    #[error("cannot resolve static base path: {0}")]
    BasePath(#[source] std::io::Error),
}
