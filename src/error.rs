use thiserror::Error;

/// Failures a [`Backend`](crate::backend::Backend) or
/// [`Session`](crate::session::Session) can report.
///
/// Every variant except `Internal` maps onto a single response line and leaves
/// the connection open.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// No job became ready before the requested timeout elapsed.
    #[error("reserve timed out")]
    ReserveTimeout,

    /// A job reserved by this client is about to expire. Not raised by the
    /// in-memory engine.
    #[error("deadline soon")]
    DeadlineSoon,

    /// The job doesn't exist or isn't in a state the command accepts.
    #[error("job not found")]
    NotFound,

    /// Ignoring the tube would leave the watch-list empty.
    #[error("cannot ignore the only watched tube")]
    NotIgnored,

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
