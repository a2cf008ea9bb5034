//! Errors surfaced by the cosim binaries.

use cosim_config::ConfigError;
use cosim_net::{CallError, MessageType, PolicyError, ServerError, SessionError, Shape};

/// Anything that makes a binary exit with a failure status.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Configuration could not be loaded or is out of range.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Retry settings were rejected.
    #[error(transparent)]
    Policy(#[from] PolicyError),

    /// The server loop stopped with an error.
    #[error(transparent)]
    Server(#[from] ServerError),

    /// A client request failed.
    #[error(transparent)]
    Call(#[from] CallError),

    /// A session operation failed.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The server answered with an error text.
    #[error("server error: {0}")]
    Remote(String),

    /// The server answered with a reply that does not pair with the request.
    #[error("unexpected {kind:?}/{shape:?} reply")]
    UnexpectedReply {
        /// Reply type tag.
        kind: MessageType,
        /// Reply payload shape.
        shape: Shape,
    },

    /// The async runtime could not be started.
    #[error("cannot start runtime: {0}")]
    Runtime(#[source] std::io::Error),
}
