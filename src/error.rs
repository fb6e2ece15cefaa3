//! Application-wide error types.
//!
//! Every failure of the event bus, the REST collaborator and the readiness
//! poller ends up as an [`AppError`] so the CLI can render one reason and
//! exit non-zero.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(String),

    #[error("logger error: {0}")]
    Logger(String),

    #[error("instance error: {0}")]
    Instance(String),

    /// Connect/send failure, or the channel went away before a terminal event.
    #[error("transport error: {0}")]
    Transport(String),

    /// An `ERROR`-kind terminal event reported by the remote side.
    #[error("remote error: {0}")]
    Protocol(String),

    #[error("timed out: {0}")]
    Timeout(String),

    /// Non-2xx answer from the workspace REST API, forwarded uninterpreted.
    #[error("HTTP {status} from {url}: {body}")]
    Rest { status: u16, url: String, body: String },

    /// The REST request could not be sent or its body could not be decoded.
    #[error("request error: {0}")]
    Request(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl AppError {
    /// `true` for a REST answer carrying HTTP 404.
    pub fn is_not_found(&self) -> bool {
        matches!(self, AppError::Rest { status: 404, .. })
    }
}
