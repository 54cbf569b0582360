use thiserror::Error;

/// Errors that can occur during transport operations
#[derive(Error, Debug)]
pub enum Error {
    /// Transport configuration rejected before any broker traffic
    #[error("invalid transport configuration: {0}")]
    Config(String),

    /// Broker unreachable, or an established connection/channel failed
    #[error("broker connectivity error: {0}")]
    Connectivity(#[source] lapin::Error),

    /// Broker connection lost with no further detail (consumer stream ended)
    #[error("broker connection lost")]
    ConnectionLost,

    /// Exchange/queue declaration or binding rejected by the broker
    #[error("topology declaration rejected: {0}")]
    Declaration(#[source] lapin::Error),

    /// Consume loop stopped because its cancellation signal fired
    #[error("message retrieval cancelled")]
    Cancelled,

    /// Incoming message could not be mapped back onto an envelope
    #[error("malformed message: {0}")]
    Codec(String),

    /// Transport-level failure outside the broker protocol
    #[error("transport error: {0}")]
    Transport(String),
}

impl Error {
    /// True when a consume loop ended due to cancellation rather than failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

/// Result type alias for transport operations
pub type Result<T> = std::result::Result<T, Error>;
