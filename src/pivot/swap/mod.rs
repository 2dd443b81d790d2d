//! The connection-swap core: pairing one externally received connection with
//! one client-dialed data connection and splicing the two byte streams.

pub mod coordinator;
pub mod gateway;
pub mod lifecycle;
pub mod pending;
pub mod protocol;
pub mod stream;

use thiserror::Error;

use crate::pivot::swap::protocol::ProtocolError;

#[derive(Debug, Error)]
pub enum SwapError {
    /// Defensive: random 128-bit ids should never collide.
    #[error("duplicate request id")]
    DuplicateId,
    /// The control-channel send failed; the client is presumed disconnected.
    #[error("client offline")]
    ClientOffline,
    /// No data connection arrived within the configured window.
    #[error("timed out waiting for data connection")]
    Timeout,
    /// A data connection referenced an id that already expired, was already
    /// fulfilled, or was never registered.
    #[error("unknown or expired request id")]
    UnknownOrExpiredId,
    #[error("protocol violation: {0}")]
    ProtocolViolation(ProtocolError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ProtocolError> for SwapError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(e) => SwapError::Io(e),
            other => SwapError::ProtocolViolation(other),
        }
    }
}
