//! Error types for the wire layer.

use thiserror::Error;

/// Errors raised by sockets and the mesh.
///
/// Two kinds, with different blast radius: `Connection` failures happen
/// during bring-up and are fatal to process start; `Transfer` failures happen
/// mid-stream and abort the current forward.
#[derive(Error, Debug)]
pub enum NetError {
    /// Unable to resolve, bind, listen, connect or accept.
    #[error("connection failed: {reason}")]
    Connection { reason: String },

    /// Peer closed or socket error while a transfer was in flight.
    #[error("transfer failed: {reason}")]
    Transfer { reason: String },
}

impl NetError {
    pub(crate) fn connection(reason: impl Into<String>) -> Self {
        NetError::Connection { reason: reason.into() }
    }

    pub(crate) fn transfer(reason: impl Into<String>) -> Self {
        NetError::Transfer { reason: reason.into() }
    }
}

pub type Result<T> = std::result::Result<T, NetError>;
