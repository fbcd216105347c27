use realtime_bus::BusError;
use thiserror::Error;

use crate::call::CallError;
use crate::protocol::ProtocolError;

/// Failures reported by a [`crate::RowStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("write denied by row-level security: {0}")]
    WriteDenied(String),
    #[error("row store unreachable: {0}")]
    Network(String),
    #[error("conflicting row: {0}")]
    Conflict(String),
    #[error("row store error: {0}")]
    Backend(String),
    #[error("undecodable row: {0}")]
    Decode(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_write_denied(&self) -> bool {
        matches!(self, StoreError::WriteDenied(_))
    }

    pub fn is_network(&self) -> bool {
        matches!(self, StoreError::Network(_))
    }
}

#[derive(Debug, Error)]
pub enum LocalStoreError {
    #[error("local storage io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("local snapshot is not valid json: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Errors surfaced by the session engine. Write denials and connectivity
/// loss during updates are absorbed and never reach callers.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session {0} not found or no longer active")]
    SessionNotFound(String),
    #[error("no active session")]
    NoActiveSession,
    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Local(#[from] LocalStoreError),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Call(#[from] CallError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
