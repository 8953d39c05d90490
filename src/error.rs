//! Per-connection error taxonomy. Typed errors at the module boundaries
//! this crate owns, `anyhow` at the process edge (`main`).

use thiserror::Error;

use crate::pool::PoolError;
use crate::protocol::ProtocolError;

/// Per-connection terminating conditions.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("client sent an invalid magic string")]
    InvalidMagic,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("no client data within the socket timeout")]
    ReadTimeout,
    #[error(transparent)]
    NoEngine(#[from] PoolError),
    #[error("client disconnected mid-session")]
    ClientDisconnect,
    #[error("username is not valid utf-8")]
    InvalidUsername(#[from] std::string::FromUtf8Error),
}

impl SessionError {
    /// Short tag used in `illegal-close`/log-line contexts, mirroring the
    /// original source's `ILLEGAL_PACKET`/`TIME_OUT` labels.
    pub fn kind_tag(&self) -> &'static str {
        match self {
            SessionError::InvalidMagic => "INVALID_MAGIC",
            SessionError::Protocol(_) => "ILLEGAL_PACKET",
            SessionError::ReadTimeout => "TIME_OUT",
            SessionError::NoEngine(_) => "SERVER_TOO_BUSY",
            SessionError::ClientDisconnect => "CLIENT_DISCONNECT",
            SessionError::InvalidUsername(_) => "ILLEGAL_PACKET",
        }
    }
}
