//! Transport boundary
//!
//! The raw channel (socket, TLS, framing, codec) lives outside this crate. It is driven through
//! `ChannelTransport` and reports completions back as `TransportEvent`s on the dispatch queue.

use std::fmt;

use crate::error::{ErrorKind, WatchlistError};
use crate::session::HostDescriptor;
use crate::watchlist::msg::OutboundMsg;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Connect could not even be started
    Connect(String),
    NotConnected,
    Write(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect(reason) => write!(f, "connect failed: {}", reason),
            Self::NotConnected => write!(f, "not connected"),
            Self::Write(reason) => write!(f, "write failed: {}", reason),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<TransportError> for WatchlistError {
    fn from(e: TransportError) -> Self {
        WatchlistError::new(ErrorKind::Transport, e.to_string())
    }
}

/// Socket-level completion reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected { host: HostDescriptor },
    ConnectFailed { host: HostDescriptor, reason: String },
    Disconnected { reason: String },
}

/// Connect/write/flush primitives of the external channel.
///
/// `connect` only starts a connection; the outcome arrives later as a `TransportEvent`.
pub trait ChannelTransport: Send {
    fn connect(&mut self, host: &HostDescriptor, auth_token: Option<&str>)
        -> Result<(), TransportError>;

    fn write(&mut self, msg: &OutboundMsg) -> Result<(), TransportError>;

    fn flush(&mut self) -> Result<(), TransportError>;

    fn close(&mut self);
}
