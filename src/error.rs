//! Watchlist Errors
//!
//! One error type for the whole engine. Each error names its `ErrorKind` and, when a stream is
//! involved, the stream id, domain and the stream's prior state so the application can tell a
//! transient failure from a terminal one.

use std::fmt;

use crate::watchlist::msg::{Domain, StreamId};
use crate::watchlist::registry::StreamPhase;

/// Error categories surfaced by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Stream id is not active on this channel
    UnknownStream,
    /// Merging would exceed the configured request or view-element limit
    RequestMergeLimit,
    /// Post was not acknowledged before its deadline
    PostTimeout,
    /// `dispatch` was entered while another dispatch is running
    ConcurrentDispatch,
    /// Channel went down; recoverable streams are reissued on reconnect
    ChannelDown,
    /// Channel is closed for good
    ChannelClosed,
    /// Token renewal failed; retried internally until the attempt limit
    AuthTokenFailure,
    /// Service discovery request failed; the caller may reissue
    ServiceDiscoveryFailure,
    /// Malformed or unsupported request
    InvalidArgument,
    /// Transport rejected a connect/write/flush
    Transport,
}

impl ErrorKind {
    /// Whether the condition may clear without application action.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ChannelDown | Self::AuthTokenFailure | Self::Transport
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownStream => write!(f, "unknown_stream"),
            Self::RequestMergeLimit => write!(f, "request_merge_limit"),
            Self::PostTimeout => write!(f, "post_timeout"),
            Self::ConcurrentDispatch => write!(f, "concurrent_dispatch"),
            Self::ChannelDown => write!(f, "channel_down"),
            Self::ChannelClosed => write!(f, "channel_closed"),
            Self::AuthTokenFailure => write!(f, "auth_token_failure"),
            Self::ServiceDiscoveryFailure => write!(f, "service_discovery_failure"),
            Self::InvalidArgument => write!(f, "invalid_argument"),
            Self::Transport => write!(f, "transport"),
        }
    }
}

/// Error with optional stream context.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchlistError {
    pub kind: ErrorKind,
    pub message: String,
    pub stream_id: Option<StreamId>,
    pub domain: Option<Domain>,
    pub prior_state: Option<StreamPhase>,
}

impl WatchlistError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            stream_id: None,
            domain: None,
            prior_state: None,
        }
    }

    pub fn unknown_stream(stream_id: StreamId) -> Self {
        Self::new(ErrorKind::UnknownStream, "stream is not active").with_stream_id(stream_id)
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    pub fn with_stream_id(mut self, stream_id: StreamId) -> Self {
        self.stream_id = Some(stream_id);
        self
    }

    /// Attach full stream context.
    pub fn with_stream(mut self, stream_id: StreamId, domain: Domain, prior: StreamPhase) -> Self {
        self.stream_id = Some(stream_id);
        self.domain = Some(domain);
        self.prior_state = Some(prior);
        self
    }

    #[inline]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[inline]
    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

impl fmt::Display for WatchlistError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(id) = self.stream_id {
            write!(f, " (stream {}", id)?;
            if let Some(domain) = self.domain {
                write!(f, ", {}", domain)?;
            }
            if let Some(prior) = self.prior_state {
                write!(f, ", was {}", prior)?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

impl std::error::Error for WatchlistError {}
