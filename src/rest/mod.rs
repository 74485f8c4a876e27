//! Auxiliary REST Exchanges
//!
//! Token renewal and service discovery talk HTTP through `RestExchange`. A submitted request
//! never answers inline: the outcome lands on the dispatch queue as `DispatchEvent::Rest` and is
//! routed back to its owner by request id.
//!
//! - `http` - reqwest-backed exchange running on a tokio runtime
//! - `token` - renewal scheduler with margin/ratio arming and bounded retry
//! - `discovery` - one-shot endpoint lookup

pub mod discovery;
pub mod http;
pub mod token;

use std::fmt;

use crate::clock::Nanos;
use crate::dispatch::EventSender;
use crate::error::WatchlistError;

pub use discovery::{DataFormat, DiscoveryTransport, ServiceDiscoveryClient, ServiceEndpoint};
pub use http::ReqwestExchange;
pub use token::{TokenCredentials, TokenRecord, TokenRenewalScheduler};

/// Correlates a response with the request that caused it.
pub type RestRequestId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RestPurpose {
    TokenRenewal,
    ServiceDiscovery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestMethod {
    Get,
    Post,
}

impl fmt::Display for RestMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Get => write!(f, "GET"),
            Self::Post => write!(f, "POST"),
        }
    }
}

/// Request descriptor handed to the exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestRequest {
    pub id: RestRequestId,
    pub purpose: RestPurpose,
    pub method: RestMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    pub body: Option<String>,
}

impl RestRequest {
    pub fn get(id: RestRequestId, purpose: RestPurpose, url: impl Into<String>) -> Self {
        Self {
            id,
            purpose,
            method: RestMethod::Get,
            url: url.into(),
            headers: Vec::new(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn post(
        id: RestRequestId,
        purpose: RestPurpose,
        url: impl Into<String>,
        body: String,
    ) -> Self {
        Self {
            method: RestMethod::Post,
            body: Some(body),
            ..Self::get(id, purpose, url)
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl RestResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// The exchange could not produce a response at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestTransportError {
    Request(String),
    Body(String),
    /// No runtime to run the exchange on
    Unavailable,
}

impl fmt::Display for RestTransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request(e) => write!(f, "request failed: {}", e),
            Self::Body(e) => write!(f, "reading body failed: {}", e),
            Self::Unavailable => write!(f, "rest exchange unavailable"),
        }
    }
}

impl std::error::Error for RestTransportError {}

/// Performs HTTP exchanges off the dispatch thread.
pub trait RestExchange: Send + Sync {
    /// Start `request`; the outcome must be pushed to `reply` exactly once.
    fn submit(&self, request: RestRequest, reply: EventSender);
}

// =============================================================================
// APPLICATION EVENTS
// =============================================================================

/// Outcome of a token renewal step.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthTokenEvent {
    Renewed {
        token_type: String,
        expires_at: Nanos,
    },
    /// A renewal attempt failed and another is scheduled
    Retrying {
        attempt: u32,
        retry_at: Nanos,
        reason: String,
    },
    /// Retries exhausted. The established connection is left alone.
    Failed(WatchlistError),
}

/// Outcome of a service discovery lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceDiscoveryEvent {
    pub request_id: RestRequestId,
    pub result: Result<Vec<ServiceEndpoint>, WatchlistError>,
}
