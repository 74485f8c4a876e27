//! Application Events
//!
//! Everything the application sees arrives as a `WatchlistEvent` during `dispatch`. Events are
//! routed to a `WatchlistCallback` by kind and, for stream events, by domain.

use crate::error::WatchlistError;
use crate::rest::{AuthTokenEvent, ServiceDiscoveryEvent};
use crate::session::ChannelEvent;
use crate::watchlist::msg::{Closure, Domain, NakCode, Payload, State, StreamId};
use crate::watchlist::registry::{Stream, StreamPhase};

/// What happened on a stream.
#[derive(Debug, Clone)]
pub enum StreamEventKind {
    Refresh {
        state: State,
        solicited: bool,
        complete: bool,
        payload: Payload,
    },
    Update {
        payload: Payload,
    },
    Status {
        state: State,
        prior: StreamPhase,
        /// The watchlist will reissue the request on its own
        recovering: bool,
    },
    Ack {
        ack_id: u32,
        seq_num: Option<u32>,
        nak: Option<NakCode>,
        text: String,
    },
    Generic {
        payload: Payload,
    },
}

/// Event addressed to one application stream.
#[derive(Debug, Clone)]
pub struct StreamEvent {
    pub stream_id: StreamId,
    pub domain: Domain,
    pub closure: Option<Closure>,
    pub kind: StreamEventKind,
}

impl StreamEvent {
    pub fn for_stream(stream: &Stream, kind: StreamEventKind) -> Self {
        Self {
            stream_id: stream.id,
            domain: stream.domain,
            closure: stream.closure().cloned(),
            kind,
        }
    }

    /// Stream no longer exists after this event.
    pub fn is_terminal(&self) -> bool {
        match &self.kind {
            StreamEventKind::Status {
                state, recovering, ..
            } => state.is_final() && !recovering,
            _ => false,
        }
    }
}

/// Everything dispatch can deliver.
#[derive(Debug, Clone)]
pub enum WatchlistEvent {
    Channel(ChannelEvent),
    Stream(StreamEvent),
    AuthToken(AuthTokenEvent),
    ServiceDiscovery(ServiceDiscoveryEvent),
    Error(WatchlistError),
    Warning(String),
}

/// Application callbacks. Every method defaults to a no-op.
pub trait WatchlistCallback {
    fn on_channel_event(&mut self, _event: &ChannelEvent) {}

    fn on_login(&mut self, _event: &StreamEvent) {}

    fn on_directory(&mut self, _event: &StreamEvent) {}

    fn on_dictionary(&mut self, _event: &StreamEvent) {}

    /// Market data domains.
    fn on_item(&mut self, _event: &StreamEvent) {}

    fn on_auth_token(&mut self, _event: &AuthTokenEvent) {}

    fn on_service_discovery(&mut self, _event: &ServiceDiscoveryEvent) {}

    fn on_error(&mut self, _error: &WatchlistError) {}

    fn on_warning(&mut self, _message: &str) {}
}

/// Route one event to its callback method.
pub(crate) fn deliver(event: &WatchlistEvent, callback: &mut dyn WatchlistCallback) {
    match event {
        WatchlistEvent::Channel(e) => callback.on_channel_event(e),
        WatchlistEvent::Stream(e) => match e.domain {
            Domain::Login => callback.on_login(e),
            Domain::Directory => callback.on_directory(e),
            Domain::Dictionary => callback.on_dictionary(e),
            _ => callback.on_item(e),
        },
        WatchlistEvent::AuthToken(e) => callback.on_auth_token(e),
        WatchlistEvent::ServiceDiscovery(e) => callback.on_service_discovery(e),
        WatchlistEvent::Error(e) => callback.on_error(e),
        WatchlistEvent::Warning(m) => callback.on_warning(m),
    }
}

/// Callback that records everything, for tests and tooling.
#[derive(Debug, Default)]
pub struct EventLog {
    pub events: Vec<WatchlistEvent>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stream_events(&self) -> impl Iterator<Item = &StreamEvent> {
        self.events.iter().filter_map(|e| match e {
            WatchlistEvent::Stream(s) => Some(s),
            _ => None,
        })
    }

    pub fn for_stream(&self, stream_id: StreamId) -> Vec<&StreamEvent> {
        self.stream_events()
            .filter(|e| e.stream_id == stream_id)
            .collect()
    }

    pub fn errors(&self) -> Vec<&WatchlistError> {
        self.events
            .iter()
            .filter_map(|e| match e {
                WatchlistEvent::Error(err) => Some(err),
                _ => None,
            })
            .collect()
    }

    pub fn channel_events(&self) -> Vec<&ChannelEvent> {
        self.events
            .iter()
            .filter_map(|e| match e {
                WatchlistEvent::Channel(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}

impl WatchlistCallback for EventLog {
    fn on_channel_event(&mut self, event: &ChannelEvent) {
        self.events.push(WatchlistEvent::Channel(event.clone()));
    }

    fn on_login(&mut self, event: &StreamEvent) {
        self.events.push(WatchlistEvent::Stream(event.clone()));
    }

    fn on_directory(&mut self, event: &StreamEvent) {
        self.events.push(WatchlistEvent::Stream(event.clone()));
    }

    fn on_dictionary(&mut self, event: &StreamEvent) {
        self.events.push(WatchlistEvent::Stream(event.clone()));
    }

    fn on_item(&mut self, event: &StreamEvent) {
        self.events.push(WatchlistEvent::Stream(event.clone()));
    }

    fn on_auth_token(&mut self, event: &AuthTokenEvent) {
        self.events.push(WatchlistEvent::AuthToken(event.clone()));
    }

    fn on_service_discovery(&mut self, event: &ServiceDiscoveryEvent) {
        self.events.push(WatchlistEvent::ServiceDiscovery(event.clone()));
    }

    fn on_error(&mut self, error: &WatchlistError) {
        self.events.push(WatchlistEvent::Error(error.clone()));
    }

    fn on_warning(&mut self, message: &str) {
        self.events.push(WatchlistEvent::Warning(message.to_string()));
    }
}
