//! Domain Handler Contract
//!
//! Login, directory, dictionary and item handlers share one capability set. The watchlist
//! lends each handler a `HandlerContext` holding the shared plumbing (registry, service cache,
//! login features, outbox, pending events) so handlers never borrow each other. Cross-domain
//! consequences come back as `Followup`s that the watchlist applies in order.

use crate::error::WatchlistError;
use crate::watchlist::directory::ServiceCache;
use crate::watchlist::event::{StreamEvent, StreamEventKind, WatchlistEvent};
use crate::watchlist::msg::{
    GroupId, InboundMsg, LoginFeatures, OutboundMsg, ServiceId, State, StreamId, WireStreamId,
};
use crate::watchlist::registry::{Stream, StreamRegistry};

/// Hands out wire stream ids. Ids are never reused within a watchlist instance.
#[derive(Debug)]
pub(crate) struct WireIdAllocator {
    next: WireStreamId,
}

impl WireIdAllocator {
    pub(crate) fn new() -> Self {
        Self { next: 1 }
    }

    pub(crate) fn allocate(&mut self) -> WireStreamId {
        let id = self.next;
        self.next = self.next.checked_add(1).unwrap_or(1);
        id
    }
}

/// Shared state lent to a handler for one call.
pub(crate) struct HandlerContext<'a> {
    pub registry: &'a mut StreamRegistry,
    pub services: &'a mut ServiceCache,
    pub features: &'a mut LoginFeatures,
    pub wire_ids: &'a mut WireIdAllocator,
    pub outbox: &'a mut Vec<OutboundMsg>,
    pub events: &'a mut Vec<WatchlistEvent>,
    pub channel_up: bool,
    pub login_open: bool,
}

impl HandlerContext<'_> {
    /// Requests may go on the wire.
    #[inline]
    pub fn ready(&self) -> bool {
        self.channel_up && self.login_open
    }

    #[inline]
    pub fn send(&mut self, msg: OutboundMsg) {
        self.outbox.push(msg);
    }

    #[inline]
    pub fn emit(&mut self, event: WatchlistEvent) {
        self.events.push(event);
    }

    pub fn emit_stream(&mut self, stream: &Stream, kind: StreamEventKind) {
        self.events
            .push(WatchlistEvent::Stream(StreamEvent::for_stream(stream, kind)));
    }

    /// Emit an event for a stream still in the registry.
    pub fn emit_for(&mut self, stream_id: StreamId, kind: StreamEventKind) {
        if let Some(stream) = self.registry.lookup(stream_id) {
            let event = StreamEvent::for_stream(stream, kind);
            self.events.push(WatchlistEvent::Stream(event));
        }
    }

    pub fn error(&mut self, error: WatchlistError) {
        self.events.push(WatchlistEvent::Error(error));
    }
}

/// Cross-domain consequence of handling a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Followup {
    LoginOpened,
    LoginRecovering,
    LoginClosed,
    ServicesAdded(Vec<ServiceId>),
    ServicesDeleted(Vec<ServiceId>),
    GroupStatus {
        service_id: ServiceId,
        group: GroupId,
        state: State,
    },
    GroupMerged {
        service_id: ServiceId,
        from: GroupId,
        to: GroupId,
    },
    DictionaryLoaded,
}

/// Capabilities every domain handler provides.
pub(crate) trait DomainHandler {
    fn name(&self) -> &'static str;

    /// Whether an inbound wire stream belongs to this handler.
    fn owns_wire_stream(&self, wire_id: WireStreamId) -> bool;

    fn handle_domain_message(
        &mut self,
        ctx: &mut HandlerContext<'_>,
        msg: InboundMsg,
    ) -> Result<Vec<Followup>, WatchlistError>;

    /// (Re)issue everything waiting now that the channel accepts requests.
    fn recover(&mut self, ctx: &mut HandlerContext<'_>) -> Result<(), WatchlistError>;

    /// The channel went down; decide per stream between recovery and terminal close.
    fn channel_down(&mut self, ctx: &mut HandlerContext<'_>);

    fn close(&mut self, ctx: &mut HandlerContext<'_>, stream_id: StreamId)
        -> Result<(), WatchlistError>;
}
