//! Watchlist
//!
//! Tracks every application request on one consumer channel and keeps it alive across
//! connection loss:
//! - registry of application streams with intrusive item-group membership
//! - request merging: same-key items share one wire stream, views are unioned
//! - per-domain handlers (login, directory, dictionary, item) behind `DomainHandler`
//! - post ack deadlines on pooled timers
//! - channel session with reconnect and preferred host fallback
//! - token renewal and service discovery over the REST exchange
//!
//! All protocol outcomes reach the application through `dispatch`, one callback at a time.
//! Application calls (`open`, `close`, `submit_post`, ...) return at once with acceptance or an
//! immediate error.

pub mod dictionary;
pub mod directory;
pub mod event;
pub(crate) mod handler;
pub mod item;
pub mod item_group;
pub mod login;
pub mod merge;
pub mod msg;
pub mod post;
pub mod registry;

#[cfg(test)]
mod watchlist_tests;

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::clock::{millis, secs, MonotonicClock, Nanos};
use crate::config::{ChannelRole, WatchlistConfig};
use crate::dispatch::{DispatchEvent, DispatchGuard, EventQueue, EventSender};
use crate::error::{ErrorKind, WatchlistError};
use crate::pool::TimerPool;
use crate::rest::{
    AuthTokenEvent, RestExchange, RestRequestId, ServiceDiscoveryClient, TokenRecord,
    TokenRenewalScheduler,
};
use crate::session::{
    ChannelEvent, ChannelSession, ChannelState, ChannelTransport, Ioctl, SessionMetrics,
};

use self::dictionary::DictionaryHandler;
use self::directory::{DirectoryHandler, ServiceCache};
use self::event::{deliver, StreamEventKind, WatchlistCallback, WatchlistEvent};
use self::handler::{DomainHandler, Followup, HandlerContext, WireIdAllocator};
use self::item::ItemHandler;
use self::login::LoginHandler;
use self::merge::RequestMergeEngine;
use self::msg::{
    Domain, InboundMsg, ItemRequest, LoginFeatures, MsgBody, OutboundBody, OutboundMsg, PostMsg,
    ServiceId, State, StreamId, WireStreamId,
};
use self::post::PostTimeoutTracker;
use self::registry::{StreamPhase, StreamRegistry};

// =============================================================================
// INTERNAL STATE
// =============================================================================

/// State every handler reads and writes through `HandlerContext`.
#[derive(Debug, Default)]
struct Shared {
    registry: StreamRegistry,
    services: ServiceCache,
    features: LoginFeatures,
    outbox: Vec<OutboundMsg>,
    events: Vec<WatchlistEvent>,
}

struct Handlers {
    login: LoginHandler,
    directory: DirectoryHandler,
    dictionary: DictionaryHandler,
    item: ItemHandler,
}

impl Handlers {
    /// Domain handlers a wire stream may belong to, in routing order.
    fn route(&mut self, wire_id: WireStreamId, consumer: bool) -> Option<&mut dyn DomainHandler> {
        if self.login.owns_wire_stream(wire_id) {
            return Some(&mut self.login);
        }
        if !consumer {
            return None;
        }
        if self.directory.owns_wire_stream(wire_id) {
            return Some(&mut self.directory);
        }
        if self.dictionary.owns_wire_stream(wire_id) {
            return Some(&mut self.dictionary);
        }
        if self.item.owns_wire_stream(wire_id) {
            return Some(&mut self.item);
        }
        None
    }
}

struct Inner {
    role: ChannelRole,
    default_recoverable: bool,
    session: ChannelSession,
    shared: Shared,
    wire_ids: WireIdAllocator,
    handlers: Handlers,
    posts: PostTimeoutTracker,
    token: TokenRenewalScheduler,
    discovery: ServiceDiscoveryClient,
    next_rest_id: RestRequestId,
}

impl Inner {
    /// Lend the shared state to the handlers for one call.
    fn with_ctx<R>(&mut self, f: impl FnOnce(&mut Handlers, &mut HandlerContext<'_>) -> R) -> R {
        let mut ctx = HandlerContext {
            registry: &mut self.shared.registry,
            services: &mut self.shared.services,
            features: &mut self.shared.features,
            wire_ids: &mut self.wire_ids,
            outbox: &mut self.shared.outbox,
            events: &mut self.shared.events,
            channel_up: self.session.is_up(),
            login_open: self.handlers.login.is_open(),
        };
        f(&mut self.handlers, &mut ctx)
    }

    #[inline]
    fn emit(&mut self, event: WatchlistEvent) {
        self.shared.events.push(event);
    }

    fn rest_id(&mut self) -> RestRequestId {
        self.next_rest_id += 1;
        self.next_rest_id
    }

    // -------------------------------------------------------------------------
    // Channel
    // -------------------------------------------------------------------------

    fn apply_channel_events(&mut self, events: Vec<ChannelEvent>) {
        for event in events {
            let closed = event.to == ChannelState::Closed;
            let lost = event.lost_connection();
            self.emit(WatchlistEvent::Channel(event));
            if closed {
                self.close_everything(State::closed("channel closed"));
            } else if lost {
                self.channel_down();
            }
        }
    }

    fn channel_down(&mut self) {
        let consumer = self.role.consumes();
        self.with_ctx(|h, ctx| {
            // Items first: recoverability reads the login features
            if consumer {
                h.item.channel_down(ctx);
                h.dictionary.channel_down(ctx);
                h.directory.channel_down(ctx);
            }
            h.login.channel_down(ctx);
        });
        self.shared.outbox.clear();
        warn!(streams = self.shared.registry.len(), "channel_down");
    }

    /// Terminal close of every stream.
    fn close_everything(&mut self, state: State) {
        self.with_ctx(|h, ctx| {
            h.item.close_all(ctx, &state);
            h.directory.close_all(ctx, &state);
            h.dictionary.channel_down(ctx);
            if let Some(id) = h.login.stream_id() {
                let prior = ctx
                    .registry
                    .lookup(id)
                    .map_or(StreamPhase::Open, |s| s.phase);
                ctx.emit_for(
                    id,
                    StreamEventKind::Status {
                        state: state.clone(),
                        prior,
                        recovering: false,
                    },
                );
                let _ = h.login.close(ctx, id);
            }
        });
        self.posts.clear();
        self.shared.outbox.clear();
    }

    // -------------------------------------------------------------------------
    // Events
    // -------------------------------------------------------------------------

    fn process(&mut self, event: DispatchEvent, now: Nanos) {
        match event {
            DispatchEvent::Transport(ev) => {
                let mut out = Vec::new();
                self.session.on_transport_event(ev, now, &mut out);
                self.apply_channel_events(out);
            }
            DispatchEvent::Message(msg) => self.process_message(msg, now),
            DispatchEvent::Rest { request_id, result } => {
                if self.token.owns(request_id) {
                    if let Some(event) = self.token.on_response(request_id, result, now) {
                        if let AuthTokenEvent::Renewed { .. } = event {
                            self.token_renewed();
                        }
                        self.emit(WatchlistEvent::AuthToken(event));
                    }
                } else if self.discovery.owns(request_id) {
                    if let Some(event) = self.discovery.on_response(request_id, result) {
                        self.emit(WatchlistEvent::ServiceDiscovery(event));
                    }
                } else {
                    debug!(request_id, "rest_response_unmatched");
                }
            }
            DispatchEvent::Wakeup => {}
        }
    }

    fn process_message(&mut self, msg: InboundMsg, now: Nanos) {
        let wire_id = msg.stream_id;

        if let MsgBody::Ack {
            ack_id,
            seq_num,
            nak,
            text,
        } = &msg.body
        {
            let kind = StreamEventKind::Ack {
                ack_id: *ack_id,
                seq_num: *seq_num,
                nak: *nak,
                text: text.clone(),
            };
            if let Some(entry) = self.posts.acknowledge(wire_id, *ack_id, *seq_num) {
                debug!(stream_id = entry.stream_id, ack_id, "post_acked");
                let stream_id = entry.stream_id;
                self.with_ctx(|_, ctx| ctx.emit_for(stream_id, kind));
                return;
            }
            let mut targets = self.handlers.item.wire_members(wire_id);
            if self.handlers.login.wire_id() == Some(wire_id) {
                targets.extend(self.handlers.login.stream_id());
            }
            if targets.is_empty() {
                self.unknown_wire(wire_id);
                return;
            }
            self.with_ctx(|_, ctx| {
                for id in targets {
                    ctx.emit_for(id, kind.clone());
                }
            });
            return;
        }

        let consumer = self.role.consumes();
        let result = self.with_ctx(|h, ctx| {
            h.route(wire_id, consumer)
                .map(|handler| handler.handle_domain_message(ctx, msg))
        });
        match result {
            Some(Ok(followups)) => self.apply_followups(followups, now),
            Some(Err(e)) => self.emit(WatchlistEvent::Error(e)),
            None => self.unknown_wire(wire_id),
        }
    }

    fn unknown_wire(&mut self, wire_id: WireStreamId) {
        debug!(wire_id, "unknown_wire_stream");
        self.emit(WatchlistEvent::Error(WatchlistError::new(
            ErrorKind::UnknownStream,
            format!("message for inactive wire stream {}", wire_id),
        )));
    }

    fn apply_followups(&mut self, followups: Vec<Followup>, now: Nanos) {
        for followup in followups {
            match followup {
                Followup::LoginOpened => {
                    let mut out = Vec::new();
                    self.session.login_accepted(now, &mut out);
                    self.apply_channel_events(out);
                    self.handlers.directory.reset_wire();
                }
                Followup::LoginRecovering => {
                    // Every stream on the connection recovers through channel-down
                    let mut out = Vec::new();
                    self.session.login_recovering(now, &mut out);
                    self.apply_channel_events(out);
                }
                Followup::LoginClosed => {
                    let state = State::closed("login closed");
                    self.with_ctx(|h, ctx| {
                        h.item.close_all(ctx, &state);
                        h.directory.close_all(ctx, &state);
                    });
                    self.posts.clear();
                    let mut out = Vec::new();
                    self.session.login_rejected(now, &mut out);
                    self.apply_channel_events(out);
                }
                Followup::ServicesAdded(ids) => {
                    let result = self.with_ctx(|h, ctx| {
                        let result = h.item.recover(ctx);
                        h.dictionary.services_added(ctx, &ids);
                        result
                    });
                    if let Err(e) = result {
                        self.emit(WatchlistEvent::Error(e));
                    }
                }
                Followup::ServicesDeleted(ids) => {
                    self.with_ctx(|h, ctx| {
                        h.item.delete_services(ctx, &ids, false);
                        h.dictionary.services_deleted(&ids);
                    });
                }
                Followup::GroupStatus {
                    service_id,
                    group,
                    state,
                } => {
                    self.with_ctx(|h, ctx| h.item.group_status(ctx, service_id, &group, &state));
                }
                Followup::GroupMerged {
                    service_id,
                    from,
                    to,
                } => {
                    let moved = self.shared.registry.merge_groups(service_id, &from, &to);
                    debug!(service_id, from = %from, to = %to, moved, "item_group_merged");
                }
                Followup::DictionaryLoaded => {
                    info!("dictionaries_ready");
                }
            }
        }
    }

    fn token_renewed(&mut self) {
        let Some(access) = self.token.token().map(|t| t.access_token.clone()) else {
            return;
        };
        self.session.set_auth_token(Some(access.clone()));
        self.with_ctx(|h, ctx| h.login.reissue_with_token(ctx, &access));
    }

    // -------------------------------------------------------------------------
    // Timers, recovery, output
    // -------------------------------------------------------------------------

    fn run_timers(&mut self, now: Nanos, rest: &dyn RestExchange, tx: &EventSender) {
        for error in self.posts.expire(now) {
            self.emit(WatchlistEvent::Error(error));
        }

        let id = self.next_rest_id + 1;
        if let Some(request) = self.token.poll(now, id) {
            self.next_rest_id = id;
            rest.submit(request, tx.clone());
        }

        let mut out = Vec::new();
        self.session.poll(now, &mut out);
        self.apply_channel_events(out);
    }

    fn recover(&mut self) {
        let consumer = self.role.consumes();
        let errors = self.with_ctx(|h, ctx| {
            let mut handlers: Vec<&mut dyn DomainHandler> = vec![&mut h.login];
            if consumer {
                handlers.push(&mut h.directory);
                handlers.push(&mut h.dictionary);
                handlers.push(&mut h.item);
            }
            handlers
                .into_iter()
                .filter_map(|handler| handler.recover(ctx).err())
                .collect::<Vec<_>>()
        });
        for e in errors {
            self.emit(WatchlistEvent::Error(e));
        }
    }

    /// Write and flush everything the handlers queued.
    fn flush(&mut self) {
        if self.shared.outbox.is_empty() {
            return;
        }
        let outbox = std::mem::take(&mut self.shared.outbox);
        match self.session.write(&outbox) {
            Ok(written) => debug!(written, "outbox_flushed"),
            Err(e) => {
                warn!(dropped = outbox.len(), error = %e, "outbox_write_failed");
                self.emit(WatchlistEvent::Error(e.into()));
            }
        }
    }

    fn next_deadline(&self) -> Option<Nanos> {
        [
            self.posts.next_deadline(),
            self.token.next_renewal(),
            self.session.reconnect_at(),
            self.session.next_detection(),
        ]
        .into_iter()
        .flatten()
        .min()
    }
}

// =============================================================================
// WATCHLIST
// =============================================================================

/// One consumer (or provider) channel with its watchlist.
pub struct Watchlist {
    config: WatchlistConfig,
    clock: Arc<dyn MonotonicClock>,
    rest: Arc<dyn RestExchange>,
    queue: Arc<EventQueue>,
    guard: DispatchGuard,
    inner: Mutex<Inner>,
}

impl Watchlist {
    pub fn new(
        config: WatchlistConfig,
        transport: Box<dyn ChannelTransport>,
        rest: Arc<dyn RestExchange>,
        clock: Arc<dyn MonotonicClock>,
    ) -> Self {
        let merge = RequestMergeEngine::new(
            config.merge.batch_enabled,
            config.merge.max_requests_per_stream,
            config.merge.max_view_elements,
        );
        let inner = Inner {
            role: config.role,
            default_recoverable: config.recovery.default_recoverable,
            session: ChannelSession::new(&config.session, transport),
            shared: Shared::default(),
            wire_ids: WireIdAllocator::new(),
            handlers: Handlers {
                login: LoginHandler::new(),
                directory: DirectoryHandler::new(),
                dictionary: DictionaryHandler::new(config.dictionary_download),
                item: ItemHandler::new(merge),
            },
            posts: PostTimeoutTracker::new(
                TimerPool::new(config.timer_pool_capacity),
                millis(config.post_ack_timeout_ms),
            ),
            token: TokenRenewalScheduler::new(&config.token),
            discovery: ServiceDiscoveryClient::new(config.discovery.url.clone()),
            next_rest_id: 0,
        };
        info!(
            role = ?config.role,
            primary = %config.session.primary,
            "watchlist_created"
        );
        Self {
            config,
            clock,
            rest,
            queue: Arc::new(EventQueue::new()),
            guard: DispatchGuard::new(),
            inner: Mutex::new(inner),
        }
    }

    pub fn config(&self) -> &WatchlistConfig {
        &self.config
    }

    /// Producer handle for the transport reader and other background contexts.
    pub fn event_sender(&self) -> EventSender {
        EventSender::new(Arc::clone(&self.queue))
    }

    /// Start the channel on the primary host.
    pub fn connect(&self) -> Result<(), WatchlistError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let mut out = Vec::new();
        let result = inner.session.connect(now, &mut out);
        inner.apply_channel_events(out);
        result
    }

    pub fn open_login(&self, request: msg::LoginRequest) -> Result<StreamId, WatchlistError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let recoverable = inner.default_recoverable;
        let id = inner.with_ctx(|h, ctx| h.login.open(ctx, request, recoverable))?;
        inner.flush();
        Ok(id)
    }

    /// Open a directory, dictionary or market data stream.
    pub fn open(&self, request: ItemRequest) -> Result<StreamId, WatchlistError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if !inner.role.consumes() {
            return Err(WatchlistError::invalid(format!(
                "{:?} channels do not request items",
                inner.role
            )));
        }
        let recoverable = inner.default_recoverable;
        let id = match request.domain {
            Domain::Login => {
                return Err(WatchlistError::invalid("open the login stream with open_login"))
            }
            Domain::Directory => {
                inner.with_ctx(|h, ctx| h.directory.open(ctx, request, recoverable))?
            }
            _ => inner.with_ctx(|h, ctx| h.item.open(ctx, request, recoverable))?,
        };
        inner.flush();
        Ok(id)
    }

    /// Open one stream per item; all are accepted or none is.
    pub fn open_batch(&self, requests: Vec<ItemRequest>) -> Result<Vec<StreamId>, WatchlistError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if !inner.role.consumes() {
            return Err(WatchlistError::invalid("provider channels do not request items"));
        }
        if requests.is_empty() {
            return Err(WatchlistError::invalid("batch request names no items"));
        }
        let recoverable = inner.default_recoverable;
        let ids = inner.with_ctx(|h, ctx| h.item.open_batch(ctx, requests, recoverable))?;
        inner.flush();
        Ok(ids)
    }

    pub fn close(&self, stream_id: StreamId) -> Result<(), WatchlistError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(domain) = inner.shared.registry.lookup(stream_id).map(|s| s.domain) else {
            return Err(WatchlistError::unknown_stream(stream_id));
        };
        let cancelled = inner.posts.cancel_stream(stream_id);
        if cancelled > 0 {
            debug!(stream_id, cancelled, "posts_cancelled");
        }
        inner.with_ctx(|h, ctx| match domain {
            Domain::Login => h.login.close(ctx, stream_id),
            Domain::Directory => h.directory.close(ctx, stream_id),
            _ => h.item.close(ctx, stream_id),
        })?;
        inner.flush();
        Ok(())
    }

    pub fn pause(&self, stream_id: StreamId) -> Result<(), WatchlistError> {
        self.set_paused(stream_id, true)
    }

    pub fn resume(&self, stream_id: StreamId) -> Result<(), WatchlistError> {
        self.set_paused(stream_id, false)
    }

    fn set_paused(&self, stream_id: StreamId, paused: bool) -> Result<(), WatchlistError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(domain) = inner.shared.registry.lookup(stream_id).map(|s| s.domain) else {
            return Err(WatchlistError::unknown_stream(stream_id));
        };
        if !inner.shared.features.supports_optimized_pause_resume {
            inner.emit(WatchlistEvent::Warning(format!(
                "pause/resume of stream {} ignored: provider has no optimized pause support",
                stream_id
            )));
            return Ok(());
        }
        match domain {
            Domain::Login => return self.set_all_paused_locked(inner, paused),
            Domain::Directory => {
                if let Some(stream) = inner.shared.registry.lookup_mut(stream_id) {
                    stream.paused = paused;
                }
            }
            _ => inner.with_ctx(|h, ctx| h.item.set_paused(ctx, stream_id, paused))?,
        }
        inner.flush();
        Ok(())
    }

    /// Pause every stream through the login stream.
    pub fn pause_all(&self) -> Result<(), WatchlistError> {
        let mut guard = self.inner.lock();
        self.set_all_paused_locked(&mut guard, true)
    }

    pub fn resume_all(&self) -> Result<(), WatchlistError> {
        let mut guard = self.inner.lock();
        self.set_all_paused_locked(&mut guard, false)
    }

    fn set_all_paused_locked(&self, inner: &mut Inner, paused: bool) -> Result<(), WatchlistError> {
        if inner.handlers.login.stream_id().is_none() {
            return Err(WatchlistError::invalid("no login stream"));
        }
        if !inner.shared.features.supports_optimized_pause_resume {
            inner.emit(WatchlistEvent::Warning(
                "pause-all ignored: provider has no optimized pause support".to_string(),
            ));
            return Ok(());
        }
        inner.with_ctx(|h, ctx| {
            h.login.send_pause_all(ctx, paused);
            h.item.mark_all_paused(ctx, paused);
        });
        let directory_ids = inner.shared.registry.ids_for_domain(Domain::Directory);
        for id in directory_ids {
            if let Some(stream) = inner.shared.registry.lookup_mut(id) {
                stream.paused = paused;
            }
        }
        inner.flush();
        Ok(())
    }

    /// Post on a stream. Posts that request an ack are tracked until acked or timed out.
    pub fn submit_post(&self, stream_id: StreamId, post: PostMsg) -> Result<(), WatchlistError> {
        let now = self.clock.now();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(stream) = inner.shared.registry.lookup(stream_id) else {
            return Err(WatchlistError::unknown_stream(stream_id));
        };
        let domain = stream.domain;
        let wire_id = stream.wire_id;
        let phase = stream.phase;

        if !inner.shared.features.supports_post {
            return Err(WatchlistError::invalid("provider does not accept posts")
                .with_stream(stream_id, domain, phase));
        }
        if !(inner.session.is_up() && inner.handlers.login.is_open()) {
            return Err(WatchlistError::new(ErrorKind::ChannelDown, "channel is not ready")
                .with_stream(stream_id, domain, phase));
        }
        let Some(wire_id) = wire_id else {
            return Err(WatchlistError::invalid("stream is not on the wire")
                .with_stream(stream_id, domain, phase));
        };

        if post.ack_requested {
            inner.posts.track(wire_id, stream_id, domain, &post, now);
        }
        inner.shared.outbox.push(OutboundMsg {
            stream_id: wire_id,
            domain,
            body: OutboundBody::Post(post),
        });
        inner.flush();
        Ok(())
    }

    /// Change live options.
    pub fn ioctl(&self, ioctl: Ioctl) {
        let now = self.clock.now();
        self.inner.lock().session.ioctl(ioctl, now);
    }

    /// Drop the current connection and try the preferred host.
    pub fn fallback_to_preferred_host(&self) -> Result<(), WatchlistError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let mut out = Vec::new();
        let result = inner.session.fallback_to_preferred_host(now, &mut out);
        inner.apply_channel_events(out);
        result
    }

    /// Install an access token obtained out of band and arm its renewal.
    pub fn install_token(&self, access_token: &str, expires_in_secs: u64) {
        let now = self.clock.now();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let expires_at = now.saturating_add(secs(expires_in_secs));
        inner
            .token
            .install(TokenRecord::new(access_token, now, expires_at), now);
        inner.token_renewed();
        inner.flush();
    }

    /// Start a one-shot endpoint lookup. The result arrives as a service discovery event.
    pub fn discover_services(&self) -> RestRequestId {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let id = inner.rest_id();
        let token = inner.token.token().map(|t| t.access_token.clone());
        let request = inner.discovery.lookup(
            id,
            self.config.discovery.transport,
            self.config.discovery.data_format,
            token.as_deref(),
        );
        drop(guard);
        self.rest.submit(request, self.event_sender());
        id
    }

    /// Close the channel and every stream on it.
    pub fn shutdown(&self) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let mut out = Vec::new();
        inner.session.shutdown(now, &mut out);
        inner.apply_channel_events(out);
    }

    // -------------------------------------------------------------------------
    // Dispatch
    // -------------------------------------------------------------------------

    /// Process queued completions and due timers, then deliver the resulting events.
    ///
    /// Returns the number of events delivered. Entering while another dispatch is running on
    /// this watchlist is a `ConcurrentDispatch` error.
    pub fn dispatch(&self, callback: &mut dyn WatchlistCallback) -> Result<usize, WatchlistError> {
        let _pass = self.guard.enter()?;
        let tx = self.event_sender();

        let events = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let now = self.clock.now();

            let batch = self.queue.drain(self.config.dispatch.max_events_per_pass);
            for event in batch {
                inner.process(event, now);
                inner.flush();
            }
            inner.run_timers(now, &*self.rest, &tx);
            inner.recover();
            inner.flush();
            std::mem::take(&mut inner.shared.events)
        };

        for event in &events {
            deliver(event, callback);
        }
        Ok(events.len())
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn channel_state(&self) -> ChannelState {
        self.inner.lock().session.state()
    }

    pub fn metrics(&self) -> Arc<SessionMetrics> {
        self.inner.lock().session.metrics()
    }

    pub fn login_features(&self) -> LoginFeatures {
        self.inner.lock().shared.features.clone()
    }

    /// Active application streams, login included.
    pub fn stream_count(&self) -> usize {
        self.inner.lock().shared.registry.len()
    }

    pub fn wire_stream_count(&self) -> usize {
        self.inner.lock().handlers.item.wire_stream_count()
    }

    /// Item streams waiting for the channel or their service.
    pub fn pending_count(&self) -> usize {
        self.inner.lock().handlers.item.pending_count()
    }

    pub fn stream_phase(&self, stream_id: StreamId) -> Option<StreamPhase> {
        self.inner
            .lock()
            .shared
            .registry
            .lookup(stream_id)
            .map(|s| s.phase)
    }

    pub fn service_id(&self, name: &str) -> Option<ServiceId> {
        self.inner.lock().shared.services.resolve(name)
    }

    pub fn services(&self) -> ServiceCache {
        self.inner.lock().shared.services.clone()
    }

    pub fn dictionary(&self, name: &str) -> Option<Vec<u8>> {
        self.inner
            .lock()
            .handlers
            .dictionary
            .dictionary(name)
            .map(|d| d.to_vec())
    }

    pub fn dictionaries_loaded(&self) -> bool {
        self.inner.lock().handlers.dictionary.is_complete()
    }

    pub fn outstanding_posts(&self) -> usize {
        self.inner.lock().posts.len()
    }

    pub fn directory_open(&self) -> bool {
        self.inner.lock().handlers.directory.is_open()
    }

    /// Earliest timer deadline, for callers that sleep between dispatch passes.
    pub fn next_deadline(&self) -> Option<Nanos> {
        self.inner.lock().next_deadline()
    }
}
