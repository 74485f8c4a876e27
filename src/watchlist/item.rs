//! Item Handler
//!
//! Market data domains (and application dictionary requests). Application streams with the
//! same item key share one wire stream; the wire view is the union of the member views, and
//! every inbound message is replicated to the members with each member's own view applied.
//!
//! Per-stream lifecycle: `PENDING_REQUEST → OPEN → (PENDING_CLOSE | RECOVERING) → {OPEN | CLOSED}`.
//! RECOVERING is entered only when `is_request_recoverable` holds at failure time.

use std::collections::{HashMap, VecDeque};

use tracing::{debug, info, warn};

use crate::error::WatchlistError;
use crate::watchlist::event::StreamEventKind;
use crate::watchlist::handler::{DomainHandler, Followup, HandlerContext};
use crate::watchlist::merge::{BatchCandidate, ItemKey, RequestMergeEngine, ViewAggregate};
use crate::watchlist::msg::{
    Domain, GroupId, InboundMsg, ItemRequest, LoginFeatures, MsgBody, OutboundBody, OutboundMsg,
    Payload, ServiceId, State, StreamId, StreamState, View, WireRequest, WireStreamId,
};
use crate::watchlist::registry::{Stream, StreamPhase, StreamRequest};

/// Whether a failed stream is reissued automatically instead of closed.
///
/// Private streams never recover, nor does a dictionary that was already fully received. The
/// provider must support single-open, the request must be marked recoverable, and the last
/// state seen must be ClosedRecover.
pub fn is_request_recoverable(
    stream: &Stream,
    last_state: Option<StreamState>,
    features: &LoginFeatures,
) -> bool {
    stream.recoverable
        && !stream.request.is_private()
        && !(stream.domain == Domain::Dictionary && stream.phase == StreamPhase::Open)
        && features.single_open
        && last_state == Some(StreamState::ClosedRecover)
}

/// One request on the wire, possibly shared by several application streams.
#[derive(Debug)]
struct WireStream {
    id: WireStreamId,
    key: ItemKey,
    private: bool,
    streaming: bool,
    members: Vec<StreamId>,
    view: ViewAggregate,
    /// First refresh received
    open: bool,
    paused: bool,
}

impl WireStream {
    fn request(&self, no_refresh: bool) -> OutboundMsg {
        OutboundMsg {
            stream_id: self.id,
            domain: self.key.domain,
            body: OutboundBody::Request(WireRequest {
                name: self.key.name.clone(),
                service_id: self.key.service_id,
                view: self.view.wire_view(),
                streaming: self.streaming,
                private: self.private,
                paused: self.paused,
                no_refresh,
            }),
        }
    }
}

/// Outcome of trying to put a stream on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attach {
    Sent,
    Joined,
    Pending,
}

#[derive(Debug)]
pub(crate) struct ItemHandler {
    wire: HashMap<WireStreamId, WireStream>,
    by_key: HashMap<ItemKey, WireStreamId>,
    merge: RequestMergeEngine,
    pending: VecDeque<StreamId>,
}

impl ItemHandler {
    pub(crate) fn new(merge: RequestMergeEngine) -> Self {
        Self {
            wire: HashMap::new(),
            by_key: HashMap::new(),
            merge,
            pending: VecDeque::new(),
        }
    }

    pub(crate) fn wire_stream_count(&self) -> usize {
        self.wire.len()
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Application streams sharing a wire stream.
    pub(crate) fn wire_members(&self, wire_id: WireStreamId) -> Vec<StreamId> {
        self.wire
            .get(&wire_id)
            .map(|ws| ws.members.clone())
            .unwrap_or_default()
    }

    fn validate(&self, request: &ItemRequest) -> Result<(), WatchlistError> {
        if request.domain == Domain::Login || request.domain == Domain::Directory {
            return Err(WatchlistError::invalid(format!(
                "{} requests are not item requests",
                request.domain
            )));
        }
        if request.name.is_empty() {
            return Err(WatchlistError::invalid("item request has no name"));
        }
        if request.view.is_some() {
            let max = self.merge.max_view_elements();
            ViewAggregate::new().check_add(request.view.as_ref(), max)?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Submission
    // -------------------------------------------------------------------------

    pub(crate) fn open(
        &mut self,
        ctx: &mut HandlerContext<'_>,
        request: ItemRequest,
        default_recoverable: bool,
    ) -> Result<StreamId, WatchlistError> {
        self.validate(&request)?;
        let id = ctx
            .registry
            .open(StreamRequest::Item(request), default_recoverable);
        if let Err(e) = self.attach(ctx, id) {
            let _ = ctx.registry.close(id);
            return Err(e.with_stream_id(id));
        }
        Ok(id)
    }

    /// One application request naming many items. Either every item is accepted or none is.
    pub(crate) fn open_batch(
        &mut self,
        ctx: &mut HandlerContext<'_>,
        requests: Vec<ItemRequest>,
        default_recoverable: bool,
    ) -> Result<Vec<StreamId>, WatchlistError> {
        for request in &requests {
            self.validate(request)?;
        }

        let mut candidates = Vec::with_capacity(requests.len());
        let mut ids = Vec::with_capacity(requests.len());
        for request in requests {
            let service_id = request
                .service
                .as_ref()
                .and_then(|s| ctx.services.lookup_ref(s));
            let key = ItemKey::new(request.domain, request.name.clone(), service_id);
            let private = request.private;
            let id = ctx
                .registry
                .open(StreamRequest::Item(request), default_recoverable);
            candidates.push(BatchCandidate {
                stream_id: id,
                key,
                private,
            });
            ids.push(id);
        }

        let records = self.merge.plan_batch(&candidates);
        debug!(items = ids.len(), wire_requests = records.len(), "batch_planned");

        let mut attached: Vec<StreamId> = Vec::with_capacity(ids.len());
        for record in &records {
            for &id in &record.members {
                if let Err(e) = self.attach(ctx, id) {
                    warn!(stream_id = id, attached = attached.len(), error = %e, "batch_rejected");
                    for done in &ids {
                        let _ = self.close(ctx, *done);
                    }
                    return Err(e.with_stream_id(id));
                }
                attached.push(id);
            }
        }
        Ok(ids)
    }

    /// Put a registered stream on the wire, joining an existing wire stream when allowed.
    fn attach(
        &mut self,
        ctx: &mut HandlerContext<'_>,
        id: StreamId,
    ) -> Result<Attach, WatchlistError> {
        let Some(stream) = ctx.registry.lookup(id) else {
            return Err(WatchlistError::unknown_stream(id));
        };
        let Some(request) = stream.request.item().cloned() else {
            return Err(WatchlistError::invalid("not an item stream").with_stream_id(id));
        };

        let service_id = match &request.service {
            Some(service) => match ctx.services.lookup_ref(service) {
                Some(sid) if ctx.services.is_available(sid) => Some(sid),
                _ => None,
            },
            None => None,
        };
        let waiting_for_service = request.service.is_some() && service_id.is_none();
        if !ctx.ready() || waiting_for_service {
            self.enqueue(id);
            return Ok(Attach::Pending);
        }

        if let Some(sid) = service_id {
            let moved = ctx.registry.lookup(id).and_then(|s| s.service_id) != Some(sid);
            if moved {
                ctx.registry.associate(id, sid, GroupId::default())?;
            }
            if let Some(stream) = ctx.registry.lookup_mut(id) {
                stream.service_id = Some(sid);
            }
        }

        let key = ItemKey::new(request.domain, request.name.clone(), service_id);
        let max_view = self.merge.max_view_elements();

        if self.merge.can_merge(request.private) {
            if let Some(&wire_id) = self.by_key.get(&key) {
                if let Some(ws) = self.wire.get_mut(&wire_id) {
                    self.merge
                        .check_merge(ws.members.len(), &ws.view, request.view.as_ref())?;
                    let view_changed = ws.view.add(request.view.as_ref(), max_view)?;
                    let upgraded = request.streaming && !ws.streaming;
                    ws.streaming |= request.streaming;
                    ws.members.push(id);
                    let unpaused = ws.paused && !request.paused;
                    if unpaused {
                        ws.paused = false;
                    }

                    if ws.open || view_changed || upgraded || unpaused {
                        ctx.send(ws.request(false));
                        ws.view.commit();
                    }
                    Self::mark_requested(ctx, id, wire_id);
                    debug!(stream_id = id, wire_id, members = ws.members.len(), "item_joined");
                    return Ok(Attach::Joined);
                }
            }
        }

        let mut view = ViewAggregate::new();
        view.add(request.view.as_ref(), max_view)?;
        let wire_id = ctx.wire_ids.allocate();
        let mut ws = WireStream {
            id: wire_id,
            key: key.clone(),
            private: request.private,
            streaming: request.streaming,
            members: vec![id],
            view,
            open: false,
            paused: request.paused,
        };
        ctx.send(ws.request(false));
        ws.view.commit();
        if self.merge.can_merge(request.private) {
            self.by_key.insert(key, wire_id);
        }
        self.wire.insert(wire_id, ws);
        Self::mark_requested(ctx, id, wire_id);
        debug!(stream_id = id, wire_id, "item_requested");
        Ok(Attach::Sent)
    }

    fn mark_requested(ctx: &mut HandlerContext<'_>, id: StreamId, wire_id: WireStreamId) {
        if let Some(stream) = ctx.registry.lookup_mut(id) {
            stream.wire_id = Some(wire_id);
            stream.awaiting_refresh = true;
            if stream.phase != StreamPhase::Recovering {
                stream.phase = StreamPhase::PendingRequest;
            }
        }
    }

    fn enqueue(&mut self, id: StreamId) {
        if !self.pending.contains(&id) {
            self.pending.push_back(id);
        }
    }

    /// Take a member off its wire stream; closes or re-narrows the wire stream as needed.
    fn detach(&mut self, ctx: &mut HandlerContext<'_>, id: StreamId, wire_id: WireStreamId) {
        let Some(ws) = self.wire.get_mut(&wire_id) else {
            return;
        };
        let Some(pos) = ws.members.iter().position(|m| *m == id) else {
            return;
        };
        ws.members.remove(pos);
        let view = ctx
            .registry
            .lookup(id)
            .and_then(|s| s.request.item())
            .and_then(|r| r.view.clone());

        if ws.members.is_empty() {
            if ws.streaming || !ws.open {
                ctx.send(OutboundMsg::close(wire_id, ws.key.domain));
            }
            self.remove_wire(wire_id);
            return;
        }

        let view_changed = ws.view.remove(view.as_ref());
        let all_paused = ws
            .members
            .iter()
            .all(|m| ctx.registry.lookup(*m).is_some_and(|s| s.paused));
        let pause_changed = all_paused != ws.paused;
        ws.paused = all_paused;
        if (view_changed || pause_changed) && ws.open {
            ctx.send(ws.request(true));
            ws.view.commit();
        }
    }

    fn remove_wire(&mut self, wire_id: WireStreamId) -> Option<WireStream> {
        let ws = self.wire.remove(&wire_id)?;
        if self.by_key.get(&ws.key) == Some(&wire_id) {
            self.by_key.remove(&ws.key);
        }
        Some(ws)
    }

    // -------------------------------------------------------------------------
    // Failure and recovery
    // -------------------------------------------------------------------------

    /// Route one member through the recoverability decision.
    fn fail_stream(&mut self, ctx: &mut HandlerContext<'_>, id: StreamId, state: &State) {
        let Some(stream) = ctx.registry.lookup(id) else {
            return;
        };
        let prior = stream.phase;
        let recoverable = is_request_recoverable(stream, Some(state.stream_state), ctx.features);

        if recoverable {
            if let Some(stream) = ctx.registry.lookup_mut(id) {
                stream.phase = StreamPhase::Recovering;
                stream.wire_id = None;
                stream.awaiting_refresh = true;
                stream.last_state = Some(state.stream_state);
            }
            ctx.emit_for(
                id,
                StreamEventKind::Status {
                    state: State::open_suspect(state.text.clone()).with_code(state.code),
                    prior,
                    recovering: true,
                },
            );
            self.enqueue(id);
            return;
        }

        ctx.emit_for(
            id,
            StreamEventKind::Status {
                state: state.clone(),
                prior,
                recovering: false,
            },
        );
        self.pending.retain(|p| *p != id);
        let _ = ctx.registry.close(id);
    }

    /// The provider closed a wire stream; every member recovers or closes on its own.
    fn fail_wire(&mut self, ctx: &mut HandlerContext<'_>, wire_id: WireStreamId, state: &State) {
        let Some(ws) = self.remove_wire(wire_id) else {
            return;
        };
        info!(
            wire_id,
            item = %ws.key.name,
            members = ws.members.len(),
            state = ?state.stream_state,
            "item_stream_failed"
        );
        for id in ws.members {
            self.fail_stream(ctx, id, state);
        }
    }

    /// Services vanished: fail every stream that depends on them.
    ///
    /// With `channel_down` the whole channel is recovering, so the synthetic state is the
    /// channel's; otherwise the failure is local to the streams of those services.
    pub(crate) fn delete_services(
        &mut self,
        ctx: &mut HandlerContext<'_>,
        service_ids: &[ServiceId],
        channel_down: bool,
    ) {
        let text = if channel_down {
            "channel down"
        } else {
            "service deleted"
        };
        let state = State::closed_recover(text);
        let affected: Vec<WireStreamId> = self
            .wire
            .values()
            .filter(|ws| ws.key.service_id.is_some_and(|s| service_ids.contains(&s)))
            .map(|ws| ws.id)
            .collect();
        for wire_id in affected {
            self.fail_wire(ctx, wire_id, &state);
        }
    }

    /// Status for a whole item group; final states fail each member's wire stream.
    pub(crate) fn group_status(
        &mut self,
        ctx: &mut HandlerContext<'_>,
        service_id: ServiceId,
        group: &GroupId,
        state: &State,
    ) {
        let members: Vec<StreamId> = ctx
            .registry
            .group_members(service_id, group)
            .into_iter()
            .filter(|id| {
                ctx.registry
                    .lookup(*id)
                    .is_some_and(|s| !matches!(s.domain, Domain::Login | Domain::Directory))
            })
            .collect();
        debug!(service_id, group = %group, members = members.len(), "group_status");

        if state.is_final() {
            let mut wires: Vec<WireStreamId> = members
                .iter()
                .filter_map(|id| ctx.registry.lookup(*id).and_then(|s| s.wire_id))
                .collect();
            wires.sort_unstable();
            wires.dedup();
            for wire_id in wires {
                self.fail_wire(ctx, wire_id, state);
            }
            return;
        }

        for id in members {
            let Some(stream) = ctx.registry.lookup_mut(id) else {
                continue;
            };
            let prior = stream.phase;
            stream.last_state = Some(state.stream_state);
            ctx.emit_for(
                id,
                StreamEventKind::Status {
                    state: state.clone(),
                    prior,
                    recovering: false,
                },
            );
        }
    }

    /// Terminal close of every item stream (login rejected or watchlist shut down).
    pub(crate) fn close_all(&mut self, ctx: &mut HandlerContext<'_>, state: &State) {
        self.wire.clear();
        self.by_key.clear();
        self.pending.clear();
        let ids: Vec<StreamId> = ctx
            .registry
            .active_ids()
            .into_iter()
            .filter(|id| {
                ctx.registry
                    .lookup(*id)
                    .is_some_and(|s| !matches!(s.domain, Domain::Login | Domain::Directory))
            })
            .collect();
        for id in ids {
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
            let _ = ctx.registry.close(id);
        }
    }

    // -------------------------------------------------------------------------
    // Pause / resume
    // -------------------------------------------------------------------------

    pub(crate) fn set_paused(
        &mut self,
        ctx: &mut HandlerContext<'_>,
        id: StreamId,
        paused: bool,
    ) -> Result<(), WatchlistError> {
        let Some(stream) = ctx.registry.lookup_mut(id) else {
            return Err(WatchlistError::unknown_stream(id));
        };
        if stream.request.is_private() && paused && stream.phase != StreamPhase::Open {
            return Err(
                WatchlistError::invalid("private stream is not open yet").with_stream_id(id)
            );
        }
        stream.paused = paused;
        let Some(wire_id) = stream.wire_id else {
            return Ok(());
        };
        let Some(ws) = self.wire.get_mut(&wire_id) else {
            return Ok(());
        };

        let all_paused = ws
            .members
            .iter()
            .all(|m| ctx.registry.lookup(*m).is_some_and(|s| s.paused));
        if all_paused != ws.paused {
            ws.paused = all_paused;
            ctx.send(ws.request(true));
            debug!(wire_id, paused = all_paused, "item_pause_changed");
        }
        Ok(())
    }

    /// Flag every item stream paused or resumed; the wire side goes through the login stream.
    pub(crate) fn mark_all_paused(&mut self, ctx: &mut HandlerContext<'_>, paused: bool) {
        for ws in self.wire.values_mut() {
            ws.paused = paused;
            for id in &ws.members {
                if let Some(stream) = ctx.registry.lookup_mut(*id) {
                    stream.paused = paused;
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Inbound
    // -------------------------------------------------------------------------

    fn member_view(ctx: &HandlerContext<'_>, id: StreamId) -> Option<View> {
        ctx.registry
            .lookup(id)
            .and_then(|s| s.request.item())
            .and_then(|r| r.view.clone())
    }

    fn filtered(ctx: &HandlerContext<'_>, id: StreamId, payload: &Payload) -> Payload {
        match (payload, Self::member_view(ctx, id)) {
            (Payload::Fields(fields), Some(view)) => Payload::Fields(view.filter(fields)),
            _ => payload.clone(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_refresh(
        &mut self,
        ctx: &mut HandlerContext<'_>,
        wire_id: WireStreamId,
        state: State,
        solicited: bool,
        complete: bool,
        group_id: Option<GroupId>,
        payload: Payload,
    ) -> Result<(), WatchlistError> {
        if state.is_final() {
            self.fail_wire(ctx, wire_id, &state);
            return Ok(());
        }
        let Some(ws) = self.wire.get_mut(&wire_id) else {
            return Err(WatchlistError::unknown_stream(wire_id));
        };
        ws.open = true;
        let members = ws.members.clone();

        if let (Some(group), Some(service_id)) = (group_id, ws.key.service_id) {
            for id in &members {
                ctx.registry.associate(*id, service_id, group.clone())?;
            }
        }

        let awaiting: Vec<StreamId> = members
            .iter()
            .copied()
            .filter(|id| ctx.registry.lookup(*id).is_some_and(|s| s.awaiting_refresh))
            .collect();
        let targets = if solicited && !awaiting.is_empty() {
            awaiting
        } else {
            members
        };

        let mut finished: Vec<StreamId> = Vec::new();
        for id in targets {
            let payload = Self::filtered(ctx, id, &payload);
            ctx.emit_for(
                id,
                StreamEventKind::Refresh {
                    state: state.clone(),
                    solicited,
                    complete,
                    payload,
                },
            );
            if !complete {
                continue;
            }
            if let Some(stream) = ctx.registry.lookup_mut(id) {
                stream.phase = StreamPhase::Open;
                stream.awaiting_refresh = false;
                stream.last_state = Some(state.stream_state);
                let streaming = stream.request.item().map_or(true, |r| r.streaming);
                if !streaming || state.stream_state == StreamState::NonStreaming {
                    finished.push(id);
                }
            }
        }

        // Snapshot requests are done once their refresh completes
        for id in finished {
            self.detach_snapshot(ctx, id, wire_id);
            let _ = ctx.registry.close(id);
        }

        // View changes held back while the request was outstanding go out now
        if complete {
            if let Some(ws) = self.wire.get_mut(&wire_id) {
                if ws.view.is_dirty() {
                    ctx.send(ws.request(true));
                    ws.view.commit();
                    debug!(wire_id, "item_view_reissued");
                }
            }
        }
        Ok(())
    }

    fn detach_snapshot(
        &mut self,
        ctx: &mut HandlerContext<'_>,
        id: StreamId,
        wire_id: WireStreamId,
    ) {
        let Some(ws) = self.wire.get_mut(&wire_id) else {
            return;
        };
        ws.members.retain(|m| *m != id);
        let view = Self::member_view(ctx, id);
        ws.view.remove(view.as_ref());
        if ws.members.is_empty() {
            if ws.streaming {
                ctx.send(OutboundMsg::close(wire_id, ws.key.domain));
            }
            self.remove_wire(wire_id);
        }
    }

    fn on_update(
        &mut self,
        ctx: &mut HandlerContext<'_>,
        wire_id: WireStreamId,
        payload: Payload,
    ) -> Result<(), WatchlistError> {
        let Some(ws) = self.wire.get(&wire_id) else {
            return Err(WatchlistError::unknown_stream(wire_id));
        };
        let targets: Vec<StreamId> = ws
            .members
            .iter()
            .copied()
            .filter(|id| {
                ctx.registry
                    .lookup(*id)
                    .is_some_and(|s| !s.awaiting_refresh && !s.paused)
            })
            .collect();
        for id in targets {
            let payload = Self::filtered(ctx, id, &payload);
            ctx.emit_for(id, StreamEventKind::Update { payload });
        }
        Ok(())
    }

    fn on_status(
        &mut self,
        ctx: &mut HandlerContext<'_>,
        wire_id: WireStreamId,
        state: Option<State>,
        group_id: Option<GroupId>,
    ) -> Result<(), WatchlistError> {
        let Some(ws) = self.wire.get(&wire_id) else {
            return Err(WatchlistError::unknown_stream(wire_id));
        };
        let members = ws.members.clone();
        if let (Some(group), Some(service_id)) = (group_id, ws.key.service_id) {
            for id in &members {
                ctx.registry.associate(*id, service_id, group.clone())?;
            }
        }
        let Some(state) = state else {
            return Ok(());
        };
        if state.is_final() {
            self.fail_wire(ctx, wire_id, &state);
            return Ok(());
        }
        for id in members {
            let Some(stream) = ctx.registry.lookup_mut(id) else {
                continue;
            };
            let prior = stream.phase;
            stream.last_state = Some(state.stream_state);
            ctx.emit_for(
                id,
                StreamEventKind::Status {
                    state: state.clone(),
                    prior,
                    recovering: false,
                },
            );
        }
        Ok(())
    }
}

impl DomainHandler for ItemHandler {
    fn name(&self) -> &'static str {
        "item"
    }

    fn owns_wire_stream(&self, wire_id: WireStreamId) -> bool {
        self.wire.contains_key(&wire_id)
    }

    fn handle_domain_message(
        &mut self,
        ctx: &mut HandlerContext<'_>,
        msg: InboundMsg,
    ) -> Result<Vec<Followup>, WatchlistError> {
        let wire_id = msg.stream_id;
        match msg.body {
            MsgBody::Refresh {
                state,
                solicited,
                complete,
                group_id,
                payload,
            } => self.on_refresh(ctx, wire_id, state, solicited, complete, group_id, payload)?,
            MsgBody::Update { payload } => self.on_update(ctx, wire_id, payload)?,
            MsgBody::Status { state, group_id } => self.on_status(ctx, wire_id, state, group_id)?,
            MsgBody::Generic { payload } => {
                let members = self
                    .wire
                    .get(&wire_id)
                    .map(|ws| ws.members.clone())
                    .ok_or_else(|| WatchlistError::unknown_stream(wire_id))?;
                for id in members {
                    ctx.emit_for(
                        id,
                        StreamEventKind::Generic {
                            payload: payload.clone(),
                        },
                    );
                }
            }
            // Acks are matched by the post tracker before reaching a handler
            MsgBody::Ack { .. } => {}
        }
        Ok(Vec::new())
    }

    fn recover(&mut self, ctx: &mut HandlerContext<'_>) -> Result<(), WatchlistError> {
        if !ctx.ready() || self.pending.is_empty() {
            return Ok(());
        }
        let queued: Vec<StreamId> = self.pending.drain(..).collect();
        let mut reissued = 0usize;
        for id in queued {
            if !ctx.registry.contains(id) {
                continue;
            }
            match self.attach(ctx, id) {
                Ok(Attach::Pending) => {}
                Ok(_) => reissued += 1,
                Err(e) => {
                    warn!(stream_id = id, error = %e, "item_reissue_rejected");
                    let prior = ctx
                        .registry
                        .lookup(id)
                        .map_or(StreamPhase::PendingRequest, |s| s.phase);
                    let state = State::closed(e.message.clone());
                    ctx.emit_for(
                        id,
                        StreamEventKind::Status {
                            state,
                            prior,
                            recovering: false,
                        },
                    );
                    let domain = ctx.registry.lookup(id).map(|s| s.domain);
                    let _ = ctx.registry.close(id);
                    let mut err = e.with_stream_id(id);
                    err.domain = domain;
                    err.prior_state = Some(prior);
                    ctx.error(err);
                }
            }
        }
        if reissued > 0 {
            info!(reissued, still_pending = self.pending.len(), "items_recovered");
        }
        Ok(())
    }

    fn channel_down(&mut self, ctx: &mut HandlerContext<'_>) {
        let state = State::closed_recover("channel down");
        let wires: Vec<WireStreamId> = self.wire.keys().copied().collect();
        for wire_id in wires {
            self.fail_wire(ctx, wire_id, &state);
        }
    }

    fn close(
        &mut self,
        ctx: &mut HandlerContext<'_>,
        stream_id: StreamId,
    ) -> Result<(), WatchlistError> {
        let Some(stream) = ctx.registry.lookup_mut(stream_id) else {
            return Err(WatchlistError::unknown_stream(stream_id));
        };
        stream.phase = StreamPhase::PendingClose;
        let wire_id = stream.wire_id;

        self.pending.retain(|p| *p != stream_id);
        if let Some(wire_id) = wire_id {
            if ctx.channel_up {
                self.detach(ctx, stream_id, wire_id);
            } else if let Some(ws) = self.wire.get_mut(&wire_id) {
                ws.members.retain(|m| *m != stream_id);
                if ws.members.is_empty() {
                    self.remove_wire(wire_id);
                }
            }
        }
        ctx.registry.close(stream_id)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(request: ItemRequest, phase: StreamPhase) -> Stream {
        Stream {
            id: 3,
            domain: request.domain,
            request: StreamRequest::Item(request),
            recoverable: true,
            phase,
            wire_id: Some(5),
            service_id: Some(1),
            paused: false,
            awaiting_refresh: false,
            last_state: None,
        }
    }

    fn single_open() -> LoginFeatures {
        LoginFeatures {
            single_open: true,
            ..Default::default()
        }
    }

    const CLOSED_RECOVER: Option<StreamState> = Some(StreamState::ClosedRecover);

    #[test]
    fn test_recoverable_after_closed_recover() {
        let s = stream(ItemRequest::market_price("IBM.N"), StreamPhase::Open);
        assert!(is_request_recoverable(&s, CLOSED_RECOVER, &single_open()));
    }

    #[test]
    fn test_closed_is_terminal() {
        let s = stream(ItemRequest::market_price("IBM.N"), StreamPhase::Open);
        assert!(!is_request_recoverable(&s, Some(StreamState::Closed), &single_open()));
        assert!(!is_request_recoverable(&s, None, &single_open()));
    }

    #[test]
    fn test_private_stream_never_recovers() {
        let s = stream(
            ItemRequest::market_price("IBM.N").private_stream(),
            StreamPhase::Open,
        );
        assert!(!is_request_recoverable(&s, CLOSED_RECOVER, &single_open()));
    }

    #[test]
    fn test_received_dictionary_not_recovered() {
        let request = ItemRequest::new(Domain::Dictionary, "RWFFld");
        let received = stream(request.clone(), StreamPhase::Open);
        assert!(!is_request_recoverable(&received, CLOSED_RECOVER, &single_open()));

        // Still downloading: reissued like any other request
        let downloading = stream(request, StreamPhase::PendingRequest);
        assert!(is_request_recoverable(&downloading, CLOSED_RECOVER, &single_open()));
    }

    #[test]
    fn test_needs_single_open_and_recoverable_flag() {
        let mut s = stream(ItemRequest::market_price("IBM.N"), StreamPhase::Open);
        assert!(!is_request_recoverable(&s, CLOSED_RECOVER, &LoginFeatures::default()));

        s.recoverable = false;
        assert!(!is_request_recoverable(&s, CLOSED_RECOVER, &single_open()));
    }
}
