//! Login Handler
//!
//! One login stream per channel. The login request goes out as soon as the channel is up; the
//! refresh carries the provider's feature set, which gates posting, optimized pause/resume and
//! recoverability of every other stream.

use tracing::{debug, info, warn};

use crate::error::WatchlistError;
use crate::watchlist::event::StreamEventKind;
use crate::watchlist::handler::{DomainHandler, Followup, HandlerContext};
use crate::watchlist::msg::{
    Domain, InboundMsg, LoginFeatures, LoginRequest, MsgBody, OutboundBody, OutboundMsg, Payload,
    State, StreamId, StreamState, WireStreamId,
};
use crate::watchlist::registry::{StreamPhase, StreamRequest};

#[derive(Debug, Default)]
pub(crate) struct LoginHandler {
    stream_id: Option<StreamId>,
    wire_id: Option<WireStreamId>,
    /// Login request written on the current connection
    sent: bool,
    open: bool,
}

impl LoginHandler {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn is_open(&self) -> bool {
        self.open
    }

    #[inline]
    pub(crate) fn stream_id(&self) -> Option<StreamId> {
        self.stream_id
    }

    #[inline]
    pub(crate) fn wire_id(&self) -> Option<WireStreamId> {
        self.wire_id
    }

    pub(crate) fn open(
        &mut self,
        ctx: &mut HandlerContext<'_>,
        request: LoginRequest,
        default_recoverable: bool,
    ) -> Result<StreamId, WatchlistError> {
        if self.stream_id.is_some() {
            return Err(WatchlistError::invalid("a login stream is already open"));
        }
        if request.user_name.is_empty() && request.auth_token.is_none() {
            return Err(WatchlistError::invalid(
                "login needs a user name or an auth token",
            ));
        }

        let id = ctx
            .registry
            .open(StreamRequest::Login(request), default_recoverable);
        let wire_id = ctx.wire_ids.allocate();
        if let Some(stream) = ctx.registry.lookup_mut(id) {
            stream.wire_id = Some(wire_id);
        }
        self.stream_id = Some(id);
        self.wire_id = Some(wire_id);

        if ctx.channel_up {
            self.send_login(ctx);
        }
        Ok(id)
    }

    fn login_request(ctx: &HandlerContext<'_>, id: StreamId) -> Option<LoginRequest> {
        match ctx.registry.lookup(id).map(|s| &s.request) {
            Some(StreamRequest::Login(req)) => Some(req.clone()),
            _ => None,
        }
    }

    fn send_login(&mut self, ctx: &mut HandlerContext<'_>) {
        let (Some(id), Some(wire_id)) = (self.stream_id, self.wire_id) else {
            return;
        };
        let Some(req) = Self::login_request(ctx, id) else {
            return;
        };
        let paused = req.pause_all;
        ctx.send(OutboundMsg {
            stream_id: wire_id,
            domain: Domain::Login,
            body: OutboundBody::Login {
                user_name: req.user_name,
                application_id: req.application_id,
                position: req.position,
                auth_token: req.auth_token,
                rtt: req.rtt,
                paused,
            },
        });
        self.sent = true;
        debug!(stream_id = id, wire_id, "login_sent");
    }

    /// Reissue the login carrying a renewed token.
    pub(crate) fn reissue_with_token(&mut self, ctx: &mut HandlerContext<'_>, token: &str) {
        let Some(id) = self.stream_id else {
            return;
        };
        match ctx.registry.lookup_mut(id).map(|s| &mut s.request) {
            Some(StreamRequest::Login(req)) if req.auth_token.is_some() => {
                req.auth_token = Some(token.to_string());
            }
            _ => return,
        }
        if ctx.channel_up && self.sent {
            self.send_login(ctx);
            info!(stream_id = id, "login_reissued_with_token");
        }
    }

    /// Optimized pause/resume of every stream through the login stream.
    pub(crate) fn send_pause_all(&mut self, ctx: &mut HandlerContext<'_>, paused: bool) {
        let Some(id) = self.stream_id else {
            return;
        };
        if let Some(StreamRequest::Login(req)) = ctx.registry.lookup_mut(id).map(|s| &mut s.request)
        {
            req.pause_all = paused;
        }
        if ctx.channel_up && self.sent {
            self.send_login(ctx);
        }
    }

    fn rtt_enabled(ctx: &HandlerContext<'_>, id: StreamId) -> bool {
        ctx.features.supports_rtt
            && matches!(
                ctx.registry.lookup(id).map(|s| &s.request),
                Some(StreamRequest::Login(req)) if req.rtt
            )
    }

    /// Failure of the login stream itself.
    fn fail(&mut self, ctx: &mut HandlerContext<'_>, id: StreamId, state: State) -> Vec<Followup> {
        self.open = false;
        self.sent = false;
        let Some(stream) = ctx.registry.lookup_mut(id) else {
            return Vec::new();
        };
        let prior = stream.phase;
        stream.last_state = Some(state.stream_state);

        if state.stream_state == StreamState::ClosedRecover && stream.recoverable {
            stream.phase = StreamPhase::Recovering;
            stream.awaiting_refresh = true;
            ctx.emit_for(
                id,
                StreamEventKind::Status {
                    state: State::open_suspect(state.text),
                    prior,
                    recovering: true,
                },
            );
            warn!(stream_id = id, "login_recovering");
            return vec![Followup::LoginRecovering];
        }

        ctx.emit_for(
            id,
            StreamEventKind::Status {
                state,
                prior,
                recovering: false,
            },
        );
        let _ = ctx.registry.close(id);
        self.stream_id = None;
        self.wire_id = None;
        warn!(stream_id = id, "login_closed");
        vec![Followup::LoginClosed]
    }
}

impl DomainHandler for LoginHandler {
    fn name(&self) -> &'static str {
        "login"
    }

    fn owns_wire_stream(&self, wire_id: WireStreamId) -> bool {
        self.wire_id == Some(wire_id)
    }

    fn handle_domain_message(
        &mut self,
        ctx: &mut HandlerContext<'_>,
        msg: InboundMsg,
    ) -> Result<Vec<Followup>, WatchlistError> {
        let Some(id) = self.stream_id else {
            return Err(WatchlistError::unknown_stream(msg.stream_id));
        };

        match msg.body {
            MsgBody::Refresh {
                state,
                solicited,
                complete,
                payload,
                ..
            } => {
                if state.is_final() {
                    return Ok(self.fail(ctx, id, state));
                }
                if let Payload::LoginFeatures(features) = &payload {
                    *ctx.features = features.clone();
                }
                let was_open = self.open;
                self.open = state.stream_state == StreamState::Open;
                if let Some(stream) = ctx.registry.lookup_mut(id) {
                    stream.phase = StreamPhase::Open;
                    stream.awaiting_refresh = false;
                    stream.last_state = Some(state.stream_state);
                }
                ctx.emit_for(
                    id,
                    StreamEventKind::Refresh {
                        state,
                        solicited,
                        complete,
                        payload,
                    },
                );
                if self.open && !was_open {
                    info!(stream_id = id, features = ?ctx.features, "login_accepted");
                    return Ok(vec![Followup::LoginOpened]);
                }
                Ok(Vec::new())
            }
            MsgBody::Status {
                state: Some(state), ..
            } => {
                if state.is_final() {
                    return Ok(self.fail(ctx, id, state));
                }
                let prior = ctx
                    .registry
                    .lookup(id)
                    .map_or(StreamPhase::Open, |s| s.phase);
                ctx.emit_for(
                    id,
                    StreamEventKind::Status {
                        state,
                        prior,
                        recovering: false,
                    },
                );
                Ok(Vec::new())
            }
            MsgBody::Status { state: None, .. } => Ok(Vec::new()),
            MsgBody::Update { payload } => {
                if let Payload::LoginFeatures(features) = &payload {
                    *ctx.features = features.clone();
                }
                ctx.emit_for(id, StreamEventKind::Update { payload });
                Ok(Vec::new())
            }
            MsgBody::Generic { payload } => {
                if let Payload::Rtt { ticks } = payload {
                    if Self::rtt_enabled(ctx, id) {
                        if let Some(wire_id) = self.wire_id {
                            ctx.send(OutboundMsg {
                                stream_id: wire_id,
                                domain: Domain::Login,
                                body: OutboundBody::Rtt { ticks },
                            });
                        }
                    }
                }
                ctx.emit_for(id, StreamEventKind::Generic { payload });
                Ok(Vec::new())
            }
            // Acks on the login stream belong to off-stream posts; the watchlist routes them
            MsgBody::Ack { .. } => Ok(Vec::new()),
        }
    }

    fn recover(&mut self, ctx: &mut HandlerContext<'_>) -> Result<(), WatchlistError> {
        if ctx.channel_up && !self.sent && self.stream_id.is_some() {
            self.send_login(ctx);
        }
        Ok(())
    }

    fn channel_down(&mut self, ctx: &mut HandlerContext<'_>) {
        self.sent = false;
        let was_open = std::mem::replace(&mut self.open, false);
        let Some(id) = self.stream_id else {
            return;
        };
        let Some(stream) = ctx.registry.lookup_mut(id) else {
            return;
        };
        let prior = stream.phase;
        let recoverable = stream.recoverable;
        if recoverable {
            stream.phase = StreamPhase::Recovering;
            stream.awaiting_refresh = true;
            if was_open || prior != StreamPhase::Recovering {
                ctx.emit_for(
                    id,
                    StreamEventKind::Status {
                        state: State::open_suspect("channel down"),
                        prior,
                        recovering: true,
                    },
                );
            }
            return;
        }
        ctx.emit_for(
            id,
            StreamEventKind::Status {
                state: State::closed_recover("channel down"),
                prior,
                recovering: false,
            },
        );
        let _ = ctx.registry.close(id);
        self.stream_id = None;
        self.wire_id = None;
    }

    fn close(
        &mut self,
        ctx: &mut HandlerContext<'_>,
        stream_id: StreamId,
    ) -> Result<(), WatchlistError> {
        if self.stream_id != Some(stream_id) {
            return Err(WatchlistError::unknown_stream(stream_id));
        }
        if let (true, Some(wire_id)) = (self.sent && ctx.channel_up, self.wire_id) {
            ctx.send(OutboundMsg::close(wire_id, Domain::Login));
        }
        ctx.registry.close(stream_id)?;
        *ctx.features = LoginFeatures::default();
        self.stream_id = None;
        self.wire_id = None;
        self.sent = false;
        self.open = false;
        Ok(())
    }
}
