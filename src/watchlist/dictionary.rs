//! Dictionary Handler
//!
//! Optional automatic download. In `FirstAvailable` mode the handler picks the first service
//! whose description provides both the field and the enum dictionary, requests them on internal
//! non-streaming wire streams, and closes each stream once its last part arrives. In `None` mode
//! it never touches the wire. Application dictionary requests are ordinary item streams.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::WatchlistError;
use crate::watchlist::handler::{DomainHandler, Followup, HandlerContext};
use crate::watchlist::msg::{
    Domain, InboundMsg, MsgBody, OutboundBody, OutboundMsg, Payload, ServiceId, State,
    StreamId, StreamState, WireRequest, WireStreamId,
};

/// Field dictionary name advertised by providers.
pub const FIELD_DICTIONARY: &str = "RWFFld";

/// Enumerated types dictionary name advertised by providers.
pub const ENUM_DICTIONARY: &str = "RWFEnum";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DictionaryDownloadMode {
    #[default]
    None,
    FirstAvailable,
}

#[derive(Debug)]
struct Download {
    name: String,
    service_id: ServiceId,
    raw: Vec<u8>,
}

#[derive(Debug)]
pub(crate) struct DictionaryHandler {
    mode: DictionaryDownloadMode,
    in_flight: HashMap<WireStreamId, Download>,
    loaded: BTreeMap<String, Vec<u8>>,
    source: Option<ServiceId>,
    /// Services that closed a download for good on this connection
    refused: HashSet<ServiceId>,
}

impl DictionaryHandler {
    pub(crate) fn new(mode: DictionaryDownloadMode) -> Self {
        Self {
            mode,
            in_flight: HashMap::new(),
            loaded: BTreeMap::new(),
            source: None,
            refused: HashSet::new(),
        }
    }

    fn wanted() -> [&'static str; 2] {
        [FIELD_DICTIONARY, ENUM_DICTIONARY]
    }

    pub(crate) fn is_complete(&self) -> bool {
        Self::wanted().iter().all(|n| self.loaded.contains_key(*n))
    }

    pub(crate) fn dictionary(&self, name: &str) -> Option<&[u8]> {
        self.loaded.get(name).map(|v| v.as_slice())
    }

    /// Look for a source among newly available services.
    pub(crate) fn services_added(&mut self, ctx: &mut HandlerContext<'_>, ids: &[ServiceId]) {
        if self.mode == DictionaryDownloadMode::None || !ctx.ready() {
            return;
        }
        if self.is_complete() || self.source.is_some() {
            return;
        }

        let candidate = ids.iter().copied().find(|id| {
            !self.refused.contains(id)
                && ctx.services.get(*id).is_some_and(|info| {
                    Self::wanted()
                        .iter()
                        .all(|n| info.dictionaries_provided.iter().any(|p| p == n))
                })
        });
        let Some(service_id) = candidate else {
            return;
        };

        self.source = Some(service_id);
        for name in Self::wanted() {
            if self.loaded.contains_key(name) || self.is_downloading(name) {
                continue;
            }
            let wire_id = ctx.wire_ids.allocate();
            ctx.send(OutboundMsg {
                stream_id: wire_id,
                domain: Domain::Dictionary,
                body: OutboundBody::Request(WireRequest {
                    name: name.to_string(),
                    service_id: Some(service_id),
                    view: None,
                    streaming: false,
                    private: false,
                    paused: false,
                    no_refresh: false,
                }),
            });
            self.in_flight.insert(
                wire_id,
                Download {
                    name: name.to_string(),
                    service_id,
                    raw: Vec::new(),
                },
            );
            debug!(wire_id, service_id, name, "dictionary_requested");
        }
    }

    fn is_downloading(&self, name: &str) -> bool {
        self.in_flight.values().any(|d| d.name == name)
    }

    /// The source service went away mid-download.
    pub(crate) fn services_deleted(&mut self, ids: &[ServiceId]) {
        self.refused.retain(|id| !ids.contains(id));
        if self.source.is_some_and(|s| ids.contains(&s)) {
            self.in_flight.retain(|_, d| !ids.contains(&d.service_id));
            self.source = None;
        }
    }

    /// A download ended without its last part.
    ///
    /// Closed marks the service as refusing for the rest of the connection; ClosedRecover
    /// leaves it eligible. The source is released once none of its downloads is in flight,
    /// so the next recovery pass asks again for whatever is still missing.
    fn download_failed(&mut self, wire_id: WireStreamId, state: &State) {
        let Some(download) = self.in_flight.remove(&wire_id) else {
            return;
        };
        warn!(
            wire_id,
            name = %download.name,
            service_id = download.service_id,
            text = %state.text,
            "dictionary_request_failed"
        );
        if state.stream_state == StreamState::Closed {
            self.refused.insert(download.service_id);
        }
        self.release_idle_source();
    }

    fn release_idle_source(&mut self) {
        let source_busy = self
            .in_flight
            .values()
            .any(|d| Some(d.service_id) == self.source);
        if !source_busy {
            self.source = None;
        }
    }
}

impl DomainHandler for DictionaryHandler {
    fn name(&self) -> &'static str {
        "dictionary"
    }

    fn owns_wire_stream(&self, wire_id: WireStreamId) -> bool {
        self.in_flight.contains_key(&wire_id)
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
                complete,
                payload,
                ..
            } => {
                if state.is_final() {
                    self.download_failed(wire_id, &state);
                    return Ok(Vec::new());
                }
                let Some(download) = self.in_flight.get_mut(&wire_id) else {
                    return Err(WatchlistError::unknown_stream(wire_id));
                };
                if let Payload::DictionaryPart { raw, .. } = payload {
                    download.raw.extend_from_slice(&raw);
                }
                if !complete {
                    return Ok(Vec::new());
                }

                if let Some(done) = self.in_flight.remove(&wire_id) {
                    ctx.send(OutboundMsg::close(wire_id, Domain::Dictionary));
                    info!(
                        name = %done.name,
                        service_id = done.service_id,
                        bytes = done.raw.len(),
                        "dictionary_downloaded"
                    );
                    self.loaded.insert(done.name, done.raw);
                }
                if self.is_complete() {
                    self.source = None;
                    return Ok(vec![Followup::DictionaryLoaded]);
                }
                self.release_idle_source();
                Ok(Vec::new())
            }
            MsgBody::Status {
                state: Some(state), ..
            } if state.is_final() => {
                self.download_failed(wire_id, &state);
                Ok(Vec::new())
            }
            _ => Ok(Vec::new()),
        }
    }

    fn recover(&mut self, ctx: &mut HandlerContext<'_>) -> Result<(), WatchlistError> {
        if self.source.is_none() && !self.is_complete() {
            let ids = ctx.services.ids();
            self.services_added(ctx, &ids);
        }
        Ok(())
    }

    fn channel_down(&mut self, _ctx: &mut HandlerContext<'_>) {
        self.in_flight.clear();
        self.source = None;
        self.refused.clear();
    }

    fn close(
        &mut self,
        _ctx: &mut HandlerContext<'_>,
        stream_id: StreamId,
    ) -> Result<(), WatchlistError> {
        // Downloads are internal; application dictionary streams belong to the item handler
        Err(WatchlistError::unknown_stream(stream_id))
    }
}
