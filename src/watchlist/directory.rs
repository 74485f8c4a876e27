//! Directory Handler
//!
//! - `ServiceCache`: service id ⇄ name, built from directory refreshes and updates
//! - One internal wire directory stream, opened once the login is accepted
//! - Application directory streams are served from the cache: a refresh on open, then every
//!   applied change fanned out as an update, optionally filtered to one service
//! - Deletes and group changes come back as followups for the item handler

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::WatchlistError;
use crate::watchlist::event::StreamEventKind;
use crate::watchlist::handler::{DomainHandler, Followup, HandlerContext};
use crate::watchlist::msg::{
    DataState, Domain, InboundMsg, ItemRequest, MsgBody, OutboundBody, OutboundMsg, Payload,
    ServiceAction, ServiceId, ServiceInfo, ServiceRef, ServiceUpdate, State, StreamId, StreamState,
    WireRequest, WireStreamId,
};
use crate::watchlist::registry::{StreamPhase, StreamRequest};

// =============================================================================
// SERVICE CACHE
// =============================================================================

/// What one batch of service updates changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceDelta {
    pub added: Vec<ServiceId>,
    pub updated: Vec<ServiceId>,
    pub deleted: Vec<ServiceId>,
}

impl ServiceDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }
}

/// Known services on the channel.
///
/// Only the services are serialized; the name index is rebuilt on load.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "ServiceTable")]
pub struct ServiceCache {
    services: BTreeMap<ServiceId, ServiceInfo>,
    #[serde(skip_serializing)]
    by_name: HashMap<String, ServiceId>,
}

/// Serialized form of `ServiceCache`.
#[derive(Deserialize)]
struct ServiceTable {
    services: BTreeMap<ServiceId, ServiceInfo>,
}

impl From<ServiceTable> for ServiceCache {
    fn from(table: ServiceTable) -> Self {
        let by_name = table
            .services
            .iter()
            .map(|(id, info)| (info.name.clone(), *id))
            .collect();
        Self {
            services: table.services,
            by_name,
        }
    }
}

impl ServiceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a batch of directory entries in order.
    pub fn apply(&mut self, updates: &[ServiceUpdate]) -> ServiceDelta {
        let mut delta = ServiceDelta::default();
        for update in updates {
            match update.action {
                ServiceAction::Add | ServiceAction::Update => {
                    let existed = self.services.contains_key(&update.service_id);
                    if let Some(info) = &update.info {
                        self.insert(update.service_id, info.clone());
                    } else if !existed {
                        // Group-only update for a service we never saw
                        continue;
                    }
                    if existed {
                        delta.updated.push(update.service_id);
                    } else {
                        delta.added.push(update.service_id);
                    }
                }
                ServiceAction::Delete => {
                    if self.remove(update.service_id).is_some() {
                        delta.deleted.push(update.service_id);
                    }
                }
            }
        }
        delta
    }

    fn insert(&mut self, id: ServiceId, info: ServiceInfo) {
        if let Some(old) = self.services.get(&id) {
            if old.name != info.name {
                self.by_name.remove(&old.name);
            }
        }
        self.by_name.insert(info.name.clone(), id);
        self.services.insert(id, info);
    }

    fn remove(&mut self, id: ServiceId) -> Option<ServiceInfo> {
        let info = self.services.remove(&id)?;
        if self.by_name.get(&info.name) == Some(&id) {
            self.by_name.remove(&info.name);
        }
        Some(info)
    }

    /// Drop every service, returning the ids that were known.
    pub fn clear(&mut self) -> Vec<ServiceId> {
        let ids = self.ids();
        self.services.clear();
        self.by_name.clear();
        ids
    }

    #[inline]
    pub fn resolve(&self, name: &str) -> Option<ServiceId> {
        self.by_name.get(name).copied()
    }

    pub fn name_of(&self, id: ServiceId) -> Option<&str> {
        self.services.get(&id).map(|s| s.name.as_str())
    }

    #[inline]
    pub fn get(&self, id: ServiceId) -> Option<&ServiceInfo> {
        self.services.get(&id)
    }

    /// Resolve a request's service reference against the cache.
    pub fn lookup_ref(&self, service: &ServiceRef) -> Option<ServiceId> {
        match service {
            ServiceRef::Id(id) => self.services.contains_key(id).then_some(*id),
            ServiceRef::Name(name) => self.resolve(name),
        }
    }

    /// Service exists, is up and accepts requests.
    pub fn is_available(&self, id: ServiceId) -> bool {
        self.services
            .get(&id)
            .is_some_and(|s| s.service_up && s.accepting_requests)
    }

    pub fn ids(&self) -> Vec<ServiceId> {
        self.services.keys().copied().collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.services.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Full cache as directory entries, optionally narrowed to one service.
    pub fn snapshot(&self, filter: Option<&ServiceRef>) -> Vec<ServiceUpdate> {
        self.services
            .iter()
            .filter(|(id, info)| matches_filter(filter, **id, &info.name))
            .map(|(id, info)| ServiceUpdate {
                service_id: *id,
                action: ServiceAction::Add,
                info: Some(info.clone()),
                groups: Vec::new(),
            })
            .collect()
    }
}

fn matches_filter(filter: Option<&ServiceRef>, id: ServiceId, name: &str) -> bool {
    match filter {
        None => true,
        Some(ServiceRef::Id(want)) => *want == id,
        Some(ServiceRef::Name(want)) => want == name,
    }
}

// =============================================================================
// HANDLER
// =============================================================================

#[derive(Debug, Default)]
pub(crate) struct DirectoryHandler {
    wire_id: Option<WireStreamId>,
    wire_open: bool,
    /// Provider closed the directory for good; no reissue until the next login
    closed: bool,
    /// Names of deleted services, kept so filtered app streams still see the delete
    deleted_names: HashMap<ServiceId, String>,
}

impl DirectoryHandler {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register an application directory stream and answer it from the cache when possible.
    pub(crate) fn open(
        &mut self,
        ctx: &mut HandlerContext<'_>,
        request: ItemRequest,
        default_recoverable: bool,
    ) -> Result<StreamId, WatchlistError> {
        if request.view.is_some() {
            return Err(WatchlistError::invalid("directory requests do not take a view"));
        }
        let id = ctx
            .registry
            .open(StreamRequest::Item(request), default_recoverable);
        if self.wire_open {
            self.answer_from_cache(ctx, id);
        }
        Ok(id)
    }

    fn answer_from_cache(&mut self, ctx: &mut HandlerContext<'_>, id: StreamId) {
        let Some(stream) = ctx.registry.lookup(id) else {
            return;
        };
        let filter = stream.request.item().and_then(|r| r.service.clone());
        let streaming = stream.request.item().map_or(true, |r| r.streaming);
        let payload = Payload::Services(ctx.services.snapshot(filter.as_ref()));
        let state = if streaming {
            State::open_ok()
        } else {
            State::new(StreamState::NonStreaming, DataState::Ok, "")
        };

        ctx.emit_for(
            id,
            StreamEventKind::Refresh {
                state,
                solicited: true,
                complete: true,
                payload,
            },
        );

        if !streaming {
            let _ = ctx.registry.close(id);
            return;
        }
        if let Some(stream) = ctx.registry.lookup_mut(id) {
            stream.phase = StreamPhase::Open;
            stream.awaiting_refresh = false;
        }
    }

    fn app_streams(ctx: &HandlerContext<'_>) -> Vec<StreamId> {
        ctx.registry.ids_for_domain(Domain::Directory)
    }

    fn send_wire_request(&mut self, ctx: &mut HandlerContext<'_>) {
        let wire_id = match self.wire_id {
            Some(id) => id,
            None => {
                let id = ctx.wire_ids.allocate();
                self.wire_id = Some(id);
                id
            }
        };
        ctx.send(OutboundMsg {
            stream_id: wire_id,
            domain: Domain::Directory,
            body: OutboundBody::Request(WireRequest {
                name: String::new(),
                service_id: None,
                view: None,
                streaming: true,
                private: false,
                paused: false,
                no_refresh: false,
            }),
        });
        debug!(wire_id, "directory_requested");
    }

    /// Fan changes out to open application directory streams.
    fn fan_out(&mut self, ctx: &mut HandlerContext<'_>, updates: &[ServiceUpdate]) {
        for id in Self::app_streams(ctx) {
            let Some(stream) = ctx.registry.lookup(id) else {
                continue;
            };
            if stream.phase != StreamPhase::Open || stream.paused {
                continue;
            }
            let filter = stream.request.item().and_then(|r| r.service.clone());
            let filtered: Vec<ServiceUpdate> = updates
                .iter()
                .filter(|u| {
                    let name = u
                        .info
                        .as_ref()
                        .map(|i| i.name.as_str())
                        .or_else(|| ctx.services.name_of(u.service_id))
                        .or_else(|| self.deleted_names.get(&u.service_id).map(|s| s.as_str()))
                        .unwrap_or("");
                    matches_filter(filter.as_ref(), u.service_id, name)
                })
                .cloned()
                .collect();
            if filtered.is_empty() {
                continue;
            }
            ctx.emit_for(
                id,
                StreamEventKind::Update {
                    payload: Payload::Services(filtered),
                },
            );
        }
    }

    fn apply_services(
        &mut self,
        ctx: &mut HandlerContext<'_>,
        updates: Vec<ServiceUpdate>,
    ) -> Vec<Followup> {
        for update in &updates {
            if update.action == ServiceAction::Delete {
                if let Some(name) = ctx.services.name_of(update.service_id) {
                    self.deleted_names.insert(update.service_id, name.to_string());
                }
            }
        }

        let delta = ctx.services.apply(&updates);
        let mut followups = Vec::new();

        if !delta.is_empty() {
            info!(
                added = delta.added.len(),
                updated = delta.updated.len(),
                deleted = delta.deleted.len(),
                services = ctx.services.len(),
                "service_cache_updated"
            );
        }

        for update in &updates {
            for change in &update.groups {
                if let Some(state) = &change.state {
                    followups.push(Followup::GroupStatus {
                        service_id: update.service_id,
                        group: change.group.clone(),
                        state: state.clone(),
                    });
                }
                if let Some(to) = &change.merged_to {
                    followups.push(Followup::GroupMerged {
                        service_id: update.service_id,
                        from: change.group.clone(),
                        to: to.clone(),
                    });
                }
            }
        }

        self.fan_out(ctx, &updates);
        for id in &delta.deleted {
            self.deleted_names.remove(id);
        }

        if !delta.deleted.is_empty() {
            followups.push(Followup::ServicesDeleted(delta.deleted));
        }
        // Updated services may have come back up, so treat them as candidates too
        let mut available = delta.added;
        available.extend(delta.updated);
        if !available.is_empty() {
            followups.push(Followup::ServicesAdded(available));
        }
        followups
    }

    /// Forget every service.
    ///
    /// With `channel_down` the item handler is already recovering every stream, so no cascade
    /// is requested; otherwise the deletes are fanned out and cascade to dependent items.
    pub(crate) fn delete_all_services(
        &mut self,
        ctx: &mut HandlerContext<'_>,
        channel_down: bool,
    ) -> Vec<Followup> {
        if channel_down {
            let ids = ctx.services.clear();
            debug!(services = ids.len(), "service_cache_cleared");
            return Vec::new();
        }
        let deletes: Vec<ServiceUpdate> = ctx
            .services
            .ids()
            .into_iter()
            .map(|service_id| ServiceUpdate {
                service_id,
                action: ServiceAction::Delete,
                info: None,
                groups: Vec::new(),
            })
            .collect();
        self.apply_services(ctx, deletes)
    }

    /// Terminal close of every application directory stream.
    pub(crate) fn close_all(&mut self, ctx: &mut HandlerContext<'_>, state: &State) {
        for id in Self::app_streams(ctx) {
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
        self.wire_id = None;
        self.wire_open = false;
    }

    pub(crate) fn is_open(&self) -> bool {
        self.wire_open
    }
}

impl DomainHandler for DirectoryHandler {
    fn name(&self) -> &'static str {
        "directory"
    }

    fn owns_wire_stream(&self, wire_id: WireStreamId) -> bool {
        self.wire_id == Some(wire_id)
    }

    fn handle_domain_message(
        &mut self,
        ctx: &mut HandlerContext<'_>,
        msg: InboundMsg,
    ) -> Result<Vec<Followup>, WatchlistError> {
        match msg.body {
            MsgBody::Refresh { state, payload, .. } => {
                if state.is_final() {
                    return Ok(self.wire_failed(ctx, state));
                }
                let first = !self.wire_open;
                self.wire_open = true;
                let updates = match payload {
                    Payload::Services(updates) => updates,
                    _ => Vec::new(),
                };
                let followups = self.apply_services(ctx, updates);
                if first {
                    for id in Self::app_streams(ctx) {
                        if ctx
                            .registry
                            .lookup(id)
                            .is_some_and(|s| s.phase != StreamPhase::Open)
                        {
                            self.answer_from_cache(ctx, id);
                        }
                    }
                }
                Ok(followups)
            }
            MsgBody::Update { payload } => match payload {
                Payload::Services(updates) => Ok(self.apply_services(ctx, updates)),
                _ => Ok(Vec::new()),
            },
            MsgBody::Status {
                state: Some(state), ..
            } => {
                if state.is_final() {
                    return Ok(self.wire_failed(ctx, state));
                }
                for id in Self::app_streams(ctx) {
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
                }
                Ok(Vec::new())
            }
            MsgBody::Generic { payload } => {
                for id in Self::app_streams(ctx) {
                    ctx.emit_for(
                        id,
                        StreamEventKind::Generic {
                            payload: payload.clone(),
                        },
                    );
                }
                Ok(Vec::new())
            }
            MsgBody::Status { state: None, .. } | MsgBody::Ack { .. } => Ok(Vec::new()),
        }
    }

    fn recover(&mut self, ctx: &mut HandlerContext<'_>) -> Result<(), WatchlistError> {
        if ctx.ready() && !self.closed && !self.wire_open && self.wire_id.is_none() {
            self.send_wire_request(ctx);
        }
        Ok(())
    }

    fn channel_down(&mut self, ctx: &mut HandlerContext<'_>) {
        self.wire_id = None;
        self.wire_open = false;
        self.delete_all_services(ctx, true);

        let state = State::open_suspect("channel down");
        for id in Self::app_streams(ctx) {
            let Some(stream) = ctx.registry.lookup_mut(id) else {
                continue;
            };
            let prior = stream.phase;
            let recoverable = stream.recoverable;
            if recoverable {
                stream.phase = StreamPhase::Recovering;
                stream.awaiting_refresh = true;
            }
            ctx.emit_for(
                id,
                StreamEventKind::Status {
                    state: if recoverable {
                        state.clone()
                    } else {
                        State::closed_recover("channel down")
                    },
                    prior,
                    recovering: recoverable,
                },
            );
            if !recoverable {
                let _ = ctx.registry.close(id);
            }
        }
    }

    fn close(
        &mut self,
        ctx: &mut HandlerContext<'_>,
        stream_id: StreamId,
    ) -> Result<(), WatchlistError> {
        ctx.registry.close(stream_id).map(|_| ())
    }
}

impl DirectoryHandler {
    /// The internal directory stream was closed by the provider.
    fn wire_failed(&mut self, ctx: &mut HandlerContext<'_>, state: State) -> Vec<Followup> {
        info!(state = ?state.stream_state, text = %state.text, "directory_stream_closed");
        let followups = self.delete_all_services(ctx, false);
        self.wire_open = false;
        self.wire_id = None;
        self.closed = state.stream_state != StreamState::ClosedRecover;
        followups
    }

    /// Allow a new wire directory request (after a fresh login).
    pub(crate) fn reset_wire(&mut self) {
        self.wire_id = None;
        self.wire_open = false;
        self.closed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watchlist::msg::{GroupChange, GroupId};

    fn add(id: ServiceId, name: &str) -> ServiceUpdate {
        ServiceUpdate {
            service_id: id,
            action: ServiceAction::Add,
            info: Some(ServiceInfo::new(name)),
            groups: Vec::new(),
        }
    }

    fn delete(id: ServiceId) -> ServiceUpdate {
        ServiceUpdate {
            service_id: id,
            action: ServiceAction::Delete,
            info: None,
            groups: Vec::new(),
        }
    }

    #[test]
    fn test_apply_add_update_delete() {
        let mut cache = ServiceCache::new();
        let delta = cache.apply(&[add(1, "ELEKTRON_DD"), add(2, "IDN_RDF")]);
        assert_eq!(delta.added, vec![1, 2]);
        assert_eq!(cache.resolve("IDN_RDF"), Some(2));

        let delta = cache.apply(&[add(2, "IDN_SELECTFEED")]);
        assert_eq!(delta.updated, vec![2]);
        assert_eq!(cache.resolve("IDN_RDF"), None);
        assert_eq!(cache.resolve("IDN_SELECTFEED"), Some(2));

        let delta = cache.apply(&[delete(1), delete(9)]);
        assert_eq!(delta.deleted, vec![1]);
        assert_eq!(cache.resolve("ELEKTRON_DD"), None);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_update_json_round_trip() {
        let updates = vec![
            add(1, "ELEKTRON_DD"),
            ServiceUpdate {
                service_id: 1,
                action: ServiceAction::Update,
                info: None,
                groups: vec![GroupChange {
                    group: GroupId::new(vec![1]),
                    merged_to: Some(GroupId::new(vec![2])),
                    state: None,
                }],
            },
            delete(7),
        ];
        let json = serde_json::to_string(&updates).unwrap();
        let decoded: Vec<ServiceUpdate> = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, updates);

        let mut direct = ServiceCache::new();
        direct.apply(&updates);
        let mut replayed = ServiceCache::new();
        replayed.apply(&decoded);
        assert_eq!(direct.ids(), replayed.ids());
        assert_eq!(replayed.name_of(1), Some("ELEKTRON_DD"));
    }

    #[test]
    fn test_cache_serde_keeps_name_index() {
        let mut cache = ServiceCache::new();
        cache.apply(&[add(3, "DIRECT_FEED"), add(4, "OTHER")]);
        let json = serde_json::to_string(&cache).unwrap();
        assert!(!json.contains("by_name"));

        let restored: ServiceCache = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.resolve("DIRECT_FEED"), Some(3));
        assert_eq!(
            restored.lookup_ref(&ServiceRef::Name("OTHER".into())),
            Some(4)
        );
        assert_eq!(restored.ids(), cache.ids());
    }

    #[test]
    fn test_snapshot_filter() {
        let mut cache = ServiceCache::new();
        cache.apply(&[add(1, "A"), add(2, "B")]);
        assert_eq!(cache.snapshot(None).len(), 2);
        let only_b = cache.snapshot(Some(&ServiceRef::Name("B".into())));
        assert_eq!(only_b.len(), 1);
        assert_eq!(only_b[0].service_id, 2);
        assert!(cache.snapshot(Some(&ServiceRef::Id(5))).is_empty());
    }

    #[test]
    fn test_availability() {
        let mut cache = ServiceCache::new();
        let mut down = ServiceInfo::new("DOWN");
        down.service_up = false;
        cache.apply(&[
            add(1, "UP"),
            ServiceUpdate {
                service_id: 2,
                action: ServiceAction::Add,
                info: Some(down),
                groups: Vec::new(),
            },
        ]);
        assert!(cache.is_available(1));
        assert!(!cache.is_available(2));
        assert!(!cache.is_available(3));
        assert_eq!(cache.lookup_ref(&ServiceRef::Id(3)), None);
    }
}
