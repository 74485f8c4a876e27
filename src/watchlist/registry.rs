//! Stream Registry
//!
//! Owns every application stream on the channel. Streams live in a dense arena indexed by their
//! stream id; membership lists (active streams, item groups) are intrusive doubly-linked lists
//! whose prev/next links are stream ids, so insert and unlink are O(1) with no ownership cycles.
//!
//! Ids are the smallest non-negative integer not currently active. A closed id goes back to the
//! free pool only after the close has fully unlinked the stream.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fmt;

use tracing::debug;

use crate::error::WatchlistError;
use crate::watchlist::item_group::{ItemGroupKey, ItemGroupTable};
use crate::watchlist::msg::{
    Closure, Domain, GroupId, ItemRequest, LoginRequest, ServiceId, ServiceRef, StreamId,
    StreamState, WireStreamId,
};

// =============================================================================
// STREAM
// =============================================================================

/// Watchlist-side lifecycle of an application stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamPhase {
    /// Waiting to be sent (or re-sent) on the wire
    PendingRequest,
    /// Refresh received
    Open,
    /// Close requested, not yet unlinked
    PendingClose,
    /// Failed recoverably; reissued on the next recovery pass
    Recovering,
    /// Terminal
    Closed,
}

impl fmt::Display for StreamPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PendingRequest => write!(f, "PENDING_REQUEST"),
            Self::Open => write!(f, "OPEN"),
            Self::PendingClose => write!(f, "PENDING_CLOSE"),
            Self::Recovering => write!(f, "RECOVERING"),
            Self::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Originating application request.
#[derive(Debug, Clone)]
pub enum StreamRequest {
    Login(LoginRequest),
    Item(ItemRequest),
}

impl StreamRequest {
    pub fn domain(&self) -> Domain {
        match self {
            Self::Login(_) => Domain::Login,
            Self::Item(req) => req.domain,
        }
    }

    pub fn closure(&self) -> Option<&Closure> {
        match self {
            Self::Login(req) => req.closure.as_ref(),
            Self::Item(req) => req.closure.as_ref(),
        }
    }

    pub fn is_private(&self) -> bool {
        matches!(self, Self::Item(req) if req.private)
    }

    pub fn item(&self) -> Option<&ItemRequest> {
        match self {
            Self::Item(req) => Some(req),
            Self::Login(_) => None,
        }
    }
}

/// Application stream state.
#[derive(Debug, Clone)]
pub struct Stream {
    pub id: StreamId,
    pub domain: Domain,
    pub request: StreamRequest,
    pub recoverable: bool,
    pub phase: StreamPhase,
    pub wire_id: Option<WireStreamId>,
    pub service_id: Option<ServiceId>,
    pub paused: bool,
    pub awaiting_refresh: bool,
    pub last_state: Option<StreamState>,
}

impl Stream {
    #[inline]
    pub fn closure(&self) -> Option<&Closure> {
        self.request.closure()
    }
}

// =============================================================================
// INTRUSIVE LISTS
// =============================================================================

/// Which membership list a link belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Chain {
    Active,
    Group,
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Links {
    prev: Option<StreamId>,
    next: Option<StreamId>,
}

#[derive(Debug)]
pub(crate) struct Slot {
    pub(crate) stream: Stream,
    active: Links,
    group: Links,
    pub(crate) group_key: Option<ItemGroupKey>,
}

/// Dense stream storage addressed by stream id.
#[derive(Debug, Default)]
pub(crate) struct StreamArena {
    slots: Vec<Option<Slot>>,
}

impl StreamArena {
    #[inline]
    fn index(id: StreamId) -> Option<usize> {
        usize::try_from(id).ok()
    }

    pub(crate) fn slot(&self, id: StreamId) -> Option<&Slot> {
        Self::index(id)
            .and_then(|i| self.slots.get(i))
            .and_then(|s| s.as_ref())
    }

    pub(crate) fn slot_mut(&mut self, id: StreamId) -> Option<&mut Slot> {
        Self::index(id)
            .and_then(|i| self.slots.get_mut(i))
            .and_then(|s| s.as_mut())
    }

    fn links_mut(&mut self, id: StreamId, chain: Chain) -> Option<&mut Links> {
        self.slot_mut(id).map(|slot| match chain {
            Chain::Active => &mut slot.active,
            Chain::Group => &mut slot.group,
        })
    }

    fn links(&self, id: StreamId, chain: Chain) -> Option<Links> {
        self.slot(id).map(|slot| match chain {
            Chain::Active => slot.active,
            Chain::Group => slot.group,
        })
    }

    fn insert(&mut self, id: StreamId, slot: Slot) {
        let Some(idx) = Self::index(id) else { return };
        if self.slots.len() <= idx {
            self.slots.resize_with(idx + 1, || None);
        }
        self.slots[idx] = Some(slot);
    }

    fn take(&mut self, id: StreamId) -> Option<Slot> {
        Self::index(id)
            .and_then(|i| self.slots.get_mut(i))
            .and_then(|s| s.take())
    }
}

/// Head of an intrusive list threaded through the arena.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ListHead {
    head: Option<StreamId>,
    tail: Option<StreamId>,
    len: usize,
}

impl ListHead {
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn push_back(&mut self, arena: &mut StreamArena, chain: Chain, id: StreamId) {
        let prev_tail = self.tail;
        if let Some(links) = arena.links_mut(id, chain) {
            links.prev = prev_tail;
            links.next = None;
        } else {
            return;
        }
        match prev_tail {
            Some(tail) => {
                if let Some(links) = arena.links_mut(tail, chain) {
                    links.next = Some(id);
                }
            }
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        self.len += 1;
    }

    pub(crate) fn unlink(&mut self, arena: &mut StreamArena, chain: Chain, id: StreamId) {
        let Some(links) = arena.links(id, chain) else {
            return;
        };
        match links.prev {
            Some(prev) => {
                if let Some(p) = arena.links_mut(prev, chain) {
                    p.next = links.next;
                }
            }
            None => self.head = links.next,
        }
        match links.next {
            Some(next) => {
                if let Some(n) = arena.links_mut(next, chain) {
                    n.prev = links.prev;
                }
            }
            None => self.tail = links.prev,
        }
        if let Some(l) = arena.links_mut(id, chain) {
            *l = Links::default();
        }
        self.len = self.len.saturating_sub(1);
    }

    pub(crate) fn iter<'a>(&self, arena: &'a StreamArena, chain: Chain) -> ListIter<'a> {
        ListIter {
            arena,
            chain,
            next: self.head,
        }
    }
}

pub(crate) struct ListIter<'a> {
    arena: &'a StreamArena,
    chain: Chain,
    next: Option<StreamId>,
}

impl Iterator for ListIter<'_> {
    type Item = StreamId;

    fn next(&mut self) -> Option<StreamId> {
        let current = self.next?;
        self.next = self.arena.links(current, self.chain).and_then(|l| l.next);
        Some(current)
    }
}

// =============================================================================
// REGISTRY
// =============================================================================

/// Owner of all application streams on one channel.
#[derive(Debug, Default)]
pub struct StreamRegistry {
    arena: StreamArena,
    free_ids: BinaryHeap<Reverse<StreamId>>,
    next_id: StreamId,
    active: ListHead,
    groups: ItemGroupTable,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request and return its stream id.
    ///
    /// Private streams never recover; otherwise the request's own flag wins over
    /// `default_recoverable`.
    pub fn open(&mut self, request: StreamRequest, default_recoverable: bool) -> StreamId {
        let id = match self.free_ids.pop() {
            Some(Reverse(id)) => id,
            None => {
                let id = self.next_id;
                self.next_id += 1;
                id
            }
        };

        let (recoverable, service_id) = match &request {
            StreamRequest::Login(_) => (default_recoverable, None),
            StreamRequest::Item(req) => {
                let recoverable = !req.private && req.recoverable.unwrap_or(default_recoverable);
                let service_id = match req.service {
                    Some(ServiceRef::Id(id)) => Some(id),
                    _ => None,
                };
                (recoverable, service_id)
            }
        };

        let paused = matches!(&request, StreamRequest::Item(req) if req.paused);
        let stream = Stream {
            id,
            domain: request.domain(),
            request,
            recoverable,
            phase: StreamPhase::PendingRequest,
            wire_id: None,
            service_id,
            paused,
            awaiting_refresh: true,
            last_state: None,
        };

        self.arena.insert(
            id,
            Slot {
                stream,
                active: Links::default(),
                group: Links::default(),
                group_key: None,
            },
        );
        self.active.push_back(&mut self.arena, Chain::Active, id);
        self.groups.associate(
            &mut self.arena,
            id,
            ItemGroupKey::default_for(service_id.unwrap_or(0)),
        );

        debug!(stream_id = id, recoverable, "stream_opened");
        id
    }

    /// Unlink a stream from its group and the active list and release its id.
    pub fn close(&mut self, id: StreamId) -> Result<Stream, WatchlistError> {
        if self.arena.slot(id).is_none() {
            return Err(WatchlistError::unknown_stream(id));
        }

        self.groups.remove(&mut self.arena, id);
        self.active.unlink(&mut self.arena, Chain::Active, id);
        let slot = self
            .arena
            .take(id)
            .ok_or_else(|| WatchlistError::unknown_stream(id))?;
        self.free_ids.push(Reverse(id));

        let mut stream = slot.stream;
        stream.phase = StreamPhase::Closed;
        debug!(stream_id = id, "stream_closed");
        Ok(stream)
    }

    #[inline]
    pub fn lookup(&self, id: StreamId) -> Option<&Stream> {
        self.arena.slot(id).map(|s| &s.stream)
    }

    #[inline]
    pub fn lookup_mut(&mut self, id: StreamId) -> Option<&mut Stream> {
        self.arena.slot_mut(id).map(|s| &mut s.stream)
    }

    #[inline]
    pub fn contains(&self, id: StreamId) -> bool {
        self.arena.slot(id).is_some()
    }

    /// Active stream ids in open order.
    pub fn active_ids(&self) -> Vec<StreamId> {
        self.active.iter(&self.arena, Chain::Active).collect()
    }

    /// Active stream ids of one domain, in open order.
    pub fn ids_for_domain(&self, domain: Domain) -> Vec<StreamId> {
        self.active
            .iter(&self.arena, Chain::Active)
            .filter(|id| self.lookup(*id).is_some_and(|s| s.domain == domain))
            .collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.active.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    // -------------------------------------------------------------------------
    // Item groups
    // -------------------------------------------------------------------------

    /// Move a stream into the group `group` of `service_id`.
    pub fn associate(
        &mut self,
        id: StreamId,
        service_id: ServiceId,
        group: GroupId,
    ) -> Result<(), WatchlistError> {
        if !self.contains(id) {
            return Err(WatchlistError::unknown_stream(id));
        }
        self.groups
            .associate(&mut self.arena, id, ItemGroupKey::new(service_id, group));
        Ok(())
    }

    /// Relink every member of `old` onto `new` within a service.
    pub fn merge_groups(&mut self, service_id: ServiceId, old: &GroupId, new: &GroupId) -> usize {
        self.groups.merge(
            &mut self.arena,
            &ItemGroupKey::new(service_id, old.clone()),
            ItemGroupKey::new(service_id, new.clone()),
        )
    }

    /// Members of a group.
    pub fn group_members(&self, service_id: ServiceId, group: &GroupId) -> Vec<StreamId> {
        self.groups
            .members(&self.arena, &ItemGroupKey::new(service_id, group.clone()))
            .collect()
    }

    /// Group the stream currently belongs to.
    pub fn group_of(&self, id: StreamId) -> Option<&ItemGroupKey> {
        self.arena.slot(id).and_then(|s| s.group_key.as_ref())
    }

    pub fn has_group(&self, service_id: ServiceId, group: &GroupId) -> bool {
        self.groups
            .contains(&ItemGroupKey::new(service_id, group.clone()))
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(name: &str) -> StreamRequest {
        StreamRequest::Item(ItemRequest::market_price(name).service_id(1))
    }

    #[test]
    fn test_ids_smallest_unused() {
        let mut reg = StreamRegistry::new();
        let a = reg.open(item("A"), true);
        let b = reg.open(item("B"), true);
        let c = reg.open(item("C"), true);
        assert_eq!((a, b, c), (0, 1, 2));

        reg.close(b).unwrap();
        reg.close(a).unwrap();
        assert_eq!(reg.open(item("D"), true), 0);
        assert_eq!(reg.open(item("E"), true), 1);
        assert_eq!(reg.open(item("F"), true), 3);
    }

    #[test]
    fn test_no_duplicate_active_ids() {
        let mut reg = StreamRegistry::new();
        let mut live: Vec<StreamId> = Vec::new();
        for round in 0..50 {
            let id = reg.open(item("X"), true);
            assert!(!live.contains(&id));
            live.push(id);
            if round % 3 == 0 {
                let victim = live.remove(live.len() / 2);
                reg.close(victim).unwrap();
            }
        }
        let mut active = reg.active_ids();
        active.sort();
        live.sort();
        assert_eq!(active, live);
    }

    #[test]
    fn test_close_unknown() {
        let mut reg = StreamRegistry::new();
        let err = reg.close(7).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::UnknownStream);
        assert_eq!(err.stream_id, Some(7));
    }

    #[test]
    fn test_active_order_after_unlink() {
        let mut reg = StreamRegistry::new();
        let ids: Vec<_> = (0..4).map(|i| reg.open(item(&format!("I{}", i)), true)).collect();
        reg.close(ids[1]).unwrap();
        assert_eq!(reg.active_ids(), vec![0, 2, 3]);
        reg.close(ids[3]).unwrap();
        reg.close(ids[0]).unwrap();
        assert_eq!(reg.active_ids(), vec![2]);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_recoverability_flags() {
        let mut reg = StreamRegistry::new();
        let private = reg.open(
            StreamRequest::Item(ItemRequest::market_price("P").private_stream()),
            true,
        );
        let opted_out = reg.open(
            StreamRequest::Item(ItemRequest::market_price("Q").recoverable(false)),
            true,
        );
        let default = reg.open(item("R"), true);
        assert!(!reg.lookup(private).unwrap().recoverable);
        assert!(!reg.lookup(opted_out).unwrap().recoverable);
        assert!(reg.lookup(default).unwrap().recoverable);
    }

    #[test]
    fn test_every_stream_has_a_group() {
        let mut reg = StreamRegistry::new();
        let id = reg.open(item("A"), true);
        let key = reg.group_of(id).unwrap();
        assert_eq!(key.service_id, 1);
        assert!(key.group.is_default());
    }
}
