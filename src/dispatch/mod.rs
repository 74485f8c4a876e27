//! Dispatch Queue
//!
//! Background contexts (transport reader, REST tasks, timer wakeups) only ever push onto the
//! event queue; the watchlist's `dispatch` is its single consumer. Within one pass events are
//! processed in category order: channel, then message, then timer/REST, arrival order kept
//! inside a category.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::queue::SegQueue;

use crate::error::{ErrorKind, WatchlistError};
use crate::rest::{RestRequestId, RestResponse, RestTransportError};
use crate::session::TransportEvent;
use crate::watchlist::msg::InboundMsg;

/// Processing order within a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventCategory {
    Channel = 0,
    Message = 1,
    Timer = 2,
}

/// One queued completion.
#[derive(Debug, Clone)]
pub enum DispatchEvent {
    Transport(TransportEvent),
    Message(InboundMsg),
    Rest {
        request_id: RestRequestId,
        result: Result<RestResponse, RestTransportError>,
    },
    /// Nudge a pass so due timers fire
    Wakeup,
}

impl DispatchEvent {
    #[inline]
    pub fn category(&self) -> EventCategory {
        match self {
            Self::Transport(_) => EventCategory::Channel,
            Self::Message(_) => EventCategory::Message,
            Self::Rest { .. } | Self::Wakeup => EventCategory::Timer,
        }
    }
}

/// Multi-producer queue drained by dispatch.
#[derive(Debug, Default)]
pub struct EventQueue {
    queue: SegQueue<DispatchEvent>,
    pushed: AtomicU64,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn push(&self, event: DispatchEvent) {
        self.queue.push(event);
        self.pushed.fetch_add(1, Ordering::Relaxed);
    }

    /// Pop up to `max` events and order them by category.
    pub fn drain(&self, max: usize) -> Vec<DispatchEvent> {
        let mut batch = Vec::with_capacity(self.queue.len().min(max));
        while batch.len() < max {
            match self.queue.pop() {
                Some(event) => batch.push(event),
                None => break,
            }
        }
        // Stable: arrival order survives inside a category
        batch.sort_by_key(|e| e.category());
        batch
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Events ever pushed
    pub fn total_pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }
}

/// Cloneable producer handle.
#[derive(Debug, Clone)]
pub struct EventSender {
    queue: Arc<EventQueue>,
}

impl EventSender {
    pub fn new(queue: Arc<EventQueue>) -> Self {
        Self { queue }
    }

    #[inline]
    pub fn send(&self, event: DispatchEvent) {
        self.queue.push(event);
    }

    pub fn message(&self, msg: InboundMsg) {
        self.send(DispatchEvent::Message(msg));
    }

    pub fn transport(&self, event: TransportEvent) {
        self.send(DispatchEvent::Transport(event));
    }

    pub fn wakeup(&self) {
        self.send(DispatchEvent::Wakeup);
    }
}

/// Rejects a second dispatch while one is in flight.
#[derive(Debug, Default)]
pub struct DispatchGuard {
    active: AtomicBool,
}

impl DispatchGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&self) -> Result<DispatchPass<'_>, WatchlistError> {
        if self
            .active
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(WatchlistError::new(
                ErrorKind::ConcurrentDispatch,
                "dispatch is already running on this watchlist",
            ));
        }
        Ok(DispatchPass { guard: self })
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

/// Held for the duration of one dispatch pass.
#[derive(Debug)]
pub struct DispatchPass<'a> {
    guard: &'a DispatchGuard,
}

impl Drop for DispatchPass<'_> {
    fn drop(&mut self) {
        self.guard.active.store(false, Ordering::Release);
    }
}
