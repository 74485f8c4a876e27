//! Post Timeout Tracker
//!
//! Every post that asks for an acknowledgement is copied and paired with a pooled timer armed
//! at an absolute deadline. The entry leaves the tracker on ack, on timeout, on stream close or
//! on clear; in every case dropping it hands the timer back to the pool. Expired posts are
//! reported once and never resent.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::clock::Nanos;
use crate::error::{ErrorKind, WatchlistError};
use crate::pool::{PooledTimer, TimerPool};
use crate::watchlist::msg::{Domain, PostMsg, StreamId, WireStreamId};
use crate::watchlist::registry::StreamPhase;

/// Identity of an outstanding post: the wire stream plus the post's id and sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PostKey {
    pub wire_id: WireStreamId,
    pub post_id: u32,
    pub seq_num: Option<u32>,
}

#[derive(Debug)]
pub struct PostTimeoutEntry {
    pub post: PostMsg,
    pub stream_id: StreamId,
    pub domain: Domain,
    timer: PooledTimer,
}

impl PostTimeoutEntry {
    #[inline]
    pub fn deadline(&self) -> Nanos {
        self.timer.deadline()
    }
}

#[derive(Debug)]
pub struct PostTimeoutTracker {
    pool: TimerPool,
    timeout: Nanos,
    entries: HashMap<PostKey, PostTimeoutEntry>,
}

impl PostTimeoutTracker {
    pub fn new(pool: TimerPool, timeout: Nanos) -> Self {
        Self {
            pool,
            timeout,
            entries: HashMap::new(),
        }
    }

    /// Track a copy of `post`; the deadline is `now + timeout`.
    ///
    /// Re-tracking the same key replaces the older entry.
    pub fn track(
        &mut self,
        wire_id: WireStreamId,
        stream_id: StreamId,
        domain: Domain,
        post: &PostMsg,
        now: Nanos,
    ) -> PostKey {
        let key = PostKey {
            wire_id,
            post_id: post.post_id,
            seq_num: post.seq_num,
        };
        let timer = self.pool.acquire(now.saturating_add(self.timeout));
        debug!(
            wire_id,
            post_id = post.post_id,
            deadline = timer.deadline(),
            "post_tracked"
        );
        self.entries.insert(
            key,
            PostTimeoutEntry {
                post: post.clone(),
                stream_id,
                domain,
                timer,
            },
        );
        key
    }

    /// Match an ack to its post. Unmatched acks return `None`.
    pub fn acknowledge(
        &mut self,
        wire_id: WireStreamId,
        ack_id: u32,
        seq_num: Option<u32>,
    ) -> Option<PostTimeoutEntry> {
        let key = PostKey {
            wire_id,
            post_id: ack_id,
            seq_num,
        };
        if let Some(entry) = self.entries.remove(&key) {
            return Some(entry);
        }
        // Providers may omit the sequence number on the ack
        if seq_num.is_none() {
            let found = self
                .entries
                .keys()
                .find(|k| k.wire_id == wire_id && k.post_id == ack_id)
                .copied()?;
            return self.entries.remove(&found);
        }
        None
    }

    /// Remove every entry whose deadline has passed and describe each as a `PostTimeout`.
    pub fn expire(&mut self, now: Nanos) -> Vec<WatchlistError> {
        let mut expired: Vec<PostKey> = self
            .entries
            .iter()
            .filter(|(_, e)| e.timer.is_expired(now))
            .map(|(k, _)| *k)
            .collect();
        expired.sort_by_key(|k| (self.entries[k].deadline(), k.wire_id, k.post_id));

        let mut errors = Vec::with_capacity(expired.len());
        for key in expired {
            let Some(entry) = self.entries.remove(&key) else {
                continue;
            };
            warn!(
                stream_id = entry.stream_id,
                post_id = key.post_id,
                seq_num = ?key.seq_num,
                "post_timeout"
            );
            errors.push(
                WatchlistError::new(
                    ErrorKind::PostTimeout,
                    format!("no ack for post {} before its deadline", key.post_id),
                )
                .with_stream(entry.stream_id, entry.domain, StreamPhase::Open),
            );
        }
        errors
    }

    /// Drop every entry owned by a closed stream.
    pub fn cancel_stream(&mut self, stream_id: StreamId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.stream_id != stream_id);
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Earliest outstanding deadline.
    pub fn next_deadline(&self) -> Option<Nanos> {
        self.entries.values().map(|e| e.deadline()).min()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn pool(&self) -> &TimerPool {
        &self.pool
    }
}
