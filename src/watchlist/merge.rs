//! Request Merge Engine
//!
//! Two independent policies keyed by the normalized item key:
//! - **Batch merge**: same-key requests submitted together share one wire request. A
//!   `BatchMergeRecord` maps the wire stream back to each contributing application stream.
//! - **View merge**: the wire view is the sorted union of every member's view, with a
//!   reference count per element. Elements whose count reaches zero are evicted.
//!
//! Limits are checked before anything is mutated, so a rejected request leaves no trace.

use std::collections::{BTreeMap, HashMap};

use crate::error::{ErrorKind, WatchlistError};
use crate::watchlist::msg::{Domain, ServiceId, StreamId, View, ViewValue, WireStreamId};

/// Normalized identity of an item on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemKey {
    pub domain: Domain,
    pub name: String,
    pub service_id: Option<ServiceId>,
}

impl ItemKey {
    pub fn new(domain: Domain, name: impl Into<String>, service_id: Option<ServiceId>) -> Self {
        Self {
            domain,
            name: name.into(),
            service_id,
        }
    }
}

// =============================================================================
// VIEW MERGE
// =============================================================================

/// One element of the merged wire view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewElement {
    pub value: ViewValue,
    pub ref_count: u32,
    /// Already carried by a request sent on the wire
    pub committed: bool,
}

/// Union of member views for one wire stream.
#[derive(Debug, Clone, Default)]
pub struct ViewAggregate {
    elements: BTreeMap<ViewValue, ViewElement>,
    /// Members that asked for every field
    full_view_requests: usize,
    dirty: bool,
}

impl ViewAggregate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate a prospective add without mutating.
    pub fn check_add(&self, view: Option<&View>, max_elements: usize) -> Result<(), WatchlistError> {
        let Some(view) = view else {
            return Ok(());
        };

        let values = view.values();
        if values.is_empty() {
            return Err(WatchlistError::invalid("view contains no elements"));
        }

        if let Some(existing) = self.elements.keys().next() {
            let existing_is_field = matches!(existing, ViewValue::Field(_));
            if existing_is_field != view.is_field_ids() {
                return Err(WatchlistError::invalid(
                    "view type differs from views already merged on this item",
                ));
            }
        }

        let new_elements = values
            .iter()
            .filter(|v| !self.elements.contains_key(*v))
            .count();
        if self.elements.len() + new_elements > max_elements {
            return Err(WatchlistError::new(
                ErrorKind::RequestMergeLimit,
                format!(
                    "merged view would hold {} elements (limit {})",
                    self.elements.len() + new_elements,
                    max_elements
                ),
            ));
        }
        Ok(())
    }

    /// Merge a member's view in. Returns whether the wire view changed.
    pub fn add(&mut self, view: Option<&View>, max_elements: usize) -> Result<bool, WatchlistError> {
        self.check_add(view, max_elements)?;
        let before = self.wire_view();

        match view {
            None => self.full_view_requests += 1,
            Some(view) => {
                for value in view.values() {
                    self.elements
                        .entry(value.clone())
                        .and_modify(|e| e.ref_count += 1)
                        .or_insert(ViewElement {
                            value,
                            ref_count: 1,
                            committed: false,
                        });
                }
            }
        }

        let changed = self.wire_view() != before;
        self.dirty |= changed;
        Ok(changed)
    }

    /// Take a member's view out. Returns whether the wire view changed.
    pub fn remove(&mut self, view: Option<&View>) -> bool {
        let before = self.wire_view();

        match view {
            None => self.full_view_requests = self.full_view_requests.saturating_sub(1),
            Some(view) => {
                for value in view.values() {
                    let drop_it = match self.elements.get_mut(&value) {
                        Some(element) => {
                            element.ref_count = element.ref_count.saturating_sub(1);
                            element.ref_count == 0
                        }
                        None => false,
                    };
                    if drop_it {
                        self.elements.remove(&value);
                    }
                }
            }
        }

        let changed = self.wire_view() != before;
        self.dirty |= changed;
        changed
    }

    /// View to put on the wire. `None` means all fields.
    pub fn wire_view(&self) -> Option<Vec<ViewValue>> {
        if self.full_view_requests > 0 || self.elements.is_empty() {
            return None;
        }
        Some(self.elements.keys().cloned().collect())
    }

    /// Mark every element as sent.
    pub fn commit(&mut self) {
        for element in self.elements.values_mut() {
            element.committed = true;
        }
        self.dirty = false;
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn ref_count(&self, value: &ViewValue) -> u32 {
        self.elements.get(value).map(|e| e.ref_count).unwrap_or(0)
    }

    pub fn element(&self, value: &ViewValue) -> Option<&ViewElement> {
        self.elements.get(value)
    }

    pub fn uncommitted(&self) -> Vec<ViewValue> {
        self.elements
            .values()
            .filter(|e| !e.committed)
            .map(|e| e.value.clone())
            .collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

// =============================================================================
// BATCH MERGE
// =============================================================================

/// Transient aggregation of same-key requests into one wire request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchMergeRecord {
    pub key: ItemKey,
    pub wire_id: Option<WireStreamId>,
    pub members: Vec<StreamId>,
}

/// Candidate for batch planning.
#[derive(Debug, Clone)]
pub struct BatchCandidate {
    pub stream_id: StreamId,
    pub key: ItemKey,
    pub private: bool,
}

/// Merge policy and limits.
#[derive(Debug, Clone)]
pub struct RequestMergeEngine {
    batch_enabled: bool,
    max_requests_per_stream: usize,
    max_view_elements: usize,
}

impl RequestMergeEngine {
    pub fn new(batch_enabled: bool, max_requests_per_stream: usize, max_view_elements: usize) -> Self {
        Self {
            batch_enabled,
            max_requests_per_stream: max_requests_per_stream.max(1),
            max_view_elements,
        }
    }

    #[inline]
    pub fn batch_enabled(&self) -> bool {
        self.batch_enabled
    }

    #[inline]
    pub fn max_view_elements(&self) -> usize {
        self.max_view_elements
    }

    /// Whether a request may share a wire stream at all.
    #[inline]
    pub fn can_merge(&self, private: bool) -> bool {
        self.batch_enabled && !private
    }

    /// Group candidates into one record per wire request, preserving submission order.
    pub fn plan_batch(&self, candidates: &[BatchCandidate]) -> Vec<BatchMergeRecord> {
        let mut records: Vec<BatchMergeRecord> = Vec::new();
        let mut by_key: HashMap<&ItemKey, usize> = HashMap::new();

        for candidate in candidates {
            if self.can_merge(candidate.private) {
                if let Some(&idx) = by_key.get(&candidate.key) {
                    records[idx].members.push(candidate.stream_id);
                    continue;
                }
                by_key.insert(&candidate.key, records.len());
            }
            records.push(BatchMergeRecord {
                key: candidate.key.clone(),
                wire_id: None,
                members: vec![candidate.stream_id],
            });
        }
        records
    }

    /// Check that one more member fits on a wire stream that has `members` already.
    pub fn check_join(&self, members: usize) -> Result<(), WatchlistError> {
        if members + 1 > self.max_requests_per_stream {
            return Err(WatchlistError::new(
                ErrorKind::RequestMergeLimit,
                format!(
                    "item already carries {} requests (limit {})",
                    members, self.max_requests_per_stream
                ),
            ));
        }
        Ok(())
    }

    /// Check a whole join (member count and view) before committing any of it.
    pub fn check_merge(
        &self,
        members: usize,
        aggregate: &ViewAggregate,
        view: Option<&View>,
    ) -> Result<(), WatchlistError> {
        self.check_join(members)?;
        aggregate.check_add(view, self.max_view_elements)
    }
}
