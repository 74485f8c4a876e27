//! Item Group Table
//!
//! Maps a provider-assigned group id (scoped to its service) to the intrusive list of member
//! streams. A stream is always in exactly one group; re-associating unlinks it from the old one
//! first. Empty groups are dropped.

use std::collections::HashMap;

use tracing::debug;

use crate::watchlist::msg::{GroupId, ServiceId, StreamId};
use crate::watchlist::registry::{Chain, ListHead, ListIter, StreamArena};

/// Group ids are only unique within a service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemGroupKey {
    pub service_id: ServiceId,
    pub group: GroupId,
}

impl ItemGroupKey {
    pub fn new(service_id: ServiceId, group: GroupId) -> Self {
        Self { service_id, group }
    }

    /// Synthetic group for streams with no provider-assigned group.
    pub fn default_for(service_id: ServiceId) -> Self {
        Self::new(service_id, GroupId::default())
    }
}

#[derive(Debug, Default)]
pub(crate) struct ItemGroupTable {
    groups: HashMap<ItemGroupKey, ListHead>,
}

impl ItemGroupTable {
    /// Move `id` into `key`, creating the group if absent. No-op if already a member.
    pub(crate) fn associate(&mut self, arena: &mut StreamArena, id: StreamId, key: ItemGroupKey) {
        let current = match arena.slot(id) {
            Some(slot) => slot.group_key.clone(),
            None => return,
        };
        if current.as_ref() == Some(&key) {
            return;
        }

        if current.is_some() {
            self.remove(arena, id);
        }

        self.groups
            .entry(key.clone())
            .or_default()
            .push_back(arena, Chain::Group, id);
        if let Some(slot) = arena.slot_mut(id) {
            slot.group_key = Some(key);
        }
    }

    /// Unlink `id` from whatever group holds it.
    pub(crate) fn remove(&mut self, arena: &mut StreamArena, id: StreamId) {
        let Some(key) = arena.slot_mut(id).and_then(|s| s.group_key.take()) else {
            return;
        };
        if let Some(head) = self.groups.get_mut(&key) {
            head.unlink(arena, Chain::Group, id);
            if head.is_empty() {
                self.groups.remove(&key);
            }
        }
    }

    /// Relink every member of `old` onto `new` and drop `old`.
    ///
    /// When `new` does not exist yet the group is simply renamed. Returns members moved.
    pub(crate) fn merge(
        &mut self,
        arena: &mut StreamArena,
        old: &ItemGroupKey,
        new: ItemGroupKey,
    ) -> usize {
        if *old == new {
            return 0;
        }
        let Some(old_head) = self.groups.remove(old) else {
            return 0;
        };

        let members: Vec<StreamId> = old_head.iter(arena, Chain::Group).collect();

        if !self.groups.contains_key(&new) {
            for id in &members {
                if let Some(slot) = arena.slot_mut(*id) {
                    slot.group_key = Some(new.clone());
                }
            }
            self.groups.insert(new.clone(), old_head);
            debug!(
                service_id = new.service_id,
                from = %old.group,
                to = %new.group,
                members = members.len(),
                "item_group_renamed"
            );
            return members.len();
        }

        let mut detached = old_head;
        let target = self.groups.entry(new.clone()).or_default();
        for id in &members {
            detached.unlink(arena, Chain::Group, *id);
            target.push_back(arena, Chain::Group, *id);
            if let Some(slot) = arena.slot_mut(*id) {
                slot.group_key = Some(new.clone());
            }
        }

        debug!(
            service_id = new.service_id,
            from = %old.group,
            to = %new.group,
            members = members.len(),
            "item_group_merged"
        );
        members.len()
    }

    pub(crate) fn members<'a>(
        &self,
        arena: &'a StreamArena,
        key: &ItemGroupKey,
    ) -> ListIter<'a> {
        self.groups
            .get(key)
            .copied()
            .unwrap_or_default()
            .iter(arena, Chain::Group)
    }

    pub(crate) fn contains(&self, key: &ItemGroupKey) -> bool {
        self.groups.contains_key(key)
    }

    pub(crate) fn len(&self) -> usize {
        self.groups.len()
    }
}
