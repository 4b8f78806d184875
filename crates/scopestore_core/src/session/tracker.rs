//! Change tracking for one live session.
//!
//! # Responsibility
//! - Keep the identity map of entities a session has read or been given.
//! - Record per-property original/current values and entry state.
//! - Turn pending entries into one storage batch and accept its outcome.
//!
//! # Invariants
//! - At most one entry exists per `(set, key)` for persisted rows.
//! - `Unchanged` entries have `current == original`.
//! - Entries leave the tracker when deleted rows are saved or on detach.

use crate::model::{EntityId, EntityModel, Record, Value, UNSAVED_ID};
use crate::store::PendingWrite;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Lifecycle state of a tracked entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Added,
    Modified,
    Deleted,
    Unchanged,
    Detached,
}

impl EntryState {
    /// Returns whether the entry will produce a write on save.
    pub fn is_pending(self) -> bool {
        matches!(self, Self::Added | Self::Modified | Self::Deleted)
    }
}

/// Tracker-local identity of one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(u64);

/// Key assigned by storage to an added entity, available once saved.
#[derive(Debug, Clone, Default)]
pub struct PendingKey(Arc<OnceCell<EntityId>>);

impl PendingKey {
    /// Key that is already known, used for rows that exist in storage.
    pub fn resolved(id: EntityId) -> Self {
        let key = Self::default();
        key.resolve(id);
        key
    }

    pub fn get(&self) -> Option<EntityId> {
        self.0.get().copied()
    }

    pub(crate) fn resolve(&self, id: EntityId) {
        let _ = self.0.set(id);
    }
}

/// One tracked entity.
#[derive(Debug, Clone)]
pub struct TrackedEntry {
    id: EntryId,
    model: &'static EntityModel,
    key: EntityId,
    state: EntryState,
    original: Record,
    current: Record,
    pending_key: Option<PendingKey>,
}

impl TrackedEntry {
    pub fn id(&self) -> EntryId {
        self.id
    }

    pub fn model(&self) -> &'static EntityModel {
        self.model
    }

    pub fn key(&self) -> EntityId {
        self.key
    }

    pub fn state(&self) -> EntryState {
        self.state
    }

    pub fn current(&self) -> &Record {
        &self.current
    }

    pub fn original(&self) -> &Record {
        &self.original
    }

    pub fn current_value(&self, property: &str) -> Option<&Value> {
        self.current.get(property)
    }

    /// Property names known on either side, in column order.
    pub fn property_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.current.keys().map(String::as_str).collect();
        for name in self.original.keys() {
            if !self.current.contains_key(name) {
                names.push(name.as_str());
            }
        }
        names.sort_unstable();
        names
    }

    pub fn is_modified(&self, property: &str) -> bool {
        self.current.get(property) != self.original.get(property)
    }

    /// Sets one property, moving `Unchanged` entries to `Modified` on change.
    pub fn set_value(&mut self, property: &str, value: Value) {
        if self.current.get(property) == Some(&value) {
            return;
        }
        self.current.insert(property.to_string(), value);
        if self.state == EntryState::Unchanged {
            self.state = EntryState::Modified;
        }
    }

    fn changed_values(&self) -> Record {
        self.current
            .iter()
            .filter(|(name, value)| self.original.get(*name) != Some(*value))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }
}

/// One pending entry turned into owned write data.
#[derive(Debug, Clone)]
pub(crate) struct PlannedWrite {
    pub(crate) entry: EntryId,
    pub(crate) state: EntryState,
    pub(crate) model: &'static EntityModel,
    pub(crate) key: EntityId,
    pub(crate) values: Record,
}

impl PlannedWrite {
    pub(crate) fn as_write(&self) -> PendingWrite<'_> {
        match self.state {
            EntryState::Added => PendingWrite::Insert {
                model: self.model,
                id: (self.key != UNSAVED_ID).then_some(self.key),
                values: &self.values,
            },
            EntryState::Modified => PendingWrite::Update {
                model: self.model,
                id: self.key,
                values: &self.values,
            },
            _ => PendingWrite::Delete {
                model: self.model,
                id: self.key,
            },
        }
    }
}

/// Ordered identity map of tracked entries.
#[derive(Debug, Default)]
pub struct ChangeTracker {
    next_entry: u64,
    entries: Vec<TrackedEntry>,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[TrackedEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: EntryId) -> Option<&TrackedEntry> {
        self.entries.iter().find(|entry| entry.id == id)
    }

    pub fn get_mut(&mut self, id: EntryId) -> Option<&mut TrackedEntry> {
        self.entries.iter_mut().find(|entry| entry.id == id)
    }

    /// Finds the entry for a persisted row of `model`'s set.
    pub fn find(&self, model: &EntityModel, key: EntityId) -> Option<&TrackedEntry> {
        if key == UNSAVED_ID {
            return None;
        }
        self.entries
            .iter()
            .find(|entry| entry.model.set == model.set && entry.key == key)
    }

    /// State of a persisted row, `Detached` when not tracked.
    pub fn state_of(&self, model: &EntityModel, key: EntityId) -> EntryState {
        self.find(model, key)
            .map_or(EntryState::Detached, TrackedEntry::state)
    }

    /// Tracks a row read from storage, keeping any existing entry for it.
    pub fn attach(&mut self, model: &'static EntityModel, key: EntityId, record: Record) -> EntryId {
        if let Some(existing) = self.find(model, key) {
            return existing.id;
        }
        self.push(model, key, EntryState::Unchanged, record.clone(), record, None)
    }

    /// Tracks a new entity to be inserted on save.
    pub fn track_added(
        &mut self,
        model: &'static EntityModel,
        key: EntityId,
        record: Record,
        pending_key: PendingKey,
    ) -> EntryId {
        if key != UNSAVED_ID {
            pending_key.resolve(key);
        }
        self.push(
            model,
            key,
            EntryState::Added,
            Record::new(),
            record,
            Some(pending_key),
        )
    }

    /// Marks an entry deleted; added entries are simply forgotten.
    pub fn mark_deleted(&mut self, id: EntryId) {
        let Some(index) = self.entries.iter().position(|entry| entry.id == id) else {
            return;
        };
        if self.entries[index].state == EntryState::Added {
            self.entries.remove(index);
        } else {
            self.entries[index].state = EntryState::Deleted;
        }
    }

    /// Drops every entry; pending changes are discarded.
    pub fn detach_all(&mut self) -> usize {
        let detached = self.entries.len();
        for entry in &mut self.entries {
            entry.state = EntryState::Detached;
        }
        self.entries.clear();
        detached
    }

    /// Entries that will produce writes, in tracking order.
    pub fn pending(&self) -> impl Iterator<Item = &TrackedEntry> {
        self.entries.iter().filter(|entry| entry.state.is_pending())
    }

    /// Owned write plan for every pending entry, in tracking order.
    pub(crate) fn plan_writes(&self) -> Vec<PlannedWrite> {
        self.pending()
            .map(|entry| PlannedWrite {
                entry: entry.id,
                state: entry.state,
                model: entry.model,
                key: entry.key,
                values: match entry.state {
                    EntryState::Added => entry.current.clone(),
                    EntryState::Modified => entry.changed_values(),
                    _ => Record::new(),
                },
            })
            .collect()
    }

    /// Applies storage-assigned keys and resets pending entries.
    pub(crate) fn accept_changes(&mut self, saved: &[(EntryId, EntityId)]) {
        for (entry_id, key) in saved {
            let Some(entry) = self.get_mut(*entry_id) else {
                continue;
            };
            match entry.state {
                EntryState::Added => {
                    entry.key = *key;
                    if let Some(pending_key) = &entry.pending_key {
                        pending_key.resolve(*key);
                    }
                    entry.original = entry.current.clone();
                    entry.state = EntryState::Unchanged;
                }
                EntryState::Modified => {
                    entry.original = entry.current.clone();
                    entry.state = EntryState::Unchanged;
                }
                EntryState::Deleted => entry.state = EntryState::Detached,
                EntryState::Unchanged | EntryState::Detached => {}
            }
        }
        self.entries
            .retain(|entry| entry.state != EntryState::Detached);
    }

    fn push(
        &mut self,
        model: &'static EntityModel,
        key: EntityId,
        state: EntryState,
        original: Record,
        current: Record,
        pending_key: Option<PendingKey>,
    ) -> EntryId {
        self.next_entry += 1;
        let id = EntryId(self.next_entry);
        self.entries.push(TrackedEntry {
            id,
            model,
            key,
            state,
            original,
            current,
            pending_key,
        });
        id
    }
}
