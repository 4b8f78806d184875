//! Change notifications published around commits.
//!
//! # Responsibility
//! - Describe one pending entity change (`PendingChange`) for subscribers.
//! - Define the sink contract the context publishes through.
//!
//! # Invariants
//! - Publishing is fire-and-forget; a sink cannot fail a commit.
//! - For every commit with a sink: per-entity `*ing` events, then
//!   `PreCommit`, then per-entity `*ed` events, then `PostCommit`.
//! - Added entities also produce `Updating`/`Updated` after `Creating`/`Created`.
//! - `*ing` events and `PreCommit` are published while the committing handle
//!   is locked; a sink must not call back into a context over that handle
//!   from those events.

use crate::model::{EntityId, Record, Value};
use crate::session::{EntryState, TrackedEntry};
use log::debug;

/// Identity and values of the entity a change is about.
#[derive(Debug, Clone, PartialEq)]
pub struct EntitySnapshot {
    pub model: &'static str,
    pub id: EntityId,
    pub values: Record,
}

/// Summary of one entity's state change, built only to drive notifications.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingChange {
    pub entity: EntitySnapshot,
    pub state: EntryState,
    pub old_values: Record,
    pub new_values: Record,
}

impl PendingChange {
    /// Builds the change record for a pending tracker entry.
    ///
    /// Modified properties carry both sides. Added entries report every
    /// property with a `Null` old value; deleted entries the reverse.
    pub fn from_entry(entry: &TrackedEntry) -> Self {
        let mut old_values = Record::new();
        let mut new_values = Record::new();
        let state = entry.state();

        for name in entry.property_names() {
            let current = entry.current().get(name).cloned().unwrap_or(Value::Null);
            let original = entry.original().get(name).cloned().unwrap_or(Value::Null);
            if state == EntryState::Deleted {
                new_values.insert(name.to_string(), Value::Null);
                old_values.insert(name.to_string(), original);
            } else if entry.is_modified(name) {
                new_values.insert(name.to_string(), current);
                old_values.insert(name.to_string(), original);
            } else if state == EntryState::Added {
                new_values.insert(name.to_string(), current);
                old_values.insert(name.to_string(), Value::Null);
            }
        }

        let values = if state == EntryState::Deleted {
            entry.original().clone()
        } else {
            entry.current().clone()
        };

        Self {
            entity: EntitySnapshot {
                model: entry.model().name,
                id: entry.key(),
                values,
            },
            state,
            old_values,
            new_values,
        }
    }
}

/// Typed change event; the entity's model name is the type tag.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    Creating(EntitySnapshot),
    Updating(PendingChange),
    Deleting(EntitySnapshot),
    PreCommit,
    Created(EntitySnapshot),
    Updated(PendingChange),
    Deleted(EntitySnapshot),
    PostCommit,
}

impl ChangeEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Creating(_) => "creating",
            Self::Updating(_) => "updating",
            Self::Deleting(_) => "deleting",
            Self::PreCommit => "pre_commit",
            Self::Created(_) => "created",
            Self::Updated(_) => "updated",
            Self::Deleted(_) => "deleted",
            Self::PostCommit => "post_commit",
        }
    }

    /// Model name of the entity involved, `None` for commit signals.
    pub fn model(&self) -> Option<&'static str> {
        match self {
            Self::Creating(entity) | Self::Deleting(entity) => Some(entity.model),
            Self::Created(entity) | Self::Deleted(entity) => Some(entity.model),
            Self::Updating(change) | Self::Updated(change) => Some(change.entity.model),
            Self::PreCommit | Self::PostCommit => None,
        }
    }
}

/// Receiver of change events.
pub trait NotificationSink: Send + Sync {
    fn publish(&self, event: ChangeEvent);
}

impl<F> NotificationSink for F
where
    F: Fn(ChangeEvent) + Send + Sync,
{
    fn publish(&self, event: ChangeEvent) {
        self(event)
    }
}

/// Sink that only writes events to the debug log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn publish(&self, event: ChangeEvent) {
        debug!(
            "event=change_notified module=events kind={} model={}",
            event.name(),
            event.model().unwrap_or("-")
        );
    }
}

/// Events published before the save, in order.
pub(crate) fn pre_commit_events(changes: &[PendingChange]) -> Vec<ChangeEvent> {
    let mut events = Vec::with_capacity(changes.len() * 2 + 1);
    for change in changes {
        match change.state {
            EntryState::Added => {
                events.push(ChangeEvent::Creating(change.entity.clone()));
                events.push(ChangeEvent::Updating(change.clone()));
            }
            EntryState::Modified => events.push(ChangeEvent::Updating(change.clone())),
            EntryState::Deleted => events.push(ChangeEvent::Deleting(change.entity.clone())),
            EntryState::Unchanged | EntryState::Detached => {}
        }
    }
    events.push(ChangeEvent::PreCommit);
    events
}

/// Events published after a successful save, in order.
pub(crate) fn post_commit_events(changes: Vec<PendingChange>) -> Vec<ChangeEvent> {
    let mut events = Vec::with_capacity(changes.len() * 2 + 1);
    for change in changes {
        match change.state {
            EntryState::Added => {
                events.push(ChangeEvent::Created(change.entity.clone()));
                events.push(ChangeEvent::Updated(change));
            }
            EntryState::Modified => events.push(ChangeEvent::Updated(change)),
            EntryState::Deleted => events.push(ChangeEvent::Deleted(change.entity)),
            EntryState::Unchanged | EntryState::Detached => {}
        }
    }
    events.push(ChangeEvent::PostCommit);
    events
}
