//! Open write-scope bookkeeping per session handle.
//!
//! # Responsibility
//! - Map each `HandleId` to the ordered list of its open write scopes.
//! - Tell the context when a scope is the sole (outermost) one left.
//!
//! # Invariants
//! - An entry exists only while its handle has at least one open scope;
//!   `register` may create an empty entry that the next `add` fills.
//! - A scope appears at most once per handle.
//! - Every mutation of one handle's list happens under that entry's lock.

use crate::session::HandleId;
use dashmap::DashMap;
use log::debug;
use once_cell::sync::Lazy;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);
static GLOBAL_REGISTRY: Lazy<Arc<WriteScopeRegistry>> =
    Lazy::new(|| Arc::new(WriteScopeRegistry::new()));

/// Process-unique identity of one write scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(u64);

impl ScopeId {
    pub fn next() -> Self {
        Self(NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Display for ScopeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "scope-{}", self.0)
    }
}

/// Outcome of removing one scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// The scope was not registered (already ended or cleared).
    Missing,
    /// Other scopes remain open for the handle.
    Remaining(usize),
    /// That was the last scope; the handle's entry is gone.
    Emptied,
}

/// Concurrent map from session handles to their open write scopes.
#[derive(Debug, Default)]
pub struct WriteScopeRegistry {
    scopes: DashMap<HandleId, Vec<ScopeId>>,
}

impl WriteScopeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide registry for callers that do not inject their own.
    pub fn global() -> Arc<WriteScopeRegistry> {
        Arc::clone(&GLOBAL_REGISTRY)
    }

    /// Ensures an entry exists for `handle`.
    pub fn register(&self, handle: HandleId) {
        self.scopes.entry(handle).or_default();
    }

    /// Appends `scope` unless already present; returns whether it was added.
    pub fn add(&self, handle: HandleId, scope: ScopeId) -> bool {
        let mut list = self.scopes.entry(handle).or_default();
        if list.contains(&scope) {
            return false;
        }
        list.push(scope);
        true
    }

    pub fn remove(&self, handle: HandleId, scope: ScopeId) -> Removal {
        let removal = match self.scopes.get_mut(&handle) {
            None => Removal::Missing,
            Some(mut list) => match list.iter().position(|open| *open == scope) {
                None => Removal::Missing,
                Some(index) => {
                    list.remove(index);
                    if list.is_empty() {
                        Removal::Emptied
                    } else {
                        Removal::Remaining(list.len())
                    }
                }
            },
        };

        if removal == Removal::Emptied {
            // A concurrent `add` may have refilled the list since the lock dropped.
            self.scopes.remove_if(&handle, |_, list| list.is_empty());
        }
        removal
    }

    /// Drops every open scope of `handle`; returns how many there were.
    pub fn clear(&self, handle: HandleId) -> usize {
        let cleared = self
            .scopes
            .remove(&handle)
            .map_or(0, |(_, list)| list.len());
        if cleared > 0 {
            debug!("event=registry_clear module=registry handle={handle} cleared={cleared}");
        }
        cleared
    }

    /// Snapshot of open scopes, oldest first.
    pub fn list(&self, handle: HandleId) -> Vec<ScopeId> {
        self.scopes
            .get(&handle)
            .map(|list| list.clone())
            .unwrap_or_default()
    }

    pub fn contains(&self, handle: HandleId, scope: ScopeId) -> bool {
        self.scopes
            .get(&handle)
            .is_some_and(|list| list.contains(&scope))
    }

    pub fn depth(&self, handle: HandleId) -> usize {
        self.scopes.get(&handle).map_or(0, |list| list.len())
    }

    /// Returns whether `scope` is the only open scope of `handle`.
    pub fn is_sole(&self, handle: HandleId, scope: ScopeId) -> bool {
        self.scopes
            .get(&handle)
            .is_some_and(|list| list.as_slice() == [scope])
    }

    pub fn is_registered(&self, handle: HandleId) -> bool {
        self.scopes.contains_key(&handle)
    }

    /// Handles with an entry, in ascending order.
    pub fn handles(&self) -> Vec<HandleId> {
        let mut handles: Vec<HandleId> = self.scopes.iter().map(|entry| *entry.key()).collect();
        handles.sort();
        handles
    }
}
