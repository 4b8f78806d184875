//! Session handles over one storage backend.
//!
//! # Responsibility
//! - `Session`: one live backend plus its change tracker.
//! - `SessionHandle`: the lifecycle contract a persistence context drives
//!   (begin-write hook, save, dispose).
//! - Two strategies: `SingleUseSession` and pooled `ExtendedUseSession`.
//!
//! # Invariants
//! - A handle's `HandleId` never changes; registries key on it.
//! - A disposed single-use handle refuses every further session access.
//! - An extended-use handle never refuses access; it swaps sessions instead.
//!
//! # See also
//! - `crate::registry` for the open-scope bookkeeping keyed by `HandleId`.

use crate::config::{ConnectionInfo, SingleUseOptions};
use crate::model::{
    Cardinality, Discriminator, EntityId, EntityModel, Navigation, Record, Value, UNSAVED_ID,
};
use crate::store::{PendingWrite, SqliteStore, StoreBackend, StoreError, StoreResult};
use log::{debug, error, info, warn};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

mod tracker;

pub use tracker::{ChangeTracker, EntryId, EntryState, PendingKey, TrackedEntry};
use tracker::PlannedWrite;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of one session handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl HandleId {
    pub fn next() -> Self {
        Self(NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl Display for HandleId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "handle-{}", self.0)
    }
}

pub type SessionResult<T> = Result<T, SessionError>;

/// Errors raised by session handles.
#[derive(Debug)]
pub enum SessionError {
    Disposed(HandleId),
    Store(StoreError),
}

impl Display for SessionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disposed(id) => write!(f, "session {id} has been disposed"),
            Self::Store(err) => write!(f, "{err}"),
        }
    }
}

impl Error for SessionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Disposed(_) => None,
            Self::Store(err) => Some(err),
        }
    }
}

impl From<StoreError> for SessionError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

/// One live storage session: a backend and the entities it tracks.
pub struct Session {
    backend: Box<dyn StoreBackend>,
    tracker: ChangeTracker,
}

impl Session {
    pub fn new(backend: impl StoreBackend + 'static) -> Self {
        Self::from_boxed(Box::new(backend))
    }

    pub fn from_boxed(backend: Box<dyn StoreBackend>) -> Self {
        Self {
            backend,
            tracker: ChangeTracker::new(),
        }
    }

    /// Opens a SQLite-backed session.
    pub fn open(info: &ConnectionInfo) -> StoreResult<Self> {
        Ok(Self::new(SqliteStore::open(info)?))
    }

    pub fn describe(&self) -> String {
        self.backend.describe()
    }

    pub fn tracker(&self) -> &ChangeTracker {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut ChangeTracker {
        &mut self.tracker
    }

    pub fn entry(&self, id: EntryId) -> Option<&TrackedEntry> {
        self.tracker.get(id)
    }

    pub fn entry_mut(&mut self, id: EntryId) -> Option<&mut TrackedEntry> {
        self.tracker.get_mut(id)
    }

    pub fn has_set(&self, model: &EntityModel) -> StoreResult<bool> {
        self.backend.has_set(model)
    }

    /// Finds a row by key, preferring the tracked instance.
    pub fn find(
        &mut self,
        model: &'static EntityModel,
        key: EntityId,
    ) -> StoreResult<Option<EntryId>> {
        if key == UNSAVED_ID {
            return Ok(None);
        }
        if let Some(entry) = self.tracker.find(model, key) {
            return Ok(Some(entry.id()));
        }
        Ok(self
            .backend
            .fetch(model, key)?
            .map(|record| self.tracker.attach(model, key, record)))
    }

    /// Tracks a new entity for insertion on the next save.
    pub fn add(
        &mut self,
        model: &'static EntityModel,
        key: EntityId,
        record: Record,
        pending_key: PendingKey,
    ) -> StoreResult<EntryId> {
        self.backend.check_record(model, &record)?;
        Ok(self.tracker.track_added(model, key, record, pending_key))
    }

    pub fn remove(&mut self, id: EntryId) {
        self.tracker.mark_deleted(id);
    }

    /// Loads the targets of `navigation` for the owning entry.
    pub fn load_navigation(
        &mut self,
        owner: EntryId,
        navigation: &'static Navigation,
    ) -> StoreResult<Vec<EntryId>> {
        let Some(entry) = self.tracker.get(owner) else {
            return Ok(Vec::new());
        };
        let target = navigation.target_model();

        match navigation.cardinality {
            Cardinality::One => match entry.current_value(navigation.foreign_key) {
                Some(Value::Integer(key)) => {
                    let key = *key;
                    Ok(self.find(target, key)?.into_iter().collect())
                }
                _ => Ok(Vec::new()),
            },
            Cardinality::Many => {
                let key = entry.key();
                if key == UNSAVED_ID {
                    return Ok(Vec::new());
                }
                let rows = self
                    .backend
                    .fetch_where(target, navigation.foreign_key, &Value::Integer(key))?;
                Ok(rows
                    .into_iter()
                    .map(|(id, record)| self.tracker.attach(target, id, record))
                    .collect())
            }
        }
    }

    /// Every row of `model`, optionally narrowed to one subtype.
    pub fn list(
        &mut self,
        model: &'static EntityModel,
        filter: Option<&Discriminator>,
    ) -> StoreResult<Vec<EntryId>> {
        let rows = self.backend.fetch_all(model, filter)?;
        Ok(rows
            .into_iter()
            .map(|(id, record)| self.tracker.attach(model, id, record))
            .collect())
    }

    /// Flushes every pending entry in one atomic batch.
    ///
    /// Returns the number of writes applied. On failure nothing is accepted
    /// and the tracker keeps its pending state.
    pub fn save_changes(&mut self) -> StoreResult<usize> {
        let started_at = Instant::now();
        let plan = self.tracker.plan_writes();
        let writes: Vec<PendingWrite<'_>> = plan.iter().map(PlannedWrite::as_write).collect();

        match self.backend.apply(&writes) {
            Ok(keys) => {
                let saved: Vec<(EntryId, EntityId)> =
                    plan.iter().map(|write| write.entry).zip(keys).collect();
                self.tracker.accept_changes(&saved);
                debug!(
                    "event=session_save module=session status=ok backend={} writes={} duration_ms={}",
                    self.backend.describe(),
                    plan.len(),
                    started_at.elapsed().as_millis()
                );
                Ok(plan.len())
            }
            Err(err) => {
                debug!(
                    "event=session_save module=session status=error backend={} writes={} duration_ms={} error={}",
                    self.backend.describe(),
                    plan.len(),
                    started_at.elapsed().as_millis(),
                    err
                );
                Err(err)
            }
        }
    }

    /// Stops tracking everything, discarding pending changes.
    pub fn detach_all(&mut self) -> usize {
        self.tracker.detach_all()
    }
}

/// Lifecycle contract between a persistence context and its session.
pub trait SessionHandle: Send {
    fn id(&self) -> HandleId;

    /// Live session, or `Disposed` once the handle has been released.
    fn session(&mut self) -> SessionResult<&mut Session>;

    fn save_changes(&mut self) -> SessionResult<usize> {
        Ok(self.session()?.save_changes()?)
    }

    /// Hook run whenever a write scope opens; `first_scope` marks the outermost one.
    fn begin_write(&mut self, first_scope: bool);

    fn dispose(&mut self);

    fn is_disposed(&self) -> bool;
}

/// A session handle shared by contexts and their write scopes.
pub type SharedSession = Arc<Mutex<Box<dyn SessionHandle>>>;

pub fn shared(handle: impl SessionHandle + 'static) -> SharedSession {
    Arc::new(Mutex::new(Box::new(handle)))
}

/// Locks a shared handle, recovering the guard if a holder panicked.
pub(crate) fn lock(handle: &SharedSession) -> MutexGuard<'_, Box<dyn SessionHandle>> {
    handle.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One handle, one session; disposal is permanent.
pub struct SingleUseSession {
    id: HandleId,
    session: Option<Session>,
    options: SingleUseOptions,
}

impl SingleUseSession {
    pub fn new(session: Session) -> Self {
        Self::with_options(session, SingleUseOptions::default())
    }

    pub fn with_options(session: Session, options: SingleUseOptions) -> Self {
        Self {
            id: HandleId::next(),
            session: Some(session),
            options,
        }
    }

    pub fn open(info: &ConnectionInfo) -> StoreResult<Self> {
        Ok(Self::new(Session::open(info)?))
    }
}

impl SessionHandle for SingleUseSession {
    fn id(&self) -> HandleId {
        self.id
    }

    fn session(&mut self) -> SessionResult<&mut Session> {
        self.session.as_mut().ok_or(SessionError::Disposed(self.id))
    }

    fn begin_write(&mut self, first_scope: bool) {
        if !first_scope || !self.options.detach_on_first_write {
            return;
        }
        if let Some(session) = self.session.as_mut() {
            let detached = session.detach_all();
            debug!(
                "event=session_begin_write module=session handle={} detached={detached}",
                self.id
            );
        }
    }

    fn dispose(&mut self) {
        if self.session.take().is_some() {
            debug!("event=session_dispose module=session handle={}", self.id);
        }
    }

    fn is_disposed(&self) -> bool {
        self.session.is_none()
    }
}

/// Factory for fresh sessions used by `ExtendedUseSession`.
pub type SessionProvider = Box<dyn FnMut() -> StoreResult<Session> + Send>;

/// Pooled handle that retires sessions instead of closing for good.
///
/// Retired sessions stay alive in a graveyard so entities read through
/// them remain usable; the next access allocates a fresh session.
///
/// Each write cycle retires up to two sessions (one when the first scope
/// opens, one when the last ends), each holding its own connection. The
/// graveyard is unbounded unless `with_retired_limit` is set; otherwise call
/// `release_retired` once retired entities are no longer needed.
pub struct ExtendedUseSession {
    id: HandleId,
    current: Option<Session>,
    graveyard: Vec<Session>,
    retired_limit: Option<usize>,
    provider: SessionProvider,
}

impl ExtendedUseSession {
    pub fn new(provider: impl FnMut() -> StoreResult<Session> + Send + 'static) -> Self {
        Self {
            id: HandleId::next(),
            current: None,
            graveyard: Vec::new(),
            retired_limit: None,
            provider: Box::new(provider),
        }
    }

    /// Keeps at most `limit` retired sessions, dropping the oldest first.
    pub fn with_retired_limit(mut self, limit: usize) -> Self {
        self.retired_limit = Some(limit);
        self
    }

    /// Extended handle opening a new SQLite connection per session.
    pub fn connect(info: ConnectionInfo) -> Self {
        Self::new(move || Session::open(&info))
    }

    pub fn has_live_session(&self) -> bool {
        self.current.is_some()
    }

    pub fn retired_count(&self) -> usize {
        self.graveyard.len()
    }

    /// Drops every retired session.
    pub fn release_retired(&mut self) -> usize {
        let released = self.graveyard.len();
        self.graveyard.clear();
        released
    }

    fn retire(&mut self) {
        if let Some(session) = self.current.take() {
            self.graveyard.push(session);
            let mut dropped = 0;
            if let Some(limit) = self.retired_limit {
                dropped = self.graveyard.len().saturating_sub(limit);
                self.graveyard.drain(..dropped);
            }
            debug!(
                "event=session_retire module=session handle={} retired={} dropped={dropped}",
                self.id,
                self.graveyard.len()
            );
        }
    }
}

impl SessionHandle for ExtendedUseSession {
    fn id(&self) -> HandleId {
        self.id
    }

    fn session(&mut self) -> SessionResult<&mut Session> {
        if self.current.is_none() {
            let session = (self.provider)().map_err(|err| {
                error!(
                    "event=session_allocate module=session status=error handle={} error={}",
                    self.id, err
                );
                SessionError::Store(err)
            })?;
            info!(
                "event=session_allocate module=session status=ok handle={} backend={}",
                self.id,
                session.describe()
            );
            self.current = Some(session);
        }
        self.current
            .as_mut()
            .ok_or(SessionError::Disposed(self.id))
    }

    fn save_changes(&mut self) -> SessionResult<usize> {
        let result = self.session()?.save_changes();
        match result {
            Ok(count) => Ok(count),
            Err(err) => {
                if !err.is_transient() && self.current.take().is_some() {
                    warn!(
                        "event=session_discard module=session handle={} error={}",
                        self.id, err
                    );
                }
                Err(SessionError::Store(err))
            }
        }
    }

    fn begin_write(&mut self, first_scope: bool) {
        if first_scope {
            self.retire();
        }
    }

    fn dispose(&mut self) {
        self.retire();
    }

    fn is_disposed(&self) -> bool {
        false
    }
}
