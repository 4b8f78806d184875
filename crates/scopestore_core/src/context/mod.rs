//! Persistence context: write-scope coordination and CRUD over one session handle.
//!
//! # Responsibility
//! - Track open write scopes for the handle through the shared registry.
//! - Commit exactly once, when the outermost scope closes.
//! - Translate typed entities into tracked records and back.
//! - Publish change notifications around each commit.
//!
//! # Invariants
//! - A context is only constructed for entity types whose set exists.
//! - A failed commit clears the handle's registry entry and disposes the
//!   handle before the original storage error is returned.
//! - Ending the last open scope disposes the handle.
//! - Opening, committing and ending scopes on one handle are serialized by
//!   the handle's session lock.
//!
//! # See also
//! - `crate::registry` for scope bookkeeping.
//! - `crate::context::scope` for the RAII guard callers normally use.

use crate::config::ContextOptions;
use crate::events::{post_commit_events, pre_commit_events, NotificationSink, PendingChange};
use crate::model::includes::include_paths;
use crate::model::{Discriminator, Entity, EntityId, EntityModel, ModelError, Record, Value};
use crate::registry::{Removal, ScopeId, WriteScopeRegistry};
use crate::session::{
    lock, EntryId, HandleId, PendingKey, Session, SessionError, SessionHandle, SharedSession,
};
use crate::store::StoreError;
use log::{debug, error, info, warn};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

mod graph;
pub mod scope;

pub use scope::WriteScope;

pub type ContextResult<T> = Result<T, ContextError>;

/// Errors surfaced by persistence context operations.
#[derive(Debug)]
pub enum ContextError {
    InvalidArgument(String),
    /// The entity type has no storage set.
    TypeMismatch {
        model: &'static str,
        set: &'static str,
    },
    /// Mapping misconfiguration detected by the store, with an actionable message.
    Configuration {
        message: String,
        source: StoreError,
    },
    /// The save failed; the storage error is carried unchanged.
    Commit(StoreError),
    Store(StoreError),
    WriteNotEnabled {
        context: String,
    },
    NotFound {
        model: &'static str,
        key: EntityId,
    },
    Disposed(HandleId),
    Materialize(ModelError),
    /// The async commit task was aborted before it finished.
    Cancelled,
}

impl ContextError {
    /// The storage error behind this failure, if any.
    pub fn store_error(&self) -> Option<&StoreError> {
        match self {
            Self::Configuration { source, .. } => Some(source),
            Self::Commit(err) | Self::Store(err) => Some(err),
            _ => None,
        }
    }
}

impl Display for ContextError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidArgument(message) => write!(f, "invalid argument: {message}"),
            Self::TypeMismatch { model, set } => write!(
                f,
                "entity type `{model}` has no storage set `{set}` in this session"
            ),
            Self::Configuration { message, source } => write!(f, "{message} ({source})"),
            Self::Commit(err) => write!(f, "{err}"),
            Self::Store(err) => write!(f, "{err}"),
            Self::WriteNotEnabled { context } => {
                write!(f, "write is not enabled for context `{context}`")
            }
            Self::NotFound { model, key } => write!(f, "`{model}` with key {key} was not found"),
            Self::Disposed(handle) => write!(f, "session {handle} has been disposed"),
            Self::Materialize(err) => write!(f, "{err}"),
            Self::Cancelled => write!(f, "commit task was cancelled"),
        }
    }
}

impl Error for ContextError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Configuration { source, .. } => Some(source),
            Self::Commit(err) | Self::Store(err) => Some(err),
            Self::Materialize(err) => Some(err),
            Self::InvalidArgument(_)
            | Self::TypeMismatch { .. }
            | Self::WriteNotEnabled { .. }
            | Self::NotFound { .. }
            | Self::Disposed(_)
            | Self::Cancelled => None,
        }
    }
}

impl From<StoreError> for ContextError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

impl From<SessionError> for ContextError {
    fn from(value: SessionError) -> Self {
        match value {
            SessionError::Disposed(handle) => Self::Disposed(handle),
            SessionError::Store(err) => Self::Store(err),
        }
    }
}

impl From<ModelError> for ContextError {
    fn from(value: ModelError) -> Self {
        Self::Materialize(value)
    }
}

/// State shared by a context, its scopes and its async commit tasks.
#[derive(Clone)]
struct ContextCore {
    id: String,
    handle: SharedSession,
    handle_id: HandleId,
    registry: Arc<WriteScopeRegistry>,
    sink: Option<Arc<dyn NotificationSink>>,
    options: ContextOptions,
}

impl ContextCore {
    fn with_session<R>(
        &self,
        work: impl FnOnce(&mut Session) -> ContextResult<R>,
    ) -> ContextResult<R> {
        let mut handle = lock(&self.handle);
        let session = handle.session()?;
        work(session)
    }

    /// Opens `scope`; the first-scope decision and the registry add happen
    /// under the handle lock so a concurrent opener cannot detach tracked work.
    fn begin_write(&self, scope: ScopeId) {
        let mut handle = lock(&self.handle);
        let first_scope = self.registry.depth(self.handle_id) == 0;
        handle.begin_write(first_scope);
        if first_scope {
            self.registry.register(self.handle_id);
        }
        self.registry.add(self.handle_id, scope);
        let depth = self.registry.depth(self.handle_id);
        drop(handle);
        debug!(
            "event=write_begin module=context context={} scope={} first={} depth={}",
            self.id, scope, first_scope, depth
        );
    }

    fn commit(&self, scope: ScopeId) -> ContextResult<()> {
        let mut handle = lock(&self.handle);
        let committed = self.commit_locked(&mut **handle, scope);
        drop(handle);
        self.publish_committed(committed)
    }

    /// Saves when `scope` is the sole open scope; `None` means skipped.
    ///
    /// Runs with the handle locked; pre-commit events are published here.
    fn commit_locked(
        &self,
        handle: &mut dyn SessionHandle,
        scope: ScopeId,
    ) -> ContextResult<Option<Vec<PendingChange>>> {
        if !self.registry.contains(self.handle_id, scope) {
            warn!(
                "event=commit module=context status=error context={} scope={} reason=write_not_enabled",
                self.id, scope
            );
            return Err(ContextError::WriteNotEnabled {
                context: self.id.clone(),
            });
        }
        if !self.registry.is_sole(self.handle_id, scope) {
            debug!(
                "event=commit module=context status=skip context={} scope={} depth={}",
                self.id,
                scope,
                self.registry.depth(self.handle_id)
            );
            return Ok(None);
        }

        let started_at = Instant::now();
        info!(
            "event=commit module=context status=start context={} scope={}",
            self.id, scope
        );

        let changes = match &self.sink {
            Some(sink) => {
                let changes = match handle.session() {
                    Ok(session) => pending_changes(session),
                    Err(err) => return Err(self.fail_commit(handle, err, 0, started_at)),
                };
                let pending: Vec<PendingChange> =
                    changes.iter().map(|(_, change)| change.clone()).collect();
                for event in pre_commit_events(&pending) {
                    sink.publish(event);
                }
                changes
            }
            None => Vec::new(),
        };

        let mut retries = 0;
        let saved = loop {
            match handle.save_changes() {
                Ok(count) => break Ok(count),
                Err(SessionError::Store(err))
                    if err.is_transient() && retries < self.options.retry.max_retries =>
                {
                    retries += 1;
                    warn!(
                        "event=commit_retry module=context context={} attempt={} error={}",
                        self.id, retries, err
                    );
                    std::thread::sleep(self.options.retry.delay());
                }
                Err(err) => break Err(err),
            }
        };
        let writes = match saved {
            Ok(writes) => writes,
            Err(err) => return Err(self.fail_commit(handle, err, retries, started_at)),
        };

        let committed = match handle.session() {
            Ok(session) => refresh_keys(session, changes),
            Err(_) => changes.into_iter().map(|(_, change)| change).collect(),
        };
        info!(
            "event=commit module=context status=ok context={} writes={} retries={} duration_ms={}",
            self.id,
            writes,
            retries,
            started_at.elapsed().as_millis()
        );
        Ok(Some(committed))
    }

    /// Clears the registry entry and disposes the handle after a failed commit.
    fn fail_commit(
        &self,
        handle: &mut dyn SessionHandle,
        err: SessionError,
        retries: u32,
        started_at: Instant,
    ) -> ContextError {
        self.registry.clear(self.handle_id);
        handle.dispose();
        error!(
            "event=commit module=context status=error context={} retries={} duration_ms={} error={}",
            self.id,
            retries,
            started_at.elapsed().as_millis(),
            err
        );
        match err {
            SessionError::Store(err) => ContextError::Commit(err),
            SessionError::Disposed(id) => ContextError::Disposed(id),
        }
    }

    /// Publishes post-commit events; call without the handle lock.
    fn publish_committed(
        &self,
        committed: ContextResult<Option<Vec<PendingChange>>>,
    ) -> ContextResult<()> {
        if let (Some(sink), Some(changes)) = (&self.sink, committed?) {
            for event in post_commit_events(changes) {
                sink.publish(event);
            }
        }
        Ok(())
    }

    fn end_write(&self, scope: ScopeId) {
        let mut handle = lock(&self.handle);
        self.end_write_locked(&mut **handle, scope);
    }

    fn end_write_locked(&self, handle: &mut dyn SessionHandle, scope: ScopeId) {
        match self.registry.remove(self.handle_id, scope) {
            Removal::Missing => debug!(
                "event=write_end module=context status=skip context={} scope={}",
                self.id, scope
            ),
            Removal::Remaining(depth) => debug!(
                "event=write_end module=context status=ok context={} scope={} depth={depth}",
                self.id, scope
            ),
            Removal::Emptied => {
                handle.dispose();
                debug!(
                    "event=write_end module=context status=ok context={} scope={} depth=0 disposed=true",
                    self.id, scope
                );
            }
        }
    }

    fn cancel_write(&self) {
        let mut handle = lock(&self.handle);
        handle.dispose();
        let cleared = self.registry.clear(self.handle_id);
        drop(handle);
        info!(
            "event=write_cancel module=context context={} cleared={cleared}",
            self.id
        );
    }

    /// Commits `scope` if it is open, then always ends it.
    ///
    /// The whole step holds the handle lock, so of several scopes released
    /// concurrently the last one always sees itself sole and commits.
    fn release(&self, scope: ScopeId) -> ContextResult<()> {
        let mut handle = lock(&self.handle);
        if !self.registry.contains(self.handle_id, scope) {
            drop(handle);
            debug!(
                "event=write_release module=context status=skip context={} scope={}",
                self.id, scope
            );
            return Ok(());
        }
        let committed = self.commit_locked(&mut **handle, scope);
        self.end_write_locked(&mut **handle, scope);
        drop(handle);
        self.publish_committed(committed)
    }

    fn materialize<E: Entity>(
        &self,
        session: &mut Session,
        entry: EntryId,
    ) -> ContextResult<Option<E>> {
        let model = E::model();
        let paths = include_paths(model);
        match graph::load_graph(session, model, entry, &paths)? {
            Some(node) => Ok(Some(E::from_node(&node)?)),
            None => Ok(None),
        }
    }
}

/// Data-access facade for one entity type over one session handle.
pub struct PersistenceContext<T: Entity> {
    core: ContextCore,
    _entity: PhantomData<fn() -> T>,
}

impl<T: Entity> PersistenceContext<T> {
    /// Creates a context, refusing entity types the session has no set for.
    pub fn new(handle: SharedSession, registry: Arc<WriteScopeRegistry>) -> ContextResult<Self> {
        let model = T::model();
        let (handle_id, has_set) = {
            let mut guard = lock(&handle);
            let handle_id = guard.id();
            let session = guard.session()?;
            (handle_id, session.has_set(model)?)
        };
        let id = format!("{} {}", Uuid::new_v4(), model.name);

        if !has_set {
            error!(
                "event=context_create module=context status=error context={id} reason=type_mismatch set={}",
                model.set
            );
            return Err(ContextError::TypeMismatch {
                model: model.name,
                set: model.set,
            });
        }
        debug!("event=context_create module=context status=ok context={id} handle={handle_id}");

        Ok(Self {
            core: ContextCore {
                id,
                handle,
                handle_id,
                registry,
                sink: None,
                options: ContextOptions::default(),
            },
            _entity: PhantomData,
        })
    }

    pub fn with_sink(self, sink: impl NotificationSink + 'static) -> Self {
        self.with_shared_sink(Arc::new(sink))
    }

    pub fn with_shared_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.core.sink = Some(sink);
        self
    }

    pub fn with_options(mut self, options: ContextOptions) -> Self {
        self.core.options = options;
        self
    }

    /// Log identity: a random id followed by the entity type name.
    pub fn id(&self) -> &str {
        &self.core.id
    }

    pub fn handle_id(&self) -> HandleId {
        self.core.handle_id
    }

    pub fn handle(&self) -> &SharedSession {
        &self.core.handle
    }

    pub fn registry(&self) -> &Arc<WriteScopeRegistry> {
        &self.core.registry
    }

    pub fn options(&self) -> &ContextOptions {
        &self.core.options
    }

    /// Returns whether the context can still reach its session.
    pub fn is_valid(&self) -> bool {
        !lock(&self.core.handle).is_disposed()
    }

    pub fn write_enabled(&self) -> bool {
        self.core.registry.depth(self.core.handle_id) > 0
    }

    /// Snapshot of open scopes for this context's handle, oldest first.
    pub fn write_scopes(&self) -> Vec<ScopeId> {
        self.core.registry.list(self.core.handle_id)
    }

    pub fn write_scope(&self) -> WriteScope<'_, T> {
        WriteScope::open(self, false)
    }

    /// Opens a scope meant to be finished with `close_async`.
    pub fn write_scope_async(&self) -> WriteScope<'_, T> {
        WriteScope::open(self, true)
    }

    pub fn begin_write(&self, scope: ScopeId) {
        self.core.begin_write(scope);
    }

    /// Saves tracked changes when `scope` is the only open scope.
    ///
    /// # Errors
    /// - `WriteNotEnabled` when `scope` is not open for this handle.
    /// - `Commit` with the storage error when the save fails; the handle is
    ///   disposed and its registry entry cleared first.
    pub fn commit(&self, scope: ScopeId) -> ContextResult<()> {
        self.core.commit(scope)
    }

    /// `commit` on the blocking pool; the outcome is only known once awaited.
    pub async fn commit_async(&self, scope: ScopeId) -> ContextResult<()> {
        let core = self.core.clone();
        match tokio::task::spawn_blocking(move || core.commit(scope)).await {
            Ok(result) => result,
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(_) => Err(ContextError::Cancelled),
        }
    }

    /// Disposes the handle and forgets every open scope, discarding changes.
    pub fn cancel_write(&self) {
        self.core.cancel_write();
    }

    pub fn end_write(&self, scope: ScopeId) {
        self.core.end_write(scope);
    }

    pub(crate) fn release(&self, scope: ScopeId) -> ContextResult<()> {
        self.core.release(scope)
    }

    /// `release` on the blocking pool. The task finishes the release even if
    /// the returned future is dropped.
    pub(crate) async fn release_async(&self, scope: ScopeId) -> ContextResult<()> {
        let core = self.core.clone();
        match tokio::task::spawn_blocking(move || core.release(scope)).await {
            Ok(result) => result,
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(_) => {
                self.core.end_write(scope);
                Err(ContextError::Cancelled)
            }
        }
    }

    /// Tracks `entity` for insertion.
    ///
    /// The returned key resolves once a commit has saved the entity.
    pub fn add(&self, entity: &T) -> ContextResult<PendingKey> {
        let record = checked_record(entity)?;
        self.core
            .with_session(|session| add_record(session, T::model(), entity.id(), record))
    }

    /// Adds several entities; all are checked before any is tracked.
    pub fn add_range<'a>(
        &self,
        entities: impl IntoIterator<Item = &'a T>,
    ) -> ContextResult<Vec<PendingKey>> {
        let checked = entities
            .into_iter()
            .map(|entity| Ok((entity.id(), checked_record(entity)?)))
            .collect::<ContextResult<Vec<(EntityId, Record)>>>()?;
        self.core.with_session(|session| {
            checked
                .into_iter()
                .map(|(key, record)| add_record(session, T::model(), key, record))
                .collect()
        })
    }

    /// Adds `entity`, or copies its fields onto the tracked row with its key.
    pub fn add_or_update(&self, entity: &T) -> ContextResult<PendingKey> {
        let record = checked_record(entity)?;
        let model = T::model();
        let key = entity.id();
        self.core.with_session(|session| {
            if populate(session, model, key, &record)? {
                return Ok(PendingKey::resolved(key));
            }
            add_record(session, model, key, record)
        })
    }

    /// Copies `entity`'s fields onto the tracked row with its key.
    ///
    /// # Errors
    /// - `NotFound` when no row with that key exists; nothing is inserted.
    pub fn update(&self, entity: &T) -> ContextResult<()> {
        let record = checked_record(entity)?;
        let model = T::model();
        let key = entity.id();
        self.core.with_session(|session| {
            if populate(session, model, key, &record)? {
                Ok(())
            } else {
                Err(ContextError::NotFound {
                    model: model.name,
                    key,
                })
            }
        })
    }

    /// Removes the row, or stamps its deletion column once for auditable models.
    pub fn delete(&self, entity: &T) -> ContextResult<()> {
        let model = T::model();
        let key = entity.id();
        if key <= 0 {
            return Err(ContextError::InvalidArgument(format!(
                "cannot delete `{}` without a persisted key (got {key})",
                model.name
            )));
        }

        self.core.with_session(|session| {
            let entry = session
                .find(model, key)?
                .ok_or(ContextError::NotFound {
                    model: model.name,
                    key,
                })?;

            match model.soft_delete {
                Some(column) => {
                    if let Some(tracked) = session.entry_mut(entry) {
                        let unset =
                            matches!(tracked.current_value(column), None | Some(Value::Null));
                        if unset {
                            tracked.set_value(column, Value::Integer(now_epoch_ms()));
                        }
                    }
                }
                None => session.remove(entry),
            }
            Ok(())
        })
    }

    /// Loads one entity by key along with its eager-load paths.
    pub fn find(&self, key: EntityId) -> ContextResult<Option<T>> {
        self.all().find(key)
    }

    /// Query over every row of the set, with the type's eager-load paths.
    pub fn all(&self) -> Query<'_, T> {
        Query::new(&self.core, None)
    }

    /// Query restricted to subtype `D`, using `D`'s own eager-load paths.
    pub fn of_type<D: Entity>(&self) -> ContextResult<Query<'_, D>> {
        let derived = D::model();
        let base = T::model();
        if !derived.is_derived_from(base) {
            return Err(ContextError::TypeMismatch {
                model: derived.name,
                set: base.set,
            });
        }
        let filter = if derived.same_as(base) {
            None
        } else {
            derived.discriminator
        };
        Ok(Query::new(&self.core, filter))
    }
}

/// Read query bound to a context's session.
pub struct Query<'ctx, E: Entity> {
    core: &'ctx ContextCore,
    filter: Option<Discriminator>,
    includes: Arc<[String]>,
    _entity: PhantomData<fn() -> E>,
}

impl<'ctx, E: Entity> Query<'ctx, E> {
    fn new(core: &'ctx ContextCore, filter: Option<Discriminator>) -> Self {
        Self {
            core,
            filter,
            includes: include_paths(E::model()),
            _entity: PhantomData,
        }
    }

    /// Eager-load paths applied to every result, shortest first.
    pub fn includes(&self) -> &[String] {
        &self.includes
    }

    pub fn to_vec(&self) -> ContextResult<Vec<E>> {
        self.core.with_session(|session| {
            let entries = session.list(E::model(), self.filter.as_ref())?;
            let mut loaded = Vec::with_capacity(entries.len());
            for entry in entries {
                if let Some(entity) = self.core.materialize::<E>(session, entry)? {
                    loaded.push(entity);
                }
            }
            Ok(loaded)
        })
    }

    pub fn find(&self, key: EntityId) -> ContextResult<Option<E>> {
        if key <= 0 {
            return Ok(None);
        }
        self.core.with_session(|session| {
            let Some(entry) = session.find(E::model(), key)? else {
                return Ok(None);
            };
            if let Some(filter) = &self.filter {
                let matches = session
                    .entry(entry)
                    .and_then(|tracked| tracked.current_value(filter.column))
                    .is_some_and(|value| *value == Value::Text(filter.value.to_string()));
                if !matches {
                    return Ok(None);
                }
            }
            self.core.materialize::<E>(session, entry)
        })
    }
}

/// Checks an entity before it touches the session and returns its record.
fn checked_record<E: Entity>(entity: &E) -> ContextResult<Record> {
    let model = E::model();
    let key = entity.id();
    if key < 0 {
        return Err(ContextError::InvalidArgument(format!(
            "`{}` key must not be negative (got {key})",
            model.name
        )));
    }
    entity.validate().map_err(|reason| {
        ContextError::InvalidArgument(format!("`{}` is invalid: {reason}", model.name))
    })?;

    let record = entity.to_record();
    if let Some(column) = record.keys().find(|column| !model.has_column(column)) {
        return Err(ContextError::InvalidArgument(format!(
            "`{}` has no declared column `{column}`",
            model.name
        )));
    }
    Ok(record)
}

fn add_record(
    session: &mut Session,
    model: &'static EntityModel,
    key: EntityId,
    record: Record,
) -> ContextResult<PendingKey> {
    let pending = PendingKey::default();
    session
        .add(model, key, record, pending.clone())
        .map_err(|err| configuration_error(model, err))?;
    Ok(pending)
}

/// Populates the tracked row for `key`; returns `false` when there is none.
fn populate(
    session: &mut Session,
    model: &'static EntityModel,
    key: EntityId,
    record: &Record,
) -> ContextResult<bool> {
    let Some(entry) = session.find(model, key)? else {
        return Ok(false);
    };
    if let Some(tracked) = session.entry_mut(entry) {
        for (column, value) in record {
            tracked.set_value(column, value.clone());
        }
    }
    Ok(true)
}

fn configuration_error(model: &EntityModel, err: StoreError) -> ContextError {
    if let StoreError::Multiplicity { navigation, .. } = &err {
        let message = format!(
            "navigation `{navigation}` on `{}` is declared single-valued but its foreign key \
             is not on `{}`; declare collection relations with Navigation::many",
            model.name, model.set
        );
        return ContextError::Configuration {
            message,
            source: err,
        };
    }
    ContextError::Store(err)
}

fn pending_changes(session: &Session) -> Vec<(EntryId, PendingChange)> {
    session
        .tracker()
        .pending()
        .map(|entry| (entry.id(), PendingChange::from_entry(entry)))
        .collect()
}

/// Fills in storage-assigned keys on changes for rows that still exist.
fn refresh_keys(
    session: &Session,
    changes: Vec<(EntryId, PendingChange)>,
) -> Vec<PendingChange> {
    changes
        .into_iter()
        .map(|(entry, mut change)| {
            if let Some(tracked) = session.entry(entry) {
                change.entity.id = tracked.key();
            }
            change
        })
        .collect()
}

fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis() as i64)
}
