//! Scoped persistence contexts over tracked storage sessions.
//!
//! Callers open nested write scopes against a context; only the outermost
//! scope commits, and a failed commit disposes the session.

pub mod config;
pub mod context;
pub mod db;
pub mod events;
pub mod logging;
pub mod model;
pub mod registry;
pub mod session;
pub mod store;

pub use config::{ConnectionInfo, ContextOptions, RetryPolicy, SingleUseOptions};
pub use context::{ContextError, ContextResult, PersistenceContext, Query, WriteScope};
pub use events::{ChangeEvent, EntitySnapshot, LogSink, NotificationSink, PendingChange};
pub use logging::{default_log_level, init_logging, logging_status, LogSettings, LoggingError};
pub use model::includes::{include_paths, resolve_paths};
pub use model::{
    record, Cardinality, Entity, EntityId, EntityModel, EntityNode, ModelError, ModelResult,
    Navigated, Navigation, Record, Value, UNSAVED_ID,
};
pub use registry::{ScopeId, WriteScopeRegistry};
pub use session::{
    shared, ExtendedUseSession, HandleId, PendingKey, Session, SessionError, SessionHandle,
    SharedSession, SingleUseSession,
};
pub use store::{SqliteStore, StoreBackend, StoreError, StoreResult};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
