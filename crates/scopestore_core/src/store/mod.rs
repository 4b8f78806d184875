//! Backing store driver contract.
//!
//! # Responsibility
//! - Define the minimal storage surface a session needs: set checks,
//!   key lookups, foreign-key lookups and one atomic batch write.
//! - Classify driver failures (transient vs terminal, configuration).
//!
//! # Invariants
//! - `apply` is all-or-nothing: either every write lands or none does.
//! - Drivers never see navigation objects, only scalar records.

use crate::model::{Discriminator, EntityId, EntityModel, Record, Value};
use rusqlite::ErrorCode;
use std::error::Error;
use std::fmt::{Display, Formatter};

mod sqlite;

pub use sqlite::SqliteStore;

pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by storage drivers.
#[derive(Debug)]
pub enum StoreError {
    Sqlite(rusqlite::Error),
    /// A single-valued navigation whose foreign key is not on the owning set.
    Multiplicity {
        model: &'static str,
        navigation: &'static str,
        detail: String,
    },
    MissingSet(&'static str),
    /// An update or delete matched no row: the row changed underneath the session.
    Conflict {
        model: &'static str,
        id: EntityId,
    },
    InvalidData(String),
}

impl StoreError {
    /// Returns whether retrying the same write may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(err) => write!(f, "{err}"),
            Self::Multiplicity {
                model,
                navigation,
                detail,
            } => write!(
                f,
                "navigation `{navigation}` on `{model}` has multiplicity 1 or 0..1: {detail}"
            ),
            Self::MissingSet(set) => write!(f, "storage set `{set}` does not exist"),
            Self::Conflict { model, id } => {
                write!(f, "`{model}` row {id} was changed or removed concurrently")
            }
            Self::InvalidData(message) => write!(f, "invalid stored data: {message}"),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Sqlite(err) => Some(err),
            Self::Multiplicity { .. } => None,
            Self::MissingSet(_) => None,
            Self::Conflict { .. } => None,
            Self::InvalidData(_) => None,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}

/// One row-level change inside a batch handed to `StoreBackend::apply`.
#[derive(Debug, Clone, Copy)]
pub enum PendingWrite<'a> {
    /// `id` is `None` when storage should assign the key.
    Insert {
        model: &'static EntityModel,
        id: Option<EntityId>,
        values: &'a Record,
    },
    Update {
        model: &'static EntityModel,
        id: EntityId,
        values: &'a Record,
    },
    Delete {
        model: &'static EntityModel,
        id: EntityId,
    },
}

/// Storage driver behind a session.
pub trait StoreBackend: Send {
    /// Short label used in log lines.
    fn describe(&self) -> String;

    /// Returns whether the set backing `model` exists.
    fn has_set(&self, model: &EntityModel) -> StoreResult<bool>;

    /// Rejects records the storage mapping cannot represent.
    fn check_record(&self, _model: &'static EntityModel, _record: &Record) -> StoreResult<()> {
        Ok(())
    }

    fn fetch(&self, model: &EntityModel, id: EntityId) -> StoreResult<Option<Record>>;

    /// Rows of `model` whose `column` equals `value`, ordered by key.
    fn fetch_where(
        &self,
        model: &EntityModel,
        column: &str,
        value: &Value,
    ) -> StoreResult<Vec<(EntityId, Record)>>;

    /// All rows of `model`, optionally restricted to one discriminator value.
    fn fetch_all(
        &self,
        model: &EntityModel,
        filter: Option<&Discriminator>,
    ) -> StoreResult<Vec<(EntityId, Record)>>;

    /// Applies `writes` atomically and returns the key of each write, in order.
    fn apply(&mut self, writes: &[PendingWrite<'_>]) -> StoreResult<Vec<EntityId>>;
}
