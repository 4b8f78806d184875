//! Entity contract and static per-type persistence metadata.
//!
//! # Responsibility
//! - Define how a domain type maps onto one storage set (`EntityModel`).
//! - Declare navigation properties and which of them are eagerly loaded.
//! - Convert between typed entities and untyped value records.
//!
//! # Invariants
//! - `EntityModel::name` is unique per process; it is the type identity
//!   used by include caches, cycle guards and change events.
//! - Key `0` (`UNSAVED_ID`) always means "not yet persisted".
//! - Models are declared as `static` items; nothing is discovered at runtime.

use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod includes;
mod node;

pub use node::{EntityNode, Navigated};
pub use rusqlite::types::Value;

/// Integer surrogate key of a persisted entity.
pub type EntityId = i64;

/// Key sentinel for entities that have not been saved yet.
pub const UNSAVED_ID: EntityId = 0;

/// Persistable scalar fields of one entity, keyed by column name.
///
/// The key column is never part of a record.
pub type Record = BTreeMap<String, Value>;

pub type ModelResult<T> = Result<T, ModelError>;

/// Errors raised while turning a loaded graph back into a typed entity.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelError {
    MissingField {
        model: &'static str,
        field: &'static str,
    },
    WrongType {
        model: &'static str,
        field: &'static str,
        expected: &'static str,
    },
}

impl Display for ModelError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingField { model, field } => {
                write!(f, "field `{field}` is missing on `{model}`")
            }
            Self::WrongType {
                model,
                field,
                expected,
            } => write!(f, "field `{field}` on `{model}` is not {expected}"),
        }
    }
}

impl Error for ModelError {}

/// How many target entities a navigation property resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    /// Single-valued reference. The foreign key lives on the owning model.
    One,
    /// Collection. The foreign key lives on the target model.
    Many,
}

/// Declared relationship from one model to another.
#[derive(Debug, Clone, Copy)]
pub struct Navigation {
    pub name: &'static str,
    pub target: fn() -> &'static EntityModel,
    pub cardinality: Cardinality,
    /// Owning column for `One`, target column for `Many`.
    pub foreign_key: &'static str,
    pub eager_load: bool,
    /// Recursion budget for eager loading below this property. `None` is unbounded.
    pub depth: Option<u32>,
}

impl Navigation {
    pub const fn one(
        name: &'static str,
        target: fn() -> &'static EntityModel,
        foreign_key: &'static str,
    ) -> Self {
        Self {
            name,
            target,
            cardinality: Cardinality::One,
            foreign_key,
            eager_load: false,
            depth: None,
        }
    }

    pub const fn many(
        name: &'static str,
        target: fn() -> &'static EntityModel,
        foreign_key: &'static str,
    ) -> Self {
        Self {
            name,
            target,
            cardinality: Cardinality::Many,
            foreign_key,
            eager_load: false,
            depth: None,
        }
    }

    /// Marks this property for eager loading on reads.
    pub const fn eager(self) -> Self {
        Self {
            eager_load: true,
            ..self
        }
    }

    /// Caps how many levels below this property are eagerly loaded.
    pub const fn depth(self, depth: u32) -> Self {
        Self {
            depth: Some(depth),
            ..self
        }
    }

    pub fn target_model(&self) -> &'static EntityModel {
        (self.target)()
    }
}

/// Column/value pair that tells derived models apart inside a shared set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Discriminator {
    pub column: &'static str,
    pub value: &'static str,
}

/// Static storage metadata for one entity type.
#[derive(Debug)]
pub struct EntityModel {
    pub name: &'static str,
    pub set: &'static str,
    pub key_column: &'static str,
    pub columns: &'static [&'static str],
    pub navigations: &'static [Navigation],
    /// Deletion timestamp column for auditable (soft-deleted) models.
    pub soft_delete: Option<&'static str>,
    pub base: Option<fn() -> &'static EntityModel>,
    pub discriminator: Option<Discriminator>,
}

impl EntityModel {
    pub const fn new(
        name: &'static str,
        set: &'static str,
        columns: &'static [&'static str],
    ) -> Self {
        Self {
            name,
            set,
            key_column: "id",
            columns,
            navigations: &[],
            soft_delete: None,
            base: None,
            discriminator: None,
        }
    }

    pub const fn key_column(self, key_column: &'static str) -> Self {
        Self { key_column, ..self }
    }

    pub const fn with_navigations(self, navigations: &'static [Navigation]) -> Self {
        Self {
            navigations,
            ..self
        }
    }

    /// Deletes on this model only stamp `column` instead of removing the row.
    pub const fn soft_delete(self, column: &'static str) -> Self {
        Self {
            soft_delete: Some(column),
            ..self
        }
    }

    /// Declares this model as a subtype stored in `base`'s set.
    pub const fn derived_from(
        self,
        base: fn() -> &'static EntityModel,
        column: &'static str,
        value: &'static str,
    ) -> Self {
        Self {
            base: Some(base),
            discriminator: Some(Discriminator { column, value }),
            ..self
        }
    }

    pub fn is_auditable(&self) -> bool {
        self.soft_delete.is_some()
    }

    pub fn navigation(&self, name: &str) -> Option<&'static Navigation> {
        self.navigations.iter().find(|nav| nav.name == name)
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|declared| *declared == column)
    }

    pub fn same_as(&self, other: &EntityModel) -> bool {
        self.name == other.name
    }

    /// Returns whether `self` is `ancestor` or one of its subtypes.
    pub fn is_derived_from(&self, ancestor: &EntityModel) -> bool {
        let mut current = Some(self);
        while let Some(model) = current {
            if model.same_as(ancestor) {
                return true;
            }
            current = model.base.map(|base| base());
        }
        false
    }
}

/// Typed domain object that can be persisted through a context.
pub trait Entity: Sized + Send + 'static {
    fn model() -> &'static EntityModel;

    /// Current key, `UNSAVED_ID` when never persisted.
    fn id(&self) -> EntityId;

    /// Persistable scalar fields, excluding the key and navigations.
    fn to_record(&self) -> Record;

    /// Rebuilds the entity, including any loaded navigations, from a graph node.
    fn from_node(node: &EntityNode) -> ModelResult<Self>;

    /// Domain checks applied before the entity reaches a session.
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Builds a record from column/value pairs.
pub fn record<const N: usize>(fields: [(&str, Value); N]) -> Record {
    fields
        .into_iter()
        .map(|(column, value)| (column.to_string(), value))
        .collect()
}
