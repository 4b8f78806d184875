//! Materialized entity graphs handed to `Entity::from_node`.

use super::{EntityId, ModelError, ModelResult, Record, Value};
use std::collections::BTreeMap;

/// Loaded value of one navigation property.
#[derive(Debug, Clone, PartialEq)]
pub enum Navigated {
    One(Option<Box<EntityNode>>),
    Many(Vec<EntityNode>),
}

/// One entity plus whichever navigations were eagerly loaded for it.
///
/// Navigations that were not part of the include set are absent, not empty.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityNode {
    pub model: &'static str,
    pub id: EntityId,
    pub values: Record,
    pub navigations: BTreeMap<&'static str, Navigated>,
}

impl EntityNode {
    pub fn new(model: &'static str, id: EntityId, values: Record) -> Self {
        Self {
            model,
            id,
            values,
            navigations: BTreeMap::new(),
        }
    }

    pub fn value(&self, field: &'static str) -> ModelResult<&Value> {
        self.values.get(field).ok_or(ModelError::MissingField {
            model: self.model,
            field,
        })
    }

    pub fn integer(&self, field: &'static str) -> ModelResult<i64> {
        match self.value(field)? {
            Value::Integer(value) => Ok(*value),
            _ => Err(self.wrong_type(field, "an integer")),
        }
    }

    pub fn optional_integer(&self, field: &'static str) -> ModelResult<Option<i64>> {
        match self.values.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Integer(value)) => Ok(Some(*value)),
            Some(_) => Err(self.wrong_type(field, "an integer")),
        }
    }

    pub fn text(&self, field: &'static str) -> ModelResult<String> {
        match self.value(field)? {
            Value::Text(value) => Ok(value.clone()),
            _ => Err(self.wrong_type(field, "text")),
        }
    }

    pub fn optional_text(&self, field: &'static str) -> ModelResult<Option<String>> {
        match self.values.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Text(value)) => Ok(Some(value.clone())),
            Some(_) => Err(self.wrong_type(field, "text")),
        }
    }

    pub fn is_loaded(&self, navigation: &str) -> bool {
        self.navigations.contains_key(navigation)
    }

    /// Loaded single-valued navigation, `None` when unset or not loaded.
    pub fn one(&self, navigation: &str) -> Option<&EntityNode> {
        match self.navigations.get(navigation) {
            Some(Navigated::One(Some(node))) => Some(node),
            _ => None,
        }
    }

    /// Loaded collection navigation, empty when not loaded.
    pub fn many(&self, navigation: &str) -> &[EntityNode] {
        match self.navigations.get(navigation) {
            Some(Navigated::Many(nodes)) => nodes,
            _ => &[],
        }
    }

    fn wrong_type(&self, field: &'static str, expected: &'static str) -> ModelError {
        ModelError::WrongType {
            model: self.model,
            field,
            expected,
        }
    }
}
