//! Schema Declarations
//!
//! Entities, relations, dictionaries and filtered entities, each optionally
//! carrying the computation that derives it.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::computation::Computation;
use crate::store::MatchExpr;

/// A field of an entity or relation.
#[derive(Debug, Clone)]
pub struct Property {
    pub name: String,
    /// Value written on create when the payload leaves the field out.
    pub default: Option<Value>,
    /// Computation deriving this field for every instance of the host.
    pub computation: Option<Computation>,
}

impl Property {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: None,
            computation: None,
        }
    }

    /// A property whose value is maintained by `computation`.
    pub fn computed(name: impl Into<String>, computation: impl Into<Computation>) -> Self {
        Self {
            name: name.into(),
            default: None,
            computation: Some(computation.into()),
        }
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }
}

/// An entity type.
#[derive(Debug, Clone)]
pub struct Entity {
    pub name: String,
    pub properties: IndexMap<String, Property>,
    /// Computation deciding which records of this entity exist.
    pub computation: Option<Computation>,
}

impl Entity {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: IndexMap::new(),
            computation: None,
        }
    }

    pub fn property(mut self, property: Property) -> Self {
        self.properties.insert(property.name.clone(), property);
        self
    }

    pub fn computed_by(mut self, computation: impl Into<Computation>) -> Self {
        self.computation = Some(computation.into());
        self
    }
}

/// How many records sit on each side of a relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cardinality {
    OneToOne,
    OneToMany,
    ManyToOne,
    ManyToMany,
}

impl Cardinality {
    /// True when a source record may link to many targets.
    pub fn source_sees_many(&self) -> bool {
        matches!(self, Cardinality::OneToMany | Cardinality::ManyToMany)
    }

    /// True when a target record may link to many sources.
    pub fn target_sees_many(&self) -> bool {
        matches!(self, Cardinality::ManyToOne | Cardinality::ManyToMany)
    }
}

/// A relation between two entities. Rows carry `source` and `target` ids plus
/// their own properties.
#[derive(Debug, Clone)]
pub struct Relation {
    pub name: String,
    pub source: String,
    /// Attribute on the source entity that reaches the targets.
    pub source_property: String,
    pub target: String,
    /// Attribute on the target entity that reaches the sources.
    pub target_property: String,
    pub cardinality: Cardinality,
    pub properties: IndexMap<String, Property>,
    pub computation: Option<Computation>,
}

impl Relation {
    pub fn new(
        source: impl Into<String>,
        source_property: impl Into<String>,
        target: impl Into<String>,
        target_property: impl Into<String>,
        cardinality: Cardinality,
    ) -> Self {
        let source = source.into();
        let source_property = source_property.into();
        let target = target.into();
        let target_property = target_property.into();
        Self {
            name: format!("{source}_{source_property}_{target_property}_{target}"),
            source,
            source_property,
            target,
            target_property,
            cardinality,
            properties: IndexMap::new(),
            computation: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn property(mut self, property: Property) -> Self {
        self.properties.insert(property.name.clone(), property);
        self
    }

    pub fn computed_by(mut self, computation: impl Into<Computation>) -> Self {
        self.computation = Some(computation.into());
        self
    }

    /// Both ends are the same entity under the same attribute, so every row is
    /// visible from both of its endpoints.
    pub fn is_symmetric(&self) -> bool {
        self.source == self.target && self.source_property == self.target_property
    }
}

/// A named global slot.
#[derive(Debug, Clone)]
pub struct Dictionary {
    pub name: String,
    pub default: Value,
    pub computation: Option<Computation>,
}

impl Dictionary {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: Value::Null,
            computation: None,
        }
    }

    pub fn computed(name: impl Into<String>, computation: impl Into<Computation>) -> Self {
        Self {
            name: name.into(),
            default: Value::Null,
            computation: Some(computation.into()),
        }
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = value.into();
        self
    }
}

/// A virtual entity holding the base records that satisfy a predicate.
#[derive(Debug, Clone)]
pub struct FilteredEntity {
    pub name: String,
    pub base: String,
    pub predicate: MatchExpr,
}

impl FilteredEntity {
    pub fn new(name: impl Into<String>, base: impl Into<String>, predicate: MatchExpr) -> Self {
        Self {
            name: name.into(),
            base: base.into(),
            predicate,
        }
    }
}
