//! Schema
//!
//! The schema is an explicit value handed to the store and the controller at
//! construction. There is no global instance registry: every test builds its
//! own isolated schema.
//!
//! Besides the declared entities and relations the schema answers the
//! questions the engine keeps asking at setup time:
//!
//! - which relation sits behind `entity.attribute`, and from which side
//! - which base entity backs a filtered entity
//! - which record names are valid targets for reads and writes

mod model;

pub use model::{Cardinality, Dictionary, Entity, FilteredEntity, Property, Relation};

use indexmap::IndexMap;
use thiserror::Error;

use crate::controller::Interaction;
use crate::store::{Record, RecordId};

/// Record name under which dictionary slots are stored.
pub const DICTIONARY_RECORD: &str = "_Dictionary_";

/// Record name under which interaction calls are recorded.
pub const INTERACTION_RECORD: &str = "_Interaction_";

/// Errors raised while building or querying a schema.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SchemaError {
    #[error("name `{0}` is declared more than once")]
    DuplicateName(String),
    #[error("unknown entity `{0}`")]
    UnknownEntity(String),
    #[error("entity `{entity}` has no relation attribute `{attribute}`")]
    UnknownRelationAttribute { entity: String, attribute: String },
    #[error("attribute `{attribute}` on `{entity}` is declared both as a property and as a relation")]
    AttributeClash { entity: String, attribute: String },
    #[error("filtered entity `{name}` has unknown base `{base}`")]
    UnknownFilterBase { name: String, base: String },
    #[error("unknown interaction `{0}`")]
    UnknownInteraction(String),
    #[error("`{0}` is a reserved record name")]
    ReservedName(String),
}

/// Which end of a relation a host record stands on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationSide {
    Source,
    Target,
    /// Symmetric relation: the host may be either endpoint of a row.
    Both,
}

/// A relation as reached from `entity.attribute`.
#[derive(Debug, Clone, Copy)]
pub struct RelationLink<'a> {
    pub relation: &'a Relation,
    pub side: RelationSide,
}

impl<'a> RelationLink<'a> {
    /// Entity on the far side of the link.
    pub fn related_entity(&self) -> &'a str {
        match self.side {
            RelationSide::Source | RelationSide::Both => &self.relation.target,
            RelationSide::Target => &self.relation.source,
        }
    }

    /// True when the host may link to many related records.
    pub fn is_many(&self) -> bool {
        match self.side {
            RelationSide::Source | RelationSide::Both => self.relation.cardinality.source_sees_many(),
            RelationSide::Target => self.relation.cardinality.target_sees_many(),
        }
    }

    /// Ids of the records on the far side of `row` as seen from `host`.
    ///
    /// For a symmetric relation the far side depends on which endpoint the host
    /// is. A self-loop row yields the host itself once.
    pub fn far_ends(&self, row: &Record, host: RecordId) -> Vec<RecordId> {
        let Some((source, target)) = row.endpoints() else {
            return Vec::new();
        };
        match self.side {
            RelationSide::Source if source == host => vec![target],
            RelationSide::Target if target == host => vec![source],
            RelationSide::Both if source == host => vec![target],
            RelationSide::Both if target == host => vec![source],
            _ => Vec::new(),
        }
    }

    /// Ids on the host side of `row`.
    pub fn near_ends(&self, row: &Record) -> Vec<RecordId> {
        let Some((source, target)) = row.endpoints() else {
            return Vec::new();
        };
        match self.side {
            RelationSide::Source => vec![source],
            RelationSide::Target => vec![target],
            RelationSide::Both if source == target => vec![source],
            RelationSide::Both => vec![source, target],
        }
    }

    /// Ids on the host side of `row` whose far end is `far`.
    pub fn hosts_reaching(&self, row: &Record, far: RecordId) -> Vec<RecordId> {
        let Some((source, target)) = row.endpoints() else {
            return Vec::new();
        };
        let mut hosts = Vec::new();
        match self.side {
            RelationSide::Source if target == far => hosts.push(source),
            RelationSide::Target if source == far => hosts.push(target),
            RelationSide::Both => {
                if target == far {
                    hosts.push(source);
                }
                if source == far && source != target {
                    hosts.push(target);
                }
            }
            _ => {}
        }
        hosts
    }
}

/// The complete static description of an application's data model.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    entities: IndexMap<String, Entity>,
    relations: IndexMap<String, Relation>,
    dictionaries: IndexMap<String, Dictionary>,
    filtered: IndexMap<String, FilteredEntity>,
    interactions: IndexMap<String, Interaction>,
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    pub fn entity(&self, name: &str) -> Option<&Entity> {
        self.entities.get(name)
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    pub fn relation(&self, name: &str) -> Option<&Relation> {
        self.relations.get(name)
    }

    pub fn relations(&self) -> impl Iterator<Item = &Relation> {
        self.relations.values()
    }

    pub fn dictionary(&self, name: &str) -> Option<&Dictionary> {
        self.dictionaries.get(name)
    }

    pub fn dictionaries(&self) -> impl Iterator<Item = &Dictionary> {
        self.dictionaries.values()
    }

    pub fn filtered_entity(&self, name: &str) -> Option<&FilteredEntity> {
        self.filtered.get(name)
    }

    pub fn filtered_entities(&self) -> impl Iterator<Item = &FilteredEntity> {
        self.filtered.values()
    }

    /// Filtered entities whose base is `base`.
    pub fn filters_of<'a>(&'a self, base: &'a str) -> impl Iterator<Item = &'a FilteredEntity> + 'a {
        self.filtered.values().filter(move |f| f.base == base)
    }

    pub fn interaction(&self, name: &str) -> Option<&Interaction> {
        self.interactions.get(name)
    }

    pub fn interactions(&self) -> impl Iterator<Item = &Interaction> {
        self.interactions.values()
    }

    /// True for any readable record name, reserved ones included.
    pub fn is_record_name(&self, name: &str) -> bool {
        self.entities.contains_key(name)
            || self.relations.contains_key(name)
            || self.filtered.contains_key(name)
            || name == DICTIONARY_RECORD
            || name == INTERACTION_RECORD
    }

    /// Resolve a filtered entity name to its base; other names map to themselves.
    pub fn base_record<'a>(&'a self, name: &'a str) -> &'a str {
        self.filtered.get(name).map(|f| f.base.as_str()).unwrap_or(name)
    }

    /// Find the relation behind `entity.attribute`.
    pub fn relation_link(&self, entity: &str, attribute: &str) -> Option<RelationLink<'_>> {
        let entity = self.base_record(entity);
        self.relations.values().find_map(|relation| {
            if relation.is_symmetric() {
                (relation.source == entity && relation.source_property == attribute).then_some(RelationLink {
                    relation,
                    side: RelationSide::Both,
                })
            } else if relation.source == entity && relation.source_property == attribute {
                Some(RelationLink {
                    relation,
                    side: RelationSide::Source,
                })
            } else if relation.target == entity && relation.target_property == attribute {
                Some(RelationLink {
                    relation,
                    side: RelationSide::Target,
                })
            } else {
                None
            }
        })
    }

    /// Like [`Schema::relation_link`] but reports a missing relation as an error.
    pub fn require_link(&self, entity: &str, attribute: &str) -> Result<RelationLink<'_>, SchemaError> {
        self.relation_link(entity, attribute)
            .ok_or_else(|| SchemaError::UnknownRelationAttribute {
                entity: entity.to_string(),
                attribute: attribute.to_string(),
            })
    }
}

/// Collects declarations and validates them into a [`Schema`].
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    schema: Schema,
    duplicates: Vec<String>,
}

impl SchemaBuilder {
    pub fn entity(mut self, entity: Entity) -> Self {
        if self.schema.entities.contains_key(&entity.name) {
            self.duplicates.push(entity.name.clone());
        }
        self.schema.entities.insert(entity.name.clone(), entity);
        self
    }

    pub fn relation(mut self, relation: Relation) -> Self {
        if self.schema.relations.contains_key(&relation.name) {
            self.duplicates.push(relation.name.clone());
        }
        self.schema.relations.insert(relation.name.clone(), relation);
        self
    }

    pub fn dictionary(mut self, dictionary: Dictionary) -> Self {
        if self.schema.dictionaries.contains_key(&dictionary.name) {
            self.duplicates.push(dictionary.name.clone());
        }
        self.schema.dictionaries.insert(dictionary.name.clone(), dictionary);
        self
    }

    pub fn filtered_entity(mut self, filtered: FilteredEntity) -> Self {
        if self.schema.filtered.contains_key(&filtered.name) {
            self.duplicates.push(filtered.name.clone());
        }
        self.schema.filtered.insert(filtered.name.clone(), filtered);
        self
    }

    pub fn interaction(mut self, interaction: Interaction) -> Self {
        if self.schema.interactions.contains_key(interaction.name()) {
            self.duplicates.push(interaction.name().to_string());
        }
        self.schema.interactions.insert(interaction.name().to_string(), interaction);
        self
    }

    /// Validate cross references and return the finished schema.
    pub fn build(self) -> Result<Schema, SchemaError> {
        if let Some(name) = self.duplicates.into_iter().next() {
            return Err(SchemaError::DuplicateName(name));
        }
        let schema = self.schema;

        let mut record_names = std::collections::HashSet::new();
        let names = schema
            .entities
            .keys()
            .chain(schema.relations.keys())
            .chain(schema.filtered.keys());
        for name in names {
            if name == DICTIONARY_RECORD || name == INTERACTION_RECORD {
                return Err(SchemaError::ReservedName(name.clone()));
            }
            if !record_names.insert(name.as_str()) {
                return Err(SchemaError::DuplicateName(name.clone()));
            }
        }

        for relation in schema.relations.values() {
            for (entity, attribute) in [
                (&relation.source, &relation.source_property),
                (&relation.target, &relation.target_property),
            ] {
                let Some(declared) = schema.entities.get(entity) else {
                    return Err(SchemaError::UnknownEntity(entity.clone()));
                };
                if declared.properties.contains_key(attribute) {
                    return Err(SchemaError::AttributeClash {
                        entity: entity.clone(),
                        attribute: attribute.clone(),
                    });
                }
            }
        }

        for filtered in schema.filtered.values() {
            if !schema.entities.contains_key(&filtered.base) && !schema.relations.contains_key(&filtered.base) {
                return Err(SchemaError::UnknownFilterBase {
                    name: filtered.name.clone(),
                    base: filtered.base.clone(),
                });
            }
        }

        Ok(schema)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn social() -> Schema {
        Schema::builder()
            .entity(Entity::new("User").property(Property::new("name")))
            .entity(Entity::new("Post").property(Property::new("title")))
            .relation(Relation::new("User", "friends", "User", "friends", Cardinality::ManyToMany))
            .relation(Relation::new("User", "posts", "Post", "author", Cardinality::OneToMany))
            .build()
            .unwrap()
    }

    #[test]
    fn relation_link_resolves_sides() {
        let schema = social();

        let friends = schema.relation_link("User", "friends").unwrap();
        assert_eq!(friends.side, RelationSide::Both);
        assert_eq!(friends.related_entity(), "User");
        assert!(friends.is_many());

        let posts = schema.relation_link("User", "posts").unwrap();
        assert_eq!(posts.side, RelationSide::Source);
        assert!(posts.is_many());

        let author = schema.relation_link("Post", "author").unwrap();
        assert_eq!(author.side, RelationSide::Target);
        assert_eq!(author.related_entity(), "User");
        assert!(!author.is_many());

        assert!(schema.relation_link("Post", "comments").is_none());
        assert!(matches!(
            schema.require_link("Post", "comments"),
            Err(SchemaError::UnknownRelationAttribute { .. })
        ));
    }

    #[test]
    fn symmetric_far_ends_depend_on_host() {
        use serde_json::json;

        let schema = social();
        let friends = schema.relation_link("User", "friends").unwrap();
        let row = Record::from_value(json!({"id": 10, "source": 1, "target": 2})).unwrap();

        assert_eq!(friends.far_ends(&row, RecordId::new(1)), vec![RecordId::new(2)]);
        assert_eq!(friends.far_ends(&row, RecordId::new(2)), vec![RecordId::new(1)]);
        assert!(friends.far_ends(&row, RecordId::new(3)).is_empty());
        assert_eq!(friends.near_ends(&row).len(), 2);
        assert_eq!(friends.hosts_reaching(&row, RecordId::new(2)), vec![RecordId::new(1)]);

        let self_loop = Record::from_value(json!({"id": 11, "source": 3, "target": 3})).unwrap();
        assert_eq!(friends.hosts_reaching(&self_loop, RecordId::new(3)), vec![RecordId::new(3)]);
    }

    #[test]
    fn build_rejects_bad_references() {
        let missing = Schema::builder()
            .entity(Entity::new("User"))
            .relation(Relation::new("User", "teams", "Team", "members", Cardinality::ManyToMany))
            .build();
        assert_eq!(missing.unwrap_err(), SchemaError::UnknownEntity("Team".into()));

        let duplicate = Schema::builder()
            .entity(Entity::new("User"))
            .entity(Entity::new("User"))
            .build();
        assert_eq!(duplicate.unwrap_err(), SchemaError::DuplicateName("User".into()));

        let reserved = Schema::builder().entity(Entity::new(INTERACTION_RECORD)).build();
        assert!(matches!(reserved, Err(SchemaError::ReservedName(_))));
    }
}
