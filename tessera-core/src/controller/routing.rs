//! Event Routing
//!
//! Each declared data dependency turns into one or more [`EventSource`]s: the
//! record name whose events matter, and how such an event reaches the
//! computation. Sources also decide the graph edges: computation B depends on
//! computation A when one of B's sources reads what A writes.

use serde_json::Value;

use crate::computation::{ComputationHandle, DataContext, DataDep};
use crate::error::{EngineError, Result};
use crate::schema::{RelationLink, RelationSide, Schema, DICTIONARY_RECORD};
use crate::store::{AttributeQuery, MutationEvent, MutationKind};

/// One relation hop from a root record.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Hop {
    pub attribute: String,
    pub relation: String,
    pub side: RelationSide,
}

impl Hop {
    pub fn link<'s>(&self, schema: &'s Schema) -> Option<RelationLink<'s>> {
        schema.relation(&self.relation).map(|relation| RelationLink {
            relation,
            side: self.side,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Route {
    /// Events on the watched record itself, delivered without a host.
    Direct { watched: Option<Vec<String>> },
    /// Own fields of a property computation's host record.
    Host { watched: Option<Vec<String>> },
    /// One dictionary slot.
    Dictionary { key: String },
    /// Relation rows (`row`) or far-end records reached from `root` through
    /// `hops`. Relayed to each root with the attribute path. `bound` roots are
    /// the hosts of a property computation.
    Hops {
        root: String,
        hops: Vec<Hop>,
        row: bool,
        watched: Option<Vec<String>>,
        bound: bool,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct EventSource {
    pub record_name: String,
    pub route: Route,
}

/// What a computation writes.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Write {
    Dictionary(String),
    Field { record: String, field: String },
    Records(String),
}

impl Write {
    pub fn of(context: &DataContext) -> Self {
        match context {
            DataContext::Global { dictionary } => Write::Dictionary(dictionary.clone()),
            DataContext::Property { host, property } => Write::Field {
                record: host.clone(),
                field: property.clone(),
            },
            DataContext::Entity { entity } => Write::Records(entity.clone()),
            DataContext::Relation { relation } => Write::Records(relation.clone()),
        }
    }
}

/// Event sources of a handle, derived from its data deps.
pub(crate) fn sources_of(schema: &Schema, handle: &dyn ComputationHandle) -> Result<Vec<EventSource>> {
    let mut sources = Vec::new();
    for (name, dep) in handle.data_deps() {
        match dep {
            DataDep::Records { source, query } => {
                if !schema.is_record_name(source) {
                    return Err(EngineError::missing(
                        handle.data_context().label(),
                        format!("dependency `{name}` reads unknown record `{source}`"),
                    ));
                }
                sources.push(EventSource {
                    record_name: source.clone(),
                    route: Route::Direct {
                        watched: query.watched_fields(),
                    },
                });
                walk(schema, schema.base_record(source), source, query, &[], false, &mut sources)?;
            }
            DataDep::Property { query } => {
                let DataContext::Property { host, .. } = handle.data_context() else {
                    return Err(EngineError::missing(
                        handle.data_context().label(),
                        format!("property dependency `{name}` outside a property context"),
                    ));
                };
                let watched = query.watched_fields();
                if watched.as_ref().map_or(true, |fields| !fields.is_empty()) {
                    sources.push(EventSource {
                        record_name: host.clone(),
                        route: Route::Host { watched },
                    });
                }
                walk(schema, host, host, query, &[], true, &mut sources)?;
            }
            DataDep::Global { dictionary } => sources.push(EventSource {
                record_name: DICTIONARY_RECORD.to_string(),
                route: Route::Dictionary {
                    key: dictionary.clone(),
                },
            }),
        }
    }
    Ok(sources)
}

fn walk(
    schema: &Schema,
    record: &str,
    root: &str,
    query: &AttributeQuery,
    hops: &[Hop],
    bound: bool,
    sources: &mut Vec<EventSource>,
) -> Result<()> {
    for (attribute, sub) in query.nested_nodes() {
        // Endpoints of a relation row are plain ids, not relation attributes.
        if schema.relation(record).is_some() && matches!(attribute, "source" | "target") {
            continue;
        }
        let link = schema.require_link(record, attribute)?;
        let mut path = hops.to_vec();
        path.push(Hop {
            attribute: attribute.to_string(),
            relation: link.relation.name.clone(),
            side: link.side,
        });

        let row_watched = match sub.relation_own() {
            Some(own) => own.watched_fields(),
            None => Some(Vec::new()),
        };
        sources.push(EventSource {
            record_name: link.relation.name.clone(),
            route: Route::Hops {
                root: root.to_string(),
                hops: path.clone(),
                row: true,
                watched: row_watched,
                bound,
            },
        });
        sources.push(EventSource {
            record_name: link.related_entity().to_string(),
            route: Route::Hops {
                root: root.to_string(),
                hops: path.clone(),
                row: false,
                watched: sub.watched_fields(),
                bound,
            },
        });
        walk(schema, link.related_entity(), root, sub, &path, bound, sources)?;
    }
    Ok(())
}

/// True when `source` observes `write`.
pub(crate) fn reads(schema: &Schema, source: &EventSource, write: &Write) -> bool {
    match write {
        Write::Dictionary(key) => match &source.route {
            Route::Dictionary { key: watched } => watched == key,
            _ => source.record_name == DICTIONARY_RECORD,
        },
        Write::Field { record, field } => {
            if schema.base_record(&source.record_name) != record {
                return false;
            }
            match &source.route {
                Route::Direct { watched } | Route::Host { watched } | Route::Hops { watched, .. } => {
                    watched.as_ref().map_or(true, |fields| fields.contains(field))
                }
                Route::Dictionary { .. } => false,
            }
        }
        Write::Records(record) => schema.base_record(&source.record_name) == record,
    }
}

/// Whether an update touches a watched field. Creates and deletes always do.
///
/// `ignore` is the computation's own output field, which it never reacts to.
pub(crate) fn touches(event: &MutationEvent, watched: &Option<Vec<String>>, ignore: Option<&str>) -> bool {
    if event.kind != MutationKind::Update {
        return true;
    }
    let mut changed = event
        .changed_fields()
        .into_iter()
        .filter(|field| Some(field.as_str()) != ignore);
    match watched {
        None => changed.next().is_some(),
        Some(fields) => changed.any(|field| fields.contains(&field)),
    }
}

/// The dictionary key a `_Dictionary_` event is about.
pub(crate) fn dictionary_key(event: &MutationEvent) -> Option<&str> {
    event.record.get("key").and_then(Value::as_str)
}
