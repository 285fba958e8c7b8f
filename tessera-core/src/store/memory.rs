//! In-Memory Record Store
//!
//! Tables are insertion-ordered maps from id to record, guarded by a single
//! `RwLock`. Ids are unique across the whole store, which keeps relation rows,
//! entity records and dictionary slots addressable by id alone.
//!
//! Relation rows are also indexed by endpoint id, so reading or cascading the
//! links of one record never scans a whole relation table.
//!
//! Transactions keep an undo journal: every insert, overwrite and removal made
//! while a transaction is open records how to reverse it. `rollback` replays
//! the journal backwards, `commit` hands it to the enclosing transaction or
//! drops it.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use parking_lot::RwLock;
use serde_json::Value;

use crate::schema::{RelationLink, Schema, DICTIONARY_RECORD, INTERACTION_RECORD};

use super::filtered::FilteredEntityManager;
use super::query::{order, AttributeQuery, MatchExpr, Modifier, QueryNode};
use super::record::{Fields, MutationEvent, MutationKind, Record, RecordId, LINK_SYMBOL};
use super::{RecordStore, StoreError};

type Table = IndexMap<RecordId, Record>;

/// How to reverse one write.
#[derive(Debug)]
enum Undo {
    Inserted { table: String, id: RecordId },
    Overwrote { table: String, old: Record },
    Removed { table: String, index: usize, old: Record },
}

#[derive(Debug, Default)]
struct Tables {
    tables: IndexMap<String, Table>,
    /// Relation row ids by endpoint id.
    links: HashMap<RecordId, IndexSet<RecordId>>,
    next_id: u64,
    next_seq: u64,
    /// One undo list per open transaction, innermost last.
    journal: Vec<Vec<Undo>>,
}

impl Tables {
    fn log(&mut self, undo: Undo) {
        if let Some(open) = self.journal.last_mut() {
            open.push(undo);
        }
    }

    fn link(&mut self, row: &Record) {
        if let (Some((source, target)), Some(id)) = (row.endpoints(), row.id()) {
            self.links.entry(source).or_default().insert(id);
            self.links.entry(target).or_default().insert(id);
        }
    }

    fn unlink(&mut self, row: &Record) {
        if let (Some((source, target)), Some(id)) = (row.endpoints(), row.id()) {
            for end in [source, target] {
                if let Some(rows) = self.links.get_mut(&end) {
                    rows.shift_remove(&id);
                    if rows.is_empty() {
                        self.links.remove(&end);
                    }
                }
            }
        }
    }

    /// Insert or overwrite `record` under `id`.
    fn put(&mut self, table: &str, id: RecordId, record: Record) {
        let previous = self.tables.entry(table.to_string()).or_default().insert(id, record.clone());
        match previous {
            Some(old) => self.log(Undo::Overwrote {
                table: table.to_string(),
                old,
            }),
            None => {
                self.link(&record);
                self.log(Undo::Inserted {
                    table: table.to_string(),
                    id,
                });
            }
        }
    }

    fn take(&mut self, table: &str, id: RecordId) -> Option<Record> {
        let (index, _, old) = self.tables.get_mut(table)?.shift_remove_full(&id)?;
        self.unlink(&old);
        self.log(Undo::Removed {
            table: table.to_string(),
            index,
            old: old.clone(),
        });
        Some(old)
    }

    fn undo(&mut self, undo: Undo) {
        match undo {
            Undo::Inserted { table, id } => {
                if let Some(old) = self.tables.get_mut(&table).and_then(|t| t.shift_remove(&id)) {
                    self.unlink(&old);
                }
            }
            Undo::Overwrote { table, old } => {
                if let (Some(t), Some(id)) = (self.tables.get_mut(&table), old.id()) {
                    t.insert(id, old);
                }
            }
            Undo::Removed { table, index, old } => {
                let Some(id) = old.id() else { return };
                self.link(&old);
                let t = self.tables.entry(table).or_default();
                let index = index.min(t.len());
                t.shift_insert(index, id, old);
            }
        }
    }

    /// Rows of `relation` touching record `id`.
    fn rows_of<'t>(&'t self, relation: &str, id: RecordId) -> impl Iterator<Item = &'t Record> + 't {
        let table = self.tables.get(relation);
        self.links
            .get(&id)
            .into_iter()
            .flatten()
            .filter_map(move |row| table.and_then(|t| t.get(row)))
    }

    fn allocate_id(&mut self) -> RecordId {
        self.next_id += 1;
        RecordId::new(self.next_id)
    }

    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

/// Reference [`RecordStore`] keeping everything in memory.
pub struct MemoryStore {
    schema: Arc<Schema>,
    data: RwLock<Tables>,
    filters: FilteredEntityManager,
}

impl MemoryStore {
    pub fn new(schema: Arc<Schema>) -> Self {
        let mut tables = Tables::default();
        let names = schema
            .entities()
            .map(|e| e.name.clone())
            .chain(schema.relations().map(|r| r.name.clone()))
            .chain([DICTIONARY_RECORD.to_string(), INTERACTION_RECORD.to_string()]);
        for name in names {
            tables.tables.insert(name, Table::new());
        }

        Self {
            filters: FilteredEntityManager::new(schema.clone()),
            schema,
            data: RwLock::new(tables),
        }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Number of stored records of `record_name` (filtered names included).
    pub fn count(&self, record_name: &str) -> usize {
        self.find(record_name, &MatchExpr::All, &Modifier::default(), &AttributeQuery::new())
            .map(|records| records.len())
            .unwrap_or(0)
    }

    fn writable<'a>(&self, record_name: &'a str) -> Result<&'a str, StoreError> {
        if self.schema.filtered_entity(record_name).is_some() {
            return Err(StoreError::ReadOnly(record_name.to_string()));
        }
        Ok(record_name)
    }

    /// Push `event` and every filtered-entity event derived from it.
    fn emit(&self, tables: &mut Tables, event: MutationEvent, events: &mut Vec<MutationEvent>) {
        let derived = self.filters.derive(&event, || tables.next_seq());
        events.push(event);
        events.extend(derived);
    }

    fn project(
        &self,
        tables: &Tables,
        record_name: &str,
        raw: &Record,
        query: &AttributeQuery,
        via: Option<(&str, &Record)>,
    ) -> Record {
        let mut out = Record::default();
        if let Some(id) = raw.get("id") {
            out.set("id", id.clone());
        }

        for node in query.nodes() {
            match node {
                QueryNode::AllFields => {
                    for (key, value) in raw.fields() {
                        out.set(key.clone(), value.clone());
                    }
                }
                QueryNode::Field(name) => {
                    if let Some(value) = raw.get(name) {
                        out.set(name.clone(), value.clone());
                    }
                }
                QueryNode::Nested { attribute, query } => {
                    let value = self.read_nested(tables, record_name, raw, attribute, query);
                    out.set(attribute.clone(), value);
                }
                QueryNode::RelationOwnFields(query) => {
                    if let Some((relation, row)) = via {
                        let own = self.project(tables, relation, row, query, None);
                        out.set(LINK_SYMBOL, own.into_value());
                    }
                }
            }
        }
        out
    }

    fn read_nested(
        &self,
        tables: &Tables,
        record_name: &str,
        raw: &Record,
        attribute: &str,
        query: &AttributeQuery,
    ) -> Value {
        let base = self.schema.base_record(record_name);

        // Relation rows reach their endpoints through `source` and `target`.
        if let Some(relation) = self.schema.relation(base) {
            let endpoint = match attribute {
                "source" => Some(&relation.source),
                "target" => Some(&relation.target),
                _ => None,
            };
            if let Some(entity) = endpoint {
                return raw
                    .get(attribute)
                    .and_then(RecordId::from_value)
                    .and_then(|id| tables.tables.get(entity.as_str())?.get(&id))
                    .map(|related| self.project(tables, entity, related, query, None).into_value())
                    .unwrap_or(Value::Null);
            }
        }

        let (Some(link), Some(host)) = (self.schema.relation_link(base, attribute), raw.id()) else {
            return Value::Null;
        };
        let related = linked_records(tables, &link, host)
            .into_iter()
            .map(|(row, record)| {
                self.project(tables, link.related_entity(), record, query, Some((link.relation.name.as_str(), row)))
                    .into_value()
            });

        if link.is_many() {
            Value::Array(related.collect())
        } else {
            related.into_iter().next().unwrap_or(Value::Null)
        }
    }

    fn apply_defaults(&self, record_name: &str, data: &mut Fields) {
        let properties = self
            .schema
            .entity(record_name)
            .map(|e| &e.properties)
            .or_else(|| self.schema.relation(record_name).map(|r| &r.properties));
        if let Some(properties) = properties {
            for property in properties.values() {
                if let Some(default) = &property.default {
                    if !data.contains_key(&property.name) {
                        data.insert(property.name.clone(), default.clone());
                    }
                }
            }
        }
    }

    fn insert_row(
        &self,
        tables: &mut Tables,
        relation: &str,
        source: RecordId,
        target: RecordId,
        mut data: Fields,
        events: &mut Vec<MutationEvent>,
    ) -> Result<Record, StoreError> {
        let declared = self
            .schema
            .relation(relation)
            .ok_or_else(|| StoreError::NotARelation(relation.to_string()))?;

        for (entity, id) in [(&declared.source, source), (&declared.target, target)] {
            let exists = tables.tables.get(entity.as_str()).is_some_and(|t| t.contains_key(&id));
            if !exists {
                return Err(StoreError::RecordNotFound {
                    record: entity.clone(),
                    id,
                });
            }
        }

        let rows = tables.rows_of(relation, source).chain(tables.rows_of(relation, target));
        for row in rows {
            let Some((s, t)) = row.endpoints() else { continue };
            if !declared.cardinality.target_sees_many() && s == source {
                return Err(StoreError::CardinalityViolation {
                    relation: relation.to_string(),
                    id: source,
                });
            }
            if !declared.cardinality.source_sees_many() && t == target {
                return Err(StoreError::CardinalityViolation {
                    relation: relation.to_string(),
                    id: target,
                });
            }
        }

        self.apply_defaults(relation, &mut data);
        let id = tables.allocate_id();
        data.insert("id".into(), id.into());
        data.insert("source".into(), source.into());
        data.insert("target".into(), target.into());
        let record = Record::new(data);

        tables.put(relation, id, record.clone());
        let seq = tables.next_seq();
        self.emit(tables, MutationEvent::new(seq, MutationKind::Create, relation, record.clone()), events);
        Ok(record)
    }

    fn remove_matching(
        &self,
        tables: &mut Tables,
        record_name: &str,
        matcher: &MatchExpr,
        events: &mut Vec<MutationEvent>,
    ) -> Result<Vec<Record>, StoreError> {
        let table = tables
            .tables
            .get(record_name)
            .ok_or_else(|| StoreError::UnknownRecord(record_name.to_string()))?;
        let doomed = matching_ids(table, matcher);

        let mut removed = Vec::with_capacity(doomed.len());
        for id in doomed {
            if self.schema.entity(record_name).is_some() {
                self.cascade_relations(tables, record_name, id, events);
            }
            let Some(record) = tables.take(record_name, id) else {
                continue;
            };
            let seq = tables.next_seq();
            self.emit(tables, MutationEvent::new(seq, MutationKind::Delete, record_name, record.clone()), events);
            removed.push(record);
        }
        Ok(removed)
    }

    /// Delete every relation row touching `entity#id`.
    fn cascade_relations(&self, tables: &mut Tables, entity: &str, id: RecordId, events: &mut Vec<MutationEvent>) {
        let relations: Vec<String> = self
            .schema
            .relations()
            .filter(|r| r.source == entity || r.target == entity)
            .map(|r| r.name.clone())
            .collect();

        for relation in relations {
            let Some(declared) = self.schema.relation(&relation) else { continue };
            let touching: Vec<RecordId> = tables
                .rows_of(&relation, id)
                .filter(|row| match row.endpoints() {
                    Some((s, t)) => (declared.source == entity && s == id) || (declared.target == entity && t == id),
                    None => false,
                })
                .filter_map(Record::id)
                .collect();

            for row_id in touching {
                let Some(row) = tables.take(&relation, row_id) else {
                    continue;
                };
                let seq = tables.next_seq();
                self.emit(tables, MutationEvent::new(seq, MutationKind::Delete, relation.as_str(), row), events);
            }
        }
    }
}

/// Relation rows touching `host` on the link's side, each paired with the
/// record at the far end.
fn linked_records<'t>(tables: &'t Tables, link: &RelationLink<'_>, host: RecordId) -> Vec<(&'t Record, &'t Record)> {
    let related_table = tables.tables.get(link.related_entity());
    tables
        .rows_of(&link.relation.name, host)
        .flat_map(|row| {
            link.far_ends(row, host)
                .into_iter()
                .filter_map(move |far| related_table.and_then(|t| t.get(&far)).map(|record| (row, record)))
        })
        .collect()
}

/// Ids of the records in `table` matched by `matcher`, looking an id match up
/// directly.
fn matching_ids(table: &Table, matcher: &MatchExpr) -> Vec<RecordId> {
    match matcher.as_id() {
        Some(id) => table.get(&id).filter(|r| matcher.matches(r)).map(|_| id).into_iter().collect(),
        None => table
            .iter()
            .filter(|(_, record)| matcher.matches(record))
            .map(|(id, _)| *id)
            .collect(),
    }
}

impl RecordStore for MemoryStore {
    fn find(
        &self,
        record_name: &str,
        matcher: &MatchExpr,
        modifier: &Modifier,
        query: &AttributeQuery,
    ) -> Result<Vec<Record>, StoreError> {
        let tables = self.data.read();
        let base = self.schema.base_record(record_name);
        let table = tables
            .tables
            .get(base)
            .ok_or_else(|| StoreError::UnknownRecord(record_name.to_string()))?;

        let predicate = match self.schema.filtered_entity(record_name) {
            Some(filtered) => filtered.predicate.clone().and(matcher.clone()),
            None => matcher.clone(),
        };

        let mut selected: Vec<&Record> = match matcher.as_id() {
            Some(id) => table.get(&id).filter(|r| predicate.matches(r)).into_iter().collect(),
            None => table.values().filter(|r| predicate.matches(r)).collect(),
        };
        if let Some((field, ascending)) = &modifier.order_by {
            selected.sort_by(|a, b| {
                let ordering = match (a.get(field), b.get(field)) {
                    (Some(a), Some(b)) => order(a, b).unwrap_or(std::cmp::Ordering::Equal),
                    (Some(_), None) => std::cmp::Ordering::Greater,
                    (None, Some(_)) => std::cmp::Ordering::Less,
                    (None, None) => std::cmp::Ordering::Equal,
                };
                if *ascending {
                    ordering
                } else {
                    ordering.reverse()
                }
            });
        }

        Ok(selected
            .into_iter()
            .skip(modifier.offset.unwrap_or(0))
            .take(modifier.limit.unwrap_or(usize::MAX))
            .map(|raw| self.project(&tables, base, raw, query, None))
            .collect())
    }

    fn create(&self, record_name: &str, mut data: Fields, events: &mut Vec<MutationEvent>) -> Result<Record, StoreError> {
        let record_name = self.writable(record_name)?;
        let mut tables = self.data.write();

        if self.schema.relation(record_name).is_some() {
            let endpoint = |key: &str| data.get(key).and_then(RecordId::from_value);
            let (Some(source), Some(target)) = (endpoint("source"), endpoint("target")) else {
                return Err(StoreError::InvalidData {
                    record: record_name.to_string(),
                    reason: "relation rows need `source` and `target` ids".into(),
                });
            };
            data.remove("source");
            data.remove("target");
            return self.insert_row(&mut tables, record_name, source, target, data, events);
        }

        if !tables.tables.contains_key(record_name) {
            return Err(StoreError::UnknownRecord(record_name.to_string()));
        }

        self.apply_defaults(record_name, &mut data);
        let id = tables.allocate_id();
        data.insert("id".into(), id.into());
        let record = Record::new(data);
        tables.put(record_name, id, record.clone());

        let seq = tables.next_seq();
        self.emit(&mut tables, MutationEvent::new(seq, MutationKind::Create, record_name, record.clone()), events);
        Ok(record)
    }

    fn update(
        &self,
        record_name: &str,
        matcher: &MatchExpr,
        mut data: Fields,
        events: &mut Vec<MutationEvent>,
    ) -> Result<Vec<Record>, StoreError> {
        let record_name = self.writable(record_name)?;
        data.remove("id");
        if self.schema.relation(record_name).is_some() {
            data.remove("source");
            data.remove("target");
        }

        let mut tables = self.data.write();
        let table = tables
            .tables
            .get(record_name)
            .ok_or_else(|| StoreError::UnknownRecord(record_name.to_string()))?;

        let mut changes = Vec::new();
        for id in matching_ids(table, matcher) {
            let Some(old) = table.get(&id) else { continue };
            let mut new = old.clone();
            for (key, value) in &data {
                new.set(key.clone(), value.clone());
            }
            changes.push((id, old.clone(), new));
        }

        let mut updated = Vec::with_capacity(changes.len());
        for (id, old, new) in changes {
            tables.put(record_name, id, new.clone());
            let seq = tables.next_seq();
            let event = MutationEvent::new(seq, MutationKind::Update, record_name, new.clone()).with_old_record(old);
            self.emit(&mut tables, event, events);
            updated.push(new);
        }
        Ok(updated)
    }

    fn delete(&self, record_name: &str, matcher: &MatchExpr, events: &mut Vec<MutationEvent>) -> Result<Vec<Record>, StoreError> {
        let record_name = self.writable(record_name)?;
        let mut tables = self.data.write();
        self.remove_matching(&mut tables, record_name, matcher, events)
    }

    fn add_relation_by_name_by_id(
        &self,
        relation: &str,
        source: RecordId,
        target: RecordId,
        data: Fields,
        events: &mut Vec<MutationEvent>,
    ) -> Result<Record, StoreError> {
        let mut tables = self.data.write();
        self.insert_row(&mut tables, relation, source, target, data, events)
    }

    fn remove_relation_by_name(
        &self,
        relation: &str,
        matcher: &MatchExpr,
        events: &mut Vec<MutationEvent>,
    ) -> Result<Vec<Record>, StoreError> {
        if self.schema.relation(relation).is_none() {
            return Err(StoreError::NotARelation(relation.to_string()));
        }
        let mut tables = self.data.write();
        self.remove_matching(&mut tables, relation, matcher, events)
    }

    fn find_relation_by_name(
        &self,
        relation: &str,
        matcher: &MatchExpr,
        query: &AttributeQuery,
    ) -> Result<Vec<Record>, StoreError> {
        if self.schema.relation(relation).is_none() {
            return Err(StoreError::NotARelation(relation.to_string()));
        }
        self.find(relation, matcher, &Modifier::default(), query)
    }

    fn find_relation_by_endpoint(
        &self,
        relation: &str,
        id: RecordId,
        query: &AttributeQuery,
    ) -> Result<Vec<Record>, StoreError> {
        if self.schema.relation(relation).is_none() {
            return Err(StoreError::NotARelation(relation.to_string()));
        }
        let tables = self.data.read();
        Ok(tables
            .rows_of(relation, id)
            .map(|row| self.project(&tables, relation, row, query, None))
            .collect())
    }

    fn dict_get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let tables = self.data.read();
        Ok(tables
            .tables
            .get(DICTIONARY_RECORD)
            .and_then(|t| t.values().find(|r| r.get("key").and_then(Value::as_str) == Some(key)))
            .and_then(|r| r.get("value").cloned()))
    }

    fn dict_set(&self, key: &str, value: Value, events: &mut Vec<MutationEvent>) -> Result<(), StoreError> {
        let mut tables = self.data.write();
        let existing = tables
            .tables
            .get(DICTIONARY_RECORD)
            .and_then(|t| t.values().find(|r| r.get("key").and_then(Value::as_str) == Some(key)))
            .cloned();

        let event = match existing {
            Some(old) => {
                let Some(id) = old.id() else {
                    return Err(StoreError::InvalidData {
                        record: DICTIONARY_RECORD.to_string(),
                        reason: format!("slot `{key}` has no id"),
                    });
                };
                let mut new = old.clone();
                new.set("value", value);
                tables.put(DICTIONARY_RECORD, id, new.clone());
                let seq = tables.next_seq();
                MutationEvent::new(seq, MutationKind::Update, DICTIONARY_RECORD, new).with_old_record(old)
            }
            None => {
                let id = tables.allocate_id();
                let mut record = Record::default();
                record.set("id", id.into());
                record.set("key", Value::from(key));
                record.set("value", value);
                tables.put(DICTIONARY_RECORD, id, record.clone());
                let seq = tables.next_seq();
                MutationEvent::new(seq, MutationKind::Create, DICTIONARY_RECORD, record)
            }
        };
        events.push(event);
        Ok(())
    }

    fn begin(&self) {
        self.data.write().journal.push(Vec::new());
    }

    fn commit(&self) -> Result<(), StoreError> {
        let mut tables = self.data.write();
        let done = tables.journal.pop().ok_or(StoreError::NoTransaction)?;
        if let Some(outer) = tables.journal.last_mut() {
            outer.extend(done);
        }
        Ok(())
    }

    /// Ids and sequence numbers are not reused after a rollback.
    fn rollback(&self) -> Result<(), StoreError> {
        let mut tables = self.data.write();
        let undone = tables.journal.pop().ok_or(StoreError::NoTransaction)?;
        for undo in undone.into_iter().rev() {
            tables.undo(undo);
        }
        Ok(())
    }
}
