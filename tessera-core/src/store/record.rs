//! Records and Mutation Events
//!
//! A record is a JSON object with a numeric `id` field. Nested relation reads
//! embed related records as JSON values inside the host record, so a record
//! is kept as a thin wrapper around `serde_json::Map` rather than a struct with
//! typed columns.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use smallvec::SmallVec;

/// Field map used for create/update payloads.
pub type Fields = Map<String, Value>;

/// Path segment naming the fields owned by a relation row itself.
pub const LINK_SYMBOL: &str = "&";

/// Stable identifier of a record or relation row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(u64);

impl RecordId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }

    /// Read an id out of a JSON value (`42` or `{"id": 42}`).
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_u64().map(Self),
            Value::Object(map) => map.get("id").and_then(Self::from_value),
            _ => None,
        }
    }
}

impl From<u64> for RecordId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<RecordId> for Value {
    fn from(id: RecordId) -> Self {
        Value::from(id.0)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A stored entity instance, relation row or dictionary slot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Fields);

impl Record {
    pub fn new(fields: Fields) -> Self {
        Self(fields)
    }

    /// Wrap a JSON object. Returns `None` for any other JSON shape.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    pub fn id(&self) -> Option<RecordId> {
        self.0.get("id").and_then(RecordId::from_value)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn fields(&self) -> &Fields {
        &self.0
    }

    pub fn fields_mut(&mut self) -> &mut Fields {
        &mut self.0
    }

    /// Follow a field path through nested objects.
    ///
    /// Arrays are not traversed; a path that runs into one yields `None`.
    pub fn lookup<S: AsRef<str>>(&self, path: &[S]) -> Option<&Value> {
        let (first, rest) = path.split_first()?;
        let mut current = self.0.get(first.as_ref())?;
        for segment in rest {
            current = current.as_object()?.get(segment.as_ref())?;
        }
        Some(current)
    }

    /// Endpoint ids of a relation row.
    pub fn endpoints(&self) -> Option<(RecordId, RecordId)> {
        let source = self.get("source").and_then(RecordId::from_value)?;
        let target = self.get("target").and_then(RecordId::from_value)?;
        Some((source, target))
    }

    /// Names of the fields whose values differ between `self` and `other`,
    /// including fields present on only one side.
    pub fn changed_fields(&self, other: &Record) -> Vec<String> {
        let mut changed: Vec<String> = self
            .0
            .iter()
            .filter(|(key, value)| other.0.get(key.as_str()) != Some(*value))
            .map(|(key, _)| key.clone())
            .collect();
        for key in other.0.keys() {
            if !self.0.contains_key(key) {
                changed.push(key.clone());
            }
        }
        changed
    }
}

impl From<Fields> for Record {
    fn from(fields: Fields) -> Self {
        Self(fields)
    }
}

/// What a mutation event did to its record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

/// Path from a host record to the attribute that changed.
pub type RelatedPath = SmallVec<[String; 2]>;

/// One create/update/delete applied to the record store.
///
/// Events produced by the store carry an empty `related_attribute`. The
/// scheduler wraps them for computations rooted elsewhere: the wrapper names
/// the root record, carries the path from the root to the changed record and
/// keeps the original event in `related_mutation_event`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationEvent {
    /// Sequence number assigned by the store, unique within a store.
    pub seq: u64,
    pub kind: MutationKind,
    pub record_name: String,
    pub record: Record,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_record: Option<Record>,
    #[serde(default, skip_serializing_if = "SmallVec::is_empty")]
    pub related_attribute: RelatedPath,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_mutation_event: Option<Box<MutationEvent>>,
}

impl MutationEvent {
    pub fn new(seq: u64, kind: MutationKind, record_name: impl Into<String>, record: Record) -> Self {
        Self {
            seq,
            kind,
            record_name: record_name.into(),
            record,
            old_record: None,
            related_attribute: SmallVec::new(),
            related_mutation_event: None,
        }
    }

    pub fn with_old_record(mut self, old: Record) -> Self {
        self.old_record = Some(old);
        self
    }

    /// Wrap `self` as seen from a root record reached through `path`.
    pub fn relayed(&self, root_name: &str, root: Record, path: RelatedPath) -> Self {
        Self {
            seq: self.seq,
            kind: MutationKind::Update,
            record_name: root_name.to_string(),
            record: root,
            old_record: None,
            related_attribute: path,
            related_mutation_event: Some(Box::new(self.clone())),
        }
    }

    /// Fields changed by an update. Create and delete events report every field.
    pub fn changed_fields(&self) -> Vec<String> {
        match (&self.kind, &self.old_record) {
            (MutationKind::Update, Some(old)) => self.record.changed_fields(old),
            _ => self.record.fields().keys().cloned().collect(),
        }
    }

    /// The innermost event this one was relayed from.
    pub fn origin(&self) -> &MutationEvent {
        let mut current = self;
        while let Some(inner) = current.related_mutation_event.as_deref() {
            current = inner;
        }
        current
    }
}
