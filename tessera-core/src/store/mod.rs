//! Record Store
//!
//! The record store is the engine's only view of persisted data. The engine
//! reads through [`RecordStore::find`] and friends, and every write appends the
//! [`MutationEvent`]s it produced to a caller-supplied vector. Those events are
//! what drives incremental recomputation.
//!
//! # Contract
//!
//! - Events are appended in the order the changes were applied.
//! - Deleting an entity first deletes every relation row touching it, one
//!   delete event per row, then the entity itself.
//! - Writes to a filtered entity's base also produce synthetic events under the
//!   filtered entity's name when membership or member data changes.
//! - Relation rows are records with `source` and `target` id fields; nested
//!   reads expose their own fields under the `&` segment.
//!
//! [`MemoryStore`] is the reference implementation used by the tests.

mod filtered;
mod memory;
mod query;
mod record;

pub use filtered::FilteredEntityManager;
pub use memory::MemoryStore;
pub use query::{AttributeQuery, MatchExpr, MatchOp, Modifier, QueryNode};
pub use record::{Fields, MutationEvent, MutationKind, Record, RecordId, RelatedPath, LINK_SYMBOL};

use serde_json::Value;
use thiserror::Error;

/// Errors reported by a record store.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    #[error("unknown record type `{0}`")]
    UnknownRecord(String),
    #[error("`{0}` is not a relation")]
    NotARelation(String),
    #[error("{record} #{id} does not exist")]
    RecordNotFound { record: String, id: RecordId },
    #[error("`{0}` is a filtered entity and cannot be written directly")]
    ReadOnly(String),
    #[error("relation `{relation}` allows only one row for #{id}")]
    CardinalityViolation { relation: String, id: RecordId },
    #[error("invalid data for `{record}`: {reason}")]
    InvalidData { record: String, reason: String },
    #[error("no open transaction")]
    NoTransaction,
}

/// Storage operations consumed by the computation engine.
///
/// Implementations use interior mutability so readers and writers can share
/// one store by reference.
pub trait RecordStore: Send + Sync {
    /// Read the records of `record_name` selected by `matcher`, projected
    /// through `query`.
    fn find(
        &self,
        record_name: &str,
        matcher: &MatchExpr,
        modifier: &Modifier,
        query: &AttributeQuery,
    ) -> Result<Vec<Record>, StoreError>;

    /// Read the first matching record.
    fn find_one(
        &self,
        record_name: &str,
        matcher: &MatchExpr,
        query: &AttributeQuery,
    ) -> Result<Option<Record>, StoreError> {
        Ok(self
            .find(record_name, matcher, &Modifier::limit(1), query)?
            .into_iter()
            .next())
    }

    fn create(
        &self,
        record_name: &str,
        data: Fields,
        events: &mut Vec<MutationEvent>,
    ) -> Result<Record, StoreError>;

    fn update(
        &self,
        record_name: &str,
        matcher: &MatchExpr,
        data: Fields,
        events: &mut Vec<MutationEvent>,
    ) -> Result<Vec<Record>, StoreError>;

    fn delete(
        &self,
        record_name: &str,
        matcher: &MatchExpr,
        events: &mut Vec<MutationEvent>,
    ) -> Result<Vec<Record>, StoreError>;

    /// Link `source` to `target` through `relation`, storing `data` on the row.
    fn add_relation_by_name_by_id(
        &self,
        relation: &str,
        source: RecordId,
        target: RecordId,
        data: Fields,
        events: &mut Vec<MutationEvent>,
    ) -> Result<Record, StoreError>;

    fn remove_relation_by_name(
        &self,
        relation: &str,
        matcher: &MatchExpr,
        events: &mut Vec<MutationEvent>,
    ) -> Result<Vec<Record>, StoreError>;

    fn find_relation_by_name(
        &self,
        relation: &str,
        matcher: &MatchExpr,
        query: &AttributeQuery,
    ) -> Result<Vec<Record>, StoreError>;

    /// Rows of `relation` with `id` at either end.
    fn find_relation_by_endpoint(
        &self,
        relation: &str,
        id: RecordId,
        query: &AttributeQuery,
    ) -> Result<Vec<Record>, StoreError> {
        self.find_relation_by_name(
            relation,
            &MatchExpr::eq("source", id).or(MatchExpr::eq("target", id)),
            query,
        )
    }

    fn dict_get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    fn dict_set(&self, key: &str, value: Value, events: &mut Vec<MutationEvent>) -> Result<(), StoreError>;

    /// Open a transaction. Transactions nest.
    fn begin(&self);

    /// Keep everything written since the matching [`RecordStore::begin`].
    fn commit(&self) -> Result<(), StoreError>;

    /// Discard everything written since the matching [`RecordStore::begin`].
    fn rollback(&self) -> Result<(), StoreError>;
}
