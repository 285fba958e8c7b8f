//! Typed views over bound state cells.
//!
//! Cells are stored as JSON values; these wrappers fix the cell name, the
//! scope shape and the Rust type so handles never build keys by hand.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{EngineError, Result};
use crate::graph::NodeId;
use crate::store::RecordId;

use super::{BoundStateStore, StateKey, StateScope};

fn decode<T: DeserializeOwned>(cell: &str, value: serde_json::Value) -> Result<T> {
    serde_json::from_value(value).map_err(|source| EngineError::State {
        cell: cell.to_string(),
        source,
    })
}

fn encode<T: Serialize>(cell: &str, value: &T) -> Result<serde_json::Value> {
    serde_json::to_value(value).map_err(|source| EngineError::State {
        cell: cell.to_string(),
        source,
    })
}

/// One cell for the whole computation.
#[derive(Debug, Clone)]
pub struct GlobalBoundState<T> {
    key: StateKey,
    default: T,
}

impl<T: Serialize + DeserializeOwned + Clone> GlobalBoundState<T> {
    pub fn new(computation: NodeId, cell: impl Into<String>, default: T) -> Self {
        Self {
            key: StateKey {
                computation,
                cell: cell.into(),
                scope: StateScope::Global,
            },
            default,
        }
    }

    /// Write the default unless the cell already holds a value.
    pub fn init(&self, states: &BoundStateStore) -> Result<()> {
        if !states.contains(&self.key) {
            states.set(self.key.clone(), encode(&self.key.cell, &self.default)?);
        }
        Ok(())
    }

    pub fn get(&self, states: &BoundStateStore) -> Result<T> {
        match states.get(&self.key) {
            Some(value) => decode(&self.key.cell, value),
            None => Ok(self.default.clone()),
        }
    }

    pub fn set(&self, states: &BoundStateStore, value: &T) -> Result<()> {
        states.set(self.key.clone(), encode(&self.key.cell, value)?);
        Ok(())
    }
}

/// One cell per host record.
#[derive(Debug, Clone)]
pub struct RecordBoundState<T> {
    computation: NodeId,
    cell: String,
    record: String,
    default: T,
}

impl<T: Serialize + DeserializeOwned + Clone> RecordBoundState<T> {
    pub fn new(computation: NodeId, cell: impl Into<String>, record: impl Into<String>, default: T) -> Self {
        Self {
            computation,
            cell: cell.into(),
            record: record.into(),
            default,
        }
    }

    fn key(&self, id: RecordId) -> StateKey {
        StateKey {
            computation: self.computation,
            cell: self.cell.clone(),
            scope: StateScope::Record {
                record: self.record.clone(),
                id,
            },
        }
    }

    /// The stored value, or the default for a record never written or already
    /// forgotten.
    pub fn get(&self, states: &BoundStateStore, id: RecordId) -> Result<T> {
        match states.get(&self.key(id)) {
            Some(value) => decode(&self.cell, value),
            None => Ok(self.default.clone()),
        }
    }

    pub fn set(&self, states: &BoundStateStore, id: RecordId, value: &T) -> Result<()> {
        states.set(self.key(id), encode(&self.cell, value)?);
        Ok(())
    }
}

/// One cell per watched item, optionally per host too.
#[derive(Debug, Clone)]
pub struct ItemBoundState<T> {
    computation: NodeId,
    cell: String,
    record: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> ItemBoundState<T> {
    pub fn new(computation: NodeId, cell: impl Into<String>, record: impl Into<String>) -> Self {
        Self {
            computation,
            cell: cell.into(),
            record: record.into(),
            _marker: PhantomData,
        }
    }

    fn key(&self, id: RecordId, host: Option<RecordId>) -> StateKey {
        StateKey {
            computation: self.computation,
            cell: self.cell.clone(),
            scope: StateScope::Item {
                record: self.record.clone(),
                id,
                host,
            },
        }
    }

    pub fn get(&self, states: &BoundStateStore, id: RecordId, host: Option<RecordId>) -> Result<Option<T>> {
        states
            .get(&self.key(id, host))
            .map(|value| decode(&self.cell, value))
            .transpose()
    }

    pub fn set(&self, states: &BoundStateStore, id: RecordId, host: Option<RecordId>, value: &T) -> Result<()> {
        states.set(self.key(id, host), encode(&self.cell, value)?);
        Ok(())
    }

    pub fn remove(&self, states: &BoundStateStore, id: RecordId, host: Option<RecordId>) -> Result<Option<T>> {
        states
            .remove(&self.key(id, host))
            .map(|value| decode(&self.cell, value))
            .transpose()
    }

    /// Drop every item of this cell, or only those hosted by `host`.
    pub fn clear(&self, states: &BoundStateStore, host: Option<RecordId>) {
        let candidates = match host {
            Some(host) => states.keys_of_record(host),
            None => states.keys_of_computation(self.computation),
        };
        for key in candidates {
            if key.computation != self.computation || key.cell != self.cell {
                continue;
            }
            let hosted = match (&key.scope, host) {
                (StateScope::Item { host: item_host, .. }, Some(host)) => *item_host == Some(host),
                (StateScope::Item { .. }, None) => true,
                _ => false,
            };
            if hosted {
                states.remove(&key);
            }
        }
    }
}
