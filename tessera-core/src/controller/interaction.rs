//! Interactions
//!
//! An interaction is the only mutation entry point exposed to application
//! code. Calling one records an `_Interaction_` event record (which is what
//! state machines listen to), runs the optional action inside the same
//! transaction, propagates, commits and finally runs the side effects.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::computation::Callback;
use crate::error::BoxError;
use crate::store::{Fields, MutationEvent, Record, RecordId, RecordStore};

/// An interaction call as seen by computations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionEvent {
    /// Id of the `_Interaction_` record, once stored.
    pub id: Option<RecordId>,
    pub interaction_name: String,
    pub user: Value,
    pub payload: Value,
}

impl InteractionEvent {
    pub fn new(interaction_name: impl Into<String>, call: &InteractionCall) -> Self {
        Self {
            id: None,
            interaction_name: interaction_name.into(),
            user: call.user.clone(),
            payload: call.payload.clone(),
        }
    }

    /// Read an event back from its `_Interaction_` record.
    pub fn from_record(record: &Record) -> Option<Self> {
        Some(Self {
            id: record.id(),
            interaction_name: record.get("interaction_name")?.as_str()?.to_string(),
            user: record.get("user").cloned().unwrap_or(Value::Null),
            payload: record.get("payload").cloned().unwrap_or(Value::Null),
        })
    }

    pub(crate) fn to_fields(&self) -> Fields {
        let mut fields = Map::new();
        fields.insert("interaction_name".into(), Value::from(self.interaction_name.clone()));
        fields.insert("user".into(), self.user.clone());
        fields.insert("payload".into(), self.payload.clone());
        fields
    }

    pub fn user_id(&self) -> Option<&Value> {
        self.user.get("id")
    }

    /// A payload entry, e.g. `event.arg("request")`.
    pub fn arg(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    /// Id of a payload entry holding either a bare id or a record with an `id`.
    pub fn arg_id(&self, key: &str) -> Option<RecordId> {
        let value = self.arg(key)?;
        RecordId::from_value(value).or_else(|| value.get("id").and_then(RecordId::from_value))
    }
}

/// Arguments of one interaction call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InteractionCall {
    #[serde(default)]
    pub user: Value,
    #[serde(default)]
    pub payload: Value,
}

impl InteractionCall {
    pub fn new(user: Value, payload: Value) -> Self {
        Self { user, payload }
    }
}

pub type ConditionFn = Callback<dyn Fn(&dyn RecordStore, &InteractionEvent) -> Result<bool, BoxError> + Send + Sync>;

pub type ActionFn =
    Callback<dyn Fn(&dyn RecordStore, &InteractionEvent, &mut Vec<MutationEvent>) -> Result<(), BoxError> + Send + Sync>;

/// A named, state-changing operation.
#[derive(Debug, Clone)]
pub struct Interaction {
    name: String,
    conditions: Vec<(String, ConditionFn)>,
    action: Option<ActionFn>,
}

impl Interaction {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            conditions: Vec::new(),
            action: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a guard. The call fails in the condition phase when it returns false.
    pub fn condition(
        mut self,
        name: impl Into<String>,
        check: impl Fn(&dyn RecordStore, &InteractionEvent) -> Result<bool, BoxError> + Send + Sync + 'static,
    ) -> Self {
        let check: Arc<dyn Fn(&dyn RecordStore, &InteractionEvent) -> Result<bool, BoxError> + Send + Sync> =
            Arc::new(check);
        self.conditions.push((name.into(), Callback::from_arc(check)));
        self
    }

    /// Writes performed by the call, inside its transaction.
    pub fn action(
        mut self,
        action: impl Fn(&dyn RecordStore, &InteractionEvent, &mut Vec<MutationEvent>) -> Result<(), BoxError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        let action: Arc<
            dyn Fn(&dyn RecordStore, &InteractionEvent, &mut Vec<MutationEvent>) -> Result<(), BoxError> + Send + Sync,
        > = Arc::new(action);
        self.action = Some(Callback::from_arc(action));
        self
    }

    pub(crate) fn conditions(&self) -> &[(String, ConditionFn)] {
        &self.conditions
    }

    pub(crate) fn action_fn(&self) -> Option<&ActionFn> {
        self.action.as_ref()
    }
}

/// Where an interaction call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionPhase {
    Lookup,
    Condition,
    Action,
    Computation,
}

impl fmt::Display for ExecutionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self {
            ExecutionPhase::Lookup => "lookup",
            ExecutionPhase::Condition => "condition",
            ExecutionPhase::Action => "action",
            ExecutionPhase::Computation => "computation",
        };
        f.write_str(phase)
    }
}

/// A failed interaction call. Reported on the response, never thrown.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("interaction `{interaction_name}` failed during {execution_phase}: {caused_by}")]
pub struct InteractionError {
    pub interaction_name: String,
    pub user_id: Option<Value>,
    pub payload: Value,
    pub execution_phase: ExecutionPhase,
    pub caused_by: String,
}

/// What one side effect produced for a committed call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SideEffectOutcome {
    /// One entry per event the side effect handled successfully.
    pub results: Vec<Value>,
    /// First error the side effect raised, if any.
    pub error: Option<String>,
}

/// Result of [`crate::Controller::call_interaction`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InteractionCallResponse {
    pub event: Option<InteractionEvent>,
    /// Every mutation the call caused, computed writes included.
    pub effects: Vec<MutationEvent>,
    pub side_effects: IndexMap<String, SideEffectOutcome>,
    pub error: Option<InteractionError>,
}

impl InteractionCallResponse {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

pub type SideEffectFn = Callback<dyn Fn(&MutationEvent) -> Result<Value, BoxError> + Send + Sync>;

/// A handler run after commit for every committed event on `record_name`.
///
/// Failures are collected on the response under the side effect's name and
/// never undo the call.
#[derive(Debug, Clone)]
pub struct RecordMutationSideEffect {
    pub name: String,
    pub record_name: String,
    pub handler: SideEffectFn,
}

impl RecordMutationSideEffect {
    pub fn new(
        name: impl Into<String>,
        record_name: impl Into<String>,
        handler: impl Fn(&MutationEvent) -> Result<Value, BoxError> + Send + Sync + 'static,
    ) -> Self {
        let handler: Arc<dyn Fn(&MutationEvent) -> Result<Value, BoxError> + Send + Sync> = Arc::new(handler);
        Self {
            name: name.into(),
            record_name: record_name.into(),
            handler: Callback::from_arc(handler),
        }
    }
}
