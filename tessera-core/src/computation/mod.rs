//! Computations
//!
//! A computation is a declarative description of a derived value (a
//! [`Computation`]) placed somewhere in the schema. At setup the controller
//! turns each one into a [`ComputationHandle`] through the [`HandleRegistry`],
//! keyed by computation kind and the kind of [`DataContext`] it writes to.
//!
//! # Handle Contract
//!
//! - `data_deps()` names every input the handle reads. The controller derives
//!   event routing and graph edges from them, and [`ComputeContext`] refuses
//!   reads of undeclared names.
//! - `compute()` derives the value from scratch.
//! - `incremental_compute()` derives it from one mutation event plus bound
//!   state. An event that does not fit the handle's dependency shape yields
//!   [`ComputationResult::FullRecompute`], never an error.
//! - `async_return()` reconciles the result of a computation that returned
//!   [`ComputationResult::Async`].

mod aggregate;
mod any;
mod average;
mod count;
mod custom;
mod every;
mod path;
mod registry;
mod state_machine;
mod summation;
mod transform;
mod weighted;

pub use aggregate::{AggregateSource, Contribution, Totals};
pub use any::Any;
pub use average::Average;
pub use count::Count;
pub use custom::{AsyncReturnFn, ComputeFn, Custom, IncrementalFn};
pub use every::Every;
pub use path::{match_related_path, PathMatch};
pub use registry::{HandleFactory, HandleRegistry};
pub use state_machine::{StateMachine, StateNode, StateTransfer, Target, TargetFn};
pub use summation::Summation;
pub use transform::{Transform, TransformFn, SOURCE_FIELD};
pub use weighted::{WeightFn, Weighted, WeightedSummation};

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, Result};
use crate::graph::NodeId;
use crate::schema::{Schema, DICTIONARY_RECORD};
use crate::state::BoundStateStore;
use crate::store::{AttributeQuery, Fields, MatchExpr, Modifier, MutationEvent, Record, RecordStore};

/// Shared user closure. Its `Debug` output hides the closure.
pub struct Callback<F: ?Sized>(Arc<F>);

impl<F: ?Sized> Callback<F> {
    pub fn from_arc(f: Arc<F>) -> Self {
        Self(f)
    }
}

impl<F: ?Sized> Clone for Callback<F> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<F: ?Sized> fmt::Debug for Callback<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Callback(..)")
    }
}

impl<F: ?Sized> Deref for Callback<F> {
    type Target = F;

    fn deref(&self) -> &F {
        &self.0
    }
}

/// Record predicate used by Count, Every and Any.
pub type Predicate = Callback<dyn Fn(&Record) -> bool + Send + Sync>;

pub(crate) fn predicate(f: impl Fn(&Record) -> bool + Send + Sync + 'static) -> Predicate {
    let f: Arc<dyn Fn(&Record) -> bool + Send + Sync> = Arc::new(f);
    Callback(f)
}

/// Which end of a relation counts for the host.
///
/// Only matters for symmetric relations, where a row is visible from both of
/// its endpoints. For other relations it must agree with the side the
/// attribute sits on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    #[default]
    Both,
    Source,
    Target,
}

/// Where a computation's result lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DataContext {
    /// A dictionary slot.
    Global { dictionary: String },
    /// A property on every instance of `host`.
    Property { host: String, property: String },
    /// The existence of `entity` records.
    Entity { entity: String },
    /// The existence of `relation` rows.
    Relation { relation: String },
}

/// The tag of a [`DataContext`], used for handle lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextKind {
    Global,
    Property,
    Entity,
    Relation,
}

impl fmt::Display for ContextKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContextKind::Global => "global",
            ContextKind::Property => "property",
            ContextKind::Entity => "entity",
            ContextKind::Relation => "relation",
        };
        f.write_str(name)
    }
}

impl DataContext {
    pub fn kind(&self) -> ContextKind {
        match self {
            DataContext::Global { .. } => ContextKind::Global,
            DataContext::Property { .. } => ContextKind::Property,
            DataContext::Entity { .. } => ContextKind::Entity,
            DataContext::Relation { .. } => ContextKind::Relation,
        }
    }

    /// Record name written by this context.
    pub fn target_record(&self) -> &str {
        match self {
            DataContext::Global { .. } => DICTIONARY_RECORD,
            DataContext::Property { host, .. } => host,
            DataContext::Entity { entity } => entity,
            DataContext::Relation { relation } => relation,
        }
    }

    /// Human readable name such as `User.friendCount`.
    pub fn label(&self) -> String {
        match self {
            DataContext::Global { dictionary } => format!("dictionary {dictionary}"),
            DataContext::Property { host, property } => format!("{host}.{property}"),
            DataContext::Entity { entity } => format!("entity {entity}"),
            DataContext::Relation { relation } => format!("relation {relation}"),
        }
    }
}

/// One named input of a computation.
#[derive(Debug, Clone, PartialEq)]
pub enum DataDep {
    /// A live query over every record of `source`.
    Records { source: String, query: AttributeQuery },
    /// The host record's own projection through `query`.
    Property { query: AttributeQuery },
    /// The current value of a dictionary slot.
    Global { dictionary: String },
}

/// A write requested by an entity, relation or property-level handle.
///
/// Patches apply to the record name of the handle's context: the entity or
/// relation itself, or the host of a property.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordPatch {
    Create { data: Fields },
    Update { matching: MatchExpr, data: Fields },
    Delete { matching: MatchExpr },
}

/// Outcome of one compute step.
#[derive(Debug, Clone, PartialEq)]
pub enum ComputationResult {
    /// The new value for a global or property context.
    Value(Value),
    /// Record writes for an entity, relation or property context.
    Patches(Vec<RecordPatch>),
    /// Incremental state cannot absorb the event; recompute from scratch.
    FullRecompute(String),
    /// Suspend until an external result arrives. Carries the task arguments.
    Async(Value),
    /// Nothing changes.
    Skip,
}

impl ComputationResult {
    pub fn full_recompute(reason: impl Into<String>) -> Self {
        ComputationResult::FullRecompute(reason.into())
    }
}

impl From<Value> for ComputationResult {
    fn from(value: Value) -> Self {
        ComputationResult::Value(value)
    }
}

/// The declarative computation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComputationKind {
    Count,
    Summation,
    Average,
    Every,
    Any,
    WeightedSummation,
    StateMachine,
    Transform,
    Custom,
}

impl fmt::Display for ComputationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A computation declared on a dictionary, property, entity or relation.
#[derive(Debug, Clone)]
pub enum Computation {
    Count(Count),
    Summation(Summation),
    Average(Average),
    Every(Every),
    Any(Any),
    WeightedSummation(WeightedSummation),
    StateMachine(StateMachine),
    Transform(Transform),
    Custom(Custom),
}

impl Computation {
    pub fn kind(&self) -> ComputationKind {
        match self {
            Computation::Count(_) => ComputationKind::Count,
            Computation::Summation(_) => ComputationKind::Summation,
            Computation::Average(_) => ComputationKind::Average,
            Computation::Every(_) => ComputationKind::Every,
            Computation::Any(_) => ComputationKind::Any,
            Computation::WeightedSummation(_) => ComputationKind::WeightedSummation,
            Computation::StateMachine(_) => ComputationKind::StateMachine,
            Computation::Transform(_) => ComputationKind::Transform,
            Computation::Custom(_) => ComputationKind::Custom,
        }
    }
}

impl From<Count> for Computation {
    fn from(def: Count) -> Self {
        Computation::Count(def)
    }
}

impl From<Summation> for Computation {
    fn from(def: Summation) -> Self {
        Computation::Summation(def)
    }
}

impl From<Average> for Computation {
    fn from(def: Average) -> Self {
        Computation::Average(def)
    }
}

impl From<Every> for Computation {
    fn from(def: Every) -> Self {
        Computation::Every(def)
    }
}

impl From<Any> for Computation {
    fn from(def: Any) -> Self {
        Computation::Any(def)
    }
}

impl From<WeightedSummation> for Computation {
    fn from(def: WeightedSummation) -> Self {
        Computation::WeightedSummation(def)
    }
}

impl From<StateMachine> for Computation {
    fn from(def: StateMachine) -> Self {
        Computation::StateMachine(def)
    }
}

impl From<Transform> for Computation {
    fn from(def: Transform) -> Self {
        Computation::Transform(def)
    }
}

impl From<Custom> for Computation {
    fn from(def: Custom) -> Self {
        Computation::Custom(def)
    }
}

/// Everything a handle factory gets.
pub struct HandleArgs<'a> {
    pub id: NodeId,
    pub schema: &'a Schema,
    pub computation: &'a Computation,
    pub context: DataContext,
}

impl HandleArgs<'_> {
    pub fn label(&self) -> String {
        self.context.label()
    }

    /// Error for a factory handed a definition of another kind.
    pub(crate) fn wrong_kind(&self) -> EngineError {
        EngineError::UnregisteredHandle {
            kind: self.computation.kind().to_string(),
            context: self.context.kind().to_string(),
        }
    }
}

/// Read access handed to a handle for one compute step.
pub struct ComputeContext<'a> {
    pub store: &'a dyn RecordStore,
    pub states: &'a BoundStateStore,
    pub schema: &'a Schema,
    /// The host record of a property computation, with every own field.
    pub host: Option<&'a Record>,
    host_name: Option<&'a str>,
    deps: &'a IndexMap<String, DataDep>,
}

impl<'a> ComputeContext<'a> {
    pub fn new(
        store: &'a dyn RecordStore,
        states: &'a BoundStateStore,
        schema: &'a Schema,
        deps: &'a IndexMap<String, DataDep>,
    ) -> Self {
        Self {
            store,
            states,
            schema,
            host: None,
            host_name: None,
            deps,
        }
    }

    /// Bind the step to host record `record` of `record_name`.
    pub fn with_host(mut self, record_name: &'a str, record: &'a Record) -> Self {
        self.host_name = Some(record_name);
        self.host = Some(record);
        self
    }

    fn dep(&self, name: &str) -> Result<&'a DataDep> {
        self.deps
            .get(name)
            .ok_or_else(|| EngineError::UndeclaredDep(name.to_string()))
    }

    /// Every record of a `Records` dependency.
    pub fn records(&self, name: &str) -> Result<Vec<Record>> {
        match self.dep(name)? {
            DataDep::Records { source, query } => {
                Ok(self.store.find(source, &MatchExpr::All, &Modifier::default(), query)?)
            }
            _ => Err(EngineError::UndeclaredDep(name.to_string())),
        }
    }

    /// The host projected through a `Property` dependency. `None` once the host
    /// is gone.
    pub fn property(&self, name: &str) -> Result<Option<Record>> {
        let DataDep::Property { query } = self.dep(name)? else {
            return Err(EngineError::UndeclaredDep(name.to_string()));
        };
        let (Some(record_name), Some(id)) = (self.host_name, self.host.and_then(Record::id)) else {
            return Err(EngineError::UndeclaredDep(name.to_string()));
        };
        Ok(self.store.find_one(record_name, &MatchExpr::id(id), query)?)
    }

    /// The value of a `Global` dependency. A slot never written reads as null.
    pub fn global(&self, name: &str) -> Result<Value> {
        match self.dep(name)? {
            DataDep::Global { dictionary } => Ok(self.store.dict_get(dictionary)?.unwrap_or(Value::Null)),
            _ => Err(EngineError::UndeclaredDep(name.to_string())),
        }
    }
}

/// A computation bound to its data context.
///
/// Handles are built once at setup and shared by reference; any memory they
/// need between steps lives in bound state.
pub trait ComputationHandle: Send + Sync {
    fn data_context(&self) -> &DataContext;

    fn data_deps(&self) -> &IndexMap<String, DataDep>;

    /// Whether `incremental_compute` wants the last stored value.
    fn use_last_value(&self) -> bool {
        true
    }

    /// Initialise bound state cells. Existing cells are left alone so restored
    /// state survives a restart.
    fn create_state(&self, _states: &BoundStateStore) -> Result<()> {
        Ok(())
    }

    fn compute(&self, cx: &ComputeContext<'_>) -> Result<ComputationResult>;

    fn incremental_compute(
        &self,
        _cx: &ComputeContext<'_>,
        _last_value: &Value,
        _event: &MutationEvent,
    ) -> Result<ComputationResult> {
        Ok(ComputationResult::full_recompute("no incremental path"))
    }

    fn async_return(&self, _cx: &ComputeContext<'_>, _result: Value, _args: &Value) -> Result<ComputationResult> {
        Err(EngineError::AsyncUnsupported(self.data_context().label()))
    }
}
