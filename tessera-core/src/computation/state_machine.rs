//! StateMachine
//!
//! Moves a value between declared states when an interaction fires. The
//! machine listens to `_Interaction_` creates only; every other event is
//! ignored rather than answered with a full recompute, because the current
//! state cannot be re-derived from the records alone.
//!
//! | context  | state is                                       | targets        |
//! |----------|------------------------------------------------|----------------|
//! | global   | the dictionary slot                            | none           |
//! | property | the host property of each target record        | record ids     |
//! | entity   | fixed properties of the target record, or its absence | ids or seeds |
//! | relation | fixed properties of the row, or its absence    | source/target pairs |
//!
//! A transfer fires only when the current state equals its `from` state, and
//! at most one transfer fires per target and event.

use std::collections::HashSet;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::{Map, Value};
use tracing::trace;

use crate::controller::InteractionEvent;
use crate::error::{EngineError, Result};
use crate::schema::INTERACTION_RECORD;
use crate::store::{AttributeQuery, Fields, MatchExpr, MutationEvent, MutationKind, Record, RecordId};

use super::{
    Callback, Computation, ComputationHandle, ComputationResult, ComputeContext, DataContext, DataDep, HandleArgs,
    RecordPatch,
};

const INTERACTION_DEP: &str = "interaction";

/// A named state and the value that represents it.
///
/// For entity and relation machines the value is an object of fixed
/// properties, or a falsy value meaning "no such record".
#[derive(Debug, Clone, PartialEq)]
pub struct StateNode {
    pub name: String,
    pub value: Value,
}

impl StateNode {
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// What a transfer applies to.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    /// An existing record.
    Record(RecordId),
    /// The entity record whose fields equal `seed`; created with `seed` when
    /// the transfer brings it into existence.
    Seed(Fields),
    /// Relation rows for every `(source, target)` combination.
    Link { source: Vec<RecordId>, target: Vec<RecordId> },
}

impl Target {
    pub fn link(source: RecordId, target: RecordId) -> Self {
        Target::Link {
            source: vec![source],
            target: vec![target],
        }
    }

    fn pairs(&self) -> Vec<(RecordId, RecordId)> {
        match self {
            Target::Link { source, target } => source
                .iter()
                .flat_map(|s| target.iter().map(move |t| (*s, *t)))
                .collect(),
            _ => Vec::new(),
        }
    }
}

pub type TargetFn = Callback<dyn Fn(&InteractionEvent) -> Vec<Target> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct StateTransfer {
    /// Interaction name that fires the transfer.
    pub trigger: String,
    pub from: String,
    pub to: String,
    /// Resolves the records the transfer applies to. Required outside the
    /// global context.
    pub targets: Option<TargetFn>,
}

impl StateTransfer {
    pub fn new(trigger: impl Into<String>, from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            trigger: trigger.into(),
            from: from.into(),
            to: to.into(),
            targets: None,
        }
    }

    pub fn targeting(mut self, targets: impl Fn(&InteractionEvent) -> Vec<Target> + Send + Sync + 'static) -> Self {
        let targets: Arc<dyn Fn(&InteractionEvent) -> Vec<Target> + Send + Sync> = Arc::new(targets);
        self.targets = Some(Callback::from_arc(targets));
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct StateMachine {
    pub states: Vec<StateNode>,
    pub transfers: Vec<StateTransfer>,
    /// Name of the initial state. Defaults to the first declared state.
    pub default_state: Option<String>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(mut self, state: StateNode) -> Self {
        self.states.push(state);
        self
    }

    pub fn transfer(mut self, transfer: StateTransfer) -> Self {
        self.transfers.push(transfer);
        self
    }

    pub fn default_state(mut self, name: impl Into<String>) -> Self {
        self.default_state = Some(name.into());
        self
    }
}

/// A transfer with its state names resolved to values.
struct Transfer {
    trigger: String,
    from: Value,
    to: Value,
    targets: Option<TargetFn>,
}

impl Transfer {
    fn targets(&self, event: &InteractionEvent) -> Vec<Target> {
        self.targets.as_ref().map(|targets| targets(event)).unwrap_or_default()
    }
}

/// Falsy values stand for "no record".
fn is_present(value: &Value) -> bool {
    match value {
        Value::Null | Value::Bool(false) => false,
        Value::Number(n) => n.as_f64() != Some(0.0),
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

/// The fixed properties a state asserts. Non-object values assert none.
fn fixed_properties(value: &Value) -> Fields {
    match value {
        Value::Object(fields) => fields.clone(),
        _ => Map::new(),
    }
}

/// True when `record` holds every fixed property of `state`.
fn holds(record: &Record, state: &Value) -> bool {
    fixed_properties(state)
        .iter()
        .all(|(key, value)| record.get(key) == Some(value))
}

struct StateMachineHandle {
    label: String,
    context: DataContext,
    deps: IndexMap<String, DataDep>,
    values: Vec<Value>,
    default: Value,
    transfers: Vec<Transfer>,
}

pub(crate) fn handle(args: HandleArgs<'_>) -> Result<Box<dyn ComputationHandle>> {
    let Computation::StateMachine(def) = args.computation else {
        return Err(args.wrong_kind());
    };
    let label = args.label();

    let value_of = |name: &str| {
        def.states
            .iter()
            .find(|state| state.name == name)
            .map(|state| state.value.clone())
            .ok_or_else(|| EngineError::missing(label.clone(), format!("unknown state `{name}`")))
    };

    let default = match &def.default_state {
        Some(name) => value_of(name)?,
        None => def
            .states
            .first()
            .map(|state| state.value.clone())
            .ok_or_else(|| EngineError::missing(label.clone(), "a state machine needs at least one state"))?,
    };

    let needs_targets = !matches!(args.context, DataContext::Global { .. });
    let mut transfers = Vec::with_capacity(def.transfers.len());
    for transfer in &def.transfers {
        if needs_targets && transfer.targets.is_none() {
            return Err(EngineError::missing(
                label.clone(),
                format!("transfer on `{}` needs a target callback", transfer.trigger),
            ));
        }
        transfers.push(Transfer {
            trigger: transfer.trigger.clone(),
            from: value_of(&transfer.from)?,
            to: value_of(&transfer.to)?,
            targets: transfer.targets.clone(),
        });
    }

    let mut deps = IndexMap::new();
    deps.insert(
        INTERACTION_DEP.to_string(),
        DataDep::Records {
            source: INTERACTION_RECORD.to_string(),
            query: AttributeQuery::all(),
        },
    );

    Ok(Box::new(StateMachineHandle {
        label,
        context: args.context.clone(),
        deps,
        values: def.states.iter().map(|state| state.value.clone()).collect(),
        default,
        transfers,
    }))
}

impl StateMachineHandle {
    fn is_state(&self, value: &Value) -> bool {
        self.values.contains(value)
    }

    fn firing<'t>(&'t self, event: &'t InteractionEvent) -> impl Iterator<Item = &'t Transfer> + 't {
        self.transfers
            .iter()
            .filter(move |transfer| transfer.trigger == event.interaction_name)
    }

    fn step_global(&self, last_value: &Value, event: &InteractionEvent) -> ComputationResult {
        let current = if last_value.is_null() { &self.default } else { last_value };
        match self.firing(event).find(|transfer| transfer.from == *current) {
            Some(transfer) => ComputationResult::Value(transfer.to.clone()),
            None => ComputationResult::Skip,
        }
    }

    fn step_property(
        &self,
        cx: &ComputeContext<'_>,
        host: &str,
        property: &str,
        event: &InteractionEvent,
    ) -> Result<ComputationResult> {
        let query = AttributeQuery::fields([property]);
        let mut done = HashSet::new();
        let mut patches = Vec::new();

        for transfer in self.firing(event) {
            for target in transfer.targets(event) {
                let Target::Record(id) = target else { continue };
                if done.contains(&id) {
                    continue;
                }
                let Some(record) = cx.store.find_one(host, &MatchExpr::id(id), &query)? else {
                    continue;
                };
                let current = match record.get(property) {
                    None | Some(Value::Null) => &self.default,
                    Some(value) => value,
                };
                if *current != transfer.from {
                    continue;
                }
                done.insert(id);
                let mut data = Map::new();
                data.insert(property.to_string(), transfer.to.clone());
                patches.push(RecordPatch::Update {
                    matching: MatchExpr::id(id),
                    data,
                });
            }
        }
        Ok(patches_or_skip(patches))
    }

    /// Entity and relation machines. Each target is identified by a matcher,
    /// plus the data a newly created record starts with.
    fn step_existence(&self, cx: &ComputeContext<'_>, record_name: &str, event: &InteractionEvent) -> Result<ComputationResult> {
        let relation = matches!(self.context, DataContext::Relation { .. });
        let mut done: Vec<MatchExpr> = Vec::new();
        let mut patches = Vec::new();

        for transfer in self.firing(event) {
            let mut identities: Vec<(MatchExpr, Fields)> = Vec::new();
            for target in transfer.targets(event) {
                if relation {
                    for (source, target) in target.pairs() {
                        let mut seed = Map::new();
                        seed.insert("source".into(), source.into());
                        seed.insert("target".into(), target.into());
                        identities.push((MatchExpr::eq("source", source).and(MatchExpr::eq("target", target)), seed));
                    }
                    continue;
                }
                match target {
                    Target::Record(id) => identities.push((MatchExpr::id(id), Map::new())),
                    Target::Seed(seed) => {
                        let matcher = seed
                            .iter()
                            .fold(MatchExpr::All, |acc, (key, value)| acc.and(MatchExpr::eq(key.clone(), value.clone())));
                        identities.push((matcher, seed));
                    }
                    Target::Link { .. } => {}
                }
            }

            for (identity, seed) in identities {
                if done.contains(&identity) {
                    continue;
                }
                let existing = cx.store.find_one(record_name, &identity, &AttributeQuery::all())?;
                let in_from_state = match &existing {
                    None => !is_present(&transfer.from),
                    Some(record) => is_present(&transfer.from) && holds(record, &transfer.from),
                };
                if !in_from_state {
                    continue;
                }
                done.push(identity);

                let patch = match (existing.as_ref().and_then(Record::id), is_present(&transfer.to)) {
                    (Some(id), false) => RecordPatch::Delete {
                        matching: MatchExpr::id(id),
                    },
                    (Some(id), true) => RecordPatch::Update {
                        matching: MatchExpr::id(id),
                        data: fixed_properties(&transfer.to),
                    },
                    (None, true) => {
                        let mut data = seed;
                        data.extend(fixed_properties(&transfer.to));
                        RecordPatch::Create { data }
                    }
                    (None, false) => continue,
                };
                patches.push(patch);
            }
        }
        Ok(patches_or_skip(patches))
    }
}

fn patches_or_skip(patches: Vec<RecordPatch>) -> ComputationResult {
    if patches.is_empty() {
        ComputationResult::Skip
    } else {
        ComputationResult::Patches(patches)
    }
}

impl ComputationHandle for StateMachineHandle {
    fn data_context(&self) -> &DataContext {
        &self.context
    }

    fn data_deps(&self) -> &IndexMap<String, DataDep> {
        &self.deps
    }

    /// Keeps a valid stored state; anything else resets to the default.
    fn compute(&self, cx: &ComputeContext<'_>) -> Result<ComputationResult> {
        match &self.context {
            DataContext::Global { dictionary } => {
                let current = cx.store.dict_get(dictionary)?;
                Ok(match current {
                    Some(value) if self.is_state(&value) => ComputationResult::Skip,
                    _ => ComputationResult::Value(self.default.clone()),
                })
            }
            DataContext::Property { property, .. } => {
                let current = cx.host.and_then(|host| host.get(property));
                Ok(match current {
                    Some(value) if self.is_state(value) => ComputationResult::Skip,
                    _ => ComputationResult::Value(self.default.clone()),
                })
            }
            DataContext::Entity { .. } | DataContext::Relation { .. } => Ok(ComputationResult::Skip),
        }
    }

    fn incremental_compute(
        &self,
        cx: &ComputeContext<'_>,
        last_value: &Value,
        event: &MutationEvent,
    ) -> Result<ComputationResult> {
        if event.record_name != INTERACTION_RECORD || event.kind != MutationKind::Create {
            return Ok(ComputationResult::Skip);
        }
        let Some(interaction) = InteractionEvent::from_record(&event.record) else {
            return Ok(ComputationResult::Skip);
        };
        trace!(computation = %self.label, interaction = %interaction.interaction_name, "state machine trigger");

        match &self.context {
            DataContext::Global { .. } => Ok(self.step_global(last_value, &interaction)),
            DataContext::Property { host, property } => self.step_property(cx, host, property, &interaction),
            DataContext::Entity { entity } => self.step_existence(cx, entity, &interaction),
            DataContext::Relation { relation } => self.step_existence(cx, relation, &interaction),
        }
    }
}
