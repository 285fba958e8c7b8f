//! Controller
//!
//! The controller owns the record store, the bound state and one handle per
//! declared computation, and keeps every derived value in step with the data.
//!
//! # Lifecycle
//!
//! 1. [`Controller::new`] takes the schema, a store and an [`EngineConfig`]
//! 2. [`Controller::setup`] builds the handles, orders them into phases and
//!    computes every initial value. [`Controller::resume`] builds them over
//!    bound state persisted by an earlier controller instead.
//! 3. Each mutation ([`Controller::create`], [`Controller::call_interaction`],
//!    ...) runs in its own transaction: the write, then a propagation pass
//!    until no computation has anything left to do, then commit. Any error
//!    rolls back both the store and the bound state.
//!
//! Side effects run after commit and can never undo a call.

mod interaction;
mod propagate;
mod routing;

pub use interaction::{
    ActionFn, ConditionFn, ExecutionPhase, Interaction, InteractionCall, InteractionCallResponse, InteractionError,
    InteractionEvent, RecordMutationSideEffect, SideEffectFn, SideEffectOutcome,
};

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::computation::{
    Computation, ComputationHandle, ComputationResult, ComputeContext, DataContext, HandleArgs, HandleRegistry,
};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::graph::{DependencyGraph, NodeId, NodeKind, Phases};
use crate::schema::{Schema, SchemaError, INTERACTION_RECORD};
use crate::state::{BoundStateStore, PendingTask};
use crate::store::{
    AttributeQuery, Fields, MatchExpr, MemoryStore, Modifier, MutationEvent, Record, RecordId, RecordStore, StoreError,
};

use routing::{EventSource, Write};

/// One computation bound to its handle.
struct Slot {
    id: NodeId,
    label: String,
    handle: Box<dyn ComputationHandle>,
    sources: Vec<EventSource>,
    write: Write,
}

impl Slot {
    fn context(&self) -> &DataContext {
        self.handle.data_context()
    }

    /// The property this computation writes on its own host, if any.
    fn own_field(&self) -> Option<(&str, &str)> {
        match self.context() {
            DataContext::Property { host, property } => Some((host.as_str(), property.as_str())),
            _ => None,
        }
    }
}

/// Every computation declared in `schema`, in declaration order.
fn declarations(schema: &Schema) -> Vec<(DataContext, NodeKind, Computation)> {
    let mut declared = Vec::new();
    for dictionary in schema.dictionaries() {
        if let Some(computation) = &dictionary.computation {
            let context = DataContext::Global {
                dictionary: dictionary.name.clone(),
            };
            declared.push((context, NodeKind::Dictionary, computation.clone()));
        }
    }
    for entity in schema.entities() {
        if let Some(computation) = &entity.computation {
            let context = DataContext::Entity {
                entity: entity.name.clone(),
            };
            declared.push((context, NodeKind::Entity, computation.clone()));
        }
        for property in entity.properties.values() {
            if let Some(computation) = &property.computation {
                let context = DataContext::Property {
                    host: entity.name.clone(),
                    property: property.name.clone(),
                };
                declared.push((context, NodeKind::Property, computation.clone()));
            }
        }
    }
    for relation in schema.relations() {
        if let Some(computation) = &relation.computation {
            let context = DataContext::Relation {
                relation: relation.name.clone(),
            };
            declared.push((context, NodeKind::Relation, computation.clone()));
        }
        for property in relation.properties.values() {
            if let Some(computation) = &property.computation {
                let context = DataContext::Property {
                    host: relation.name.clone(),
                    property: property.name.clone(),
                };
                declared.push((context, NodeKind::Property, computation.clone()));
            }
        }
    }
    declared
}

/// Drives computations over a record store.
pub struct Controller<S: RecordStore = MemoryStore> {
    schema: Arc<Schema>,
    store: S,
    states: BoundStateStore,
    config: EngineConfig,
    registry: HandleRegistry,
    side_effects: Vec<RecordMutationSideEffect>,
    graph: DependencyGraph,
    slots: Vec<Slot>,
    ranks: HashMap<NodeId, usize>,
}

impl Controller<MemoryStore> {
    /// A controller over a fresh [`MemoryStore`] with the default config.
    pub fn in_memory(schema: Schema) -> Self {
        let schema = Arc::new(schema);
        let store = MemoryStore::new(schema.clone());
        Self::new(schema, store, EngineConfig::default())
    }
}

impl<S: RecordStore> Controller<S> {
    pub fn new(schema: Arc<Schema>, store: S, config: EngineConfig) -> Self {
        Self {
            schema,
            store,
            states: BoundStateStore::new(),
            config,
            registry: HandleRegistry::with_builtins(),
            side_effects: Vec::new(),
            graph: DependencyGraph::new(),
            slots: Vec::new(),
            ranks: HashMap::new(),
        }
    }

    /// Replace the handle registry. Must be called before [`Controller::setup`].
    pub fn with_registry(mut self, registry: HandleRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_side_effect(mut self, side_effect: RecordMutationSideEffect) -> Self {
        self.side_effects.push(side_effect);
        self
    }

    /// Start from previously persisted bound state.
    pub fn with_states(mut self, states: BoundStateStore) -> Self {
        self.states = states;
        self
    }

    /// Build every handle, order them and compute initial values.
    pub fn setup(&mut self) -> Result<()> {
        let phases = self.build()?;
        let order = phases.order();
        self.transact(|controller, events| {
            for dictionary in controller.schema.dictionaries() {
                if controller.store.dict_get(&dictionary.name)?.is_none() {
                    controller
                        .store
                        .dict_set(&dictionary.name, dictionary.default.clone(), events)?;
                }
            }
            for id in &order {
                let Some(slot) = controller.slot(*id) else { continue };
                controller.compute_initial(slot, events)?;
            }
            Ok(())
        })?;

        info!(
            computations = self.slots.len(),
            phases = phases.phases.len(),
            "controller ready"
        );
        Ok(())
    }

    /// Build every handle over records and bound state persisted by an earlier
    /// controller, recomputing nothing. The bound state comes in through
    /// [`Controller::with_states`] and must belong to the same schema.
    pub fn resume(&mut self) -> Result<()> {
        let phases = self.build()?;
        info!(
            computations = self.slots.len(),
            phases = phases.phases.len(),
            cells = self.states.len(),
            tasks = self.states.tasks().len(),
            "controller resumed"
        );
        Ok(())
    }

    fn build(&mut self) -> Result<Phases> {
        let mut graph = DependencyGraph::new();
        let mut slots = Vec::new();

        for (context, kind, computation) in declarations(&self.schema) {
            let label = context.label();
            let id = graph.add_node(kind, label.clone());
            let handle = self.registry.build(HandleArgs {
                id,
                schema: &self.schema,
                computation: &computation,
                context: context.clone(),
            })?;
            let sources = routing::sources_of(&self.schema, handle.as_ref())?;
            slots.push(Slot {
                id,
                label,
                handle,
                sources,
                write: Write::of(&context),
            });
        }

        for writer in &slots {
            for reader in &slots {
                if reader
                    .sources
                    .iter()
                    .any(|source| routing::reads(&self.schema, source, &writer.write))
                {
                    graph.add_edge(writer.id, reader.id);
                }
            }
        }

        let phases = graph.phases();
        if !phases.cyclic.is_empty() {
            let cyclic: Vec<&str> = phases
                .cyclic
                .iter()
                .filter_map(|id| graph.get_node(*id).map(|node| node.label()))
                .collect();
            warn!(?cyclic, "computations depend on each other; ordering them by declaration");
        }

        for slot in &slots {
            slot.handle.create_state(&self.states)?;
        }
        self.ranks = phases.ranks();
        self.graph = graph;
        self.slots = slots;
        Ok(phases)
    }

    fn slot(&self, id: NodeId) -> Option<&Slot> {
        usize::try_from(id.raw())
            .ok()
            .and_then(|index| self.slots.get(index))
            .filter(|slot| slot.id == id)
    }

    fn rank(&self, id: NodeId) -> usize {
        self.ranks.get(&id).copied().unwrap_or(usize::MAX)
    }

    /// Compute `slot` from scratch: once, or once per host for property
    /// computations.
    fn compute_initial(&self, slot: &Slot, events: &mut Vec<MutationEvent>) -> Result<()> {
        match slot.context() {
            DataContext::Property { host, .. } => {
                for record in self.hosts(host)? {
                    self.compute_into(slot, Some(&record), events)?;
                }
                Ok(())
            }
            _ => self.compute_into(slot, None, events),
        }
    }

    fn hosts(&self, host: &str) -> Result<Vec<Record>> {
        Ok(self
            .store
            .find(host, &MatchExpr::All, &Modifier::default(), &AttributeQuery::all())?)
    }

    fn context_for<'a>(
        &'a self,
        slot: &'a Slot,
        host: Option<&'a Record>,
        states: &'a BoundStateStore,
    ) -> ComputeContext<'a> {
        let cx = ComputeContext::new(&self.store, states, &self.schema, slot.handle.data_deps());
        match (slot.own_field(), host) {
            (Some((host_name, _)), Some(record)) => cx.with_host(host_name, record),
            _ => cx,
        }
    }

    /// Run `op` and propagate its events in one transaction.
    fn transact<T>(
        &self,
        op: impl FnOnce(&Self, &mut Vec<MutationEvent>) -> Result<T>,
    ) -> Result<(T, Vec<MutationEvent>)> {
        self.store.begin();
        self.states.begin();
        let mut events = Vec::new();

        let outcome = op(self, &mut events).and_then(|value| Ok((value, self.propagate(events)?)));
        match outcome {
            Ok(done) => {
                self.states.commit();
                self.store.commit()?;
                Ok(done)
            }
            Err(err) => {
                debug!(error = %err, "rolling back");
                self.states.rollback();
                self.store.rollback()?;
                Err(err)
            }
        }
    }

    pub fn create(&self, record_name: &str, data: Fields) -> Result<Record> {
        let (record, _) = self.transact(|c, events| Ok(c.store.create(record_name, data, events)?))?;
        Ok(record)
    }

    pub fn update(&self, record_name: &str, matcher: &MatchExpr, data: Fields) -> Result<Vec<Record>> {
        let (records, _) = self.transact(|c, events| Ok(c.store.update(record_name, matcher, data, events)?))?;
        Ok(records)
    }

    pub fn delete(&self, record_name: &str, matcher: &MatchExpr) -> Result<Vec<Record>> {
        let (records, _) = self.transact(|c, events| Ok(c.store.delete(record_name, matcher, events)?))?;
        Ok(records)
    }

    pub fn add_relation(&self, relation: &str, source: RecordId, target: RecordId, data: Fields) -> Result<Record> {
        let (row, _) = self.transact(|c, events| {
            Ok(c.store
                .add_relation_by_name_by_id(relation, source, target, data, events)?)
        })?;
        Ok(row)
    }

    pub fn remove_relation(&self, relation: &str, matcher: &MatchExpr) -> Result<Vec<Record>> {
        let (rows, _) = self.transact(|c, events| Ok(c.store.remove_relation_by_name(relation, matcher, events)?))?;
        Ok(rows)
    }

    pub fn set_dictionary(&self, name: &str, value: Value) -> Result<()> {
        self.transact(|c, events| Ok(c.store.dict_set(name, value, events)?))?;
        Ok(())
    }

    /// Run interaction `name`. Failures are reported on the response.
    pub fn call_interaction(&self, name: &str, call: InteractionCall) -> InteractionCallResponse {
        let mut response = InteractionCallResponse::default();
        let mut event = InteractionEvent::new(name, &call);
        let fail = |phase: ExecutionPhase, caused_by: String| InteractionError {
            interaction_name: name.to_string(),
            user_id: call.user.get("id").cloned(),
            payload: call.payload.clone(),
            execution_phase: phase,
            caused_by,
        };

        let Some(interaction) = self.schema.interaction(name) else {
            response.error = Some(fail(
                ExecutionPhase::Lookup,
                SchemaError::UnknownInteraction(name.to_string()).to_string(),
            ));
            return response;
        };

        let store: &dyn RecordStore = &self.store;
        for (condition, check) in interaction.conditions() {
            let rejection = match check(store, &event) {
                Ok(true) => continue,
                Ok(false) => format!("condition `{condition}` rejected the call"),
                Err(err) => format!("condition `{condition}` failed: {err}"),
            };
            response.error = Some(fail(ExecutionPhase::Condition, rejection));
            return response;
        }

        // Which phase a failure inside the transaction belongs to.
        let mut phase = ExecutionPhase::Action;
        let outcome = {
            let phase = &mut phase;
            let event = &mut event;
            self.transact(|c, events| {
                let record = c.store.create(INTERACTION_RECORD, event.to_fields(), events)?;
                event.id = record.id();
                if let Some(action) = interaction.action_fn() {
                    let store: &dyn RecordStore = &c.store;
                    action(store, &*event, events).map_err(|err| EngineError::callback(name, err))?;
                }
                *phase = ExecutionPhase::Computation;
                Ok(())
            })
        };

        match outcome {
            Ok(((), effects)) => {
                response.side_effects = self.run_side_effects(&effects);
                response.effects = effects;
                response.event = Some(event);
            }
            Err(err) => response.error = Some(fail(phase, err.to_string())),
        }
        response
    }

    fn run_side_effects(&self, effects: &[MutationEvent]) -> IndexMap<String, SideEffectOutcome> {
        let mut outcomes = IndexMap::new();
        for side_effect in &self.side_effects {
            let mut outcome = SideEffectOutcome::default();
            for event in effects.iter().filter(|e| e.record_name == side_effect.record_name) {
                match (side_effect.handler)(event) {
                    Ok(result) => outcome.results.push(result),
                    Err(err) => {
                        warn!(side_effect = %side_effect.name, error = %err, "side effect failed");
                        outcome.error.get_or_insert_with(|| err.to_string());
                    }
                }
            }
            outcomes.insert(side_effect.name.clone(), outcome);
        }
        outcomes
    }

    /// Resume the computation suspended as `task_id` with `result`.
    pub fn handle_async_return(&self, task_id: u64, result: Value) -> Result<Vec<MutationEvent>> {
        let task = self.states.task(task_id).ok_or(EngineError::UnknownTask(task_id))?;
        let slot = self
            .slot(task.computation)
            .ok_or(EngineError::UnknownTask(task_id))?;

        let ((), effects) = self.transact(|c, events| {
            c.states.take_task(task_id);
            let host = match &task.host {
                Some((name, id)) => match c.store.find_one(name, &MatchExpr::id(*id), &AttributeQuery::all())? {
                    Some(record) => Some(record),
                    // Orphaned by a delete that raced the external work.
                    None => return Ok(()),
                },
                None => None,
            };
            let cx = c.context_for(slot, host.as_ref(), &c.states);
            let outcome = slot.handle.async_return(&cx, result, &task.args)?;
            c.apply(slot, host.as_ref(), outcome, events)
        })?;
        Ok(effects)
    }

    pub fn pending_tasks(&self) -> Vec<PendingTask> {
        self.states.tasks()
    }

    /// Labels of the computations downstream of a pending async task.
    pub fn stalled_computations(&self) -> Vec<String> {
        let mut stalled: Vec<NodeId> = Vec::new();
        for task in self.states.tasks() {
            for id in self.graph.downstream(task.computation) {
                if !stalled.contains(&id) {
                    stalled.push(id);
                }
            }
        }
        stalled.sort_by_key(|id| (self.rank(*id), *id));
        stalled
            .into_iter()
            .filter_map(|id| self.slot(id).map(|slot| slot.label.clone()))
            .collect()
    }

    /// The value of dictionary `name` computed from scratch against throwaway
    /// bound state. Dictionaries without a computation report the stored value.
    pub fn fresh_dictionary_value(&self, name: &str) -> Result<Value> {
        let slot = self.slots.iter().find(
            |slot| matches!(slot.context(), DataContext::Global { dictionary } if dictionary == name),
        );
        match slot {
            Some(slot) => self.fresh_value(slot, None),
            None => self.dictionary(name),
        }
    }

    /// The value of `record_name.property` for record `id`, computed from
    /// scratch against throwaway bound state.
    pub fn fresh_property_value(&self, record_name: &str, id: RecordId, property: &str) -> Result<Value> {
        let host = self
            .store
            .find_one(record_name, &MatchExpr::id(id), &AttributeQuery::all())?
            .ok_or_else(|| StoreError::RecordNotFound {
                record: record_name.to_string(),
                id,
            })?;
        let slot = self.slots.iter().find(|slot| slot.own_field() == Some((record_name, property)));
        match slot {
            Some(slot) => self.fresh_value(slot, Some(&host)),
            None => Ok(host.get(property).cloned().unwrap_or(Value::Null)),
        }
    }

    fn fresh_value(&self, slot: &Slot, host: Option<&Record>) -> Result<Value> {
        let scratch = BoundStateStore::new();
        slot.handle.create_state(&scratch)?;
        let cx = self.context_for(slot, host, &scratch);
        match slot.handle.compute(&cx)? {
            ComputationResult::Value(value) => Ok(value),
            // Kept as stored, e.g. a state machine already in a valid state.
            ComputationResult::Skip => Ok(match host {
                Some(record) => slot
                    .own_field()
                    .and_then(|(_, property)| record.get(property).cloned())
                    .unwrap_or(Value::Null),
                None => match slot.context() {
                    DataContext::Global { dictionary } => self.dictionary(dictionary)?,
                    _ => Value::Null,
                },
            }),
            other => Err(EngineError::InvalidResult {
                computation: slot.label.clone(),
                detail: format!("no plain value to verify: {other:?}"),
            }),
        }
    }

    /// Current value of dictionary `name`, null when never written.
    pub fn dictionary(&self, name: &str) -> Result<Value> {
        Ok(self.store.dict_get(name)?.unwrap_or(Value::Null))
    }

    pub fn find(&self, record_name: &str, matcher: &MatchExpr, query: &AttributeQuery) -> Result<Vec<Record>> {
        Ok(self.store.find(record_name, matcher, &Modifier::default(), query)?)
    }

    pub fn find_one(&self, record_name: &str, matcher: &MatchExpr, query: &AttributeQuery) -> Result<Option<Record>> {
        Ok(self.store.find_one(record_name, matcher, query)?)
    }

    /// Tear the controller down, keeping its records.
    pub fn into_store(self) -> S {
        self.store
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn states(&self) -> &BoundStateStore {
        &self.states
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }
}

/// Shorthand for building record data in tests and examples.
pub fn fields(value: Value) -> Fields {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}
