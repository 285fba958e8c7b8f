//! Aggregate Handles
//!
//! Count, Summation, Average, Every, Any and WeightedSummation share one
//! engine and differ only in their [`Accumulator`]: how one item contributes,
//! and how the running [`Totals`] turn into the visible value.
//!
//! # Bound State
//!
//! Every aggregate keeps
//!
//! - one `totals` cell (global, or per host record for the property flavor)
//! - one `contribution` cell per item, keyed by the item's id (the watched
//!   record for the global flavor, the relation row plus host for the
//!   property flavor)
//!
//! A delete subtracts the stored contribution, so the gone record is never
//! re-read. A create for an item that already has a contribution replaces it,
//! which keeps a re-delivered create from counting twice.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use tracing::trace;

use crate::error::{EngineError, Result};
use crate::schema::{RelationLink, RelationSide, Schema, SchemaError};
use crate::state::{BoundStateStore, GlobalBoundState, ItemBoundState, RecordBoundState};
use crate::store::{AttributeQuery, MatchExpr, MutationEvent, MutationKind, QueryNode, Record, RecordId, LINK_SYMBOL};

use super::path::match_related_path;
use super::{
    ComputationHandle, ComputationResult, ComputeContext, ContextKind, DataContext, DataDep, Direction, HandleArgs,
};

/// Name of the single data dependency every aggregate declares.
pub(crate) const MAIN_DEP: &str = "main";

/// What an aggregate watches.
#[derive(Debug, Clone, Default)]
pub struct AggregateSource {
    /// Record name watched by the global flavor.
    pub record: Option<String>,
    /// Relation attribute followed from each host by the property flavor.
    pub property: Option<String>,
    pub direction: Direction,
    /// Fields read from each item. For the property flavor the query is
    /// relative to the related record, and `&` reaches the relation row.
    pub attribute_query: AttributeQuery,
}

macro_rules! source_builders {
    ($def:ty) => {
        impl $def {
            /// Aggregate over every record of `record`.
            pub fn record(record: impl Into<String>) -> Self {
                let mut def = Self::default();
                def.source.record = Some(record.into());
                def
            }

            /// Aggregate, per host record, over the records reached through
            /// relation attribute `property`.
            pub fn property(property: impl Into<String>) -> Self {
                let mut def = Self::default();
                def.source.property = Some(property.into());
                def
            }

            pub fn direction(mut self, direction: $crate::computation::Direction) -> Self {
                self.source.direction = direction;
                self
            }

            pub fn attribute_query(mut self, query: $crate::store::AttributeQuery) -> Self {
                self.source.attribute_query = query;
                self
            }
        }
    };
}

pub(crate) use source_builders;

/// What one item adds to an aggregate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Contribution {
    pub matched: bool,
    pub amount: f64,
}

/// Running totals of an aggregate.
///
/// `sum` is kept with Neumaier compensation: `carry` holds the low-order bits
/// lost by each addition, so adding and later subtracting the same amounts
/// lands on the value a fresh pass over the remaining items gives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Totals {
    pub sum: f64,
    #[serde(default)]
    pub carry: f64,
    pub matched: u64,
    pub total: u64,
}

impl Totals {
    /// The compensated sum.
    pub fn amount(&self) -> f64 {
        self.sum + self.carry
    }

    fn accumulate(&mut self, value: f64) {
        let next = self.sum + value;
        if self.sum.abs() >= value.abs() {
            self.carry += (self.sum - next) + value;
        } else {
            self.carry += (value - next) + self.sum;
        }
        self.sum = next;
    }

    fn add(&mut self, contribution: &Contribution) {
        self.accumulate(contribution.amount);
        self.total += 1;
        if contribution.matched {
            self.matched += 1;
        }
    }

    fn remove(&mut self, contribution: &Contribution) {
        self.accumulate(-contribution.amount);
        self.total = self.total.saturating_sub(1);
        if contribution.matched {
            self.matched = self.matched.saturating_sub(1);
        }
        if self.total == 0 {
            self.sum = 0.0;
            self.carry = 0.0;
        }
    }

    /// Swap `old` for `new`; either may be absent.
    fn replace(&mut self, old: Option<Contribution>, new: Option<Contribution>) {
        if let Some(old) = old {
            self.remove(&old);
        }
        if let Some(new) = new {
            self.add(&new);
        }
    }
}

/// The part that differs between aggregate kinds.
pub(crate) trait Accumulator: Send + Sync {
    fn contribute(&self, item: &Record) -> Contribution;

    fn value(&self, totals: &Totals) -> Value;
}

/// JSON number for an aggregate result. Integral values stay integers.
pub(crate) fn number(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < 9.0e15 {
        Value::from(value as i64)
    } else {
        Number::from_f64(value).map(Value::Number).unwrap_or_else(|| Value::from(0))
    }
}

/// A finite number at `path`, if there is one.
pub(crate) fn finite_at<S: AsRef<str>>(item: &Record, path: &[S]) -> Option<f64> {
    item.lookup(path).and_then(Value::as_f64).filter(|n| n.is_finite())
}

/// Build the global or property flavor for `args.context`.
pub(crate) fn build<A: Accumulator + 'static>(
    args: &HandleArgs<'_>,
    source: &AggregateSource,
    accumulator: A,
) -> Result<Box<dyn ComputationHandle>> {
    match args.context.kind() {
        ContextKind::Global => Ok(Box::new(GlobalAggregate::new(args, source, accumulator)?)),
        ContextKind::Property => Ok(Box::new(PropertyAggregate::new(args, source, accumulator)?)),
        _ => Err(args.wrong_kind()),
    }
}

/// Split an item query into the related record's part and the relation row's part.
fn split_item_query(query: &AttributeQuery) -> (AttributeQuery, AttributeQuery) {
    let mut item = AttributeQuery::new();
    let mut own = AttributeQuery::new();
    for node in query.nodes() {
        match node {
            QueryNode::AllFields => item = item.merged(&AttributeQuery::all()),
            QueryNode::Field(name) => item = item.field(name.clone()),
            QueryNode::Nested { attribute, query } => item = item.nested(attribute.clone(), query.clone()),
            QueryNode::RelationOwnFields(query) => own = own.merged(query),
        }
    }
    (item, own)
}

/// Aggregate over every record of one record name, stored in a dictionary.
pub(crate) struct GlobalAggregate<A> {
    label: String,
    context: DataContext,
    record: String,
    query: AttributeQuery,
    deps: IndexMap<String, DataDep>,
    totals: GlobalBoundState<Totals>,
    items: ItemBoundState<Contribution>,
    accumulator: A,
}

impl<A: Accumulator> GlobalAggregate<A> {
    fn new(args: &HandleArgs<'_>, source: &AggregateSource, accumulator: A) -> Result<Self> {
        let record = source
            .record
            .clone()
            .ok_or_else(|| EngineError::missing(args.label(), "a global aggregate needs a `record` to watch"))?;
        if !args.schema.is_record_name(&record) {
            return Err(SchemaError::UnknownEntity(record).into());
        }

        let query = if source.attribute_query.is_empty() {
            AttributeQuery::all()
        } else {
            source.attribute_query.clone()
        };
        let mut deps = IndexMap::new();
        deps.insert(
            MAIN_DEP.to_string(),
            DataDep::Records {
                source: record.clone(),
                query: query.clone(),
            },
        );

        Ok(Self {
            label: args.label(),
            context: args.context.clone(),
            totals: GlobalBoundState::new(args.id, "totals", Totals::default()),
            items: ItemBoundState::new(args.id, "contribution", record.clone()),
            record,
            query,
            deps,
            accumulator,
        })
    }

    fn nests(&self, attribute: &str) -> bool {
        self.query.nested_nodes().any(|(nested, _)| nested == attribute)
    }
}

impl<A: Accumulator> ComputationHandle for GlobalAggregate<A> {
    fn data_context(&self) -> &DataContext {
        &self.context
    }

    fn data_deps(&self) -> &IndexMap<String, DataDep> {
        &self.deps
    }

    fn create_state(&self, states: &BoundStateStore) -> Result<()> {
        self.totals.init(states)
    }

    fn compute(&self, cx: &ComputeContext<'_>) -> Result<ComputationResult> {
        let records = cx.records(MAIN_DEP)?;
        self.items.clear(cx.states, None);

        let mut totals = Totals::default();
        for record in &records {
            let Some(id) = record.id() else { continue };
            let contribution = self.accumulator.contribute(record);
            self.items.set(cx.states, id, None, &contribution)?;
            totals.add(&contribution);
        }
        self.totals.set(cx.states, &totals)?;
        Ok(ComputationResult::Value(self.accumulator.value(&totals)))
    }

    fn incremental_compute(
        &self,
        cx: &ComputeContext<'_>,
        _last_value: &Value,
        event: &MutationEvent,
    ) -> Result<ComputationResult> {
        if event.record_name != self.record {
            return Ok(ComputationResult::full_recompute(format!(
                "{} does not watch `{}`",
                self.label, event.record_name
            )));
        }
        if let Some(first) = event.related_attribute.first() {
            if !self.nests(first) {
                return Ok(ComputationResult::full_recompute(format!(
                    "{} does not read related attribute `{first}`",
                    self.label
                )));
            }
        }
        let Some(id) = event.record.id() else {
            return Ok(ComputationResult::full_recompute("event record has no id"));
        };

        let old = self.items.get(cx.states, id, None)?;
        let new = if event.kind == MutationKind::Delete && event.related_attribute.is_empty() {
            None
        } else {
            cx.store
                .find_one(&self.record, &MatchExpr::id(id), &self.query)?
                .map(|record| self.accumulator.contribute(&record))
        };

        let mut totals = self.totals.get(cx.states)?;
        totals.replace(old, new);
        match new {
            Some(contribution) => self.items.set(cx.states, id, None, &contribution)?,
            None => {
                self.items.remove(cx.states, id, None)?;
            }
        }
        self.totals.set(cx.states, &totals)?;

        trace!(computation = %self.label, item = %id, ?totals, "aggregate step");
        Ok(ComputationResult::Value(self.accumulator.value(&totals)))
    }
}

/// Per-host aggregate over the records reached through one relation attribute.
pub(crate) struct PropertyAggregate<A> {
    label: String,
    context: DataContext,
    host: String,
    attribute: String,
    relation: String,
    related: String,
    side: RelationSide,
    item_query: AttributeQuery,
    own_query: AttributeQuery,
    deps: IndexMap<String, DataDep>,
    totals: RecordBoundState<Totals>,
    items: ItemBoundState<Contribution>,
    accumulator: A,
}

/// The side a host stands on, given the attribute's side and the requested
/// direction. `None` when they contradict each other.
fn resolve_side(side: RelationSide, direction: Direction) -> Option<RelationSide> {
    match (side, direction) {
        (side, Direction::Both) => Some(side),
        (RelationSide::Both | RelationSide::Source, Direction::Source) => Some(RelationSide::Source),
        (RelationSide::Both | RelationSide::Target, Direction::Target) => Some(RelationSide::Target),
        _ => None,
    }
}

/// Relation rows joining `host` and `far`, as seen from `side`.
fn rows_between(side: RelationSide, host: RecordId, far: RecordId) -> MatchExpr {
    let forward = MatchExpr::eq("source", host).and(MatchExpr::eq("target", far));
    let backward = MatchExpr::eq("source", far).and(MatchExpr::eq("target", host));
    match side {
        RelationSide::Source => forward,
        RelationSide::Target => backward,
        RelationSide::Both => forward.or(backward),
    }
}

fn related_items(projected: &Record, attribute: &str) -> Vec<Record> {
    match projected.get(attribute) {
        Some(Value::Array(items)) => items.iter().cloned().filter_map(Record::from_value).collect(),
        Some(item @ Value::Object(_)) => Record::from_value(item.clone()).into_iter().collect(),
        _ => Vec::new(),
    }
}

impl<A: Accumulator> PropertyAggregate<A> {
    fn new(args: &HandleArgs<'_>, source: &AggregateSource, accumulator: A) -> Result<Self> {
        let DataContext::Property { host, .. } = &args.context else {
            return Err(args.wrong_kind());
        };
        let attribute = source.property.clone().ok_or_else(|| {
            EngineError::missing(args.label(), "a property aggregate needs the relation attribute to follow")
        })?;
        let link = args.schema.require_link(host, &attribute)?;
        let side = resolve_side(link.side, source.direction).ok_or_else(|| {
            EngineError::missing(
                args.label(),
                format!("direction {:?} does not fit `{host}.{attribute}`", source.direction),
            )
        })?;

        let (item_query, own_query) = if source.attribute_query.is_empty() {
            (AttributeQuery::all(), AttributeQuery::all())
        } else {
            split_item_query(&source.attribute_query)
        };
        let own_query = AttributeQuery::fields(["source", "target"]).merged(&own_query);

        let mut deps = IndexMap::new();
        deps.insert(
            MAIN_DEP.to_string(),
            DataDep::Property {
                query: AttributeQuery::new().nested(
                    attribute.clone(),
                    item_query.clone().relation_fields(own_query.clone()),
                ),
            },
        );

        let relation = link.relation.name.clone();
        let related = RelationLink {
            relation: link.relation,
            side,
        }
        .related_entity()
        .to_string();

        Ok(Self {
            label: args.label(),
            context: args.context.clone(),
            totals: RecordBoundState::new(args.id, "totals", host.clone(), Totals::default()),
            items: ItemBoundState::new(args.id, "contribution", relation.clone()),
            host: host.clone(),
            attribute,
            relation,
            related,
            side,
            item_query,
            own_query,
            deps,
            accumulator,
        })
    }

    fn link<'s>(&self, schema: &'s Schema) -> Result<RelationLink<'s>> {
        let relation = schema
            .relation(&self.relation)
            .ok_or_else(|| SchemaError::UnknownRelationAttribute {
                entity: self.host.clone(),
                attribute: self.attribute.clone(),
            })?;
        Ok(RelationLink {
            relation,
            side: self.side,
        })
    }

    /// The related record reached through `row_id`, with the row under `&`.
    fn item_view(
        &self,
        cx: &ComputeContext<'_>,
        link: &RelationLink<'_>,
        row_id: RecordId,
        host_id: RecordId,
    ) -> Result<Option<Record>> {
        let Some(row) = cx.store.find_one(&self.relation, &MatchExpr::id(row_id), &self.own_query)? else {
            return Ok(None);
        };
        let Some(far) = link.far_ends(&row, host_id).first().copied() else {
            return Ok(None);
        };
        let Some(mut item) = cx.store.find_one(&self.related, &MatchExpr::id(far), &self.item_query)? else {
            return Ok(None);
        };
        item.set(LINK_SYMBOL, row.into_value());
        Ok(Some(item))
    }

    fn apply(
        &self,
        states: &BoundStateStore,
        totals: &mut Totals,
        row_id: RecordId,
        host_id: RecordId,
        new: Option<Contribution>,
    ) -> Result<()> {
        let old = self.items.get(states, row_id, Some(host_id))?;
        totals.replace(old, new);
        match new {
            Some(contribution) => self.items.set(states, row_id, Some(host_id), &contribution),
            None => self.items.remove(states, row_id, Some(host_id)).map(|_| ()),
        }
    }
}

impl<A: Accumulator> ComputationHandle for PropertyAggregate<A> {
    fn data_context(&self) -> &DataContext {
        &self.context
    }

    fn data_deps(&self) -> &IndexMap<String, DataDep> {
        &self.deps
    }

    fn compute(&self, cx: &ComputeContext<'_>) -> Result<ComputationResult> {
        let Some(host_id) = cx.host.and_then(Record::id) else {
            return Err(EngineError::InvalidResult {
                computation: self.label.clone(),
                detail: "property aggregate computed without a host".into(),
            });
        };
        let Some(projected) = cx.property(MAIN_DEP)? else {
            return Ok(ComputationResult::Skip);
        };
        let link = self.link(cx.schema)?;

        self.items.clear(cx.states, Some(host_id));
        let mut totals = Totals::default();
        for item in related_items(&projected, &self.attribute) {
            let Some(row) = item.get(LINK_SYMBOL).cloned().and_then(Record::from_value) else {
                continue;
            };
            let Some(row_id) = row.id() else { continue };
            // A symmetric relation lists rows from both ends; keep the requested direction.
            if link.far_ends(&row, host_id).is_empty() {
                continue;
            }
            let contribution = self.accumulator.contribute(&item);
            self.items.set(cx.states, row_id, Some(host_id), &contribution)?;
            totals.add(&contribution);
        }
        self.totals.set(cx.states, host_id, &totals)?;
        Ok(ComputationResult::Value(self.accumulator.value(&totals)))
    }

    fn incremental_compute(
        &self,
        cx: &ComputeContext<'_>,
        _last_value: &Value,
        event: &MutationEvent,
    ) -> Result<ComputationResult> {
        let Some(host_id) = cx.host.and_then(Record::id) else {
            return Ok(ComputationResult::full_recompute("no host record"));
        };
        if !match_related_path(event.related_attribute.as_slice(), &self.attribute).is_incremental() {
            return Ok(ComputationResult::full_recompute(format!(
                "{}: related path {:?} is not a single hop through `{}`",
                self.label,
                event.related_attribute.as_slice(),
                self.attribute
            )));
        }
        let Some(inner) = event.related_mutation_event.as_deref() else {
            return Ok(ComputationResult::full_recompute("relayed event lost its origin"));
        };
        let link = self.link(cx.schema)?;
        let mut totals = self.totals.get(cx.states, host_id)?;

        if inner.record_name == self.relation {
            let Some(row_id) = inner.record.id() else {
                return Ok(ComputationResult::full_recompute("relation row has no id"));
            };
            if link.far_ends(&inner.record, host_id).is_empty() {
                // The row joins the host on the other side.
                return Ok(ComputationResult::Skip);
            }
            let new = match inner.kind {
                MutationKind::Delete => None,
                _ => self
                    .item_view(cx, &link, row_id, host_id)?
                    .map(|item| self.accumulator.contribute(&item)),
            };
            self.apply(cx.states, &mut totals, row_id, host_id, new)?;
        } else if cx.schema.base_record(&inner.record_name) == self.related {
            let Some(far) = inner.record.id() else {
                return Ok(ComputationResult::full_recompute("related record has no id"));
            };
            let rows = cx.store.find_relation_by_name(
                &self.relation,
                &rows_between(self.side, host_id, far),
                &AttributeQuery::fields(["source", "target"]),
            )?;
            for row in rows {
                let Some(row_id) = row.id() else { continue };
                if !link.far_ends(&row, host_id).contains(&far) {
                    continue;
                }
                let new = self
                    .item_view(cx, &link, row_id, host_id)?
                    .map(|item| self.accumulator.contribute(&item));
                self.apply(cx.states, &mut totals, row_id, host_id, new)?;
            }
        } else {
            return Ok(ComputationResult::full_recompute(format!(
                "{} does not follow `{}`",
                self.label, inner.record_name
            )));
        }

        self.totals.set(cx.states, host_id, &totals)?;
        trace!(computation = %self.label, host = %host_id, ?totals, "aggregate step");
        Ok(ComputationResult::Value(self.accumulator.value(&totals)))
    }
}
