//! Propagation
//!
//! One pass drains a FIFO queue of mutation events. For each event the
//! controller collects the deliveries (computation, event, host) its sources
//! ask for, runs them in dependency rank order, and appends whatever the
//! results write to the end of the queue. The pass ends when the queue is
//! empty, or fails once it has processed `max_cascade_events` events.
//!
//! Events about related records are relayed to each root record reached by
//! walking the relation hops backwards, with the attribute path attached. A
//! relation row update that only touches the row's own fields carries `&` as
//! its last segment.

use std::collections::{HashSet, VecDeque};

use serde_json::{Map, Value};
use tracing::{debug, debug_span, trace};

use crate::computation::{ComputationResult, DataContext, RecordPatch};
use crate::error::{EngineError, Result};
use crate::schema::{RelationLink, DICTIONARY_RECORD};
use crate::store::{
    AttributeQuery, MatchExpr, Modifier, MutationEvent, MutationKind, Record, RecordId, RecordStore, RelatedPath,
    LINK_SYMBOL,
};

use super::routing::{dictionary_key, touches, Hop, Route};
use super::{Controller, Slot};

enum Work {
    /// Fold one event into the computation's current value.
    Incremental(MutationEvent),
    /// A new host appeared; compute its value from scratch.
    Compute,
}

struct Delivery {
    slot: usize,
    host: Option<Record>,
    /// The record the delivery is about, for deduplication.
    subject: Option<RecordId>,
    seq: u64,
    work: Work,
}

impl<S: RecordStore> Controller<S> {
    /// Drain `initial` and everything it causes. Returns every processed event.
    pub(super) fn propagate(&self, initial: Vec<MutationEvent>) -> Result<Vec<MutationEvent>> {
        let span = debug_span!("propagate", initial = initial.len());
        let _guard = span.enter();

        let mut queue: VecDeque<MutationEvent> = initial.into();
        let mut processed = Vec::new();
        let mut delivered: HashSet<(usize, u64, Option<RecordId>)> = HashSet::new();

        while let Some(event) = queue.pop_front() {
            if processed.len() >= self.config.max_cascade_events {
                return Err(EngineError::CascadeLimit {
                    limit: self.config.max_cascade_events,
                });
            }
            trace!(seq = event.seq, kind = ?event.kind, record = %event.record_name, "event");

            let mut produced = Vec::new();
            for delivery in self.deliveries(&event)? {
                let key = (delivery.slot, delivery.seq, delivery.subject);
                if self.config.dedupe_deliveries && !delivered.insert(key) {
                    continue;
                }
                self.run(delivery, &mut produced)?;
            }
            processed.push(event);
            queue.extend(produced);
        }

        for event in &processed {
            self.release(event);
        }
        Ok(processed)
    }

    /// Drop bound state and pending tasks of a record deleted for good.
    fn release(&self, event: &MutationEvent) {
        if event.kind != MutationKind::Delete
            || event.record_name == DICTIONARY_RECORD
            || self.schema.filtered_entity(&event.record_name).is_some()
        {
            return;
        }
        let Some(id) = event.record.id() else { return };
        let cells = self.states.forget_record(id);
        let tasks = self.states.drop_tasks_of_host(id);
        if cells > 0 || !tasks.is_empty() {
            debug!(record = %event.record_name, %id, cells, ?tasks, "released bound state");
        }
    }

    fn deliveries(&self, event: &MutationEvent) -> Result<Vec<Delivery>> {
        let mut deliveries = Vec::new();

        for (index, slot) in self.slots.iter().enumerate() {
            let own = slot.own_field();

            if let Some((host, _)) = own {
                if event.kind == MutationKind::Create && event.record_name == host {
                    if let Some(id) = event.record.id() {
                        if let Some(record) = self.fetch(host, id)? {
                            deliveries.push(Delivery {
                                slot: index,
                                host: Some(record),
                                subject: Some(id),
                                seq: event.seq,
                                work: Work::Compute,
                            });
                        }
                    }
                    continue;
                }
            }

            let ignore = own
                .filter(|(host, _)| self.schema.base_record(&event.record_name) == *host)
                .map(|(_, property)| property);

            for source in slot.sources.iter().filter(|s| s.record_name == event.record_name) {
                match &source.route {
                    Route::Direct { watched } => {
                        if touches(event, watched, ignore) {
                            deliveries.push(Delivery {
                                slot: index,
                                host: None,
                                subject: event.record.id(),
                                seq: event.seq,
                                work: Work::Incremental(event.clone()),
                            });
                        }
                    }
                    Route::Host { watched } => {
                        if event.kind != MutationKind::Update || !touches(event, watched, ignore) {
                            continue;
                        }
                        let Some(id) = event.record.id() else { continue };
                        if let Some(record) = self.fetch(&source.record_name, id)? {
                            deliveries.push(Delivery {
                                slot: index,
                                host: Some(record),
                                subject: Some(id),
                                seq: event.seq,
                                work: Work::Incremental(event.clone()),
                            });
                        }
                    }
                    Route::Dictionary { key } => {
                        if dictionary_key(event) == Some(key.as_str()) {
                            deliveries.push(Delivery {
                                slot: index,
                                host: None,
                                subject: event.record.id(),
                                seq: event.seq,
                                work: Work::Incremental(event.clone()),
                            });
                        }
                    }
                    Route::Hops {
                        root,
                        hops,
                        row,
                        watched,
                        bound,
                    } => {
                        let Some(path) = relay_path(event, hops, *row, watched, ignore) else {
                            continue;
                        };
                        for root_id in self.roots(hops, *row, &event.record)? {
                            let Some(root_record) = self.fetch(root, root_id)? else { continue };
                            let relayed = event.relayed(root, root_record.clone(), path.clone());
                            deliveries.push(Delivery {
                                slot: index,
                                host: bound.then_some(root_record),
                                subject: Some(root_id),
                                seq: event.seq,
                                work: Work::Incremental(relayed),
                            });
                        }
                    }
                }
            }
        }

        deliveries.sort_by_key(|delivery| self.rank(self.slots[delivery.slot].id));
        Ok(deliveries)
    }

    fn fetch(&self, record_name: &str, id: RecordId) -> Result<Option<Record>> {
        Ok(self
            .store
            .find_one(record_name, &MatchExpr::id(id), &AttributeQuery::all())?)
    }

    /// Records at the near side of `hops` that reach `record`, deduplicated.
    fn roots(&self, hops: &[Hop], row: bool, record: &Record) -> Result<Vec<RecordId>> {
        let Some((last, above)) = hops.split_last() else {
            return Ok(Vec::new());
        };
        let Some(link) = last.link(&self.schema) else {
            return Ok(Vec::new());
        };

        let mut ids = if row {
            link.near_ends(record)
        } else {
            match record.id() {
                Some(id) => self.reaching(&link, id)?,
                None => Vec::new(),
            }
        };
        for hop in above.iter().rev() {
            let Some(link) = hop.link(&self.schema) else {
                return Ok(Vec::new());
            };
            let mut next = Vec::new();
            for id in ids {
                next.extend(self.reaching(&link, id)?);
            }
            ids = next;
        }

        let mut seen = HashSet::new();
        ids.retain(|id| seen.insert(*id));
        Ok(ids)
    }

    /// Hosts linked to `far` through `link`.
    fn reaching(&self, link: &RelationLink<'_>, far: RecordId) -> Result<Vec<RecordId>> {
        let rows = self.store.find_relation_by_endpoint(
            &link.relation.name,
            far,
            &AttributeQuery::fields(["source", "target"]),
        )?;
        Ok(rows.iter().flat_map(|row| link.hosts_reaching(row, far)).collect())
    }

    fn run(&self, delivery: Delivery, produced: &mut Vec<MutationEvent>) -> Result<()> {
        let slot = &self.slots[delivery.slot];
        let host = delivery.host.as_ref();

        let event = match delivery.work {
            Work::Compute => return self.compute_into(slot, host, produced),
            Work::Incremental(event) => event,
        };

        let cx = self.context_for(slot, host, &self.states);
        let last_value = if slot.handle.use_last_value() {
            self.last_value(slot, host)?
        } else {
            Value::Null
        };
        match slot.handle.incremental_compute(&cx, &last_value, &event)? {
            ComputationResult::FullRecompute(reason) => {
                debug!(computation = %slot.label, %reason, "full recompute");
                match (slot.context(), host) {
                    (DataContext::Property { host: host_name, .. }, None) => {
                        for record in self.hosts(host_name)? {
                            self.compute_into(slot, Some(&record), produced)?;
                        }
                        Ok(())
                    }
                    _ => self.compute_into(slot, host, produced),
                }
            }
            result => self.apply(slot, host, result, produced),
        }
    }

    fn last_value(&self, slot: &Slot, host: Option<&Record>) -> Result<Value> {
        Ok(match (slot.context(), host) {
            (DataContext::Global { dictionary }, _) => self.store.dict_get(dictionary)?.unwrap_or(Value::Null),
            (DataContext::Property { property, .. }, Some(record)) => {
                record.get(property).cloned().unwrap_or(Value::Null)
            }
            _ => Value::Null,
        })
    }

    pub(super) fn compute_into(
        &self,
        slot: &Slot,
        host: Option<&Record>,
        produced: &mut Vec<MutationEvent>,
    ) -> Result<()> {
        let cx = self.context_for(slot, host, &self.states);
        match slot.handle.compute(&cx)? {
            ComputationResult::FullRecompute(reason) => {
                Err(EngineError::RecomputeLoop(format!("{}: {reason}", slot.label)))
            }
            result => self.apply(slot, host, result, produced),
        }
    }

    /// Write a result into the computation's data context.
    pub(super) fn apply(
        &self,
        slot: &Slot,
        host: Option<&Record>,
        result: ComputationResult,
        events: &mut Vec<MutationEvent>,
    ) -> Result<()> {
        let invalid = |detail: &str| EngineError::InvalidResult {
            computation: slot.label.clone(),
            detail: detail.to_string(),
        };

        match result {
            ComputationResult::Skip => Ok(()),
            ComputationResult::FullRecompute(reason) => {
                Err(EngineError::RecomputeLoop(format!("{}: {reason}", slot.label)))
            }
            ComputationResult::Async(args) => {
                let host = match slot.own_field() {
                    Some((name, _)) => host.and_then(Record::id).map(|id| (name.to_string(), id)),
                    None => None,
                };
                let task = self.states.push_task(slot.id, host, args);
                debug!(computation = %slot.label, task, "suspended on async task");
                Ok(())
            }
            ComputationResult::Value(value) => match slot.context() {
                DataContext::Global { dictionary } => {
                    if self.config.skip_unchanged_writes && self.store.dict_get(dictionary)?.as_ref() == Some(&value) {
                        return Ok(());
                    }
                    Ok(self.store.dict_set(dictionary, value, events)?)
                }
                DataContext::Property { host: host_name, property } => {
                    let id = host.and_then(Record::id).ok_or_else(|| invalid("property value without a host"))?;
                    let current = self
                        .store
                        .find_one(host_name, &MatchExpr::id(id), &AttributeQuery::fields([property.as_str()]))?;
                    let Some(current) = current else {
                        // Host deleted later in the same pass.
                        return Ok(());
                    };
                    if self.config.skip_unchanged_writes && current.get(property) == Some(&value) {
                        return Ok(());
                    }
                    let mut data = Map::new();
                    data.insert(property.clone(), value);
                    self.store.update(host_name, &MatchExpr::id(id), data, events)?;
                    Ok(())
                }
                DataContext::Entity { .. } | DataContext::Relation { .. } => {
                    Err(invalid("entity and relation computations return patches"))
                }
            },
            ComputationResult::Patches(patches) => {
                if matches!(slot.context(), DataContext::Global { .. }) {
                    return Err(invalid("a dictionary cannot take record patches"));
                }
                let target = slot.context().target_record().to_string();
                for patch in patches {
                    self.apply_patch(&target, patch, events)?;
                }
                Ok(())
            }
        }
    }

    fn apply_patch(&self, target: &str, patch: RecordPatch, events: &mut Vec<MutationEvent>) -> Result<()> {
        match patch {
            RecordPatch::Create { data } => {
                self.store.create(target, data, events)?;
            }
            RecordPatch::Update { matching, data } => {
                if self.config.skip_unchanged_writes {
                    let current = self
                        .store
                        .find(target, &matching, &Modifier::default(), &AttributeQuery::all())?;
                    let unchanged = current
                        .iter()
                        .all(|record| data.iter().all(|(key, value)| record.get(key) == Some(value)));
                    if unchanged {
                        return Ok(());
                    }
                }
                self.store.update(target, &matching, data, events)?;
            }
            RecordPatch::Delete { matching } => {
                self.store.delete(target, &matching, events)?;
            }
        }
        Ok(())
    }
}

/// Attribute path of `event` as seen from the root of `hops`, or `None` when
/// the event is of no interest to the route.
fn relay_path(
    event: &MutationEvent,
    hops: &[Hop],
    row: bool,
    watched: &Option<Vec<String>>,
    ignore: Option<&str>,
) -> Option<RelatedPath> {
    let mut path: RelatedPath = hops.iter().map(|hop| hop.attribute.clone()).collect();
    match (row, event.kind) {
        (true, MutationKind::Create | MutationKind::Delete) => Some(path),
        (true, MutationKind::Update) => touches(event, watched, None).then(|| {
            path.push(LINK_SYMBOL.to_string());
            path
        }),
        // A far record is linked and unlinked through row events.
        (false, MutationKind::Create | MutationKind::Delete) => None,
        (false, MutationKind::Update) => touches(event, watched, ignore).then_some(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::RelationSide;
    use serde_json::json;

    fn hops() -> Vec<Hop> {
        vec![Hop {
            attribute: "friends".into(),
            relation: "User_friends_friends_User".into(),
            side: RelationSide::Both,
        }]
    }

    #[test]
    fn row_updates_relay_through_the_link_segment() {
        let old = Record::from_value(json!({"id": 9, "source": 1, "target": 2, "since": 2020})).unwrap();
        let new = Record::from_value(json!({"id": 9, "source": 1, "target": 2, "since": 2021})).unwrap();
        let update = MutationEvent::new(3, MutationKind::Update, "User_friends_friends_User", new.clone())
            .with_old_record(old);

        let path = relay_path(&update, &hops(), true, &Some(vec!["since".into()]), None).unwrap();
        assert_eq!(path.as_slice(), ["friends", "&"]);
        assert!(relay_path(&update, &hops(), true, &Some(vec![]), None).is_none());

        let create = MutationEvent::new(4, MutationKind::Create, "User_friends_friends_User", new);
        let path = relay_path(&create, &hops(), true, &Some(vec![]), None).unwrap();
        assert_eq!(path.as_slice(), ["friends"]);
    }

    #[test]
    fn far_records_relay_only_updates() {
        let user = Record::from_value(json!({"id": 2, "age": 30})).unwrap();
        let create = MutationEvent::new(5, MutationKind::Create, "User", user);
        assert!(relay_path(&create, &hops(), false, &None, None).is_none());
    }
}
