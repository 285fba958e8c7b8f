//! Filtered Entity Membership
//!
//! A filtered entity has no table of its own. Its members are the base records
//! satisfying its predicate, and its events are derived from base events by
//! comparing membership before and after each change.

use std::sync::Arc;

use crate::schema::Schema;

use super::record::{MutationEvent, MutationKind};

/// Derives synthetic mutation events for filtered entities.
#[derive(Debug, Clone)]
pub struct FilteredEntityManager {
    schema: Arc<Schema>,
}

impl FilteredEntityManager {
    pub fn new(schema: Arc<Schema>) -> Self {
        Self { schema }
    }

    /// Events on filtered entities caused by `event` on their base.
    ///
    /// `next_seq` hands out sequence numbers for the synthetic events.
    pub fn derive(&self, event: &MutationEvent, mut next_seq: impl FnMut() -> u64) -> Vec<MutationEvent> {
        let mut derived = Vec::new();
        for filtered in self.schema.filters_of(&event.record_name) {
            let now = filtered.predicate.matches(&event.record);
            let before = event
                .old_record
                .as_ref()
                .is_some_and(|old| filtered.predicate.matches(old));

            let kind = match event.kind {
                MutationKind::Create if now => Some(MutationKind::Create),
                MutationKind::Delete if now => Some(MutationKind::Delete),
                MutationKind::Update => match (before, now) {
                    (false, true) => Some(MutationKind::Create),
                    (true, false) => Some(MutationKind::Delete),
                    (true, true) => Some(MutationKind::Update),
                    (false, false) => None,
                },
                _ => None,
            };

            if let Some(kind) = kind {
                let record = match kind {
                    // A record leaving the view is reported as it was while a member.
                    MutationKind::Delete => event.old_record.clone().unwrap_or_else(|| event.record.clone()),
                    _ => event.record.clone(),
                };
                let mut synthetic = MutationEvent::new(next_seq(), kind, filtered.name.clone(), record);
                if kind == MutationKind::Update {
                    synthetic.old_record = event.old_record.clone();
                }
                derived.push(synthetic);
            }
        }
        derived
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Entity, FilteredEntity, Property};
    use crate::store::{MatchExpr, Record};
    use serde_json::json;

    fn manager() -> FilteredEntityManager {
        let schema = Schema::builder()
            .entity(Entity::new("Request").property(Property::new("handled")))
            .filtered_entity(FilteredEntity::new(
                "HandledRequest",
                "Request",
                MatchExpr::eq("handled", true),
            ))
            .build()
            .unwrap();
        FilteredEntityManager::new(Arc::new(schema))
    }

    fn request(handled: bool) -> Record {
        Record::from_value(json!({"id": 1, "handled": handled})).unwrap()
    }

    #[test]
    fn membership_changes_become_create_and_delete() {
        let manager = manager();
        let mut seq = 100;
        let mut next = || {
            seq += 1;
            seq
        };

        let created = MutationEvent::new(1, MutationKind::Create, "Request", request(false));
        assert!(manager.derive(&created, &mut next).is_empty());

        let joined = MutationEvent::new(2, MutationKind::Update, "Request", request(true)).with_old_record(request(false));
        let derived = manager.derive(&joined, &mut next);
        assert_eq!(derived.len(), 1);
        assert_eq!(derived[0].kind, MutationKind::Create);
        assert_eq!(derived[0].record_name, "HandledRequest");
        assert_eq!(derived[0].seq, 101);

        let left = MutationEvent::new(3, MutationKind::Update, "Request", request(false)).with_old_record(request(true));
        let derived = manager.derive(&left, &mut next);
        assert_eq!(derived[0].kind, MutationKind::Delete);
        assert_eq!(derived[0].record.get("handled"), Some(&json!(true)));
    }

    #[test]
    fn deleting_a_member_deletes_from_view() {
        let manager = manager();
        let deleted = MutationEvent::new(5, MutationKind::Delete, "Request", request(true));
        let derived = manager.derive(&deleted, || 9);
        assert_eq!(derived.len(), 1);
        assert_eq!(derived[0].kind, MutationKind::Delete);
    }
}
