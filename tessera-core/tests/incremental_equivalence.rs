//! Incremental Equivalence Tests
//!
//! Drives a schema through a long pseudo-random sequence of mutations and
//! checks after every step that each incrementally maintained value equals
//! the value computed from scratch.

use serde_json::{json, Map, Value};

use tessera_core::computation::{Any, Average, Count, Every, Summation, Weighted, WeightedSummation};
use tessera_core::schema::{Cardinality, Dictionary, Entity, FilteredEntity, Property, Relation, Schema};
use tessera_core::state::BoundStateStore;
use tessera_core::store::{AttributeQuery, MatchExpr, MatchOp, Record, RecordId};
use tessera_core::{fields, Controller, EngineConfig};

const FRIENDS: &str = "User_friends_friends_User";
const DICTIONARIES: [&str; 6] = ["users", "adults", "totalAge", "meanAge", "allActive", "anyActive"];
const PROPERTIES: [&str; 3] = ["friendCount", "friendAge", "closeness"];

/// Deterministic linear congruential generator.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.0 >> 33
    }

    fn below(&mut self, n: usize) -> usize {
        (self.next() % n as u64) as usize
    }
}

fn active(user: &Record) -> bool {
    user.get("active") == Some(&json!(true))
}

fn schema() -> Schema {
    let age = || AttributeQuery::fields(["age"]);
    Schema::builder()
        .entity(
            Entity::new("User")
                .property(Property::new("age").with_default(0))
                .property(Property::new("active").with_default(true))
                .property(Property::computed("friendCount", Count::property("friends")))
                .property(Property::computed(
                    "friendAge",
                    Summation::property("friends").attribute_query(age()),
                ))
                .property(Property::computed(
                    "closeness",
                    WeightedSummation::property("friends")
                        .attribute_query(AttributeQuery::path(&["&", "level"]))
                        .weighing(|item| {
                            let level = item.lookup(&["&", "level"]).and_then(Value::as_f64).unwrap_or(0.0);
                            Weighted::new(level, 2.0)
                        }),
                )),
        )
        .relation(
            Relation::new("User", "friends", "User", "friends", Cardinality::ManyToMany)
                .property(Property::new("level").with_default(1)),
        )
        .filtered_entity(FilteredEntity::new(
            "Adult",
            "User",
            MatchExpr::cond("age", MatchOp::Ge, 18),
        ))
        .dictionary(Dictionary::computed("users", Count::record("User")))
        .dictionary(Dictionary::computed("adults", Count::record("Adult")))
        .dictionary(Dictionary::computed(
            "totalAge",
            Summation::record("User").attribute_query(age()),
        ))
        .dictionary(Dictionary::computed("meanAge", Average::record("User").attribute_query(age())))
        .dictionary(Dictionary::computed(
            "allActive",
            Every::record("User").matching(active).not_empty(true),
        ))
        .dictionary(Dictionary::computed("anyActive", Any::record("User").matching(active)))
        .build()
        .unwrap()
}

fn user_ids(controller: &Controller) -> Vec<RecordId> {
    controller
        .find("User", &MatchExpr::All, &AttributeQuery::new())
        .unwrap()
        .iter()
        .filter_map(|user| user.id())
        .collect()
}

fn row_ids(controller: &Controller) -> Vec<RecordId> {
    controller
        .find(FRIENDS, &MatchExpr::All, &AttributeQuery::new())
        .unwrap()
        .iter()
        .filter_map(|row| row.id())
        .collect()
}

fn pick(rng: &mut Lcg, ids: &[RecordId]) -> RecordId {
    ids[rng.below(ids.len())]
}

fn step(controller: &Controller, rng: &mut Lcg) {
    let users = user_ids(controller);
    let rows = row_ids(controller);
    match rng.below(7) {
        0 | 1 => {
            let age = rng.below(60);
            controller
                .create("User", fields(json!({"age": age, "active": rng.below(3) > 0})))
                .unwrap();
        }
        2 if users.len() >= 2 => {
            let (a, b) = (pick(rng, &users), pick(rng, &users));
            if a != b {
                let level = rng.below(4) + 1;
                controller
                    .add_relation(FRIENDS, a, b, fields(json!({"level": level})))
                    .unwrap();
            }
        }
        3 if !users.is_empty() => {
            let user = pick(rng, &users);
            let data = if rng.below(2) == 0 {
                json!({"age": rng.below(60)})
            } else {
                json!({"active": rng.below(2) == 0})
            };
            controller.update("User", &MatchExpr::id(user), fields(data)).unwrap();
        }
        4 if !rows.is_empty() => {
            let row = pick(rng, &rows);
            controller
                .update(FRIENDS, &MatchExpr::id(row), fields(json!({"level": rng.below(5)})))
                .unwrap();
        }
        5 if !rows.is_empty() => {
            controller.remove_relation(FRIENDS, &MatchExpr::id(pick(rng, &rows))).unwrap();
        }
        6 if users.len() > 3 => {
            controller.delete("User", &MatchExpr::id(pick(rng, &users))).unwrap();
        }
        _ => {
            controller.create("User", Map::new()).unwrap();
        }
    }
}

fn assert_consistent(controller: &Controller, round: usize) {
    for name in DICTIONARIES {
        assert_eq!(
            controller.dictionary(name).unwrap(),
            controller.fresh_dictionary_value(name).unwrap(),
            "dictionary {name} diverged in round {round}"
        );
    }
    for user in controller.find("User", &MatchExpr::All, &AttributeQuery::all()).unwrap() {
        let id = user.id().unwrap();
        for property in PROPERTIES {
            assert_eq!(
                user.get(property).cloned().unwrap_or(Value::Null),
                controller.fresh_property_value("User", id, property).unwrap(),
                "User#{id}.{property} diverged in round {round}"
            );
        }
    }
}

/// Test that incremental results match recomputation over random mutations.
#[test]
fn incremental_matches_full_recompute() {
    for seed in [7, 42, 2024] {
        let mut controller = Controller::in_memory(schema());
        controller.setup().unwrap();
        let mut rng = Lcg(seed);

        for round in 0..150 {
            step(&controller, &mut rng);
            assert_consistent(&controller, round);
        }
    }
}

/// Test that a controller resumed from persisted bound state keeps every
/// value consistent as mutations continue.
#[test]
fn restored_bound_state_stays_consistent() {
    let mut controller = Controller::in_memory(schema());
    controller.setup().unwrap();
    let mut rng = Lcg(99);
    for _ in 0..40 {
        step(&controller, &mut rng);
    }

    let bytes = controller.states().to_bytes().unwrap();
    let cells = controller.states().len();
    let store = controller.into_store();

    let restored = BoundStateStore::from_bytes(&bytes).unwrap();
    assert_eq!(restored.len(), cells);
    let mut resumed = Controller::new(store.schema().clone(), store, EngineConfig::default()).with_states(restored);
    resumed.resume().unwrap();
    assert_consistent(&resumed, 40);

    for round in 41..160 {
        step(&resumed, &mut rng);
        assert_consistent(&resumed, round);
    }
}
