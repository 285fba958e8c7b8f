//! Integration Tests for Aggregates
//!
//! These tests drive dictionaries and properties computed by the aggregate
//! kinds through ordinary record mutations.

use serde_json::{json, Map, Value};

use tessera_core::computation::{Any, Average, Count, Direction, Every, Summation, Weighted, WeightedSummation};
use tessera_core::schema::{Cardinality, Dictionary, Entity, FilteredEntity, Property, Relation, Schema};
use tessera_core::store::{AttributeQuery, MatchExpr, RecordId};
use tessera_core::{fields, Controller};

fn started(schema: Schema) -> Controller {
    let mut controller = Controller::in_memory(schema);
    controller.setup().unwrap();
    controller
}

fn id_of(controller: &Controller, record_name: &str, data: Value) -> RecordId {
    controller.create(record_name, fields(data)).unwrap().id().unwrap()
}

fn property(controller: &Controller, record_name: &str, id: RecordId, name: &str) -> Value {
    controller
        .find_one(record_name, &MatchExpr::id(id), &AttributeQuery::all())
        .unwrap()
        .and_then(|record| record.get(name).cloned())
        .unwrap_or(Value::Null)
}

/// Test that a count over a filtered entity follows records entering and
/// leaving the filter.
#[test]
fn count_follows_filtered_entity() {
    let schema = Schema::builder()
        .entity(Entity::new("Request").property(Property::new("handled").with_default(false)))
        .filtered_entity(FilteredEntity::new(
            "HandledRequest",
            "Request",
            MatchExpr::eq("handled", true),
        ))
        .dictionary(Dictionary::computed("handledCount", Count::record("HandledRequest")))
        .build()
        .unwrap();
    let controller = started(schema);
    assert_eq!(controller.dictionary("handledCount").unwrap(), json!(0));

    let first = id_of(&controller, "Request", json!({}));
    assert_eq!(controller.dictionary("handledCount").unwrap(), json!(0));

    controller
        .update("Request", &MatchExpr::id(first), fields(json!({"handled": true})))
        .unwrap();
    assert_eq!(controller.dictionary("handledCount").unwrap(), json!(1));

    id_of(&controller, "Request", json!({"handled": true}));
    assert_eq!(controller.dictionary("handledCount").unwrap(), json!(2));

    controller.delete("Request", &MatchExpr::id(first)).unwrap();
    assert_eq!(controller.dictionary("handledCount").unwrap(), json!(1));
}

/// Test that a predicate count re-evaluates an item when it changes.
#[test]
fn count_with_predicate_tracks_updates() {
    let schema = Schema::builder()
        .entity(Entity::new("Task").property(Property::new("priority")))
        .dictionary(Dictionary::computed(
            "urgent",
            Count::record("Task").matching(|task| task.get("priority") == Some(&json!("high"))),
        ))
        .build()
        .unwrap();
    let controller = started(schema);

    let task = id_of(&controller, "Task", json!({"priority": "low"}));
    id_of(&controller, "Task", json!({"priority": "high"}));
    assert_eq!(controller.dictionary("urgent").unwrap(), json!(1));

    controller
        .update("Task", &MatchExpr::id(task), fields(json!({"priority": "high"})))
        .unwrap();
    assert_eq!(controller.dictionary("urgent").unwrap(), json!(2));
    assert_eq!(controller.fresh_dictionary_value("urgent").unwrap(), json!(2));
}

fn tasks_schema() -> Schema {
    let done = |task: &tessera_core::store::Record| task.get("done") == Some(&json!(true));
    Schema::builder()
        .entity(Entity::new("Task").property(Property::new("done").with_default(false)))
        .dictionary(Dictionary::computed(
            "allDone",
            Every::record("Task").matching(done).not_empty(true),
        ))
        .dictionary(Dictionary::computed("vacuous", Every::record("Task").matching(done)))
        .dictionary(Dictionary::computed("anyDone", Any::record("Task").matching(done)))
        .build()
        .unwrap()
}

/// Test every and any, including the empty-set rule.
#[test]
fn every_and_any_over_tasks() {
    let controller = started(tasks_schema());
    assert_eq!(controller.dictionary("allDone").unwrap(), json!(false));
    assert_eq!(controller.dictionary("vacuous").unwrap(), json!(true));
    assert_eq!(controller.dictionary("anyDone").unwrap(), json!(false));

    let a = id_of(&controller, "Task", json!({}));
    let b = id_of(&controller, "Task", json!({"done": true}));
    assert_eq!(controller.dictionary("allDone").unwrap(), json!(false));
    assert_eq!(controller.dictionary("anyDone").unwrap(), json!(true));

    controller
        .update("Task", &MatchExpr::id(a), fields(json!({"done": true})))
        .unwrap();
    assert_eq!(controller.dictionary("allDone").unwrap(), json!(true));
    assert_eq!(controller.dictionary("vacuous").unwrap(), json!(true));

    controller.delete("Task", &MatchExpr::id(a)).unwrap();
    controller.delete("Task", &MatchExpr::id(b)).unwrap();
    assert_eq!(controller.dictionary("allDone").unwrap(), json!(false));
    assert_eq!(controller.dictionary("vacuous").unwrap(), json!(true));
    assert_eq!(controller.dictionary("anyDone").unwrap(), json!(false));
}

/// Test that a deleted item leaves the average without being re-read.
#[test]
fn average_survives_deletes() {
    let schema = Schema::builder()
        .entity(Entity::new("Score").property(Property::new("value")))
        .dictionary(Dictionary::computed(
            "mean",
            Average::record("Score").attribute_query(AttributeQuery::fields(["value"])),
        ))
        .build()
        .unwrap();
    let controller = started(schema);
    assert_eq!(controller.dictionary("mean").unwrap(), json!(0));

    let ten = id_of(&controller, "Score", json!({"value": 10}));
    let twenty = id_of(&controller, "Score", json!({"value": 20}));
    id_of(&controller, "Score", json!({"value": 30}));
    assert_eq!(controller.dictionary("mean").unwrap(), json!(20));

    controller.delete("Score", &MatchExpr::id(twenty)).unwrap();
    assert_eq!(controller.dictionary("mean").unwrap(), json!(20));

    controller.delete("Score", &MatchExpr::id(ten)).unwrap();
    assert_eq!(controller.dictionary("mean").unwrap(), json!(30));

    // Not a number: left out of the mean entirely.
    id_of(&controller, "Score", json!({"value": "n/a"}));
    assert_eq!(controller.dictionary("mean").unwrap(), json!(30));
}

/// Test that summation treats missing values as zero.
#[test]
fn summation_over_records() {
    let schema = Schema::builder()
        .entity(Entity::new("Expense").property(Property::new("amount")))
        .dictionary(Dictionary::computed(
            "total",
            Summation::record("Expense").attribute_query(AttributeQuery::fields(["amount"])),
        ))
        .build()
        .unwrap();
    let controller = started(schema);

    let lunch = id_of(&controller, "Expense", json!({"amount": 12.5}));
    id_of(&controller, "Expense", json!({"amount": 7.5}));
    id_of(&controller, "Expense", json!({}));
    assert_eq!(controller.dictionary("total").unwrap(), json!(20));

    controller
        .update("Expense", &MatchExpr::id(lunch), fields(json!({"amount": 2.25})))
        .unwrap();
    assert_eq!(controller.dictionary("total").unwrap(), json!(9.75));
}

/// Test that deleting a fractional amount leaves the same total a fresh sum
/// over the remaining records gives.
#[test]
fn fractional_summation_survives_deletes() {
    let schema = Schema::builder()
        .entity(Entity::new("Expense").property(Property::new("amount")))
        .dictionary(Dictionary::computed(
            "total",
            Summation::record("Expense").attribute_query(AttributeQuery::fields(["amount"])),
        ))
        .build()
        .unwrap();
    let controller = started(schema);

    let first = id_of(&controller, "Expense", json!({"amount": 0.1}));
    id_of(&controller, "Expense", json!({"amount": 0.2}));
    id_of(&controller, "Expense", json!({"amount": 0.3}));
    controller.delete("Expense", &MatchExpr::id(first)).unwrap();

    assert_eq!(controller.dictionary("total").unwrap(), json!(0.5));
    assert_eq!(controller.fresh_dictionary_value("total").unwrap(), json!(0.5));
}

/// Test a weighted sum of quantity times price.
#[test]
fn weighted_summation_of_stock() {
    let schema = Schema::builder()
        .entity(
            Entity::new("Item")
                .property(Property::new("quantity"))
                .property(Property::new("price")),
        )
        .dictionary(Dictionary::computed(
            "stockValue",
            WeightedSummation::record("Item").weighing(|item| {
                let number = |key: &str| item.get(key).and_then(Value::as_f64).unwrap_or(0.0);
                Weighted::new(number("quantity"), number("price"))
            }),
        ))
        .build()
        .unwrap();
    let controller = started(schema);

    let pens = id_of(&controller, "Item", json!({"quantity": 2, "price": 5.0}));
    id_of(&controller, "Item", json!({"quantity": 3, "price": 1.5}));
    assert_eq!(controller.dictionary("stockValue").unwrap(), json!(14.5));

    controller
        .update("Item", &MatchExpr::id(pens), fields(json!({"quantity": 0})))
        .unwrap();
    assert_eq!(controller.dictionary("stockValue").unwrap(), json!(4.5));
}

fn friends_schema() -> Schema {
    Schema::builder()
        .entity(
            Entity::new("User")
                .property(Property::new("name"))
                .property(Property::computed("friendCount", Count::property("friends"))),
        )
        .relation(Relation::new("User", "friends", "User", "friends", Cardinality::ManyToMany))
        .build()
        .unwrap()
}

const FRIENDS: &str = "User_friends_friends_User";

/// Test that a symmetric relation counts for both of its endpoints.
#[test]
fn symmetric_friend_counts() {
    let controller = started(friends_schema());
    let alice = id_of(&controller, "User", json!({"name": "alice"}));
    let bob = id_of(&controller, "User", json!({"name": "bob"}));
    assert_eq!(property(&controller, "User", alice, "friendCount"), json!(0));

    controller.add_relation(FRIENDS, alice, bob, Map::new()).unwrap();
    assert_eq!(property(&controller, "User", alice, "friendCount"), json!(1));
    assert_eq!(property(&controller, "User", bob, "friendCount"), json!(1));

    let carol = id_of(&controller, "User", json!({"name": "carol"}));
    controller.add_relation(FRIENDS, carol, alice, Map::new()).unwrap();
    assert_eq!(property(&controller, "User", alice, "friendCount"), json!(2));
    assert_eq!(property(&controller, "User", carol, "friendCount"), json!(1));
    assert_eq!(property(&controller, "User", bob, "friendCount"), json!(1));

    controller
        .remove_relation(
            FRIENDS,
            &MatchExpr::eq("source", alice).and(MatchExpr::eq("target", bob)),
        )
        .unwrap();
    assert_eq!(property(&controller, "User", alice, "friendCount"), json!(1));
    assert_eq!(property(&controller, "User", bob, "friendCount"), json!(0));

    controller.delete("User", &MatchExpr::id(carol)).unwrap();
    assert_eq!(property(&controller, "User", alice, "friendCount"), json!(0));
    assert_eq!(controller.fresh_property_value("User", alice, "friendCount").unwrap(), json!(0));
}

/// Test that removing one of three pairwise friendships changes only the
/// counts of its two endpoints.
#[test]
fn three_way_friendships() {
    let controller = started(friends_schema());
    let alice = id_of(&controller, "User", json!({"name": "alice"}));
    let bob = id_of(&controller, "User", json!({"name": "bob"}));
    let carol = id_of(&controller, "User", json!({"name": "carol"}));
    let counts = || {
        [alice, bob, carol].map(|user| property(&controller, "User", user, "friendCount"))
    };

    let ab = controller.add_relation(FRIENDS, alice, bob, Map::new()).unwrap().id().unwrap();
    controller.add_relation(FRIENDS, bob, carol, Map::new()).unwrap();
    controller.add_relation(FRIENDS, alice, carol, Map::new()).unwrap();
    assert_eq!(counts(), [json!(2), json!(2), json!(2)]);

    controller.remove_relation(FRIENDS, &MatchExpr::id(ab)).unwrap();
    assert_eq!(counts(), [json!(1), json!(1), json!(2)]);
    for user in [alice, bob, carol] {
        assert_eq!(
            property(&controller, "User", user, "friendCount"),
            controller.fresh_property_value("User", user, "friendCount").unwrap()
        );
    }
}

/// Test that a direction on a symmetric relation counts only the rows the
/// host started.
#[test]
fn directed_count_over_symmetric_relation() {
    let schema = Schema::builder()
        .entity(
            Entity::new("User")
                .property(Property::new("name"))
                .property(Property::computed(
                    "invited",
                    Count::property("friends").direction(Direction::Source),
                )),
        )
        .relation(Relation::new("User", "friends", "User", "friends", Cardinality::ManyToMany))
        .build()
        .unwrap();
    let controller = started(schema);
    let alice = id_of(&controller, "User", json!({"name": "alice"}));
    let bob = id_of(&controller, "User", json!({"name": "bob"}));
    let carol = id_of(&controller, "User", json!({"name": "carol"}));

    controller.add_relation(FRIENDS, alice, bob, Map::new()).unwrap();
    let carol_alice = controller.add_relation(FRIENDS, carol, alice, Map::new()).unwrap().id().unwrap();
    let invited = || [alice, bob, carol].map(|user| property(&controller, "User", user, "invited"));
    assert_eq!(invited(), [json!(1), json!(0), json!(1)]);

    controller.remove_relation(FRIENDS, &MatchExpr::id(carol_alice)).unwrap();
    assert_eq!(invited(), [json!(1), json!(0), json!(0)]);
    for user in [alice, bob, carol] {
        assert_eq!(
            property(&controller, "User", user, "invited"),
            controller.fresh_property_value("User", user, "invited").unwrap()
        );
    }
}

/// Test a property sum over a field stored on the relation rows.
#[test]
fn property_sum_reads_relation_fields() {
    let schema = Schema::builder()
        .entity(Entity::new("Order").property(Property::computed(
            "units",
            Summation::property("items").attribute_query(AttributeQuery::path(&["&", "quantity"])),
        )))
        .entity(Entity::new("Product").property(Property::new("sku")))
        .relation(
            Relation::new("Order", "items", "Product", "orders", Cardinality::ManyToMany)
                .property(Property::new("quantity")),
        )
        .build()
        .unwrap();
    let controller = started(schema);
    let lines = "Order_items_orders_Product";

    let order = id_of(&controller, "Order", json!({}));
    let pen = id_of(&controller, "Product", json!({"sku": "pen"}));
    let ink = id_of(&controller, "Product", json!({"sku": "ink"}));

    let pen_line = controller
        .add_relation(lines, order, pen, fields(json!({"quantity": 2})))
        .unwrap();
    controller
        .add_relation(lines, order, ink, fields(json!({"quantity": 3})))
        .unwrap();
    assert_eq!(property(&controller, "Order", order, "units"), json!(5));

    controller
        .update(lines, &MatchExpr::id(pen_line.id().unwrap()), fields(json!({"quantity": 4})))
        .unwrap();
    assert_eq!(property(&controller, "Order", order, "units"), json!(7));

    controller.delete("Product", &MatchExpr::id(ink)).unwrap();
    assert_eq!(property(&controller, "Order", order, "units"), json!(4));
    assert_eq!(controller.fresh_property_value("Order", order, "units").unwrap(), json!(4));
}

/// Test that a property aggregate reacts to changes of the related records.
#[test]
fn property_aggregate_follows_related_updates() {
    let schema = Schema::builder()
        .entity(Entity::new("Team").property(Property::computed(
            "active",
            Count::property("members")
                .attribute_query(AttributeQuery::fields(["active"]))
                .matching(|member| member.get("active") == Some(&json!(true))),
        )))
        .entity(Entity::new("Member").property(Property::new("active").with_default(true)))
        .relation(Relation::new("Team", "members", "Member", "team", Cardinality::OneToMany))
        .build()
        .unwrap();
    let controller = started(schema);
    let relation = "Team_members_team_Member";

    let team = id_of(&controller, "Team", json!({}));
    let ann = id_of(&controller, "Member", json!({}));
    let ben = id_of(&controller, "Member", json!({}));
    controller.add_relation(relation, team, ann, Map::new()).unwrap();
    controller.add_relation(relation, team, ben, Map::new()).unwrap();
    assert_eq!(property(&controller, "Team", team, "active"), json!(2));

    controller
        .update("Member", &MatchExpr::id(ben), fields(json!({"active": false})))
        .unwrap();
    assert_eq!(property(&controller, "Team", team, "active"), json!(1));
}
