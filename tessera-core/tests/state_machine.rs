//! Integration Tests for State Machines
//!
//! These tests verify that interactions move dictionaries, properties, entity
//! records and relation rows between declared states.

use serde_json::{json, Value};

use tessera_core::computation::{StateMachine, StateNode, StateTransfer, Target};
use tessera_core::controller::InteractionEvent;
use tessera_core::schema::{Cardinality, Dictionary, Entity, Property, Relation, Schema};
use tessera_core::store::{AttributeQuery, MatchExpr, RecordId};
use tessera_core::{fields, Controller, Interaction, InteractionCall};

fn started(schema: Schema) -> Controller {
    let mut controller = Controller::in_memory(schema);
    controller.setup().unwrap();
    controller
}

fn call(controller: &Controller, name: &str, user: Value, payload: Value) {
    let response = controller.call_interaction(name, InteractionCall::new(user, payload));
    assert!(response.is_ok(), "{name} failed: {:?}", response.error);
}

/// Test a global machine toggling between two states.
#[test]
fn global_toggle() {
    let light = StateMachine::new()
        .state(StateNode::new("off", "off"))
        .state(StateNode::new("on", "on"))
        .transfer(StateTransfer::new("toggle", "off", "on"))
        .transfer(StateTransfer::new("toggle", "on", "off"));
    let schema = Schema::builder()
        .dictionary(Dictionary::computed("light", light))
        .interaction(Interaction::new("toggle"))
        .interaction(Interaction::new("noop"))
        .build()
        .unwrap();
    let controller = started(schema);
    assert_eq!(controller.dictionary("light").unwrap(), json!("off"));

    call(&controller, "toggle", Value::Null, Value::Null);
    assert_eq!(controller.dictionary("light").unwrap(), json!("on"));

    call(&controller, "noop", Value::Null, Value::Null);
    assert_eq!(controller.dictionary("light").unwrap(), json!("on"));

    call(&controller, "toggle", Value::Null, Value::Null);
    assert_eq!(controller.dictionary("light").unwrap(), json!("off"));
}

fn request_target(event: &InteractionEvent) -> Vec<Target> {
    event.arg_id("request").map(Target::Record).into_iter().collect()
}

fn approval_schema() -> Schema {
    let status = StateMachine::new()
        .state(StateNode::new("pending", "pending"))
        .state(StateNode::new("approved", "approved"))
        .state(StateNode::new("rejected", "rejected"))
        .default_state("pending")
        .transfer(StateTransfer::new("approve", "pending", "approved").targeting(request_target))
        .transfer(StateTransfer::new("reject", "pending", "rejected").targeting(request_target));
    Schema::builder()
        .entity(
            Entity::new("Request")
                .property(Property::new("title"))
                .property(Property::computed("status", status)),
        )
        .interaction(Interaction::new("approve"))
        .interaction(Interaction::new("reject"))
        .build()
        .unwrap()
}

fn status_of(controller: &Controller, id: RecordId) -> Value {
    controller
        .find_one("Request", &MatchExpr::id(id), &AttributeQuery::fields(["status"]))
        .unwrap()
        .and_then(|record| record.get("status").cloned())
        .unwrap_or(Value::Null)
}

/// Test that a property machine starts new hosts in the default state and
/// only fires from the matching state.
#[test]
fn property_machine_per_record() {
    let controller = started(approval_schema());
    let first = controller.create("Request", fields(json!({"title": "a"}))).unwrap().id().unwrap();
    let second = controller.create("Request", fields(json!({"title": "b"}))).unwrap().id().unwrap();
    assert_eq!(status_of(&controller, first), json!("pending"));

    call(&controller, "approve", Value::Null, json!({"request": first}));
    assert_eq!(status_of(&controller, first), json!("approved"));
    assert_eq!(status_of(&controller, second), json!("pending"));

    // Already approved: the reject transfer does not apply.
    call(&controller, "reject", Value::Null, json!({"request": {"id": first}}));
    assert_eq!(status_of(&controller, first), json!("approved"));

    call(&controller, "reject", Value::Null, json!({"request": second}));
    assert_eq!(status_of(&controller, second), json!("rejected"));
}

fn ticket_target(event: &InteractionEvent) -> Vec<Target> {
    event.arg_id("ticket").map(Target::Record).into_iter().collect()
}

/// Test an entity machine that creates, updates and deletes records.
#[test]
fn entity_machine_controls_existence() {
    let tickets = StateMachine::new()
        .state(StateNode::new("absent", false))
        .state(StateNode::new("open", json!({"status": "open"})))
        .state(StateNode::new("closed", json!({"status": "closed"})))
        .transfer(StateTransfer::new("openTicket", "absent", "open").targeting(|event| {
            vec![Target::Seed(fields(json!({"title": event.arg("title").cloned().unwrap_or(Value::Null)})))]
        }))
        .transfer(StateTransfer::new("closeTicket", "open", "closed").targeting(ticket_target))
        .transfer(StateTransfer::new("purgeTicket", "closed", "absent").targeting(ticket_target));
    let schema = Schema::builder()
        .entity(
            Entity::new("Ticket")
                .property(Property::new("title"))
                .property(Property::new("status"))
                .computed_by(tickets),
        )
        .interaction(Interaction::new("openTicket"))
        .interaction(Interaction::new("closeTicket"))
        .interaction(Interaction::new("purgeTicket"))
        .build()
        .unwrap();
    let controller = started(schema);

    call(&controller, "openTicket", Value::Null, json!({"title": "printer"}));
    // The seed already exists in the open state: nothing to create.
    call(&controller, "openTicket", Value::Null, json!({"title": "printer"}));
    let all = controller.find("Ticket", &MatchExpr::All, &AttributeQuery::all()).unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].get("status"), Some(&json!("open")));
    let ticket = all[0].id().unwrap();

    // Purge only applies to closed tickets.
    call(&controller, "purgeTicket", Value::Null, json!({"ticket": ticket}));
    assert_eq!(controller.store().count("Ticket"), 1);

    call(&controller, "closeTicket", Value::Null, json!({"ticket": ticket}));
    let closed = controller
        .find_one("Ticket", &MatchExpr::id(ticket), &AttributeQuery::all())
        .unwrap()
        .unwrap();
    assert_eq!(closed.get("status"), Some(&json!("closed")));
    assert_eq!(closed.get("title"), Some(&json!("printer")));

    call(&controller, "purgeTicket", Value::Null, json!({"ticket": ticket}));
    assert_eq!(controller.store().count("Ticket"), 0);
}

/// The calling user and the `target` user of the payload.
fn follow_pair(event: &InteractionEvent) -> Vec<Target> {
    event
        .user_id()
        .and_then(RecordId::from_value)
        .zip(event.arg_id("target"))
        .map(|(source, target)| Target::link(source, target))
        .into_iter()
        .collect()
}

/// Test a relation machine linking the calling user to a target user.
#[test]
fn relation_machine_links_users() {
    let follows = StateMachine::new()
        .state(StateNode::new("none", Value::Null))
        .state(StateNode::new("following", json!({"muted": false})))
        .transfer(StateTransfer::new("follow", "none", "following").targeting(follow_pair))
        .transfer(StateTransfer::new("unfollow", "following", "none").targeting(follow_pair));
    let schema = Schema::builder()
        .entity(Entity::new("User").property(Property::new("name")))
        .relation(
            Relation::new("User", "following", "User", "followers", Cardinality::ManyToMany)
                .property(Property::new("muted"))
                .computed_by(follows),
        )
        .interaction(Interaction::new("follow"))
        .interaction(Interaction::new("unfollow"))
        .build()
        .unwrap();
    let controller = started(schema);
    let relation = "User_following_followers_User";

    let alice = controller.create("User", fields(json!({"name": "alice"}))).unwrap().id().unwrap();
    let bob = controller.create("User", fields(json!({"name": "bob"}))).unwrap().id().unwrap();

    call(&controller, "follow", json!({"id": alice}), json!({"target": bob}));
    let rows = controller.find(relation, &MatchExpr::All, &AttributeQuery::all()).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].endpoints(), Some((alice, bob)));
    assert_eq!(rows[0].get("muted"), Some(&json!(false)));

    call(&controller, "unfollow", json!({"id": alice}), json!({"target": bob}));
    assert_eq!(controller.store().count(relation), 0);
}

/// The document of the payload paired with every listed reviewer.
fn review_pairs(event: &InteractionEvent) -> Vec<Target> {
    let reviewers: Vec<RecordId> = event
        .arg("reviewers")
        .and_then(Value::as_array)
        .map(|ids| ids.iter().filter_map(RecordId::from_value).collect())
        .unwrap_or_default();
    event
        .arg_id("document")
        .map(|document| Target::Link {
            source: vec![document],
            target: reviewers,
        })
        .into_iter()
        .collect()
}

/// Test that one transfer fans out to a row per reviewer and leaves pairs
/// already in the target state alone.
#[test]
fn relation_machine_fans_out_to_reviewers() {
    let approvals = StateMachine::new()
        .state(StateNode::new("pending", Value::Null))
        .state(StateNode::new("approved", json!({"approved": true})))
        .transfer(StateTransfer::new("approve", "pending", "approved").targeting(review_pairs))
        .transfer(StateTransfer::new("revoke", "approved", "pending").targeting(review_pairs));
    let schema = Schema::builder()
        .entity(Entity::new("Document").property(Property::new("title")))
        .entity(Entity::new("User").property(Property::new("name")))
        .relation(
            Relation::new("Document", "approvals", "User", "approvedDocuments", Cardinality::ManyToMany)
                .property(Property::new("approved"))
                .computed_by(approvals),
        )
        .interaction(Interaction::new("approve"))
        .interaction(Interaction::new("revoke"))
        .build()
        .unwrap();
    let controller = started(schema);
    let relation = "Document_approvals_approvedDocuments_User";

    let draft = controller.create("Document", fields(json!({"title": "rfc"}))).unwrap().id().unwrap();
    let bob = controller.create("User", fields(json!({"name": "bob"}))).unwrap().id().unwrap();
    let carol = controller.create("User", fields(json!({"name": "carol"}))).unwrap().id().unwrap();

    call(&controller, "approve", Value::Null, json!({"document": draft, "reviewers": [bob]}));
    let first = controller.find(relation, &MatchExpr::All, &AttributeQuery::all()).unwrap();
    assert_eq!(first.len(), 1);
    let bob_row = first[0].id().unwrap();

    call(&controller, "approve", Value::Null, json!({"document": draft, "reviewers": [bob, carol]}));
    let rows = controller.find(relation, &MatchExpr::All, &AttributeQuery::all()).unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].id(), Some(bob_row));
    assert_eq!(rows[1].endpoints(), Some((draft, carol)));
    assert!(rows.iter().all(|row| row.get("approved") == Some(&json!(true))));

    call(&controller, "revoke", Value::Null, json!({"document": draft, "reviewers": [bob, carol]}));
    assert_eq!(controller.store().count(relation), 0);
}
