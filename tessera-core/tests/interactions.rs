//! Integration Tests for Interactions
//!
//! These tests verify the interaction call lifecycle: lookup, conditions,
//! action, propagation, rollback and side effects.

use std::sync::Arc;

use serde_json::{json, Value};

use tessera_core::computation::{ComputationResult, Custom, DataDep, Summation};
use tessera_core::controller::{ExecutionPhase, InteractionEvent, RecordMutationSideEffect};
use tessera_core::error::BoxError;
use tessera_core::schema::{Dictionary, Entity, Property, Schema, INTERACTION_RECORD};
use tessera_core::store::{AttributeQuery, MatchExpr, MutationEvent, RecordId};
use tessera_core::{fields, Controller, EngineConfig, EngineError, Interaction, InteractionCall, MemoryStore, RecordStore};

fn balance_of(store: &dyn RecordStore, id: RecordId) -> Result<f64, BoxError> {
    let account = store
        .find_one("Account", &MatchExpr::id(id), &AttributeQuery::fields(["balance"]))?
        .ok_or("no such account")?;
    Ok(account.get("balance").and_then(Value::as_f64).unwrap_or(0.0))
}

fn deposit(store: &dyn RecordStore, event: &InteractionEvent, events: &mut Vec<MutationEvent>) -> Result<(), BoxError> {
    let id = event.arg_id("account").ok_or("payload names no account")?;
    let amount = event.arg("amount").and_then(Value::as_f64).unwrap_or(0.0);
    let balance = balance_of(store, id)?;
    store.update("Account", &MatchExpr::id(id), fields(json!({"balance": balance + amount})), events)?;
    Ok(())
}

fn bank_schema() -> Schema {
    let guard = Custom::new()
        .dep(
            "accounts",
            DataDep::Records {
                source: "Account".into(),
                query: AttributeQuery::fields(["balance"]),
            },
        )
        .compute(|cx| {
            let accounts = cx.records("accounts")?;
            let over = accounts
                .iter()
                .any(|account| account.get("balance").and_then(Value::as_f64).unwrap_or(0.0) > 1000.0);
            if over {
                return Err("balance limit exceeded".into());
            }
            Ok(ComputationResult::Value(json!(accounts.len())))
        });

    Schema::builder()
        .entity(Entity::new("Account").property(Property::new("balance").with_default(0)))
        .dictionary(Dictionary::computed(
            "totalBalance",
            Summation::record("Account").attribute_query(AttributeQuery::fields(["balance"])),
        ))
        .dictionary(Dictionary::computed("accountsChecked", guard))
        .interaction(
            Interaction::new("deposit")
                .condition("positive amount", |_, event| {
                    Ok(event.arg("amount").and_then(Value::as_f64).is_some_and(|amount| amount > 0.0))
                })
                .action(deposit),
        )
        .build()
        .unwrap()
}

fn started(controller: Controller) -> Controller {
    let mut controller = controller;
    controller.setup().unwrap();
    controller
}

fn open_account(controller: &Controller) -> RecordId {
    controller.create("Account", fields(json!({}))).unwrap().id().unwrap()
}

/// Test a successful call: the event record, the action's writes and the
/// computed values all land in one response.
#[test]
fn deposit_updates_balance_and_totals() {
    let controller = started(Controller::in_memory(bank_schema()));
    let account = open_account(&controller);

    let response = controller.call_interaction(
        "deposit",
        InteractionCall::new(json!({"id": 1}), json!({"account": account, "amount": 40})),
    );
    assert!(response.is_ok());
    let event = response.event.unwrap();
    assert!(event.id.is_some());
    assert_eq!(event.user_id(), Some(&json!(1)));

    let names: Vec<&str> = response.effects.iter().map(|e| e.record_name.as_str()).collect();
    assert!(names.contains(&INTERACTION_RECORD));
    assert!(names.contains(&"Account"));
    assert_eq!(controller.dictionary("totalBalance").unwrap(), json!(40));
    assert_eq!(controller.store().count(INTERACTION_RECORD), 1);
}

/// Test that a failed condition stops the call before anything is written.
#[test]
fn condition_rejects_call() {
    let controller = started(Controller::in_memory(bank_schema()));
    let account = open_account(&controller);

    let response = controller.call_interaction(
        "deposit",
        InteractionCall::new(Value::Null, json!({"account": account, "amount": -5})),
    );
    let error = response.error.unwrap();
    assert_eq!(error.execution_phase, ExecutionPhase::Condition);
    assert!(error.caused_by.contains("positive amount"));
    assert_eq!(controller.store().count(INTERACTION_RECORD), 0);
}

/// Test that an unknown interaction fails during lookup.
#[test]
fn unknown_interaction() {
    let controller = started(Controller::in_memory(bank_schema()));
    let response = controller.call_interaction("withdraw", InteractionCall::default());
    assert_eq!(response.error.unwrap().execution_phase, ExecutionPhase::Lookup);
}

/// Test that a failing action rolls back the event record.
#[test]
fn action_failure_rolls_back() {
    let controller = started(Controller::in_memory(bank_schema()));

    let response = controller.call_interaction(
        "deposit",
        InteractionCall::new(Value::Null, json!({"account": 999, "amount": 5})),
    );
    let error = response.error.unwrap();
    assert_eq!(error.execution_phase, ExecutionPhase::Action);
    assert!(error.caused_by.contains("no such account"));
    assert_eq!(controller.store().count(INTERACTION_RECORD), 0);
}

/// Test that a computation failure rolls back both records and bound state.
#[test]
fn computation_failure_rolls_back_state() {
    let controller = started(Controller::in_memory(bank_schema()));
    let account = open_account(&controller);
    let call = |amount: u32| {
        controller.call_interaction(
            "deposit",
            InteractionCall::new(Value::Null, json!({"account": account, "amount": amount})),
        )
    };

    assert!(call(100).is_ok());
    let response = call(5000);
    assert_eq!(response.error.unwrap().execution_phase, ExecutionPhase::Computation);
    assert_eq!(balance_of(controller.store(), account).unwrap(), 100.0);
    assert_eq!(controller.dictionary("totalBalance").unwrap(), json!(100));

    assert!(call(20).is_ok());
    assert_eq!(controller.dictionary("totalBalance").unwrap(), json!(120));
    assert_eq!(controller.fresh_dictionary_value("totalBalance").unwrap(), json!(120));
}

/// Test that side effects see committed events and that their failures are
/// reported without undoing the call.
#[test]
fn side_effects_run_after_commit() {
    let controller = Controller::in_memory(bank_schema())
        .with_side_effect(RecordMutationSideEffect::new("audit", "Account", |event| Ok(json!(event.seq))))
        .with_side_effect(RecordMutationSideEffect::new("mailer", "Account", |_| {
            Err("smtp unavailable".into())
        }));
    let controller = started(controller);
    let account = open_account(&controller);

    let response = controller.call_interaction(
        "deposit",
        InteractionCall::new(Value::Null, json!({"account": account, "amount": 3})),
    );
    assert!(response.is_ok());
    assert_eq!(response.side_effects["audit"].results.len(), 1);
    assert_eq!(response.side_effects["mailer"].error.as_deref(), Some("smtp unavailable"));
    assert_eq!(balance_of(controller.store(), account).unwrap(), 3.0);

    // Direct mutations are not interaction calls and run no side effects.
    controller
        .update("Account", &MatchExpr::id(account), fields(json!({"balance": 4})))
        .unwrap();
}

/// Test that two computations feeding each other hit the cascade limit.
#[test]
fn runaway_cascade_is_stopped() {
    let bump = |other: &'static str| {
        Custom::new()
            .dep("other", DataDep::Global { dictionary: other.into() })
            .compute(|cx| {
                let value = cx.global("other")?.as_i64().unwrap_or(0);
                Ok(ComputationResult::Value(json!(value + 1)))
            })
    };
    let schema = Arc::new(
        Schema::builder()
            .dictionary(Dictionary::computed("ping", bump("pong")))
            .dictionary(Dictionary::computed("pong", bump("ping")))
            .build()
            .unwrap(),
    );
    let config = EngineConfig {
        max_cascade_events: 50,
        ..EngineConfig::default()
    };
    let mut controller = Controller::new(schema.clone(), MemoryStore::new(schema), config);

    let err = controller.setup().unwrap_err();
    assert!(matches!(err, EngineError::CascadeLimit { limit: 50 }));
    assert_eq!(controller.dictionary("ping").unwrap(), Value::Null);
}
