//! Pipeline integration tests
//!
//! Exercises the state machine, context manager, NLU parsing, and action
//! executor together, without audio hardware or network access.

mod common;

use murmur::context::{ContextManager, Role};
use murmur::nlu;
use murmur::{Action, ActionExecutor, StateMachine, SystemState, TurnEvent};

#[test]
fn test_full_turn_state_sequence() {
    let mut sm = StateMachine::new();

    // Wake → listen → understand → act → respond → idle
    assert_eq!(sm.transition(TurnEvent::WakeDetected), SystemState::Listening);
    assert_eq!(
        sm.transition(TurnEvent::UtteranceCaptured),
        SystemState::Processing
    );
    assert_eq!(
        sm.transition(TurnEvent::ActionsRequested),
        SystemState::ExecutingAction
    );
    assert_eq!(
        sm.transition(TurnEvent::ActionsSettled),
        SystemState::Responding
    );
    assert_eq!(sm.transition(TurnEvent::ReplyDelivered), SystemState::Idle);
}

#[test]
fn test_error_recovery_sequence() {
    let mut sm = StateMachine::new();

    sm.transition(TurnEvent::WakeDetected);
    sm.fail("STT unreachable");
    assert_eq!(sm.current(), SystemState::Error);

    // Events other than reset leave the machine parked
    assert_eq!(sm.transition(TurnEvent::WakeDetected), SystemState::Error);
    assert_eq!(sm.transition(TurnEvent::Reset), SystemState::Idle);

    // The machine is usable again after reset
    assert_eq!(sm.transition(TurnEvent::WakeDetected), SystemState::Listening);
}

#[test]
fn test_extracted_actions_flow_through_executor() {
    // Nested payload end to end: parse then dispatch
    let reply = r#"Setting your reminder. ACTION: {"action": "reminder", "params": {"action": "set", "time": {"hour": 7}, "message": "wake up"}}"#;

    let (actions, _) = nlu::extract_actions(reply);
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].parameters["time"]["hour"], serde_json::json!(7));

    let executor = ActionExecutor::new();
    let results = executor.execute_batch(&actions);
    assert_eq!(results.len(), 1);
    assert!(results[0].success);
}

#[test]
fn test_batch_with_unknown_and_failing_actions() {
    let executor = ActionExecutor::new();

    let actions = vec![
        Action::new("media", serde_json::json!({"action": "play", "title": "jazz"})
            .as_object()
            .cloned()
            .unwrap()),
        Action::new("warp_drive", serde_json::Map::new()),
        Action {
            action_type: None,
            parameters: serde_json::Map::new(),
        },
    ];

    let results = executor.execute_batch(&actions);
    assert_eq!(results.len(), 3);
    assert!(results[0].success);
    assert!(!results[1].success);
    assert!(results[1].error.as_deref().unwrap().contains("unknown action"));
    assert!(!results[2].success);
}

#[test]
fn test_context_persists_across_managers() {
    let pool = common::setup_test_db();
    let mut settings = common::test_settings().context;
    settings.persistent = true;

    {
        let mut ctx = ContextManager::with_pool(settings.clone(), pool.clone()).unwrap();
        ctx.add_message(Role::User, "what's the weather").unwrap();
        ctx.add_message(Role::Assistant, "Sunny and 72").unwrap();
        ctx.set_preference("city", serde_json::json!("Portland"), None)
            .unwrap();
    }

    // A fresh manager over the same store sees everything in the window
    let ctx = ContextManager::with_pool(settings, pool).unwrap();
    let stats = ctx.stats();
    assert_eq!(stats.total_messages, 2);
    assert_eq!(stats.user_messages, 1);
    assert_eq!(stats.assistant_messages, 1);
    assert_eq!(ctx.preference("city"), Some(&serde_json::json!("Portland")));

    let hits = ctx.search("weather", 5);
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].role, Role::User);
}

#[test]
fn test_stats_shape_matches_between_empty_and_populated() {
    let mut ctx = ContextManager::new(common::test_settings().context).unwrap();

    let empty = serde_json::to_value(ctx.stats()).unwrap();
    ctx.add_message(Role::User, "hello").unwrap();
    let populated = serde_json::to_value(ctx.stats()).unwrap();

    let empty_keys: Vec<_> = empty.as_object().unwrap().keys().collect();
    let populated_keys: Vec<_> = populated.as_object().unwrap().keys().collect();
    assert_eq!(empty_keys, populated_keys);

    // Absent timestamps serialize as null, not as missing keys
    assert!(empty["oldest_message"].is_null());
    assert!(populated["oldest_message"].is_string());
}

#[test]
fn test_trim_is_idempotent_against_the_store() {
    let pool = common::setup_test_db();
    let mut settings = common::test_settings().context;
    settings.persistent = true;

    let mut ctx = ContextManager::with_pool(settings, pool).unwrap();
    ctx.add_message(Role::User, "current").unwrap();

    let cutoff = chrono::Utc::now() - chrono::Duration::hours(1);
    ctx.trim(cutoff).unwrap();
    assert_eq!(ctx.stats().total_messages, 1);

    ctx.trim(cutoff).unwrap();
    assert_eq!(ctx.stats().total_messages, 1);
}

#[test]
fn test_intent_policy_for_alarms() {
    // Policy: reminder phrasing wins over control phrasing
    assert_eq!(nlu::classify_intent("set an alarm"), murmur::Intent::Reminder);
    assert_eq!(
        nlu::classify_intent("set the lights to blue"),
        murmur::Intent::Control
    );
}
