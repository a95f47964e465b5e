//! Turn-taking state machine
//!
//! Tracks where the assistant is in a conversational turn and fires entry
//! callbacks on transitions. Driven exclusively by the daemon control loop;
//! there is no internal locking.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;
use serde_json::Value;

/// System states for a conversational turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemState {
    /// Waiting for a wake phrase or input
    Idle,
    /// Capturing an utterance
    Listening,
    /// Understanding the transcript
    Processing,
    /// Delivering the reply
    Responding,
    /// Running extracted actions
    ExecutingAction,
    /// A stage failed; parked until reset
    Error,
}

impl fmt::Display for SystemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Processing => "processing",
            Self::Responding => "responding",
            Self::ExecutingAction => "executing_action",
            Self::Error => "error",
        };
        write!(f, "{name}")
    }
}

/// Events that drive state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnEvent {
    /// Wake phrase heard (or gating disabled and input expected)
    WakeDetected,
    /// A complete utterance was captured
    UtteranceCaptured,
    /// Capture ended with nothing usable
    CaptureAbandoned,
    /// Understanding produced a reply with no actions
    ReplyReady,
    /// Understanding produced actions to run
    ActionsRequested,
    /// All actions in the batch have settled
    ActionsSettled,
    /// The reply has been spoken
    ReplyDelivered,
    /// A stage failed
    Failure,
    /// Explicit recovery back to idle
    Reset,
}

/// Per-turn data payload passed to entry callbacks
pub type StateData = HashMap<String, Value>;

/// Entry callback; an error forces a transition to [`SystemState::Error`]
pub type StateCallback = Box<dyn Fn(&StateData) -> crate::Result<()> + Send>;

/// Snapshot of the machine for prompting and status reporting
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub state: SystemState,
    pub previous: Option<SystemState>,
    pub data: StateData,
}

/// The turn-taking state machine
pub struct StateMachine {
    current: SystemState,
    previous: Option<SystemState>,
    data: StateData,
    callbacks: HashMap<SystemState, Vec<StateCallback>>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    /// Create a machine parked in [`SystemState::Idle`]
    #[must_use]
    pub fn new() -> Self {
        Self {
            current: SystemState::Idle,
            previous: None,
            data: StateData::new(),
            callbacks: HashMap::new(),
        }
    }

    /// Current state
    #[must_use]
    pub const fn current(&self) -> SystemState {
        self.current
    }

    /// State before the last transition
    #[must_use]
    pub const fn previous(&self) -> Option<SystemState> {
        self.previous
    }

    /// Snapshot of state, previous state, and turn data
    #[must_use]
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            state: self.current,
            previous: self.previous,
            data: self.data.clone(),
        }
    }

    /// Whether the machine is idle
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.current == SystemState::Idle
    }

    /// Whether the machine is mid-turn (understanding or acting)
    #[must_use]
    pub fn is_busy(&self) -> bool {
        matches!(
            self.current,
            SystemState::Processing | SystemState::ExecutingAction
        )
    }

    /// Set a per-turn data entry
    pub fn set_data(&mut self, key: impl Into<String>, value: Value) {
        self.data.insert(key.into(), value);
    }

    /// Read a per-turn data entry
    #[must_use]
    pub fn get_data(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Clear the per-turn data payload
    pub fn clear_data(&mut self) {
        self.data.clear();
    }

    /// Register an entry callback for a state
    pub fn register_callback(&mut self, state: SystemState, callback: StateCallback) {
        self.callbacks.entry(state).or_default().push(callback);
        tracing::debug!(state = %state, "registered state callback");
    }

    /// Apply an event and return the resulting state
    ///
    /// The transition table is total: events that make no sense in `Idle`
    /// (and all events except `Reset`/`Failure` in `Error`) are ignored,
    /// while an out-of-order event in any mid-turn state routes to `Error`.
    pub fn transition(&mut self, event: TurnEvent) -> SystemState {
        let target = Self::target_for(self.current, event);

        match target {
            Target::Stay => {
                tracing::trace!(state = %self.current, ?event, "event ignored");
            }
            Target::Go(next) => self.enter(next, event),
        }

        self.current
    }

    /// Resolve the transition table entry for a `(state, event)` pair
    const fn target_for(state: SystemState, event: TurnEvent) -> Target {
        use SystemState::{Error, ExecutingAction, Idle, Listening, Processing, Responding};
        use TurnEvent::{
            ActionsRequested, ActionsSettled, CaptureAbandoned, Failure, ReplyDelivered,
            ReplyReady, Reset, UtteranceCaptured, WakeDetected,
        };

        match (state, event) {
            // Failure is accepted everywhere
            (_, Failure) => Target::Go(Error),

            // Idle ignores everything except a wake or an explicit reset
            (Idle, WakeDetected) => Target::Go(Listening),
            (Idle, Reset) | (Error, Reset) => Target::Go(Idle),
            (Idle | Error, _) => Target::Stay,

            // The expected turn progression
            (Listening, UtteranceCaptured) => Target::Go(Processing),
            (Listening, CaptureAbandoned) => Target::Go(Idle),
            (Processing, ReplyReady) => Target::Go(Responding),
            (Processing, ActionsRequested) => Target::Go(ExecutingAction),
            (ExecutingAction, ActionsSettled) => Target::Go(Responding),
            (Responding, ReplyDelivered) => Target::Go(Idle),

            // Anything else mid-turn is out of order
            (Listening | Processing | Responding | ExecutingAction, _) => Target::Go(Error),
        }
    }

    /// Enter a state, firing its callbacks
    fn enter(&mut self, next: SystemState, event: TurnEvent) {
        if next == self.current {
            return;
        }

        tracing::info!(from = %self.current, to = %next, ?event, "state transition");

        self.previous = Some(self.current);
        self.current = next;

        if next == SystemState::Idle {
            self.data.remove("error_message");
        }

        self.run_callbacks(next);
    }

    /// Fire entry callbacks; a failing callback forces `Error`
    fn run_callbacks(&mut self, state: SystemState) {
        let mut failed = None;

        if let Some(callbacks) = self.callbacks.get(&state) {
            for callback in callbacks {
                if let Err(e) = callback(&self.data) {
                    tracing::error!(state = %state, error = %e, "state callback failed");
                    failed = Some(e.to_string());
                }
            }
        }

        if let Some(message) = failed {
            if state == SystemState::Error {
                // Already entering Error; logging is all we can do
                return;
            }
            self.data
                .insert("error_message".to_string(), Value::String(message));
            self.previous = Some(self.current);
            self.current = SystemState::Error;
            self.run_callbacks(SystemState::Error);
        }
    }

    /// Record an error message and park in `Error`
    pub fn fail(&mut self, message: impl Into<String>) {
        self.data
            .insert("error_message".to_string(), Value::String(message.into()));
        self.transition(TurnEvent::Failure);
    }
}

/// Transition table entry
enum Target {
    Stay,
    Go(SystemState),
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_EVENTS: [TurnEvent; 9] = [
        TurnEvent::WakeDetected,
        TurnEvent::UtteranceCaptured,
        TurnEvent::CaptureAbandoned,
        TurnEvent::ReplyReady,
        TurnEvent::ActionsRequested,
        TurnEvent::ActionsSettled,
        TurnEvent::ReplyDelivered,
        TurnEvent::Failure,
        TurnEvent::Reset,
    ];

    const ALL_STATES: [SystemState; 6] = [
        SystemState::Idle,
        SystemState::Listening,
        SystemState::Processing,
        SystemState::Responding,
        SystemState::ExecutingAction,
        SystemState::Error,
    ];

    #[test]
    fn test_happy_path_without_actions() {
        let mut sm = StateMachine::new();

        assert_eq!(sm.transition(TurnEvent::WakeDetected), SystemState::Listening);
        assert_eq!(
            sm.transition(TurnEvent::UtteranceCaptured),
            SystemState::Processing
        );
        assert_eq!(sm.transition(TurnEvent::ReplyReady), SystemState::Responding);
        assert_eq!(sm.transition(TurnEvent::ReplyDelivered), SystemState::Idle);
        assert_eq!(sm.previous(), Some(SystemState::Responding));
    }

    #[test]
    fn test_happy_path_with_actions() {
        let mut sm = StateMachine::new();

        sm.transition(TurnEvent::WakeDetected);
        sm.transition(TurnEvent::UtteranceCaptured);
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
    fn test_unknown_events_from_idle_are_ignored() {
        let mut sm = StateMachine::new();

        assert_eq!(sm.transition(TurnEvent::ReplyReady), SystemState::Idle);
        assert_eq!(sm.transition(TurnEvent::ActionsSettled), SystemState::Idle);
        assert_eq!(
            sm.transition(TurnEvent::UtteranceCaptured),
            SystemState::Idle
        );
    }

    #[test]
    fn test_out_of_order_event_routes_to_error() {
        let mut sm = StateMachine::new();

        sm.transition(TurnEvent::WakeDetected);
        assert_eq!(sm.transition(TurnEvent::ReplyDelivered), SystemState::Error);
    }

    #[test]
    fn test_only_reset_leaves_error() {
        let mut sm = StateMachine::new();
        sm.transition(TurnEvent::Failure);
        assert_eq!(sm.current(), SystemState::Error);

        for event in ALL_EVENTS {
            if matches!(event, TurnEvent::Reset) {
                continue;
            }
            assert_eq!(sm.transition(event), SystemState::Error);
        }

        assert_eq!(sm.transition(TurnEvent::Reset), SystemState::Idle);
    }

    #[test]
    fn test_totality_over_random_sequences() {
        // Every event from every reachable state lands in a defined state.
        let mut sm = StateMachine::new();
        let mut step = 0usize;

        for _ in 0..500 {
            let event = ALL_EVENTS[step % ALL_EVENTS.len()];
            step = step.wrapping_mul(31).wrapping_add(7);
            let state = sm.transition(event);
            assert!(ALL_STATES.contains(&state));
        }
    }

    #[test]
    fn test_failure_records_message() {
        let mut sm = StateMachine::new();
        sm.fail("mic unplugged");
        assert_eq!(sm.current(), SystemState::Error);
        assert_eq!(
            sm.get_data("error_message"),
            Some(&Value::String("mic unplugged".to_string()))
        );

        // Reset clears the recorded message
        sm.transition(TurnEvent::Reset);
        assert!(sm.get_data("error_message").is_none());
    }

    #[test]
    fn test_callbacks_fire_on_entry() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let hits = Arc::new(AtomicUsize::new(0));
        let hits_cb = Arc::clone(&hits);

        let mut sm = StateMachine::new();
        sm.register_callback(
            SystemState::Listening,
            Box::new(move |_| {
                hits_cb.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        sm.transition(TurnEvent::WakeDetected);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failing_callback_forces_error() {
        let mut sm = StateMachine::new();
        sm.register_callback(
            SystemState::Listening,
            Box::new(|_| Err(crate::Error::State("callback exploded".to_string()))),
        );

        assert_eq!(sm.transition(TurnEvent::WakeDetected), SystemState::Error);
        assert!(sm.get_data("error_message").is_some());
    }

    #[test]
    fn test_failing_error_callback_does_not_loop() {
        let mut sm = StateMachine::new();
        sm.register_callback(
            SystemState::Error,
            Box::new(|_| Err(crate::Error::State("error hook exploded".to_string()))),
        );

        // Entering Error with a failing Error callback must terminate
        assert_eq!(sm.transition(TurnEvent::Failure), SystemState::Error);
    }

    #[test]
    fn test_turn_data_roundtrip() {
        let mut sm = StateMachine::new();
        sm.set_data("last_input", Value::String("hello".to_string()));
        assert_eq!(
            sm.get_data("last_input"),
            Some(&Value::String("hello".to_string()))
        );

        sm.clear_data();
        assert!(sm.get_data("last_input").is_none());
    }
}
