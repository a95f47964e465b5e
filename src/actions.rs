//! Action dispatch
//!
//! Maps action types extracted by the NLU to registered handler functions.
//! Dispatch always resolves to a handler or an explicit "unknown action"
//! result; handler failures are folded into per-action results so one bad
//! action never aborts a batch.

use std::collections::HashMap;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::Result;

/// A structured instruction produced by the NLU
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    /// Handler key; absent when the model omitted it
    ///
    /// Models are inconsistent about the key name; accept the common
    /// spellings.
    #[serde(default, alias = "type", alias = "action")]
    pub action_type: Option<String>,

    /// Handler arguments
    #[serde(default, alias = "params")]
    pub parameters: Map<String, Value>,
}

impl Action {
    /// Build an action with the given type and parameters
    #[must_use]
    pub fn new(action_type: impl Into<String>, parameters: Map<String, Value>) -> Self {
        Self {
            action_type: Some(action_type.into()),
            parameters,
        }
    }
}

/// Outcome of dispatching a single action
#[derive(Debug, Clone, Serialize)]
pub struct ActionResult {
    pub success: bool,
    pub action_type: Option<String>,
    pub output: Option<String>,
    pub error: Option<String>,
}

impl ActionResult {
    fn ok(action_type: &str, output: String) -> Self {
        Self {
            success: true,
            action_type: Some(action_type.to_string()),
            output: Some(output),
            error: None,
        }
    }

    fn failed(action_type: &str, error: impl Into<String>) -> Self {
        Self {
            success: false,
            action_type: Some(action_type.to_string()),
            output: None,
            error: Some(error.into()),
        }
    }

    fn unknown(action_type: &str) -> Self {
        Self {
            success: false,
            action_type: Some(action_type.to_string()),
            output: None,
            error: Some(format!("unknown action type: {action_type}")),
        }
    }

    fn missing_type() -> Self {
        Self {
            success: false,
            action_type: None,
            output: None,
            error: Some("no action type specified".to_string()),
        }
    }
}

/// Synchronous handler
pub type SyncHandler = Box<dyn Fn(&Map<String, Value>) -> Result<String> + Send + Sync>;

/// Asynchronous handler
pub type AsyncHandler =
    Box<dyn Fn(Map<String, Value>) -> BoxFuture<'static, Result<String>> + Send + Sync>;

enum Handler {
    Sync(SyncHandler),
    Async(AsyncHandler),
}

/// Action execution engine with a string-keyed handler registry
pub struct ActionExecutor {
    handlers: HashMap<String, Handler>,
}

impl Default for ActionExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionExecutor {
    /// Create an executor with the default handlers registered
    #[must_use]
    pub fn new() -> Self {
        let mut executor = Self {
            handlers: HashMap::new(),
        };
        executor.register_defaults();
        executor
    }

    /// Create an executor with no handlers (for tests and embedders)
    #[must_use]
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a synchronous handler, replacing any existing one
    pub fn register(&mut self, action_type: impl Into<String>, handler: SyncHandler) {
        let action_type = action_type.into();
        tracing::debug!(action_type = %action_type, "registered handler");
        self.handlers.insert(action_type, Handler::Sync(handler));
    }

    /// Register an asynchronous handler, replacing any existing one
    pub fn register_async(&mut self, action_type: impl Into<String>, handler: AsyncHandler) {
        let action_type = action_type.into();
        tracing::debug!(action_type = %action_type, "registered async handler");
        self.handlers.insert(action_type, Handler::Async(handler));
    }

    /// Registered action types
    #[must_use]
    pub fn registered_types(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    /// Dispatch a single action synchronously
    ///
    /// Async handlers cannot run on this path and produce a failure result;
    /// use [`execute_async`](Self::execute_async) for those.
    #[must_use]
    pub fn execute(&self, action: &Action) -> ActionResult {
        let Some(action_type) = action.action_type.as_deref() else {
            return ActionResult::missing_type();
        };

        match self.handlers.get(action_type) {
            None => {
                tracing::warn!(action_type, "no handler registered");
                ActionResult::unknown(action_type)
            }
            Some(Handler::Async(_)) => {
                ActionResult::failed(action_type, "handler requires async execution")
            }
            Some(Handler::Sync(handler)) => {
                tracing::info!(action_type, "executing action");
                match handler(&action.parameters) {
                    Ok(output) => ActionResult::ok(action_type, output),
                    Err(e) => {
                        tracing::error!(action_type, error = %e, "action failed");
                        ActionResult::failed(action_type, e.to_string())
                    }
                }
            }
        }
    }

    /// Dispatch a single action, awaiting async handlers
    pub async fn execute_async(&self, action: &Action) -> ActionResult {
        let Some(action_type) = action.action_type.as_deref() else {
            return ActionResult::missing_type();
        };

        match self.handlers.get(action_type) {
            None => {
                tracing::warn!(action_type, "no handler registered");
                ActionResult::unknown(action_type)
            }
            Some(Handler::Sync(handler)) => match handler(&action.parameters) {
                Ok(output) => ActionResult::ok(action_type, output),
                Err(e) => {
                    tracing::error!(action_type, error = %e, "action failed");
                    ActionResult::failed(action_type, e.to_string())
                }
            },
            Some(Handler::Async(handler)) => {
                tracing::info!(action_type, "executing action");
                match handler(action.parameters.clone()).await {
                    Ok(output) => ActionResult::ok(action_type, output),
                    Err(e) => {
                        tracing::error!(action_type, error = %e, "action failed");
                        ActionResult::failed(action_type, e.to_string())
                    }
                }
            }
        }
    }

    /// Dispatch a batch synchronously; one result per action, in order
    #[must_use]
    pub fn execute_batch(&self, actions: &[Action]) -> Vec<ActionResult> {
        actions.iter().map(|a| self.execute(a)).collect()
    }

    /// Dispatch a batch, awaiting each action to completion in order
    pub async fn execute_batch_async(&self, actions: &[Action]) -> Vec<ActionResult> {
        let mut results = Vec::with_capacity(actions.len());
        for action in actions {
            results.push(self.execute_async(action).await);
        }
        results
    }

    /// Register the built-in handler set
    fn register_defaults(&mut self) {
        self.register("smart_home", Box::new(handle_smart_home));
        self.register("information", Box::new(handle_information));
        self.register("reminder", Box::new(handle_reminder));
        self.register("media", Box::new(handle_media));
        self.register("communication", Box::new(handle_communication));
        self.register("search", Box::new(handle_search));
    }
}

/// Read a string parameter, defaulting to empty
fn param<'a>(params: &'a Map<String, Value>, key: &str) -> &'a str {
    params.get(key).and_then(Value::as_str).unwrap_or("")
}

fn handle_smart_home(params: &Map<String, Value>) -> Result<String> {
    let device = params
        .get("device")
        .and_then(Value::as_str)
        .unwrap_or("device");
    let location = param(params, "location");
    let action = param(params, "action");
    let value = params.get("value");

    tracing::info!(device, location, action, "smart home action");

    Ok(match (action, value) {
        ("on", _) => format!("Turned on {device} in {location}"),
        ("off", _) => format!("Turned off {device} in {location}"),
        ("set", Some(v)) => format!("Set {device} in {location} to {v}"),
        _ => format!("Executed {action} on {device}"),
    })
}

fn handle_information(params: &Map<String, Value>) -> Result<String> {
    let info_type = param(params, "type");
    let location = params
        .get("location")
        .and_then(Value::as_str)
        .unwrap_or("current");

    tracing::info!(info_type, location, "information request");

    Ok(match info_type {
        "weather" => "The current weather is 72 degrees and sunny".to_string(),
        "news" => "Here are the top news headlines".to_string(),
        "time" => format!(
            "The current time is {}",
            chrono::Local::now().format("%-I:%M %p")
        ),
        other => format!("Retrieved information about {other}"),
    })
}

fn handle_reminder(params: &Map<String, Value>) -> Result<String> {
    let action = param(params, "action");
    let time = param(params, "time");
    let message = param(params, "message");

    tracing::info!(action, time, "reminder action");

    Ok(match action {
        "set" => format!("I'll remind you {message} at {time}"),
        "list" => "Here are your upcoming reminders".to_string(),
        "cancel" => "Reminder cancelled".to_string(),
        _ => "Reminder action completed".to_string(),
    })
}

fn handle_media(params: &Map<String, Value>) -> Result<String> {
    let action = param(params, "action");
    let media_type = params
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("music");
    let title = param(params, "title");

    tracing::info!(action, media_type, title, "media action");

    Ok(match action {
        "play" if !title.is_empty() => format!("Playing {title}"),
        "play" => format!("Playing {media_type}"),
        "pause" => "Media paused".to_string(),
        "stop" => "Media stopped".to_string(),
        "next" => "Playing next track".to_string(),
        "previous" => "Playing previous track".to_string(),
        _ => "Media action completed".to_string(),
    })
}

fn handle_communication(params: &Map<String, Value>) -> Result<String> {
    let action = param(params, "action");
    let recipient = param(params, "recipient");

    tracing::info!(action, recipient, "communication action");

    Ok(match action {
        "send_message" => format!("Message sent to {recipient}"),
        "call" => format!("Calling {recipient}"),
        "email" => format!("Email sent to {recipient}"),
        _ => "Communication action completed".to_string(),
    })
}

fn handle_search(params: &Map<String, Value>) -> Result<String> {
    let query = param(params, "query");
    tracing::info!(query, "search action");
    Ok(format!("Here's what I found about {query}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    fn action(action_type: &str, params: Value) -> Action {
        Action {
            action_type: Some(action_type.to_string()),
            parameters: params.as_object().cloned().unwrap_or_default(),
        }
    }

    #[test]
    fn test_default_handler_dispatch() {
        let executor = ActionExecutor::new();
        let result = executor.execute(&action(
            "smart_home",
            serde_json::json!({"device": "lights", "location": "kitchen", "action": "on"}),
        ));

        assert!(result.success);
        assert_eq!(result.output.as_deref(), Some("Turned on lights in kitchen"));
    }

    #[test]
    fn test_unknown_action_type_is_a_result_not_a_panic() {
        let executor = ActionExecutor::new();
        let result = executor.execute(&action("teleport", serde_json::json!({})));

        assert!(!result.success);
        assert_eq!(
            result.error.as_deref(),
            Some("unknown action type: teleport")
        );
    }

    #[test]
    fn test_missing_action_type() {
        let executor = ActionExecutor::new();
        let result = executor.execute(&Action {
            action_type: None,
            parameters: Map::new(),
        });

        assert!(!result.success);
        assert!(result.action_type.is_none());
        assert_eq!(result.error.as_deref(), Some("no action type specified"));
    }

    #[test]
    fn test_batch_survives_a_failing_handler() {
        let mut executor = ActionExecutor::empty();
        executor.register("good", Box::new(|_| Ok("fine".to_string())));
        executor.register(
            "bad",
            Box::new(|_| Err(Error::Action("handler blew up".to_string()))),
        );

        let actions = vec![
            action("good", serde_json::json!({})),
            action("bad", serde_json::json!({})),
            action("good", serde_json::json!({})),
        ];

        let results = executor.execute_batch(&actions);
        assert_eq!(results.len(), 3);
        assert!(results[0].success);
        assert!(!results[1].success);
        assert!(results[2].success);
    }

    #[tokio::test]
    async fn test_async_handler_dispatch() {
        let mut executor = ActionExecutor::empty();
        executor.register_async(
            "lookup",
            Box::new(|params| {
                Box::pin(async move {
                    let q = params.get("q").and_then(Value::as_str).unwrap_or("");
                    Ok(format!("looked up {q}"))
                })
            }),
        );

        let result = executor
            .execute_async(&action("lookup", serde_json::json!({"q": "rust"})))
            .await;
        assert!(result.success);
        assert_eq!(result.output.as_deref(), Some("looked up rust"));
    }

    #[test]
    fn test_sync_path_rejects_async_handler() {
        let mut executor = ActionExecutor::empty();
        executor.register_async(
            "slow",
            Box::new(|_| Box::pin(async { Ok(String::new()) })),
        );

        let result = executor.execute(&action("slow", serde_json::json!({})));
        assert!(!result.success);
        assert_eq!(
            result.error.as_deref(),
            Some("handler requires async execution")
        );
    }

    #[tokio::test]
    async fn test_async_batch_order_preserved() {
        let executor = ActionExecutor::new();
        let actions = vec![
            action("media", serde_json::json!({"action": "pause"})),
            action("nope", serde_json::json!({})),
            action("search", serde_json::json!({"query": "coffee"})),
        ];

        let results = executor.execute_batch_async(&actions).await;
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].output.as_deref(), Some("Media paused"));
        assert!(!results[1].success);
        assert!(results[2].success);
    }
}
