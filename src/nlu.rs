//! Natural-language understanding
//!
//! Delegates understanding to a hosted chat-completions endpoint, then
//! defensively parses the reply for an intent, entities, and structured
//! action payloads. Malformed model output degrades to an empty action list
//! with low confidence; it is never fatal.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::actions::Action;
use crate::config::{NluSettings, OpenAiSettings};
use crate::context::ConversationMessage;
use crate::retry::{with_backoff, RetryPolicy};
use crate::state::StateSnapshot;
use crate::{Error, Result};

/// Baseline confidence for a clean reply
const CONFIDENCE_HIGH: f32 = 0.8;

/// Confidence when the reply hedges
const CONFIDENCE_HEDGED: f32 = 0.5;

/// Confidence when action payloads were present but none parsed
const CONFIDENCE_DEGRADED: f32 = 0.2;

/// Phrases that lower the confidence estimate
const HEDGING_PHRASES: [&str; 5] = [
    "i'm not sure",
    "i don't know",
    "maybe",
    "perhaps",
    "i think",
];

/// Classified purpose of an utterance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    Control,
    Query,
    Reminder,
    Media,
    Communication,
    General,
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Control => "control",
            Self::Query => "query",
            Self::Reminder => "reminder",
            Self::Media => "media",
            Self::Communication => "communication",
            Self::General => "general",
        };
        write!(f, "{name}")
    }
}

/// Named entities pulled from an utterance
#[derive(Debug, Clone, Default, Serialize)]
pub struct Entities {
    pub devices: Vec<String>,
    pub locations: Vec<String>,
    pub times: Vec<String>,
    pub numbers: Vec<String>,
}

/// The full result of understanding one utterance
#[derive(Debug, Clone, Serialize)]
pub struct Understanding {
    /// Reply text with action payloads stripped, ready to speak
    pub reply: String,
    pub intent: Intent,
    pub entities: Entities,
    pub actions: Vec<Action>,
    pub confidence: f32,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

/// Hosted-LLM understanding engine
pub struct NluCore {
    client: reqwest::Client,
    openai: OpenAiSettings,
    settings: NluSettings,
    retry: RetryPolicy,
    system_prompt: String,
}

impl NluCore {
    /// Create an NLU core
    ///
    /// # Errors
    ///
    /// Returns error if the API key is missing
    pub fn new(openai: OpenAiSettings, settings: NluSettings) -> Result<Self> {
        if openai.api_key.is_empty() {
            return Err(Error::Config(
                "OPENAI_API_KEY required for language understanding".to_string(),
            ));
        }

        let system_prompt = settings
            .system_prompt
            .clone()
            .unwrap_or_else(|| default_system_prompt().to_string());

        tracing::info!(model = %openai.llm_model, "NLU core initialized");

        Ok(Self {
            client: reqwest::Client::new(),
            openai,
            settings,
            retry: RetryPolicy::default(),
            system_prompt,
        })
    }

    /// Override the retry policy (tests use [`RetryPolicy::none`])
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Understand one utterance
    ///
    /// Calls the chat endpoint with the recent context and state summary,
    /// then extracts intent, entities, and actions from the reply.
    ///
    /// # Errors
    ///
    /// Returns error when the endpoint is unreachable after retries; parse
    /// problems in the reply never error.
    pub async fn process(
        &self,
        input: &str,
        context: &[ConversationMessage],
        state: Option<&StateSnapshot>,
    ) -> Result<Understanding> {
        let messages = self.build_messages(input, context, state);

        tracing::info!(chars = input.len(), "processing utterance");

        let raw = with_backoff(&self.retry, "nlu", || {
            self.request_completion(&messages)
        })
        .await?;

        Ok(self.interpret(input, &raw))
    }

    /// Turn a raw model reply into an [`Understanding`] (pure; no I/O)
    #[must_use]
    pub fn interpret(&self, input: &str, raw_reply: &str) -> Understanding {
        let (actions, saw_candidates) = extract_actions(raw_reply);
        let reply = strip_action_markers(raw_reply);

        let confidence = if saw_candidates && actions.is_empty() {
            CONFIDENCE_DEGRADED
        } else {
            score_confidence(&reply)
        };

        Understanding {
            reply,
            intent: classify_intent(input),
            entities: extract_entities(input),
            actions,
            confidence,
        }
    }

    /// One chat-completion round trip
    async fn request_completion(&self, messages: &[ChatMessage]) -> Result<String> {
        let request = ChatRequest {
            model: &self.openai.llm_model,
            messages: messages
                .iter()
                .map(|m| ChatMessage {
                    role: m.role.clone(),
                    content: m.content.clone(),
                })
                .collect(),
            temperature: self.settings.temperature,
            max_tokens: self.settings.max_tokens,
        };

        let response = self
            .client
            .post(&self.openai.llm_url)
            .bearer_auth(&self.openai.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Status {
                service: "chat",
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatResponse = response.json().await?;
        let reply = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| Error::Nlu("chat response contained no choices".to_string()))?;

        tracing::debug!(chars = reply.len(), "completion received");
        Ok(reply.trim().to_string())
    }

    /// Assemble the chat message list: system prompt, state summary,
    /// recent context, then the current input
    fn build_messages(
        &self,
        input: &str,
        context: &[ConversationMessage],
        state: Option<&StateSnapshot>,
    ) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage {
            role: "system".to_string(),
            content: self.system_prompt.clone(),
        }];

        if let Some(snapshot) = state {
            let summary = format_state(snapshot);
            if !summary.is_empty() {
                messages.push(ChatMessage {
                    role: "system".to_string(),
                    content: format!("Current system state: {summary}"),
                });
            }
        }

        for msg in context {
            messages.push(ChatMessage {
                role: msg.role.to_string(),
                content: msg.text.clone(),
            });
        }

        messages.push(ChatMessage {
            role: "user".to_string(),
            content: input.to_string(),
        });

        messages
    }
}

/// Built-in system prompt instructing the action convention
fn default_system_prompt() -> &'static str {
    r#"You are a helpful ambient voice assistant.

Key behaviors:
- Be conversational and natural
- Keep responses concise (1-3 sentences usually)
- Acknowledge commands with confirmation
- Ask for clarification when needed
- When executing actions, describe what you're doing

For actionable commands, include structured data in your response using this format:
ACTION: {"action_type": "name", "parameters": {...}}

Available actions:
- smart_home: control lights, temperature, security
- information: weather, news, time
- reminder: reminders and alarms
- communication: send messages, make calls
- media: play music, videos, podcasts
- search: search for information

Example:
User: "Turn on the living room lights"
Assistant: "I'll turn on the living room lights. ACTION: {"action_type": "smart_home", "parameters": {"device": "lights", "location": "living room", "action": "on"}}""#
}

/// Summarize a state snapshot for the prompt
fn format_state(snapshot: &StateSnapshot) -> String {
    let mut parts = vec![format!("state: {}", snapshot.state)];
    if let Some(prev) = snapshot.previous {
        parts.push(format!("previous: {prev}"));
    }
    for (key, value) in &snapshot.data {
        parts.push(format!("{key}: {value}"));
    }
    parts.join(", ")
}

/// Extract action payloads following `ACTION:` markers
///
/// Returns the parsed actions and whether any candidate payload was seen
/// (used to degrade confidence when candidates exist but none parse).
///
/// Payload boundaries are found by brace counting, not pattern matching: a
/// non-greedy regex stops at the first `}` and truncates nested structures.
#[must_use]
pub fn extract_actions(text: &str) -> (Vec<Action>, bool) {
    let marker = action_marker();
    let mut actions = Vec::new();
    let mut saw_candidates = false;

    for found in marker.find_iter(text) {
        let rest = &text[found.end()..];
        let Some(candidate) = balanced_object(rest) else {
            continue;
        };
        saw_candidates = true;

        match serde_json::from_str::<Action>(candidate) {
            Ok(action) => {
                tracing::info!(action_type = ?action.action_type, "extracted action");
                actions.push(action);
            }
            Err(e) => {
                tracing::warn!(error = %e, payload = candidate, "failed to parse action payload");
            }
        }
    }

    (actions, saw_candidates)
}

/// Slice out the first balanced `{...}` object at the start of `text`
///
/// Tracks brace depth, skipping braces inside string literals and honoring
/// escapes. Returns `None` when no opening brace starts the text or the
/// object never closes.
fn balanced_object(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    if bytes.first() != Some(&b'{') {
        return None;
    }

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[..=i]);
                }
            }
            _ => {}
        }
    }

    None
}

/// The `ACTION:` marker pattern, compiled once
fn action_marker() -> &'static Regex {
    static MARKER: OnceLock<Regex> = OnceLock::new();
    MARKER.get_or_init(|| Regex::new(r"ACTION:\s*").expect("valid static pattern"))
}

/// Remove `ACTION: {...}` payloads so they are not spoken aloud
fn strip_action_markers(text: &str) -> String {
    let marker = action_marker();
    let mut result = String::with_capacity(text.len());
    let mut cursor = 0;

    for found in marker.find_iter(text) {
        if found.start() < cursor {
            continue;
        }
        result.push_str(&text[cursor..found.start()]);
        cursor = balanced_object(&text[found.end()..]).map_or(found.end(), |obj| {
            found.end() + obj.len()
        });
    }
    result.push_str(&text[cursor..]);

    result.trim().to_string()
}

/// Keyword-based closed intent classification
///
/// Reminder phrasing is checked before control phrasing so "set an alarm"
/// classifies as a reminder rather than a device command.
#[must_use]
pub fn classify_intent(text: &str) -> Intent {
    let lower = text.to_lowercase();
    let contains_any = |keywords: &[&str]| keywords.iter().any(|k| lower.contains(k));

    if contains_any(&["remind me", "reminder", "alarm", "schedule"]) {
        Intent::Reminder
    } else if contains_any(&["turn on", "turn off", "set", "adjust"]) {
        Intent::Control
    } else if contains_any(&["what", "when", "where", "how", "who"]) {
        Intent::Query
    } else if contains_any(&["play", "pause", "next", "previous", "skip"]) {
        Intent::Media
    } else if contains_any(&["send", "message", "call", "text"]) {
        Intent::Communication
    } else {
        Intent::General
    }
}

/// Keyword-list entity extraction
#[must_use]
pub fn extract_entities(text: &str) -> Entities {
    const DEVICES: [&str; 7] = [
        "lights", "light", "thermostat", "temperature", "door", "lock", "camera",
    ];
    const LOCATIONS: [&str; 5] = ["living room", "bedroom", "kitchen", "bathroom", "garage"];
    const TIMES: [&str; 6] = [
        "morning", "afternoon", "evening", "tonight", "today", "tomorrow",
    ];

    let lower = text.to_lowercase();
    let collect = |keywords: &[&str]| {
        keywords
            .iter()
            .filter(|k| lower.contains(*k))
            .map(|k| (*k).to_string())
            .collect()
    };

    static NUMBERS: OnceLock<Regex> = OnceLock::new();
    let numbers = NUMBERS
        .get_or_init(|| Regex::new(r"\b\d+\b").expect("valid static pattern"))
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .collect();

    Entities {
        devices: collect(&DEVICES),
        locations: collect(&LOCATIONS),
        times: collect(&TIMES),
        numbers,
    }
}

/// Heuristic confidence from hedging phrases in the reply
fn score_confidence(reply: &str) -> f32 {
    let lower = reply.to_lowercase();
    if HEDGING_PHRASES.iter().any(|p| lower.contains(p)) {
        CONFIDENCE_HEDGED
    } else {
        CONFIDENCE_HIGH
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_extract_action_with_nested_braces() {
        let reply = r#"Setting that up. ACTION: {"action_type": "set_reminder", "parameters": {"time": {"hour": 7}}}"#;
        let (actions, saw) = extract_actions(reply);

        assert!(saw);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].action_type.as_deref(), Some("set_reminder"));
        assert_eq!(
            actions[0].parameters["time"]["hour"],
            Value::from(7)
        );
    }

    #[test]
    fn test_extract_multiple_actions() {
        let reply = r#"Done. ACTION: {"action_type": "smart_home", "parameters": {"action": "on"}} and ACTION: {"action_type": "media", "parameters": {"action": "play"}}"#;
        let (actions, _) = extract_actions(reply);

        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].action_type.as_deref(), Some("smart_home"));
        assert_eq!(actions[1].action_type.as_deref(), Some("media"));
    }

    #[test]
    fn test_malformed_payload_is_skipped() {
        let reply = r#"ACTION: {"action_type": "good", "parameters": {}} ACTION: {"action_type": bad}"#;
        let (actions, saw) = extract_actions(reply);

        assert!(saw);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].action_type.as_deref(), Some("good"));
    }

    #[test]
    fn test_braces_inside_strings_do_not_confuse_the_parser() {
        let reply = r#"ACTION: {"action_type": "search", "parameters": {"query": "what does {} mean"}}"#;
        let (actions, _) = extract_actions(reply);

        assert_eq!(actions.len(), 1);
        assert_eq!(
            actions[0].parameters["query"],
            Value::String("what does {} mean".to_string())
        );
    }

    #[test]
    fn test_unclosed_object_yields_nothing() {
        let reply = r#"ACTION: {"action_type": "oops", "parameters": {"#;
        let (actions, saw) = extract_actions(reply);

        assert!(actions.is_empty());
        assert!(!saw);
    }

    #[test]
    fn test_strip_action_markers() {
        let reply = r#"I'll turn them on. ACTION: {"action_type": "smart_home", "parameters": {"a": {"b": 1}}}"#;
        assert_eq!(strip_action_markers(reply), "I'll turn them on.");
    }

    #[test]
    fn test_intent_reminder_beats_control_for_alarms() {
        assert_eq!(classify_intent("set an alarm for 7am"), Intent::Reminder);
        assert_eq!(classify_intent("remind me to stretch"), Intent::Reminder);
        assert_eq!(classify_intent("set the thermostat to 70"), Intent::Control);
    }

    #[test]
    fn test_intent_classification() {
        assert_eq!(classify_intent("turn off the lights"), Intent::Control);
        assert_eq!(classify_intent("what's the weather"), Intent::Query);
        assert_eq!(classify_intent("play some jazz"), Intent::Media);
        assert_eq!(classify_intent("call mom"), Intent::Communication);
        assert_eq!(classify_intent("hello there"), Intent::General);
    }

    #[test]
    fn test_entity_extraction() {
        let entities =
            extract_entities("Turn on the lights in the living room at 7 tomorrow");

        assert!(entities.devices.contains(&"lights".to_string()));
        assert!(entities.locations.contains(&"living room".to_string()));
        assert!(entities.times.contains(&"tomorrow".to_string()));
        assert_eq!(entities.numbers, vec!["7"]);
    }

    #[test]
    fn test_interpret_degrades_on_unparseable_actions() {
        let core = NluCore::new(
            crate::config::Settings::for_tests().openai,
            crate::config::Settings::for_tests().nlu,
        )
        .unwrap();

        let understanding =
            core.interpret("do the thing", r#"Okay! ACTION: {"action_type": nope}"#);
        assert!(understanding.actions.is_empty());
        assert!((understanding.confidence - 0.2).abs() < f32::EPSILON);
    }

    #[test]
    fn test_interpret_hedged_reply_lowers_confidence() {
        let core = NluCore::new(
            crate::config::Settings::for_tests().openai,
            crate::config::Settings::for_tests().nlu,
        )
        .unwrap();

        let hedged = core.interpret("hm", "I'm not sure about that.");
        assert!((hedged.confidence - 0.5).abs() < f32::EPSILON);

        let confident = core.interpret("hm", "Absolutely, done.");
        assert!((confident.confidence - 0.8).abs() < f32::EPSILON);
    }
}
