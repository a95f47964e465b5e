//! Conversation memory
//!
//! Append-only conversation log with recency-windowed retrieval, keyword
//! search, user preferences with optional expiry, and optional SQLite
//! mirroring. The in-memory log is the working copy; when persistence is
//! enabled every append is mirrored to the store and recent history is
//! reloaded on startup.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::config::ContextSettings;
use crate::store::{self, DbPool};
use crate::{Error, Result};

/// Who produced a conversation message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    fn from_str_value(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single immutable entry in the conversation log
#[derive(Debug, Clone, Serialize)]
pub struct ConversationMessage {
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// A user preference with optional expiry
#[derive(Debug, Clone)]
pub struct Preference {
    pub value: Value,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Preference {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Context statistics
///
/// The field set is identical whether or not history is empty; absent
/// timestamps serialize as `null`, never as missing keys.
#[derive(Debug, Clone, Serialize)]
pub struct ContextStats {
    pub total_messages: usize,
    pub user_messages: usize,
    pub assistant_messages: usize,
    pub oldest_message: Option<DateTime<Utc>>,
    pub newest_message: Option<DateTime<Utc>>,
    pub preference_count: usize,
}

/// Conversation memory manager
pub struct ContextManager {
    settings: ContextSettings,
    history: Vec<ConversationMessage>,
    preferences: HashMap<String, Preference>,
    db: Option<DbPool>,
}

impl ContextManager {
    /// Create a context manager, opening the store when persistence is on
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be opened or loaded
    pub fn new(settings: ContextSettings) -> Result<Self> {
        let db = if settings.persistent {
            Some(store::init(&settings.db_path)?)
        } else {
            None
        };

        Self::with_optional_pool(settings, db)
    }

    /// Create a context manager over an already-open pool (used by tests
    /// and by callers that share the pool with the API server)
    ///
    /// # Errors
    ///
    /// Returns error if loading persisted history fails
    pub fn with_pool(settings: ContextSettings, pool: DbPool) -> Result<Self> {
        Self::with_optional_pool(settings, Some(pool))
    }

    fn with_optional_pool(settings: ContextSettings, db: Option<DbPool>) -> Result<Self> {
        let mut manager = Self {
            settings,
            history: Vec::new(),
            preferences: HashMap::new(),
            db,
        };

        if manager.db.is_some() {
            manager.load()?;
        }

        tracing::info!(
            persistent = manager.db.is_some(),
            loaded = manager.history.len(),
            "context manager initialized"
        );
        Ok(manager)
    }

    /// Append a message to the log
    ///
    /// The append is mirrored to the store when persistence is enabled,
    /// then history older than the retention window is trimmed.
    ///
    /// # Errors
    ///
    /// Returns error if the store write fails
    pub fn add_message(&mut self, role: Role, text: impl Into<String>) -> Result<()> {
        let message = ConversationMessage {
            role,
            text: text.into(),
            timestamp: Utc::now(),
        };

        if let Some(ref db) = self.db {
            let conn = db.get().map_err(|e| Error::Database(e.to_string()))?;
            conn.execute(
                "INSERT INTO messages (id, role, content, created_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    Uuid::new_v4().to_string(),
                    message.role.as_str(),
                    message.text,
                    message.timestamp.to_rfc3339(),
                ],
            )?;
        }

        tracing::debug!(role = %message.role, chars = message.text.len(), "message appended");
        self.history.push(message);

        let cutoff = Utc::now() - Duration::hours(self.settings.retention_hours);
        self.trim(cutoff)?;

        Ok(())
    }

    /// Last `n` messages, oldest first
    #[must_use]
    pub fn recent(&self, n: usize) -> &[ConversationMessage] {
        let start = self.history.len().saturating_sub(n);
        &self.history[start..]
    }

    /// The configured prompt window of recent messages
    #[must_use]
    pub fn prompt_window(&self) -> &[ConversationMessage] {
        self.recent(self.settings.max_context_messages)
    }

    /// Full history for the process lifetime
    #[must_use]
    pub fn full_history(&self) -> &[ConversationMessage] {
        &self.history
    }

    /// Case-insensitive substring search; returns the most recent `limit`
    /// matches in chronological order
    #[must_use]
    pub fn search(&self, keyword: &str, limit: usize) -> Vec<&ConversationMessage> {
        let needle = keyword.to_lowercase();
        let mut matches: Vec<&ConversationMessage> = self
            .history
            .iter()
            .rev()
            .filter(|m| m.text.to_lowercase().contains(&needle))
            .take(limit)
            .collect();
        matches.reverse();
        matches
    }

    /// Remove messages older than `cutoff` (and purge expired preferences)
    ///
    /// Only entries strictly older than the cutoff are removed; calling
    /// twice with the same cutoff is a no-op the second time.
    ///
    /// # Errors
    ///
    /// Returns error if the store delete fails
    pub fn trim(&mut self, cutoff: DateTime<Utc>) -> Result<()> {
        let before = self.history.len();
        self.history.retain(|m| m.timestamp >= cutoff);
        let removed = before - self.history.len();

        if let Some(ref db) = self.db {
            let conn = db.get().map_err(|e| Error::Database(e.to_string()))?;
            conn.execute(
                "DELETE FROM messages WHERE created_at < ?1",
                [cutoff.to_rfc3339()],
            )?;
            conn.execute(
                "DELETE FROM preferences WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                [Utc::now().to_rfc3339()],
            )?;
        }

        let now = Utc::now();
        self.preferences.retain(|_, p| !p.is_expired(now));

        if removed > 0 {
            tracing::debug!(removed, remaining = self.history.len(), "history trimmed");
        }
        Ok(())
    }

    /// Set a preference, optionally expiring after `ttl`
    ///
    /// # Errors
    ///
    /// Returns error if the store write fails
    pub fn set_preference(
        &mut self,
        key: impl Into<String>,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let key = key.into();
        let expires_at = ttl.map(|d| Utc::now() + d);

        if let Some(ref db) = self.db {
            let conn = db.get().map_err(|e| Error::Database(e.to_string()))?;
            conn.execute(
                "INSERT OR REPLACE INTO preferences (key, value, expires_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    key,
                    serde_json::to_string(&value)?,
                    expires_at.map(|at| at.to_rfc3339()),
                    Utc::now().to_rfc3339(),
                ],
            )?;
        }

        tracing::debug!(key = %key, "preference set");
        self.preferences.insert(key, Preference { value, expires_at });
        Ok(())
    }

    /// Read a preference; expired entries are invisible
    #[must_use]
    pub fn preference(&self, key: &str) -> Option<&Value> {
        let now = Utc::now();
        self.preferences
            .get(key)
            .filter(|p| !p.is_expired(now))
            .map(|p| &p.value)
    }

    /// Context statistics with a shape independent of history size
    #[must_use]
    pub fn stats(&self) -> ContextStats {
        let now = Utc::now();
        let user_messages = self
            .history
            .iter()
            .filter(|m| m.role == Role::User)
            .count();

        ContextStats {
            total_messages: self.history.len(),
            user_messages,
            assistant_messages: self.history.len() - user_messages,
            oldest_message: self.history.first().map(|m| m.timestamp),
            newest_message: self.history.last().map(|m| m.timestamp),
            preference_count: self
                .preferences
                .values()
                .filter(|p| !p.is_expired(now))
                .count(),
        }
    }

    /// Drop all in-memory history (the store is left untouched)
    pub fn clear(&mut self) {
        tracing::info!(dropped = self.history.len(), "conversation context cleared");
        self.history.clear();
    }

    /// Load messages within the retention window and all live preferences
    fn load(&mut self) -> Result<()> {
        let Some(ref db) = self.db else {
            return Ok(());
        };
        let conn = db.get().map_err(|e| Error::Database(e.to_string()))?;

        let cutoff = Utc::now() - Duration::hours(self.settings.retention_hours);
        let mut stmt = conn.prepare(
            "SELECT role, content, created_at FROM messages
             WHERE created_at >= ?1 ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map([cutoff.to_rfc3339()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        for row in rows.flatten() {
            let (role, text, created_at) = row;
            let Some(role) = Role::from_str_value(&role) else {
                continue;
            };
            let timestamp = DateTime::parse_from_rfc3339(&created_at)
                .map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc));
            self.history.push(ConversationMessage { role, text, timestamp });
        }

        let now = Utc::now().to_rfc3339();
        let mut stmt = conn.prepare(
            "SELECT key, value, expires_at FROM preferences
             WHERE expires_at IS NULL OR expires_at > ?1",
        )?;
        let rows = stmt.query_map([now], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
            ))
        })?;

        for row in rows.flatten() {
            let (key, raw, expires_at) = row;
            let value = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
            let expires_at = expires_at.and_then(|s| {
                DateTime::parse_from_rfc3339(&s)
                    .ok()
                    .map(|dt| dt.with_timezone(&Utc))
            });
            self.preferences.insert(key, Preference { value, expires_at });
        }

        Ok(())
    }
}
