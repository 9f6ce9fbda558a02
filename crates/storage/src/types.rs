use std::fmt;

use super::ids::{MessageId, SessionId};

/// Title shown for sessions that were never named.
pub const DEFAULT_SESSION_TITLE: &str = "New Chat";

/// Storage-local message role, decoupled from provider role enums.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl fmt::Display for MessageRole {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub id: SessionId,
    pub title: Option<String>,
    pub created_at_unix_ms: u64,
    pub updated_at_unix_ms: u64,
}

impl SessionRecord {
    pub fn display_title(&self) -> &str {
        self.title.as_deref().unwrap_or(DEFAULT_SESSION_TITLE)
    }
}

/// Sidebar row: one session plus what the list needs to describe it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub id: SessionId,
    pub title: Option<String>,
    pub created_at_unix_ms: u64,
    pub message_count: u64,
    /// First user message of the session, if any.
    pub preview: Option<String>,
    pub last_message_at_unix_ms: Option<u64>,
}

impl SessionSummary {
    pub fn display_title(&self) -> &str {
        self.title
            .as_deref()
            .or(self.preview.as_deref())
            .unwrap_or(DEFAULT_SESSION_TITLE)
    }

    /// Last activity, falling back to creation for empty sessions.
    pub fn last_active_unix_ms(&self) -> u64 {
        self.last_message_at_unix_ms
            .unwrap_or(self.created_at_unix_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NewSession {
    pub title: Option<String>,
}

impl NewSession {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: MessageId,
    pub session_id: SessionId,
    pub seq: u64,
    pub role: MessageRole,
    pub content: String,
    pub created_at_unix_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub role: MessageRole,
    pub content: String,
}

impl NewMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}
