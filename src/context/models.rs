//! Data models for conversation context

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Author of a conversation turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Sender {
    #[serde(rename = "user")]
    User,
    #[serde(rename = "ai")]
    Assistant,
}

impl Sender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sender::User => "user",
            Sender::Assistant => "ai",
        }
    }
}

impl fmt::Display for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which backend actually produced an assistant turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub provider: String,
    pub model: String,
}

/// A single message in a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub sender: Sender,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_metadata: Option<ModelMetadata>,
}

impl ConversationTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            sender: Sender::User,
            text: text.into(),
            timestamp: Utc::now(),
            model_metadata: None,
        }
    }

    pub fn assistant(text: impl Into<String>, metadata: ModelMetadata) -> Self {
        Self {
            sender: Sender::Assistant,
            text: text.into(),
            timestamp: Utc::now(),
            model_metadata: Some(metadata),
        }
    }

    /// Text used for token accounting and summarization prompts
    pub fn render(&self) -> String {
        format!("{}: {}", self.sender, self.text)
    }
}

/// Generation input state of a conversation
///
/// `summary` carries everything older than `unsummarized_turns`. The pair is
/// what gets sent to a model; the display log lives in [`Conversation::history`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationContext {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub summary_token_count: usize,
    #[serde(default)]
    pub unsummarized_turns: Vec<ConversationTurn>,
    #[serde(default)]
    pub last_summarized_at: Option<DateTime<Utc>>,
}

impl ConversationContext {
    pub fn has_summary(&self) -> bool {
        !self.summary.is_empty()
    }

    /// Current state of the summarization state machine
    pub fn state(&self) -> ContextState {
        if self.has_summary() {
            ContextState::Summarized
        } else {
            ContextState::Direct
        }
    }
}

/// Summarization state of a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextState {
    /// Every turn still fits under the threshold
    Direct,
    /// A rolling summary plus a short tail of raw turns
    Summarized,
}

/// Persisted conversation record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub owner_id: String,
    pub conversation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Full turn log, never shrunk by summarization
    pub history: Vec<ConversationTurn>,
    pub context: ConversationContext,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(owner_id: impl Into<String>, conversation_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            owner_id: owner_id.into(),
            conversation_id: conversation_id.into(),
            title: None,
            history: Vec::new(),
            context: ConversationContext::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Append a completed user/assistant exchange to both the log and the context
    pub fn append_exchange(&mut self, user: ConversationTurn, assistant: ConversationTurn) {
        self.history.push(user.clone());
        self.history.push(assistant.clone());
        self.context.unsummarized_turns.push(user);
        self.context.unsummarized_turns.push(assistant);
        self.updated_at = Utc::now();
    }
}

/// Listing row for a conversation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationSummary {
    pub conversation_id: String,
    pub title: Option<String>,
    pub turn_count: usize,
    pub state: ContextState,
    pub updated_at: DateTime<Utc>,
}

impl From<&Conversation> for ConversationSummary {
    fn from(conversation: &Conversation) -> Self {
        Self {
            conversation_id: conversation.conversation_id.clone(),
            title: conversation.title.clone(),
            turn_count: conversation.history.len(),
            state: conversation.context.state(),
            updated_at: conversation.updated_at,
        }
    }
}
