//! Prompt assembly for conversation turns

use crate::context::ConversationContext;
use crate::providers::{ChatMessage, ChatRole};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const BASE_SYSTEM_PROMPT: &str = "You are an AI assistant for a CRM system. You help users \
manage their contacts, understand their activity history and draft follow-ups.";

const CLOSING_INSTRUCTION: &str = "Always provide helpful, accurate information about the \
user's CRM data and assist with contact management tasks.";

const MAX_PROMPT_CONTACTS: usize = 10;
const MAX_PROMPT_ACTIVITIES: usize = 5;

/// Snapshot of a user's CRM data injected into the system prompt
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BusinessContext {
    pub total_contacts: usize,
    pub companies_count: usize,
    pub tags_count: usize,
    /// (company, contact count), largest first
    #[serde(default)]
    pub top_companies: Vec<(String, usize)>,
    /// Most recently contacted first
    #[serde(default)]
    pub recent_contacts: Vec<ContactSummary>,
    /// Most recent first
    #[serde(default)]
    pub recent_activities: Vec<ActivitySummary>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactSummary {
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivitySummary {
    pub activity_type: String,
    #[serde(default)]
    pub details: String,
    pub timestamp: DateTime<Utc>,
}

/// Source of business context snapshots
///
/// Returning `None` degrades the prompt to the base instructions.
#[async_trait]
pub trait BusinessContextSource: Send + Sync {
    async fn snapshot(&self, owner_id: &str) -> Option<BusinessContext>;
}

/// Source with no business data
pub struct NoBusinessContext;

#[async_trait]
impl BusinessContextSource for NoBusinessContext {
    async fn snapshot(&self, _owner_id: &str) -> Option<BusinessContext> {
        None
    }
}

/// Build the system prompt, optionally enriched with a CRM snapshot
pub fn build_system_prompt(business: Option<&BusinessContext>) -> String {
    let mut prompt = BASE_SYSTEM_PROMPT.to_string();

    if let Some(ctx) = business {
        prompt.push_str("\n\nCURRENT CRM DATA SUMMARY:\n");
        prompt.push_str(&format!(
            "- Total Contacts: {}\n- Companies: {}\n- Tags: {}",
            ctx.total_contacts, ctx.companies_count, ctx.tags_count
        ));

        if !ctx.top_companies.is_empty() {
            prompt.push_str("\n\nTOP COMPANIES (by contact count):");
            for (company, count) in &ctx.top_companies {
                prompt.push_str(&format!("\n- {}: {} contacts", company, count));
            }
        }

        if !ctx.recent_contacts.is_empty() {
            prompt.push_str("\n\nRECENT CONTACTS:");
            for contact in ctx.recent_contacts.iter().take(MAX_PROMPT_CONTACTS) {
                prompt.push_str(&format!("\n- {} ({})", contact.name, contact.email));
                if let Some(company) = &contact.company {
                    prompt.push_str(&format!(" at {}", company));
                }
                if !contact.tags.is_empty() {
                    prompt.push_str(&format!(" - Tags: {}", contact.tags.join(", ")));
                }
            }
        }

        if !ctx.recent_activities.is_empty() {
            prompt.push_str("\n\nRECENT ACTIVITIES:");
            for activity in ctx.recent_activities.iter().take(MAX_PROMPT_ACTIVITIES) {
                prompt.push_str(&format!(
                    "\n- {}: {} ({})",
                    activity.activity_type,
                    activity.details,
                    activity.timestamp.format("%Y-%m-%d")
                ));
            }
        }

        if !ctx.tags.is_empty() {
            prompt.push_str("\n\nAVAILABLE TAGS:");
            for tag in &ctx.tags {
                prompt.push_str(&format!("\n- {}", tag));
            }
        }
    }

    prompt.push_str("\n\n");
    prompt.push_str(CLOSING_INSTRUCTION);
    prompt
}

/// Assemble the model input for a reconciled context
///
/// Summary and raw history are never sent together: when a summary exists
/// only the last `recent_with_summary` turns accompany it.
pub fn assemble_prompt(
    system_prompt: &str,
    context: &ConversationContext,
    recent_without_summary: usize,
    recent_with_summary: usize,
) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::new(ChatRole::System, system_prompt)];

    let recent = if context.has_summary() {
        messages.push(ChatMessage::new(
            ChatRole::Assistant,
            format!("[Previous conversation summary: {}]", context.summary),
        ));
        recent_with_summary
    } else {
        recent_without_summary
    };

    let turns = &context.unsummarized_turns;
    let start = turns.len().saturating_sub(recent);
    messages.extend(turns[start..].iter().map(|turn| {
        let role = match turn.sender {
            crate::context::Sender::User => ChatRole::User,
            crate::context::Sender::Assistant => ChatRole::Assistant,
        };
        ChatMessage::new(role, turn.text.clone())
    }));

    messages
}
