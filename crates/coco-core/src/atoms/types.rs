// ── COCO Atoms: Pure Data Types ────────────────────────────────────────────
// All plain struct/enum definitions with no logic beyond small accessors.
// These types flow through the entire engine and are independent of any
// specific model provider or storage backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Messages (model wire protocol, provider-independent) ───────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// Present on assistant messages that requested tool calls.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// Present on tool-result messages; references the originating call id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Message {
            role: Role::User,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Message {
            role: Role::Assistant,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Message {
            role: Role::Tool,
            content: content.into(),
            tool_calls: None,
            tool_call_id: Some(call_id.into()),
        }
    }
}

/// A tool_use block from the model: `{id, name, input}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

/// A tool exposed to the model: `{name, description, input_schema}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

// ── Episodes ───────────────────────────────────────────────────────────────

/// One tool invocation made during an episode, embedded in that episode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub name: String,
    pub input: serde_json::Value,
    /// Rendered result text handed back to the model as an observation.
    pub result: Option<String>,
    /// Error kind + message when the handler failed.
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Immutable record of one (user, assistant) exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    pub episode_id: i64,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub user_text: String,
    pub assistant_text: String,
    pub tool_calls: Vec<ToolInvocation>,
    pub usage: TokenUsage,
    /// True when the user interrupted the turn before it completed.
    pub cancelled: bool,
}

// ── Facts ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactType {
    Appointment,
    Contact,
    Task,
    Preference,
    Note,
    EmailRecipient,
    DocumentReference,
    FileReference,
    CalendarReference,
    Topic,
    Command,
    Generic,
}

impl FactType {
    pub const ALL: [FactType; 12] = [
        FactType::Appointment,
        FactType::Contact,
        FactType::Task,
        FactType::Preference,
        FactType::Note,
        FactType::EmailRecipient,
        FactType::DocumentReference,
        FactType::FileReference,
        FactType::CalendarReference,
        FactType::Topic,
        FactType::Command,
        FactType::Generic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FactType::Appointment => "appointment",
            FactType::Contact => "contact",
            FactType::Task => "task",
            FactType::Preference => "preference",
            FactType::Note => "note",
            FactType::EmailRecipient => "email_recipient",
            FactType::DocumentReference => "document_reference",
            FactType::FileReference => "file_reference",
            FactType::CalendarReference => "calendar_reference",
            FactType::Topic => "topic",
            FactType::Command => "command",
            FactType::Generic => "generic",
        }
    }

    pub fn parse(s: &str) -> Option<FactType> {
        FactType::ALL.iter().copied().find(|t| t.as_str() == s)
    }

    /// Type-specific base importance assigned at creation time.
    pub fn base_importance(&self) -> f64 {
        match self {
            FactType::Appointment | FactType::Contact | FactType::Task => 0.9,
            FactType::Preference => 0.8,
            FactType::Note
            | FactType::Topic
            | FactType::EmailRecipient
            | FactType::DocumentReference
            | FactType::FileReference
            | FactType::CalendarReference => 0.6,
            FactType::Command => 0.5,
            FactType::Generic => 0.4,
        }
    }

    /// Default decay half-life in days. Volatile types fade faster.
    pub fn default_half_life_days(&self) -> f64 {
        match self {
            FactType::Appointment | FactType::CalendarReference => 14.0,
            FactType::Task | FactType::Command => 21.0,
            FactType::Contact | FactType::Preference => 90.0,
            FactType::EmailRecipient => 60.0,
            _ => 30.0,
        }
    }
}

/// A structured memory unit with importance and decay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fact {
    pub fact_id: i64,
    pub fact_type: FactType,
    pub content: String,
    /// Normalized entity the fact is about (e.g. "Sarah").
    pub subject: Option<String>,
    pub importance: f64,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: i64,
    pub source_episode_id: Option<i64>,
    pub source_tool: Option<String>,
    pub half_life_days: f64,
    pub tags: Vec<String>,
}

/// A fact as produced by the extractor, before the store assigns an id
/// and computes importance from the type base and confidence.
#[derive(Debug, Clone)]
pub struct NewFact {
    pub fact_type: FactType,
    pub content: String,
    pub subject: Option<String>,
    /// Extractor confidence in [0, 1]; modulates base importance.
    pub confidence: f64,
    pub source_episode_id: Option<i64>,
    pub source_tool: Option<String>,
    pub tags: Vec<String>,
}

impl NewFact {
    pub fn new(fact_type: FactType, content: impl Into<String>) -> Self {
        NewFact {
            fact_type,
            content: content.into(),
            subject: None,
            confidence: 1.0,
            source_episode_id: None,
            source_tool: None,
            tags: Vec::new(),
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn from_tool(mut self, tool: impl Into<String>) -> Self {
        self.source_tool = Some(tool.into());
        self
    }
}

// ── Semantic memories ──────────────────────────────────────────────────────

/// A text with an embedding, as returned from retrieval (vector not exposed).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticMemory {
    pub memory_id: i64,
    pub text: String,
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: i64,
    /// Effective score — only present in retrieval results.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

// ── Conversation summaries ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyExchange {
    pub user: String,
    pub assistant: String,
}

/// Condensed record of a window of episodes, retained across sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub summary_id: String,
    pub session_id: String,
    pub timestamp_start: DateTime<Utc>,
    pub timestamp_end: DateTime<Utc>,
    pub exchange_count: usize,
    pub summary_text: String,
    pub key_points: Vec<String>,
    /// Verbatim (user, assistant) pairs so precise phrasing survives.
    pub key_exchanges: Vec<KeyExchange>,
    pub tags: Vec<String>,
    pub importance: f64,
}

// ── Identity documents ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityFileKind {
    Coco,
    UserProfile,
    PreviousConversation,
}

impl IdentityFileKind {
    pub const ALL: [IdentityFileKind; 3] = [
        IdentityFileKind::Coco,
        IdentityFileKind::UserProfile,
        IdentityFileKind::PreviousConversation,
    ];

    pub fn file_name(&self) -> &'static str {
        match self {
            IdentityFileKind::Coco => "COCO.md",
            IdentityFileKind::UserProfile => "USER_PROFILE.md",
            IdentityFileKind::PreviousConversation => "previous_conversation.md",
        }
    }
}

/// Frontmatter carried by every identity file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityFrontmatter {
    pub awakening_count: u64,
    pub coherence: f64,
    pub updated_at: String,
}

impl Default for IdentityFrontmatter {
    fn default() -> Self {
        IdentityFrontmatter {
            awakening_count: 0,
            coherence: 0.0,
            updated_at: String::new(),
        }
    }
}

/// A parsed identity file: frontmatter block plus free-form markdown body.
#[derive(Debug, Clone)]
pub struct IdentityDocument {
    pub kind: IdentityFileKind,
    pub frontmatter: IdentityFrontmatter,
    pub body: String,
}

// ── Utility ────────────────────────────────────────────────────────────────

/// UTF-8–safe string truncation.  Returns a `&str` of at most `max_bytes`
/// bytes, backing up to the previous char boundary if `max_bytes` falls
/// inside a multi-byte character.
///
/// Use this instead of `&s[..s.len().min(N)]` which panics on non-ASCII.
pub fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fact_type_round_trips_through_strings() {
        for t in FactType::ALL {
            assert_eq!(FactType::parse(t.as_str()), Some(t));
        }
        assert_eq!(FactType::parse("nonsense"), None);
    }

    #[test]
    fn base_importance_matches_type_tiers() {
        assert_eq!(FactType::Appointment.base_importance(), 0.9);
        assert_eq!(FactType::Preference.base_importance(), 0.8);
        assert_eq!(FactType::Note.base_importance(), 0.6);
        assert_eq!(FactType::Generic.base_importance(), 0.4);
    }

    #[test]
    fn truncate_utf8_respects_char_boundaries() {
        let s = "héllo wörld";
        let t = truncate_utf8(s, 2);
        assert!(t.len() <= 2);
        assert!(s.starts_with(t));
        assert_eq!(truncate_utf8("short", 100), "short");
    }
}
