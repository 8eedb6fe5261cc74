pub mod background;
pub mod bus;
pub mod error;
pub mod event_log;
pub mod events;
mod execution;
pub mod manager;
pub mod prompt;
pub mod protocol;
pub mod session_store;
pub mod supervisor;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
    System,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
            ChatRole::System => "system",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

/// Point-in-time view of a run. The live record sits in the manager's
/// registry; callers only ever get clones of it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    #[serde(rename = "runId")]
    pub id: String,
    pub slug: String,
    pub prompt: String,
    pub chat_context: Vec<ChatMessage>,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub queue_position: Option<usize>,
    pub return_code: Option<i32>,
    pub last_message: Option<String>,
    pub session_id: Option<String>,
    pub error: Option<String>,
    pub cancel_requested: bool,
}

impl Run {
    pub fn new(id: String, slug: String, prompt: String, chat_context: Vec<ChatMessage>) -> Self {
        Self {
            id,
            slug,
            prompt,
            chat_context,
            status: RunStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            queue_position: None,
            return_code: None,
            last_message: None,
            session_id: None,
            error: None,
            cancel_requested: false,
        }
    }
}
