use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::RunStatus;

/// Version of the event vocabulary below. Version 1 forwarded raw agent
/// output as `codex_event` / `codex_text` / `stderr`; version 2 extracts
/// typed sub-events and is the only one emitted.
pub const EVENT_SCHEMA_VERSION: u32 = 2;

/// Envelope written to subscribers and to the run log, one per line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEvent {
    #[serde(rename = "type")]
    pub event_type: RunEventType,
    pub run_id: String,
    pub slug: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

impl RunEvent {
    pub fn is_finished(&self) -> bool {
        self.event_type == RunEventType::RunFinished
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEventType {
    Status,
    QueuePosition,
    CodexThinking,
    AssistantResponse,
    CodexToolCall,
    CodexToolOutput,
    MetadataUpdated,
    Error,
    RunFinished,
    /// Tags from other schema versions, seen when reading old logs back.
    #[serde(other)]
    Unknown,
}

impl RunEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunEventType::Status => "status",
            RunEventType::QueuePosition => "queue_position",
            RunEventType::CodexThinking => "codex_thinking",
            RunEventType::AssistantResponse => "assistant_response",
            RunEventType::CodexToolCall => "codex_tool_call",
            RunEventType::CodexToolOutput => "codex_tool_output",
            RunEventType::MetadataUpdated => "metadata_updated",
            RunEventType::Error => "error",
            RunEventType::RunFinished => "run_finished",
            RunEventType::Unknown => "unknown",
        }
    }
}

/// Value carried by a `status` event. `Cancelling` is transient and never
/// stored on the run itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusLabel {
    Run(RunStatus),
    Cancelling,
}

impl StatusLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusLabel::Run(status) => status.as_str(),
            StatusLabel::Cancelling => "cancelling",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataTask {
    Title,
    Image,
}

impl MetadataTask {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetadataTask::Title => "title",
            MetadataTask::Image => "image",
        }
    }
}

/// Typed constructor for an event; becomes `(type, payload)` on emission.
#[derive(Debug, Clone, PartialEq)]
pub enum RunEventKind {
    Status(StatusLabel),
    QueuePosition(usize),
    Thinking {
        text: String,
    },
    AssistantResponse {
        text: String,
    },
    ToolCall {
        call_id: String,
        name: String,
        input: String,
    },
    ToolOutput {
        call_id: String,
        output: String,
        exit_code: Option<i64>,
    },
    MetadataUpdated(MetadataTask),
    Error {
        message: String,
    },
    RunFinished {
        status: RunStatus,
        return_code: Option<i32>,
        last_message: Option<String>,
        error: Option<String>,
    },
}

impl RunEventKind {
    pub fn event_type(&self) -> RunEventType {
        match self {
            RunEventKind::Status(_) => RunEventType::Status,
            RunEventKind::QueuePosition(_) => RunEventType::QueuePosition,
            RunEventKind::Thinking { .. } => RunEventType::CodexThinking,
            RunEventKind::AssistantResponse { .. } => RunEventType::AssistantResponse,
            RunEventKind::ToolCall { .. } => RunEventType::CodexToolCall,
            RunEventKind::ToolOutput { .. } => RunEventType::CodexToolOutput,
            RunEventKind::MetadataUpdated(_) => RunEventType::MetadataUpdated,
            RunEventKind::Error { .. } => RunEventType::Error,
            RunEventKind::RunFinished { .. } => RunEventType::RunFinished,
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            RunEventKind::Status(label) => json!({ "status": label.as_str() }),
            RunEventKind::QueuePosition(position) => json!({ "position": position }),
            RunEventKind::Thinking { text } | RunEventKind::AssistantResponse { text } => {
                json!({ "text": text })
            }
            RunEventKind::ToolCall {
                call_id,
                name,
                input,
            } => json!({ "callId": call_id, "name": name, "input": input }),
            RunEventKind::ToolOutput {
                call_id,
                output,
                exit_code,
            } => json!({ "callId": call_id, "output": output, "exitCode": exit_code }),
            RunEventKind::MetadataUpdated(task) => json!({ "task": task.as_str() }),
            RunEventKind::Error { message } => json!({ "message": message }),
            RunEventKind::RunFinished {
                status,
                return_code,
                last_message,
                error,
            } => json!({
                "status": status.as_str(),
                "returnCode": return_code,
                "lastMessage": last_message,
                "error": error,
            }),
        }
    }

    pub fn into_event(self, run_id: &str, slug: &str) -> RunEvent {
        RunEvent {
            event_type: self.event_type(),
            run_id: run_id.to_string(),
            slug: slug.to_string(),
            timestamp: Utc::now(),
            payload: self.payload(),
        }
    }
}
