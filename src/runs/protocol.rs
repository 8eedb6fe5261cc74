//! Decoding of the agent's `exec --json` stdout stream.
//!
//! Each stdout line is one JSON object tagged by `type`. Item lifecycle
//! lines carry a nested `item`, itself tagged by `type`. Only the shapes
//! below are understood; everything else maps to an `Other` variant and is
//! dropped without noise.

use serde::Deserialize;
use serde_json::Value;

use super::events::RunEventKind;

/// Tool outputs longer than this many characters are cut.
pub const TOOL_OUTPUT_LIMIT: usize = 500;
/// Raw tool input shown to clients is capped at this many characters.
pub const TOOL_INPUT_PREVIEW: usize = 200;

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum CodexLine {
    #[serde(rename = "thread.started")]
    ThreadStarted {
        #[serde(default)]
        thread_id: Option<String>,
    },
    #[serde(rename = "item.started")]
    ItemStarted { item: CodexItem },
    #[serde(rename = "item.completed")]
    ItemCompleted { item: CodexItem },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CodexItem {
    Reasoning {
        #[serde(default)]
        text: Option<String>,
    },
    CommandExecution {
        #[serde(default)]
        id: String,
        #[serde(default)]
        command: Value,
        #[serde(default)]
        aggregated_output: Value,
        #[serde(default)]
        exit_code: Option<i64>,
    },
    AgentMessage {
        #[serde(default)]
        text: Option<String>,
    },
    LocalShellCall(ToolCallItem),
    ToolCall(ToolCallItem),
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
pub struct ToolCallItem {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Value,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub output: Value,
}

/// What one stdout line means for the run.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentSignal {
    /// The agent announced its conversation token.
    SessionStarted(String),
    Event(RunEventKind),
}

/// Interpret one stdout line. Blank, non-JSON, non-object and unrecognised
/// lines yield `None`.
pub fn interpret_line(line: &str) -> Option<AgentSignal> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let value: Value = serde_json::from_str(line).ok()?;
    if !value.is_object() {
        return None;
    }
    let parsed: CodexLine = match serde_json::from_value(value) {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::trace!(error = %e, "skipping unrecognised agent line");
            return None;
        }
    };

    match parsed {
        CodexLine::ThreadStarted { thread_id } => thread_id
            .filter(|id| !id.is_empty())
            .map(AgentSignal::SessionStarted),
        CodexLine::ItemStarted { item } => item_started(item).map(AgentSignal::Event),
        CodexLine::ItemCompleted { item } => item_completed(item).map(AgentSignal::Event),
        CodexLine::Other => None,
    }
}

fn item_started(item: CodexItem) -> Option<RunEventKind> {
    match item {
        CodexItem::CommandExecution { id, command, .. } => Some(RunEventKind::ToolCall {
            call_id: id,
            name: "shell_command".to_string(),
            input: value_to_text(&command),
        }),
        CodexItem::LocalShellCall(call) => Some(tool_call_started(call, "local_shell_call")),
        CodexItem::ToolCall(call) => Some(tool_call_started(call, "tool_call")),
        _ => None,
    }
}

fn item_completed(item: CodexItem) -> Option<RunEventKind> {
    match item {
        CodexItem::Reasoning { text } => {
            non_empty(text).map(|text| RunEventKind::Thinking { text })
        }
        CodexItem::AgentMessage { text } => {
            non_empty(text).map(|text| RunEventKind::AssistantResponse { text })
        }
        CodexItem::CommandExecution {
            id,
            aggregated_output,
            exit_code,
            ..
        } => Some(RunEventKind::ToolOutput {
            call_id: id,
            output: truncate_output(&value_to_text(&aggregated_output)),
            exit_code,
        }),
        CodexItem::LocalShellCall(call) | CodexItem::ToolCall(call) => {
            Some(RunEventKind::ToolOutput {
                call_id: call.id,
                output: truncate_output(&value_to_text(&call.output)),
                exit_code: None,
            })
        }
        CodexItem::Other => None,
    }
}

fn tool_call_started(call: ToolCallItem, item_type: &str) -> RunEventKind {
    let name = call.name.unwrap_or_else(|| item_type.to_string());
    let raw_input = if is_blank(&call.arguments) {
        &call.input
    } else {
        &call.arguments
    };
    let input = summarize_tool_input(&name, raw_input);
    RunEventKind::ToolCall {
        call_id: call.id,
        name,
        input,
    }
}

/// Short label for a tool invocation: the patched file for `apply_patch`,
/// the command line for `shell_command`, otherwise a capped preview.
pub fn summarize_tool_input(name: &str, raw_input: &Value) -> String {
    let raw = match raw_input {
        Value::Null => "",
        Value::String(s) => s.as_str(),
        other => return take_chars(&other.to_string(), TOOL_INPUT_PREVIEW),
    };

    match name {
        "apply_patch" => raw
            .lines()
            .find(|l| l.starts_with("*** Update File:") || l.starts_with("*** Add File:"))
            .and_then(|l| l.split_once(':'))
            .map(|(_, file)| file.trim().to_string())
            .unwrap_or_else(|| "(file edit)".to_string()),
        "shell_command" => serde_json::from_str::<Value>(raw)
            .ok()
            .and_then(|args| args.get("command").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_else(|| take_chars(raw, TOOL_INPUT_PREVIEW)),
        _ => take_chars(raw, TOOL_INPUT_PREVIEW),
    }
}

/// Cut to `TOOL_OUTPUT_LIMIT` characters, marking the cut with `…`.
pub fn truncate_output(output: &str) -> String {
    if output.chars().count() > TOOL_OUTPUT_LIMIT {
        format!("{}\u{2026}", take_chars(output, TOOL_OUTPUT_LIMIT))
    } else {
        output.to_string()
    }
}

/// Strings verbatim, null as empty, anything else as its JSON text.
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn take_chars(s: &str, n: usize) -> String {
    s.chars().take(n).collect()
}

fn non_empty(text: Option<String>) -> Option<String> {
    text.map(|t| t.trim().to_string()).filter(|t| !t.is_empty())
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}
