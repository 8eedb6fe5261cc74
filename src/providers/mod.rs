pub mod openai;

use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;

use crate::runs::ChatMessage;

/// Names an unnamed game from what the user asked for.
#[async_trait]
pub trait TitleProvider: Send + Sync {
    async fn generate_title(&self, prompt: &str, chat_context: &[ChatMessage]) -> Result<String>;
}

/// Renders a cover image for a game and writes it to `output`.
#[async_trait]
pub trait ImageProvider: Send + Sync {
    async fn generate_cover_image(
        &self,
        prompt: &str,
        chat_context: &[ChatMessage],
        output: &Path,
    ) -> Result<PathBuf>;
}

/// Short plain-text digest of the conversation handed to providers.
pub(crate) fn describe_request(prompt: &str, chat_context: &[ChatMessage]) -> String {
    let mut lines: Vec<String> = chat_context
        .iter()
        .rev()
        .filter(|m| !m.content.trim().is_empty())
        .take(6)
        .map(|m| format!("{}: {}", m.role.as_str(), m.content.trim()))
        .collect();
    lines.reverse();
    lines.push(format!("user: {}", prompt.trim()));
    lines.join("\n")
}
