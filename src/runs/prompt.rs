use std::path::Path;

use super::ChatMessage;
use crate::projects::Project;

/// Only this many trailing chat messages are replayed into a fresh session.
pub const CHAT_CONTEXT_WINDOW: usize = 24;

/// Paths the agent must use or avoid, rendered into its hard rules.
#[derive(Debug, Clone, Copy)]
pub struct PromptRules<'a> {
    pub skill_phaser_path: &'a Path,
    pub skill_playwright_path: &'a Path,
    pub forbidden_path: &'a Path,
}

/// Full instructions for a run that starts a new agent session.
pub fn build_game_prompt(
    rules: PromptRules<'_>,
    project: &Project,
    request: &str,
    chat_context: &[ChatMessage],
) -> String {
    let context_block = render_chat_context(chat_context);

    format!(
        "You are Codex running inside a single game's folder.

Hard requirements:
1) Use these two local skills while working:
- phaser-gamedev: {phaser}
- playwright-testing: {playwright}
2) Do NOT edit any skill files.
3) Do NOT read from or use this folder: {forbidden}
4) Edit only files in the current working directory (this game's folder).
5) Build/iterate a playable vanilla HTML/CSS/JavaScript browser game.
6) Ensure index.html exists and is the playable entrypoint.

Game metadata:
- slug: {slug}
- title: {title}

Prior chat context:
{context_block}

New user request:
{request}

Output expectations:
- Make the game playable by opening index.html in a browser.
- Keep code maintainable and readable.
- If adding files, keep a clean small structure.",
        phaser = rules.skill_phaser_path.display(),
        playwright = rules.skill_playwright_path.display(),
        forbidden = rules.forbidden_path.display(),
        slug = project.slug,
        title = project.title,
        request = request.trim(),
    )
}

/// Resumed sessions already carry the history; they only get the new ask.
pub fn build_resume_prompt(request: &str) -> String {
    request.trim().to_string()
}

fn render_chat_context(chat_context: &[ChatMessage]) -> String {
    let start = chat_context.len().saturating_sub(CHAT_CONTEXT_WINDOW);
    let lines: Vec<String> = chat_context[start..]
        .iter()
        .filter_map(|msg| {
            let content = msg.content.trim();
            if content.is_empty() {
                return None;
            }
            Some(format!("{}: {content}", msg.role.as_str().to_uppercase()))
        })
        .collect();

    if lines.is_empty() {
        "(No prior chat context.)".to_string()
    } else {
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runs::ChatRole;
    use chrono::Utc;

    fn project() -> Project {
        Project {
            slug: "racer".into(),
            title: "Racer".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            preview_url: "/games/racer/index.html".into(),
            image_url: None,
        }
    }

    fn rules() -> PromptRules<'static> {
        PromptRules {
            skill_phaser_path: Path::new("/skills/phaser/SKILL.md"),
            skill_playwright_path: Path::new("/skills/playwright/SKILL.md"),
            forbidden_path: Path::new("/inspo"),
        }
    }

    fn msg(role: ChatRole, content: &str) -> ChatMessage {
        ChatMessage {
            role,
            content: content.into(),
        }
    }

    #[test]
    fn test_fresh_prompt_contents() {
        let prompt = build_game_prompt(rules(), &project(), "  make a racer  ", &[]);
        assert!(prompt.starts_with("You are Codex"));
        assert!(prompt.contains("- phaser-gamedev: /skills/phaser/SKILL.md"));
        assert!(prompt.contains("Do NOT read from or use this folder: /inspo"));
        assert!(prompt.contains("- slug: racer\n- title: Racer"));
        assert!(prompt.contains("(No prior chat context.)"));
        assert!(prompt.contains("New user request:\nmake a racer\n"));
        assert!(prompt.ends_with("keep a clean small structure."));
    }

    #[test]
    fn test_chat_context_rendering() {
        let ctx = vec![
            msg(ChatRole::User, "first"),
            msg(ChatRole::Assistant, "   "),
            msg(ChatRole::Assistant, " done "),
        ];
        let prompt = build_game_prompt(rules(), &project(), "more", &ctx);
        assert!(prompt.contains("Prior chat context:\nUSER: first\nASSISTANT: done\n"));
    }

    #[test]
    fn test_chat_context_window() {
        let ctx: Vec<ChatMessage> = (0..30)
            .map(|i| msg(ChatRole::User, &format!("m{i}")))
            .collect();
        let block = render_chat_context(&ctx);
        assert_eq!(block.lines().count(), CHAT_CONTEXT_WINDOW);
        assert!(block.starts_with("USER: m6"));
        assert!(block.ends_with("USER: m29"));
    }

    #[test]
    fn test_resume_prompt_is_trimmed_request() {
        assert_eq!(build_resume_prompt("\n add sound \n"), "add sound");
    }
}
