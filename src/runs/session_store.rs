use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

const SESSION_FILE: &str = ".codex_session";

/// Remembers the agent's conversation token per game so later runs resume
/// the same thread instead of starting over.
#[derive(Debug, Clone)]
pub struct SessionStore {
    games_dir: PathBuf,
}

impl SessionStore {
    pub fn new(games_dir: impl Into<PathBuf>) -> Self {
        Self {
            games_dir: games_dir.into(),
        }
    }

    fn session_path(&self, slug: &str) -> PathBuf {
        self.games_dir.join(slug).join(SESSION_FILE)
    }

    /// Stored token for `slug`, if any. An empty or unreadable file counts
    /// as no session.
    pub fn load(&self, slug: &str) -> Option<String> {
        let path = self.session_path(slug);
        match std::fs::read_to_string(&path) {
            Ok(content) => {
                let token = content.trim();
                (!token.is_empty()).then(|| token.to_string())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                tracing::warn!(slug, path = %path.display(), error = %e, "failed to read session token");
                None
            }
        }
    }

    pub fn save(&self, slug: &str, token: &str) -> Result<()> {
        let path = self.session_path(slug);
        write_atomic(&path, token.trim())
            .with_context(|| format!("failed to save session token for {slug}"))
    }
}

fn write_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)
}
