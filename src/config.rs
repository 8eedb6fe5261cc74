use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_PORT: u16 = 8081;
const DEFAULT_TERMINATE_GRACE_SECS: u64 = 10;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub sentry_dsn: Option<String>,
    pub environment: String,
    pub project_root: PathBuf,
    pub games_dir: PathBuf,
    pub codex: CodexConfig,
    pub openai: OpenAiConfig,
    /// Keep at most this many finished runs in memory. `None` keeps all of them.
    pub run_retention: Option<usize>,
}

/// Everything needed to launch the agent CLI and render its prompt.
#[derive(Debug, Clone)]
pub struct CodexConfig {
    pub bin: String,
    pub model: Option<String>,
    pub skill_phaser_path: PathBuf,
    pub skill_playwright_path: PathBuf,
    pub forbidden_path: PathBuf,
    /// How long a SIGTERM'd agent gets before it is force-killed.
    pub terminate_grace: Duration,
}

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: Option<String>,
    pub title_model: String,
    pub image_model: String,
}

impl Config {
    pub fn from_env() -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self::from_lookup(&cwd, |key| std::env::var(key).ok())
    }

    /// Build a Config from a key lookup (as values would come from env vars).
    /// Used directly in tests to avoid mutating process-global environment.
    pub fn from_lookup<F>(cwd: &Path, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let port = get("PORT")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_PORT);

        let sentry_dsn = get("SENTRY_DSN");

        let environment = get("ENVIRONMENT").unwrap_or_else(|| "local".to_string());

        let project_root = get("PROJECT_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| cwd.to_path_buf());

        let path_or = |key: &str, default: PathBuf| get(key).map(PathBuf::from).unwrap_or(default);

        let games_dir = path_or("GAMES_DIR", project_root.join("games"));

        let terminate_grace = get("TERMINATE_GRACE_SECS")
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(DEFAULT_TERMINATE_GRACE_SECS));

        let codex = CodexConfig {
            bin: get("CODEX_BIN").unwrap_or_else(|| "codex".to_string()),
            model: get("CODEX_MODEL"),
            skill_phaser_path: path_or(
                "SKILL_PHASER_PATH",
                project_root.join("phaser-gamedev").join("SKILL.md"),
            ),
            skill_playwright_path: path_or(
                "SKILL_PLAYWRIGHT_PATH",
                project_root.join("playwright-testing").join("SKILL.md"),
            ),
            forbidden_path: path_or("FORBIDDEN_PATH", project_root.join("games-inspo")),
            terminate_grace,
        };

        let openai = OpenAiConfig {
            api_key: get("OPENAI_API_KEY"),
            title_model: get("TITLE_MODEL").unwrap_or_else(|| "gpt-4.1-mini".to_string()),
            image_model: get("IMAGE_MODEL").unwrap_or_else(|| "gpt-image-1".to_string()),
        };

        let run_retention = get("RUN_RETENTION")
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|n| *n > 0);

        Config {
            port,
            sentry_dsn,
            environment,
            project_root,
            games_dir,
            codex,
            openai,
            run_retention,
        }
    }
}
