use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use super::events::RunEvent;

/// Directory inside a game folder that holds run logs and artifacts.
pub const RUNS_DIR: &str = ".runs";

/// Append-only JSONL record of everything emitted for one run.
#[derive(Debug, Clone)]
pub struct EventLog {
    path: PathBuf,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<game>/.runs/<run_id>.jsonl`
    pub fn for_run(project_dir: &Path, run_id: &str) -> Self {
        Self::new(project_dir.join(RUNS_DIR).join(format!("{run_id}.jsonl")))
    }

    #[cfg(test)]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, event: &RunEvent) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create runs dir: {}", dir.display()))?;
        }
        let line = serde_json::to_string(event).context("failed to serialize run event")?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open run log: {}", self.path.display()))?;
        writeln!(file, "{line}")
            .with_context(|| format!("failed to append to run log: {}", self.path.display()))?;
        Ok(())
    }

    pub fn read_all(&self) -> Result<Vec<RunEvent>> {
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read run log: {}", self.path.display()))?;
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).context("failed to parse run log line"))
            .collect()
    }
}
