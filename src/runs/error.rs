use crate::projects::ProjectError;

#[derive(thiserror::Error, Debug)]
pub enum RunError {
    #[error("game not found: {0}")]
    ProjectNotFound(String),

    #[error("run not found: {0}")]
    NotFound(String),

    /// The agent binary could not be started. The message is surfaced to
    /// clients verbatim as the run's error.
    #[error("{0}")]
    LaunchFailure(String),

    #[error("run queue is closed")]
    QueueClosed,

    #[error(transparent)]
    Project(ProjectError),
}

impl From<ProjectError> for RunError {
    fn from(err: ProjectError) -> Self {
        match err {
            ProjectError::NotFound(slug) => RunError::ProjectNotFound(slug),
            other => RunError::Project(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(
            RunError::ProjectNotFound("racer".into()).to_string(),
            "game not found: racer"
        );
        assert_eq!(RunError::NotFound("abc".into()).to_string(), "run not found: abc");
        assert_eq!(
            RunError::LaunchFailure("Codex binary not found: codex".into()).to_string(),
            "Codex binary not found: codex"
        );
        assert_eq!(RunError::QueueClosed.to_string(), "run queue is closed");
    }

    #[test]
    fn test_project_not_found_maps_to_project_not_found() {
        let err: RunError = ProjectError::NotFound("racer".into()).into();
        assert!(matches!(err, RunError::ProjectNotFound(slug) if slug == "racer"));

        let err: RunError = ProjectError::Io(std::io::Error::other("disk")).into();
        assert!(matches!(err, RunError::Project(_)));
        assert_eq!(err.to_string(), "io: disk");
    }
}
