use std::path::PathBuf;

use async_trait::async_trait;

use super::{Project, ProjectError};

#[async_trait]
pub trait ProjectRepository: Send + Sync {
    async fn list_projects(&self) -> Result<Vec<Project>, ProjectError>;
    async fn create_project(&self, title: Option<&str>) -> Result<Project, ProjectError>;
    async fn get_project(&self, slug: &str) -> Result<Project, ProjectError>;
    async fn touch(&self, slug: &str) -> Result<Project, ProjectError>;
    async fn update_title(&self, slug: &str, title: &str) -> Result<Project, ProjectError>;
    /// Working directory of a game. Fails with `NotFound` if the folder is missing.
    fn project_dir(&self, slug: &str) -> Result<PathBuf, ProjectError>;
    fn cover_image_path(&self, slug: &str) -> Result<PathBuf, ProjectError>;
}
