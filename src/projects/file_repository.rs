use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::repository::ProjectRepository;
use super::{COVER_IMAGE_FILE, Project, ProjectError, UNTITLED, is_valid_slug, slugify_title};
use crate::runs::event_log::RUNS_DIR;

const METADATA_FILE: &str = "game.json";
const INDEX_FILE: &str = "index.html";

/// On-disk shape of `game.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GameMetadata {
    slug: String,
    title: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// Games live as folders under `games_dir`, each with a `game.json`,
/// a playable `index.html` and a `.runs/` directory for run logs.
pub struct FileProjectRepository {
    games_dir: PathBuf,
    /// Serializes folder creation and every read-modify-write of `game.json`.
    metadata_lock: Mutex<()>,
}

impl FileProjectRepository {
    pub fn new(games_dir: impl AsRef<Path>) -> Self {
        Self {
            games_dir: games_dir.as_ref().to_path_buf(),
            metadata_lock: Mutex::new(()),
        }
    }

    pub fn ensure_root(&self) -> Result<(), ProjectError> {
        std::fs::create_dir_all(&self.games_dir)?;
        Ok(())
    }

    fn read_metadata(&self, slug: &str) -> Result<GameMetadata, ProjectError> {
        if !is_valid_slug(slug) {
            return Err(ProjectError::NotFound(slug.to_string()));
        }
        let path = self.games_dir.join(slug).join(METADATA_FILE);
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ProjectError::NotFound(slug.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&content).map_err(|e| ProjectError::Metadata {
            slug: slug.to_string(),
            reason: e.to_string(),
        })
    }

    fn write_metadata(&self, game_dir: &Path, metadata: &GameMetadata) -> Result<(), ProjectError> {
        let content = serde_json::to_string_pretty(metadata).map_err(|e| ProjectError::Metadata {
            slug: metadata.slug.clone(),
            reason: e.to_string(),
        })?;

        // Atomic write via a per-write temp file + rename
        let path = game_dir.join(METADATA_FILE);
        let tmp_path = game_dir.join(format!(".{METADATA_FILE}.{}.tmp", Uuid::new_v4().simple()));
        std::fs::write(&tmp_path, content)?;
        if let Err(e) = std::fs::rename(&tmp_path, &path) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(e.into());
        }
        Ok(())
    }

    fn to_project(&self, metadata: GameMetadata) -> Result<Project, ProjectError> {
        let game_dir = self.games_dir.join(&metadata.slug);
        ensure_placeholder_index(&game_dir, &metadata.title)?;

        let image_url = game_dir
            .join(COVER_IMAGE_FILE)
            .exists()
            .then(|| format!("/games/{}/{COVER_IMAGE_FILE}", metadata.slug));

        Ok(Project {
            preview_url: format!("/games/{}/{INDEX_FILE}", metadata.slug),
            image_url,
            slug: metadata.slug,
            title: metadata.title,
            created_at: metadata.created_at,
            updated_at: metadata.updated_at,
        })
    }

    async fn mutate_metadata<F>(&self, slug: &str, mutate: F) -> Result<Project, ProjectError>
    where
        F: FnOnce(&mut GameMetadata) + Send,
    {
        let _guard = self.metadata_lock.lock().await;
        let mut metadata = self.read_metadata(slug)?;
        mutate(&mut metadata);
        metadata.updated_at = Utc::now();
        self.write_metadata(&self.games_dir.join(slug), &metadata)?;
        self.to_project(metadata)
    }
}

#[async_trait]
impl ProjectRepository for FileProjectRepository {
    async fn list_projects(&self) -> Result<Vec<Project>, ProjectError> {
        self.ensure_root()?;

        let mut projects = Vec::new();
        for entry in std::fs::read_dir(&self.games_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let slug = entry.file_name().to_string_lossy().to_string();
            match self.read_metadata(&slug).and_then(|m| self.to_project(m)) {
                Ok(project) => projects.push(project),
                Err(ProjectError::NotFound(_)) => continue,
                Err(e) => {
                    tracing::warn!(slug = %slug, error = %e, "skipping unreadable game folder");
                }
            }
        }

        projects.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(projects)
    }

    async fn create_project(&self, title: Option<&str>) -> Result<Project, ProjectError> {
        let title = title
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(UNTITLED)
            .to_string();

        let _guard = self.metadata_lock.lock().await;
        self.ensure_root()?;

        let base_slug = slugify_title(&title);
        let mut slug = base_slug.clone();
        let mut suffix = 2;
        let game_dir = loop {
            let candidate = self.games_dir.join(&slug);
            match std::fs::create_dir(&candidate) {
                Ok(()) => break candidate,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    slug = format!("{base_slug}-{suffix}");
                    suffix += 1;
                }
                Err(e) => return Err(e.into()),
            }
        };
        std::fs::create_dir_all(game_dir.join(RUNS_DIR))?;

        let now = Utc::now();
        let metadata = GameMetadata {
            slug: slug.clone(),
            title,
            created_at: now,
            updated_at: now,
        };
        self.write_metadata(&game_dir, &metadata)?;

        tracing::info!(slug = %slug, "created game");
        self.to_project(metadata)
    }

    async fn get_project(&self, slug: &str) -> Result<Project, ProjectError> {
        let metadata = self.read_metadata(slug)?;
        self.to_project(metadata)
    }

    async fn touch(&self, slug: &str) -> Result<Project, ProjectError> {
        self.mutate_metadata(slug, |_| {}).await
    }

    async fn update_title(&self, slug: &str, title: &str) -> Result<Project, ProjectError> {
        let title = title.trim().to_string();
        self.mutate_metadata(slug, |m| m.title = title).await
    }

    fn project_dir(&self, slug: &str) -> Result<PathBuf, ProjectError> {
        if !is_valid_slug(slug) {
            return Err(ProjectError::NotFound(slug.to_string()));
        }
        let dir = self.games_dir.join(slug);
        if dir.is_dir() {
            Ok(dir)
        } else {
            Err(ProjectError::NotFound(slug.to_string()))
        }
    }

    fn cover_image_path(&self, slug: &str) -> Result<PathBuf, ProjectError> {
        Ok(self.project_dir(slug)?.join(COVER_IMAGE_FILE))
    }
}

/// Keeps the preview route valid before the first generation run.
fn ensure_placeholder_index(game_dir: &Path, title: &str) -> Result<(), ProjectError> {
    let path = game_dir.join(INDEX_FILE);
    if path.exists() {
        return Ok(());
    }
    let safe_title = title.replace(['<', '>'], "");
    let html = format!(
        r#"<!doctype html>
<html lang="en">
  <head>
    <meta charset="UTF-8" />
    <meta name="viewport" content="width=device-width, initial-scale=1.0" />
    <title>{safe_title}</title>
  </head>
  <body style="font-family: system-ui; margin: 0; display: grid; place-items: center; min-height: 100vh;">
    <div>
      <h1>{safe_title}</h1>
      <p>Game files will appear here after the first AI generation.</p>
    </div>
  </body>
</html>
"#
    );
    std::fs::write(&path, html)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_and_list() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = FileProjectRepository::new(tmp.path());

        let created = repo.create_project(Some("Space Survivor")).await.unwrap();
        assert_eq!(created.slug, "space-survivor");
        assert_eq!(created.title, "Space Survivor");
        assert_eq!(created.preview_url, "/games/space-survivor/index.html");
        assert!(created.image_url.is_none());

        let dir = tmp.path().join("space-survivor");
        assert!(dir.join("game.json").exists());
        assert!(dir.join("index.html").exists());
        assert!(dir.join(".runs").is_dir());

        let all = repo.list_projects().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].title, "Space Survivor");
    }

    #[tokio::test]
    async fn test_slug_collision() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = FileProjectRepository::new(tmp.path());

        let first = repo.create_project(Some("Puzzle Quest")).await.unwrap();
        let second = repo.create_project(Some("Puzzle Quest")).await.unwrap();
        let third = repo.create_project(Some("Puzzle Quest")).await.unwrap();

        assert_eq!(first.slug, "puzzle-quest");
        assert_eq!(second.slug, "puzzle-quest-2");
        assert_eq!(third.slug, "puzzle-quest-3");
    }

    #[tokio::test]
    async fn test_create_without_title_is_untitled() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = FileProjectRepository::new(tmp.path());

        let created = repo.create_project(None).await.unwrap();
        assert_eq!(created.title, UNTITLED);
        assert_eq!(created.slug, "untitled-game");
        assert!(created.is_untitled());
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = FileProjectRepository::new(tmp.path());

        assert!(matches!(
            repo.get_project("nope").await,
            Err(ProjectError::NotFound(_))
        ));
        assert!(matches!(repo.project_dir("nope"), Err(ProjectError::NotFound(_))));
        assert!(matches!(
            repo.project_dir("../outside"),
            Err(ProjectError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_update_title_and_touch() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = FileProjectRepository::new(tmp.path());
        let created = repo.create_project(None).await.unwrap();

        let renamed = repo
            .update_title(&created.slug, "  Asteroid Shepherd ")
            .await
            .unwrap();
        assert_eq!(renamed.title, "Asteroid Shepherd");
        assert_eq!(renamed.slug, created.slug);
        assert!(renamed.updated_at >= created.updated_at);

        let touched = repo.touch(&created.slug).await.unwrap();
        assert!(touched.updated_at >= renamed.updated_at);
        assert_eq!(touched.title, "Asteroid Shepherd");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_title_and_touch_keep_metadata_intact() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = std::sync::Arc::new(FileProjectRepository::new(tmp.path()));

        for i in 0..50 {
            let created = repo.create_project(None).await.unwrap();
            let slug = created.slug.clone();
            let title = format!("Comet Chaser {i}");

            let renamer = {
                let repo = repo.clone();
                let slug = slug.clone();
                let title = title.clone();
                tokio::spawn(async move { repo.update_title(&slug, &title).await })
            };
            let toucher = {
                let repo = repo.clone();
                let slug = slug.clone();
                tokio::spawn(async move { repo.touch(&slug).await })
            };
            renamer.await.unwrap().unwrap();
            toucher.await.unwrap().unwrap();

            let project = repo.get_project(&slug).await.unwrap();
            assert_eq!(project.title, title);
        }

        for entry in std::fs::read_dir(tmp.path()).unwrap() {
            let dir = entry.unwrap().path();
            let leftovers: Vec<_> = std::fs::read_dir(&dir)
                .unwrap()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
                .collect();
            assert!(leftovers.is_empty(), "temp files left in {}", dir.display());
        }
    }

    #[tokio::test]
    async fn test_placeholder_index_is_restored() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = FileProjectRepository::new(tmp.path());
        let created = repo.create_project(Some("<Racer>")).await.unwrap();

        let index = tmp.path().join(&created.slug).join("index.html");
        std::fs::remove_file(&index).unwrap();
        repo.get_project(&created.slug).await.unwrap();

        let html = std::fs::read_to_string(&index).unwrap();
        assert!(html.contains("<title>Racer</title>"));
    }

    #[tokio::test]
    async fn test_image_url_when_cover_exists() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = FileProjectRepository::new(tmp.path());
        let created = repo.create_project(Some("Racer")).await.unwrap();

        let cover = repo.cover_image_path(&created.slug).unwrap();
        std::fs::write(&cover, b"png").unwrap();

        let project = repo.get_project(&created.slug).await.unwrap();
        assert_eq!(project.image_url.as_deref(), Some("/games/racer/card.png"));
    }

    #[tokio::test]
    async fn test_list_skips_folders_without_metadata() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = FileProjectRepository::new(tmp.path());
        repo.create_project(Some("Real Game")).await.unwrap();
        std::fs::create_dir_all(tmp.path().join("stray")).unwrap();
        std::fs::write(tmp.path().join("notes.txt"), "x").unwrap();

        let all = repo.list_projects().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].slug, "real-game");
    }
}
