use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;

use super::bus::EventBus;
use super::event_log::RUNS_DIR;
use super::events::{MetadataTask, RunEventKind};
use super::manager::{RunManager, StartedRun, classify_exit};
use super::prompt::{build_game_prompt, build_resume_prompt};
use super::protocol::{AgentSignal, interpret_line};
use super::supervisor::{LaunchSpec, for_each_line};
use super::{ChatMessage, Run, RunStatus};
use crate::projects::Project;
use crate::projects::repository::ProjectRepository;
use crate::providers::{ImageProvider, TitleProvider};

/// How long the output readers may keep going once the agent has exited.
const OUTPUT_DRAIN: Duration = Duration::from_secs(3);

/// What the agent left behind once it exited.
struct AgentOutcome {
    return_code: Option<i32>,
    session_id: Option<String>,
    stderr_error: Option<String>,
    wait_error: Option<String>,
}

impl RunManager {
    /// Drive one run from launch to `run_finished`.
    pub(super) async fn execute_run(&self, started: StartedRun) {
        let StartedRun { run, bus } = started;
        tracing::info!(run_id = %run.id, slug = %run.slug, "run started");

        let (project, project_dir) = match self.load_project(&run.slug).await {
            Ok(found) => found,
            Err(message) => {
                self.fail_launch(&run, &bus, message).await;
                return;
            }
        };

        let runs_dir = project_dir.join(RUNS_DIR);
        if let Err(e) = std::fs::create_dir_all(&runs_dir) {
            tracing::warn!(run_id = %run.id, error = %e, "failed to create runs dir");
        }

        let spec = match self.sessions.load(&run.slug) {
            Some(session_id) => LaunchSpec {
                working_dir: project_dir.clone(),
                prompt: build_resume_prompt(&run.prompt),
                session_id: Some(session_id),
                last_message_path: None,
            },
            None => LaunchSpec {
                working_dir: project_dir.clone(),
                prompt: build_game_prompt(self.prompt_rules(), &project, &run.prompt, &run.chat_context),
                session_id: None,
                last_message_path: Some(runs_dir.join(format!("{}.last.txt", run.id))),
            },
        };

        let mut process = match self.supervisor.spawn(&spec) {
            Ok(process) => process,
            Err(e) => {
                self.fail_launch(&run, &bus, e.to_string()).await;
                return;
            }
        };

        {
            let mut registry = self.registry.lock().await;
            if let Some(entry) = registry.runs.get_mut(&run.id) {
                let handle = process.handle();
                if entry.run.cancel_requested {
                    handle.terminate();
                }
                entry.process = Some(handle);
            }
        }
        tracing::info!(run_id = %run.id, pid = ?process.pid(), "codex running");

        self.spawn_metadata_tasks(&run, &project, &bus);

        let stdout = process.take_stdout();
        let stderr = process.take_stderr();
        let (exited_tx, exited) = watch::channel(false);

        let read_stdout = async {
            let mut session_id = None;
            if let Some(stdout) = stdout {
                let reading = for_each_line(stdout, |line| match interpret_line(line) {
                    Some(AgentSignal::SessionStarted(id)) => session_id = Some(id),
                    Some(AgentSignal::Event(kind)) => {
                        bus.emit(kind);
                    }
                    None => {}
                });
                drain_output(&run.id, "stdout", reading, exited.clone()).await;
            }
            session_id
        };

        let read_stderr = async {
            let mut first = None;
            if let Some(stderr) = stderr {
                let reading = for_each_line(stderr, |line| {
                    let line = line.trim();
                    if first.is_none() && !line.is_empty() {
                        first = Some(line.to_string());
                    }
                });
                drain_output(&run.id, "stderr", reading, exited.clone()).await;
            }
            first
        };

        let wait = async {
            let exit = process.wait().await;
            let _ = exited_tx.send(true);
            exit
        };

        let (session_id, stderr_error, exit) = tokio::join!(read_stdout, read_stderr, wait);

        let (return_code, wait_error) = match exit {
            Ok(code) => (Some(code), None),
            Err(e) => {
                tracing::error!(run_id = %run.id, error = %e, "failed to wait for codex");
                (None, Some(format!("failed to wait for Codex: {e}")))
            }
        };

        let outcome = AgentOutcome {
            return_code,
            session_id,
            stderr_error,
            wait_error,
        };
        self.finish_run(&run, &bus, spec.last_message_path.as_deref(), outcome)
            .await;
    }

    async fn load_project(&self, slug: &str) -> Result<(Project, PathBuf), String> {
        let project = self
            .projects
            .get_project(slug)
            .await
            .map_err(|e| e.to_string())?;
        let dir = self.projects.project_dir(slug).map_err(|e| e.to_string())?;
        Ok((project, dir))
    }

    /// Terminal failure before any process existed: `error` then
    /// `run_finished`.
    async fn fail_launch(&self, run: &Run, bus: &EventBus, message: String) {
        tracing::error!(run_id = %run.id, slug = %run.slug, error = %message, "run failed to launch");

        let mut registry = self.registry.lock().await;
        if let Some(entry) = registry.runs.get_mut(&run.id) {
            entry.run.status = RunStatus::Failed;
            entry.run.error = Some(message.clone());
            entry.run.finished_at = Some(Utc::now());
        }
        bus.emit(RunEventKind::Error {
            message: message.clone(),
        });
        bus.emit(RunEventKind::RunFinished {
            status: RunStatus::Failed,
            return_code: None,
            last_message: None,
            error: Some(message),
        });
        self.note_finished(&mut registry, &run.id);
    }

    async fn finish_run(
        &self,
        run: &Run,
        bus: &EventBus,
        last_message_path: Option<&Path>,
        outcome: AgentOutcome,
    ) {
        let last_message = last_message_path.and_then(read_last_message);

        if let Some(token) = &outcome.session_id {
            if let Err(e) = self.sessions.save(&run.slug, token) {
                tracing::warn!(run_id = %run.id, error = %e, "failed to persist session token");
            }
        }

        if outcome.return_code == Some(0) {
            if let Err(e) = self.projects.touch(&run.slug).await {
                tracing::warn!(run_id = %run.id, error = %e, "failed to touch game after run");
            }
        }

        let mut registry = self.registry.lock().await;
        let cancel_requested = registry
            .runs
            .get(&run.id)
            .is_some_and(|entry| entry.run.cancel_requested);
        let status = classify_exit(cancel_requested, outcome.return_code);

        let mut error = outcome.wait_error.or(outcome.stderr_error);
        if status == RunStatus::Failed && error.is_none() {
            if let Some(code) = outcome.return_code {
                error = Some(format!("Codex exited with code {code}"));
            }
        }

        if let Some(entry) = registry.runs.get_mut(&run.id) {
            let record = &mut entry.run;
            record.status = status;
            record.return_code = outcome.return_code;
            record.finished_at = Some(Utc::now());
            record.last_message = last_message.clone();
            if outcome.session_id.is_some() {
                record.session_id = outcome.session_id.clone();
            }
            record.error = error.clone();
            entry.process = None;
        }

        bus.emit(RunEventKind::RunFinished {
            status,
            return_code: outcome.return_code,
            last_message,
            error,
        });
        self.note_finished(&mut registry, &run.id);

        tracing::info!(
            run_id = %run.id,
            slug = %run.slug,
            status = status.as_str(),
            return_code = ?outcome.return_code,
            "run finished"
        );
    }

    /// Title and cover generation. Fire-and-forget: failures are logged and
    /// never touch the run's status.
    fn spawn_metadata_tasks(&self, run: &Run, project: &Project, bus: &Arc<EventBus>) {
        if project.is_untitled() {
            match &self.title_provider {
                Some(provider) => {
                    let job = MetadataJob::new(self, run, bus);
                    let provider = Arc::clone(provider);
                    self.background.spawn("title", async move {
                        job.run(MetadataTask::Title, generate_title(&job, provider.as_ref()))
                            .await;
                    });
                }
                None => tracing::debug!(slug = %run.slug, "no title provider configured, skipping"),
            }
        }

        if project.image_url.is_none() {
            match &self.image_provider {
                Some(provider) => {
                    let job = MetadataJob::new(self, run, bus);
                    let provider = Arc::clone(provider);
                    self.background.spawn("cover_image", async move {
                        job.run(MetadataTask::Image, generate_cover(&job, provider.as_ref()))
                            .await;
                    });
                }
                None => tracing::debug!(slug = %run.slug, "no image provider configured, skipping"),
            }
        }
    }
}

/// Everything an auxiliary task needs, detached from the manager.
struct MetadataJob {
    projects: Arc<dyn ProjectRepository>,
    bus: Arc<EventBus>,
    run_id: String,
    slug: String,
    prompt: String,
    chat_context: Vec<ChatMessage>,
}

impl MetadataJob {
    fn new(manager: &RunManager, run: &Run, bus: &Arc<EventBus>) -> Self {
        Self {
            projects: Arc::clone(&manager.projects),
            bus: Arc::clone(bus),
            run_id: run.id.clone(),
            slug: run.slug.clone(),
            prompt: run.prompt.clone(),
            chat_context: run.chat_context.clone(),
        }
    }

    async fn run<F>(&self, task: MetadataTask, work: F)
    where
        F: std::future::Future<Output = anyhow::Result<()>>,
    {
        match work.await {
            Ok(()) => {
                self.bus.emit(RunEventKind::MetadataUpdated(task));
            }
            Err(e) => tracing::warn!(
                run_id = %self.run_id,
                slug = %self.slug,
                task = task.as_str(),
                error = %e,
                "metadata generation failed"
            ),
        }
    }
}

async fn generate_title(job: &MetadataJob, provider: &dyn TitleProvider) -> anyhow::Result<()> {
    let title = provider.generate_title(&job.prompt, &job.chat_context).await?;
    job.projects.update_title(&job.slug, &title).await?;
    Ok(())
}

async fn generate_cover(job: &MetadataJob, provider: &dyn ImageProvider) -> anyhow::Result<()> {
    let output = job.projects.cover_image_path(&job.slug)?;
    provider
        .generate_cover_image(&job.prompt, &job.chat_context, &output)
        .await?;
    job.projects.touch(&job.slug).await?;
    Ok(())
}

/// Run `reading` to EOF, but give up `OUTPUT_DRAIN` after the agent exits.
/// Anything the agent left running may still hold the pipe open.
async fn drain_output<F>(run_id: &str, stream: &str, reading: F, mut exited: watch::Receiver<bool>)
where
    F: Future<Output = ()>,
{
    tokio::pin!(reading);
    tokio::select! {
        () = &mut reading => return,
        _ = exited.wait_for(|done| *done) => {}
    }
    if tokio::time::timeout(OUTPUT_DRAIN, reading).await.is_err() {
        tracing::warn!(run_id, stream, "codex output still open after exit, stopped reading");
    }
}

fn read_last_message(path: &Path) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;
    let trimmed = content.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::CodexConfig;
    use crate::projects::file_repository::FileProjectRepository;
    use crate::runs::session_store::SessionStore;
    use async_trait::async_trait;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct FixedTitle(&'static str);

    #[async_trait]
    impl TitleProvider for FixedTitle {
        async fn generate_title(&self, _: &str, _: &[ChatMessage]) -> anyhow::Result<String> {
            Ok(self.0.to_string())
        }
    }

    struct FailingTitle;

    #[async_trait]
    impl TitleProvider for FailingTitle {
        async fn generate_title(&self, _: &str, _: &[ChatMessage]) -> anyhow::Result<String> {
            anyhow::bail!("provider down")
        }
    }

    #[derive(Default)]
    struct CountingImage {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ImageProvider for CountingImage {
        async fn generate_cover_image(
            &self,
            _: &str,
            _: &[ChatMessage],
            output: &Path,
        ) -> anyhow::Result<PathBuf> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::fs::write(output, b"png")?;
            Ok(output.to_path_buf())
        }
    }

    async fn setup(
        title: Option<Arc<dyn TitleProvider>>,
        image: Option<Arc<dyn ImageProvider>>,
        project_title: Option<&str>,
    ) -> (tempfile::TempDir, Arc<FileProjectRepository>, Arc<RunManager>, String) {
        let tmp = tempfile::tempdir().unwrap();
        let bin = tmp.path().join("fake-codex");
        std::fs::write(&bin, "#!/bin/sh\ncat > /dev/null\nsleep 0.5\nexit 0\n").unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();

        let games_dir = tmp.path().join("games");
        let projects = Arc::new(FileProjectRepository::new(&games_dir));
        projects.ensure_root().unwrap();
        let project = projects.create_project(project_title).await.unwrap();

        let codex = CodexConfig {
            bin: bin.display().to_string(),
            model: None,
            skill_phaser_path: PathBuf::from("/p"),
            skill_playwright_path: PathBuf::from("/w"),
            forbidden_path: PathBuf::from("/f"),
            terminate_grace: Duration::from_secs(5),
        };
        let mut manager = RunManager::new(projects.clone(), SessionStore::new(&games_dir), &codex);
        if let Some(title) = title {
            manager = manager.with_title_provider(title);
        }
        if let Some(image) = image {
            manager = manager.with_image_provider(image);
        }
        (tmp, projects, manager.start(), project.slug)
    }

    async fn run_to_end(manager: &RunManager, slug: &str) -> Vec<crate::runs::events::RunEvent> {
        let run = manager.enqueue(slug, "make a racer", vec![]).await.unwrap();
        let mut sub = manager.subscribe(&run.id).await.unwrap();
        let mut events = Vec::new();
        tokio::time::timeout(Duration::from_secs(20), async {
            while let Some(event) = sub.next().await {
                events.push(event);
            }
        })
        .await
        .unwrap();
        assert!(manager.background.drain(Duration::from_secs(5)).await);
        events
    }

    #[tokio::test]
    async fn test_untitled_game_gets_generated_title_and_cover() {
        let image = Arc::new(CountingImage::default());
        let (_tmp, projects, manager, slug) = setup(
            Some(Arc::new(FixedTitle("Neon Racer"))),
            Some(image.clone()),
            None,
        )
        .await;
        assert_eq!(slug, "untitled-game");

        let events = run_to_end(&manager, &slug).await;
        assert_eq!(events.last().unwrap().payload["status"], "completed");

        let project = projects.get_project(&slug).await.unwrap();
        assert_eq!(project.title, "Neon Racer");
        assert_eq!(
            project.image_url.as_deref(),
            Some("/games/untitled-game/card.png")
        );
        assert_eq!(image.calls.load(Ordering::SeqCst), 1);

        let tasks: Vec<_> = events
            .iter()
            .filter(|e| e.event_type == crate::runs::events::RunEventType::MetadataUpdated)
            .map(|e| e.payload["task"].as_str().unwrap().to_string())
            .collect();
        assert!(tasks.contains(&"title".to_string()));
        assert!(tasks.contains(&"image".to_string()));
    }

    #[tokio::test]
    async fn test_named_game_with_cover_skips_metadata() {
        let image = Arc::new(CountingImage::default());
        let (_tmp, projects, manager, slug) =
            setup(Some(Arc::new(FixedTitle("Other"))), Some(image.clone()), Some("Racer")).await;
        std::fs::write(projects.cover_image_path(&slug).unwrap(), b"png").unwrap();

        run_to_end(&manager, &slug).await;
        assert_eq!(projects.get_project(&slug).await.unwrap().title, "Racer");
        assert_eq!(image.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_provider_failure_does_not_affect_run() {
        let (_tmp, projects, manager, slug) =
            setup(Some(Arc::new(FailingTitle)), None, None).await;

        let events = run_to_end(&manager, &slug).await;
        assert_eq!(events.last().unwrap().payload["status"], "completed");
        assert!(events.iter().all(|e| e.event_type != crate::runs::events::RunEventType::Error));
        assert!(projects.get_project(&slug).await.unwrap().is_untitled());
    }

    #[test]
    fn test_read_last_message() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("r.last.txt");
        assert_eq!(read_last_message(&path), None);
        std::fs::write(&path, "  \n").unwrap();
        assert_eq!(read_last_message(&path), None);
        std::fs::write(&path, "\nAll done.\n").unwrap();
        assert_eq!(read_last_message(&path).as_deref(), Some("All done."));
    }
}
