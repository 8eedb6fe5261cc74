use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::background::BackgroundTasks;
use super::bus::{EventBus, Subscription};
use super::error::RunError;
use super::event_log::EventLog;
use super::events::{RunEventKind, StatusLabel};
use super::prompt::PromptRules;
use super::session_store::SessionStore;
use super::supervisor::{CodexSupervisor, ProcessHandle};
use super::{ChatMessage, Run, RunStatus};
use crate::config::CodexConfig;
use crate::projects::repository::ProjectRepository;
use crate::providers::{ImageProvider, TitleProvider};

/// How long shutdown waits for title/cover tasks before aborting them.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);
/// Extra time, on top of the terminate grace, for a cancelled run to finish.
const SHUTDOWN_SETTLE: Duration = Duration::from_secs(10);

/// Owns every run: the registry, the FIFO queue and the single worker that
/// drains it. Only one agent process runs at a time.
pub struct RunManager {
    pub(super) projects: Arc<dyn ProjectRepository>,
    pub(super) sessions: SessionStore,
    pub(super) supervisor: CodexSupervisor,
    pub(super) codex: CodexConfig,
    pub(super) title_provider: Option<Arc<dyn TitleProvider>>,
    pub(super) image_provider: Option<Arc<dyn ImageProvider>>,
    pub(super) background: BackgroundTasks,
    pub(super) registry: Mutex<Registry>,
    retention: Option<usize>,
    queue_tx: mpsc::UnboundedSender<String>,
    queue_rx: Option<mpsc::UnboundedReceiver<String>>,
    worker: std::sync::Mutex<Option<JoinHandle<()>>>,
}

#[derive(Default)]
pub(super) struct Registry {
    pub(super) runs: HashMap<String, RunEntry>,
    next_seq: u64,
    finished: VecDeque<String>,
    /// Set by shutdown; no new runs are accepted.
    closed: bool,
}

pub(super) struct RunEntry {
    pub(super) run: Run,
    seq: u64,
    pub(super) bus: Arc<EventBus>,
    pub(super) process: Option<ProcessHandle>,
}

/// A run the worker has just moved to `running`.
pub(super) struct StartedRun {
    pub(super) run: Run,
    pub(super) bus: Arc<EventBus>,
}

impl RunManager {
    pub fn new(
        projects: Arc<dyn ProjectRepository>,
        sessions: SessionStore,
        codex: &CodexConfig,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Self {
            projects,
            sessions,
            supervisor: CodexSupervisor::new(codex),
            codex: codex.clone(),
            title_provider: None,
            image_provider: None,
            background: BackgroundTasks::default(),
            registry: Mutex::new(Registry::default()),
            retention: None,
            queue_tx,
            queue_rx: Some(queue_rx),
            worker: std::sync::Mutex::new(None),
        }
    }

    pub fn with_title_provider(mut self, provider: Arc<dyn TitleProvider>) -> Self {
        self.title_provider = Some(provider);
        self
    }

    pub fn with_image_provider(mut self, provider: Arc<dyn ImageProvider>) -> Self {
        self.image_provider = Some(provider);
        self
    }

    /// Forget the oldest finished runs beyond `limit`.
    pub fn with_retention(mut self, limit: Option<usize>) -> Self {
        self.retention = limit;
        self
    }

    /// Spawn the worker loop. The worker only holds a weak reference, so
    /// dropping the last `Arc` ends it.
    pub fn start(mut self) -> Arc<Self> {
        let queue_rx = self.queue_rx.take();
        let manager = Arc::new(self);
        if let Some(rx) = queue_rx {
            let handle = tokio::spawn(worker_loop(Arc::downgrade(&manager), rx));
            *manager.worker_slot() = Some(handle);
        }
        manager
    }

    fn worker_slot(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.worker
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub(super) fn prompt_rules(&self) -> PromptRules<'_> {
        PromptRules {
            skill_phaser_path: &self.codex.skill_phaser_path,
            skill_playwright_path: &self.codex.skill_playwright_path,
            forbidden_path: &self.codex.forbidden_path,
        }
    }

    /// Queue a new run for `slug`. The returned snapshot already carries
    /// its queue position.
    pub async fn enqueue(
        &self,
        slug: &str,
        prompt: &str,
        chat_context: Vec<ChatMessage>,
    ) -> Result<Run, RunError> {
        let project_dir = self.projects.project_dir(slug)?;
        let run_id = Uuid::new_v4().simple().to_string();
        let bus = Arc::new(EventBus::new(
            &run_id,
            slug,
            Some(EventLog::for_run(&project_dir, &run_id)),
        ));
        let run = Run::new(run_id.clone(), slug.to_string(), prompt.to_string(), chat_context);

        let mut registry = self.registry.lock().await;
        if registry.closed {
            return Err(RunError::QueueClosed);
        }
        self.queue_tx
            .send(run_id.clone())
            .map_err(|_| RunError::QueueClosed)?;

        let seq = registry.next_seq;
        registry.next_seq += 1;
        registry.runs.insert(
            run_id.clone(),
            RunEntry {
                run,
                seq,
                bus: Arc::clone(&bus),
                process: None,
            },
        );
        bus.emit(RunEventKind::Status(StatusLabel::Run(RunStatus::Queued)));
        refresh_queue_positions(&mut registry);

        tracing::info!(run_id = %run_id, slug, "run queued");
        registry
            .runs
            .get(&run_id)
            .map(|entry| entry.run.clone())
            .ok_or(RunError::NotFound(run_id))
    }

    /// Cancel a run. Queued runs finish immediately; running runs get a
    /// termination request and finish when the agent exits. Terminal runs
    /// are returned unchanged.
    pub async fn cancel(&self, run_id: &str) -> Option<Run> {
        let mut registry = self.registry.lock().await;
        let entry = registry.runs.get_mut(run_id)?;

        if entry.run.status.is_terminal() {
            return Some(entry.run.clone());
        }

        if entry.run.status == RunStatus::Running {
            // No handle yet means the agent is still launching; the launcher
            // sees `cancel_requested` and terminates it once spawned.
            if !entry.run.cancel_requested {
                entry.run.cancel_requested = true;
                if let Some(process) = &entry.process {
                    process.terminate();
                }
                entry.bus.emit(RunEventKind::Status(StatusLabel::Cancelling));
                tracing::info!(run_id, slug = %entry.run.slug, "cancelling running run");
            }
            return Some(entry.run.clone());
        }

        let run = &mut entry.run;
        run.cancel_requested = true;
        run.status = RunStatus::Cancelled;
        run.finished_at = Some(Utc::now());
        run.queue_position = None;

        entry
            .bus
            .emit(RunEventKind::Status(StatusLabel::Run(RunStatus::Cancelled)));
        entry.bus.emit(RunEventKind::RunFinished {
            status: RunStatus::Cancelled,
            return_code: None,
            last_message: entry.run.last_message.clone(),
            error: None,
        });
        tracing::info!(run_id, slug = %entry.run.slug, "cancelled queued run");

        let snapshot = entry.run.clone();
        refresh_queue_positions(&mut registry);
        self.note_finished(&mut registry, run_id);
        Some(snapshot)
    }

    pub async fn get_run(&self, run_id: &str) -> Option<Run> {
        let registry = self.registry.lock().await;
        registry.runs.get(run_id).map(|entry| entry.run.clone())
    }

    /// Attach to a run's event stream, starting with its full history.
    pub async fn subscribe(&self, run_id: &str) -> Option<Subscription> {
        let bus = {
            let registry = self.registry.lock().await;
            Arc::clone(&registry.runs.get(run_id)?.bus)
        };
        Some(bus.subscribe())
    }

    /// Refuse new runs, cancel every queued and running run, and wait
    /// (bounded) for the in-flight agent to exit so that every event stream
    /// ends with `run_finished`. Then stop the worker and drain auxiliary
    /// tasks. Safe to call more than once.
    pub async fn shutdown(&self) {
        let pending: Vec<String> = {
            let mut registry = self.registry.lock().await;
            registry.closed = true;
            let mut pending: Vec<(u64, String)> = registry
                .runs
                .iter()
                .filter(|(_, entry)| !entry.run.status.is_terminal())
                .map(|(id, entry)| (entry.seq, id.clone()))
                .collect();
            pending.sort_unstable();
            pending.into_iter().map(|(_, id)| id).collect()
        };

        let mut in_flight = Vec::new();
        for run_id in pending {
            if let Some(run) = self.cancel(&run_id).await {
                if !run.status.is_terminal() {
                    in_flight.push(run_id);
                }
            }
        }

        let settle = self.codex.terminate_grace + SHUTDOWN_SETTLE;
        for run_id in in_flight {
            let Some(mut subscription) = self.subscribe(&run_id).await else {
                continue;
            };
            let drained = tokio::time::timeout(settle, async {
                while subscription.next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                tracing::warn!(run_id = %run_id, "run did not finish before shutdown");
            }
        }

        let worker = self.worker_slot().take();
        if let Some(worker) = worker {
            worker.abort();
            let _ = worker.await;
        }
        if !self.background.drain(SHUTDOWN_DRAIN).await {
            tracing::warn!("background tasks did not finish before shutdown");
        }
        tracing::info!("run manager stopped");
    }

    /// Move a queued run to `running`. `None` if it is gone or no longer
    /// queued (cancelled while waiting).
    pub(super) async fn begin_run(&self, run_id: &str) -> Option<StartedRun> {
        let mut registry = self.registry.lock().await;
        let entry = registry.runs.get_mut(run_id)?;
        if entry.run.status != RunStatus::Queued {
            return None;
        }

        entry.run.status = RunStatus::Running;
        entry.run.started_at = Some(Utc::now());
        entry.run.queue_position = None;
        entry
            .bus
            .emit(RunEventKind::Status(StatusLabel::Run(RunStatus::Running)));

        let started = StartedRun {
            run: entry.run.clone(),
            bus: Arc::clone(&entry.bus),
        };
        refresh_queue_positions(&mut registry);
        Some(started)
    }

    /// Record that `run_id` reached a terminal state and evict the oldest
    /// finished runs past the retention limit.
    pub(super) fn note_finished(&self, registry: &mut Registry, run_id: &str) {
        registry.finished.push_back(run_id.to_string());
        let Some(limit) = self.retention else {
            return;
        };
        while registry.finished.len() > limit {
            if let Some(evicted) = registry.finished.pop_front() {
                registry.runs.remove(&evicted);
                tracing::debug!(run_id = %evicted, "evicted finished run");
            }
        }
    }
}

async fn worker_loop(manager: Weak<RunManager>, mut queue: mpsc::UnboundedReceiver<String>) {
    tracing::info!("run worker started");
    while let Some(run_id) = queue.recv().await {
        let Some(manager) = manager.upgrade() else {
            break;
        };
        match manager.begin_run(&run_id).await {
            Some(started) => manager.execute_run(started).await,
            None => tracing::debug!(run_id = %run_id, "skipping run that is no longer queued"),
        }
    }
    tracing::info!("run worker stopped");
}

/// Number the still-queued runs 1..N in enqueue order and emit
/// `queue_position` for every run whose number changed.
pub(super) fn refresh_queue_positions(registry: &mut Registry) {
    let mut queued: Vec<(u64, String)> = registry
        .runs
        .iter()
        .filter(|(_, entry)| entry.run.status == RunStatus::Queued)
        .map(|(id, entry)| (entry.seq, id.clone()))
        .collect();
    queued.sort_unstable();

    for (index, (_, run_id)) in queued.into_iter().enumerate() {
        let position = index + 1;
        if let Some(entry) = registry.runs.get_mut(&run_id) {
            if entry.run.queue_position != Some(position) {
                entry.run.queue_position = Some(position);
                entry.bus.emit(RunEventKind::QueuePosition(position));
            }
        }
    }
}

/// Exit 0 is success even when a cancel was requested; otherwise a
/// requested cancel wins over failure.
pub fn classify_exit(cancel_requested: bool, return_code: Option<i32>) -> RunStatus {
    match return_code {
        Some(0) => RunStatus::Completed,
        _ if cancel_requested => RunStatus::Cancelled,
        _ => RunStatus::Failed,
    }
}
