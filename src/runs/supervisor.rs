use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::Notify;

use super::error::RunError;
use crate::config::CodexConfig;

/// Reported when the exit status carries neither a code nor a signal.
const UNKNOWN_EXIT_CODE: i32 = -1;

/// Inputs for one agent invocation.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub working_dir: PathBuf,
    pub prompt: String,
    /// Resume this conversation instead of starting a new one.
    pub session_id: Option<String>,
    /// Ask the agent to write its final message here (fresh sessions only).
    pub last_message_path: Option<PathBuf>,
}

/// Spawns the Codex CLI and hands back a supervised process.
#[derive(Debug, Clone)]
pub struct CodexSupervisor {
    bin: String,
    model: Option<String>,
    terminate_grace: Duration,
}

impl CodexSupervisor {
    pub fn new(config: &CodexConfig) -> Self {
        Self {
            bin: config.bin.clone(),
            model: config.model.clone(),
            terminate_grace: config.terminate_grace,
        }
    }

    pub fn build_args(&self, spec: &LaunchSpec) -> Vec<String> {
        let mut args = vec!["exec".to_string()];

        if let Some(session_id) = &spec.session_id {
            args.push("resume".to_string());
            args.push("--dangerously-bypass-approvals-and-sandbox".to_string());
            args.push("--json".to_string());
            if let Some(model) = &self.model {
                args.push("-m".to_string());
                args.push(model.clone());
            }
            args.push(session_id.clone());
        } else {
            if let Some(model) = &self.model {
                args.push("-m".to_string());
                args.push(model.clone());
            }
            args.push("--dangerously-bypass-approvals-and-sandbox".to_string());
            args.push("--json".to_string());
            args.push("--cd".to_string());
            args.push(spec.working_dir.display().to_string());
            if let Some(path) = &spec.last_message_path {
                args.push("--output-last-message".to_string());
                args.push(path.display().to_string());
            }
        }

        // Prompt comes from stdin.
        args.push("-".to_string());
        args
    }

    /// Start the agent. The prompt is fed to stdin from a background task
    /// and stdin is closed afterwards.
    pub fn spawn(&self, spec: &LaunchSpec) -> Result<AgentProcess, RunError> {
        let args = self.build_args(spec);

        tracing::info!(
            bin = %self.bin,
            cwd = %spec.working_dir.display(),
            resume = spec.session_id.is_some(),
            "spawning codex"
        );

        let mut command = Command::new(&self.bin);
        command
            .args(&args)
            .current_dir(&spec.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so termination reaches whatever the agent spawned.
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    RunError::LaunchFailure(format!("Codex binary not found: {}", self.bin))
                } else {
                    RunError::LaunchFailure(format!("failed to launch Codex: {e}"))
                }
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            let prompt = spec.prompt.clone();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                    tracing::debug!(error = %e, "failed to write prompt to codex stdin");
                }
                drop(stdin);
            });
        }

        Ok(AgentProcess {
            pid: child.id(),
            child,
            terminate: Arc::new(Notify::new()),
            grace: self.terminate_grace,
        })
    }
}

/// A running agent. Owned by whoever waits on it; cancellation goes
/// through a [`ProcessHandle`].
pub struct AgentProcess {
    pid: Option<u32>,
    child: Child,
    terminate: Arc<Notify>,
    grace: Duration,
}

impl AgentProcess {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn handle(&self) -> ProcessHandle {
        ProcessHandle {
            terminate: Arc::clone(&self.terminate),
        }
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Wait for exit. A termination request sends SIGTERM to the agent's
    /// process group; if the agent outlives the grace period the whole group
    /// is killed. Returns the exit code, or the negated signal number for
    /// signal deaths.
    pub async fn wait(mut self) -> std::io::Result<i32> {
        let status = tokio::select! {
            status = self.child.wait() => status?,
            _ = self.terminate.notified() => {
                if let Some(pid) = self.pid {
                    tracing::info!(pid, "sending SIGTERM to codex");
                    signal_process_group(pid, "TERM");
                }
                match tokio::time::timeout(self.grace, self.child.wait()).await {
                    Ok(status) => status?,
                    Err(_) => {
                        tracing::warn!(
                            pid = ?self.pid,
                            grace_secs = self.grace.as_secs_f64(),
                            "codex ignored SIGTERM, killing"
                        );
                        if let Some(pid) = self.pid {
                            signal_process_group(pid, "KILL");
                        }
                        if let Err(e) = self.child.start_kill() {
                            tracing::debug!(error = %e, "codex already gone");
                        }
                        self.child.wait().await?
                    }
                }
            }
        };
        Ok(exit_code(status))
    }
}

/// Cloneable cancellation handle for a running agent.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    terminate: Arc<Notify>,
}

impl ProcessHandle {
    /// Request termination. Takes effect even if the waiter has not started
    /// waiting yet.
    pub fn terminate(&self) {
        self.terminate.notify_one();
    }
}

/// `signal` is a `kill` signal name such as `TERM` or `KILL`.
fn signal_process_group(pid: u32, signal: &str) {
    #[cfg(unix)]
    {
        let _ = std::process::Command::new("kill")
            .args([format!("-{signal}"), format!("-{pid}")])
            .status();
    }
    #[cfg(windows)]
    {
        let mut args = vec!["/T".to_string(), "/PID".to_string(), pid.to_string()];
        if signal == "KILL" {
            args.insert(0, "/F".to_string());
        }
        let _ = std::process::Command::new("taskkill").args(&args).status();
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    UNKNOWN_EXIT_CODE
}

/// Feed each line of `reader` to `on_line` until EOF. Invalid UTF-8 is
/// replaced rather than ending the stream.
pub async fn for_each_line<R, F>(reader: R, mut on_line: F)
where
    R: AsyncRead + Unpin,
    F: FnMut(&str),
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => return,
            Ok(_) => on_line(String::from_utf8_lossy(&buf).trim_end_matches(['\r', '\n'])),
            Err(e) => {
                tracing::warn!(error = %e, "stopped reading codex output");
                return;
            }
        }
    }
}
