//! Session process supervision: spawning runner children, liveness
//! probing, periodic health checks, orphan reaping, and startup
//! reconciliation of records that did not survive a daemon restart.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::events::SessionEvent;
use crate::hub::RpcHub;
use crate::registry::{Registry, Session, SessionStatus};
use crate::settings::Settings;
use crate::terminal::{self, TerminalApp};
use crate::threads::ThreadMappings;

pub const HEALTH_INTERVAL: Duration = Duration::from_secs(60);
/// A starting session gets this long to open its RPC connection.
pub const CONNECT_GRACE: Duration = Duration::from_secs(30);
/// Terminal records linger this long before being pruned.
pub const RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

const SIGINT_WAIT: Duration = Duration::from_secs(5);
const SIGTERM_WAIT: Duration = Duration::from_secs(3);
const KILL_POLL: Duration = Duration::from_millis(100);

/// Signal-0 liveness probe. Pid 0 means unknown/externally started and is
/// never alive; no syscall is made for it.
pub fn is_pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    #[cfg(unix)]
    {
        match nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None) {
            Ok(()) => true,
            // EPERM means the process exists but we can't signal it
            // (different user).
            Err(errno) => errno == nix::errno::Errno::EPERM,
        }
    }
    #[cfg(not(unix))]
    {
        false
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: nix::sys::signal::Signal) {
    let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), signal);
}

async fn wait_dead(pid: u32, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if !is_pid_alive(pid) {
            return true;
        }
        tokio::time::sleep(KILL_POLL).await;
    }
    !is_pid_alive(pid)
}

/// Escalating kill: interrupt, then terminate, then kill. Returns once the
/// pid is no longer alive.
pub async fn graceful_kill(pid: u32) -> Result<()> {
    if !is_pid_alive(pid) {
        return Ok(());
    }
    #[cfg(unix)]
    {
        use nix::sys::signal::Signal;

        send_signal(pid, Signal::SIGINT);
        if wait_dead(pid, SIGINT_WAIT).await {
            return Ok(());
        }
        send_signal(pid, Signal::SIGTERM);
        if wait_dead(pid, SIGTERM_WAIT).await {
            return Ok(());
        }
        send_signal(pid, Signal::SIGKILL);
        if wait_dead(pid, SIGTERM_WAIT).await {
            return Ok(());
        }
        bail!("pid {pid} survived SIGKILL");
    }
    #[cfg(not(unix))]
    {
        bail!("graceful kill unsupported on this platform");
    }
}

/// Skip the ladder and kill outright.
pub async fn force_kill(pid: u32) -> Result<()> {
    if !is_pid_alive(pid) {
        return Ok(());
    }
    #[cfg(unix)]
    {
        send_signal(pid, nix::sys::signal::Signal::SIGKILL);
        if wait_dead(pid, SIGTERM_WAIT).await {
            return Ok(());
        }
        bail!("pid {pid} survived SIGKILL");
    }
    #[cfg(not(unix))]
    {
        bail!("force kill unsupported on this platform");
    }
}

/// Deterministic event-log directory for a working directory: every path
/// separator and dot collapses to a dash under the agent's log root.
pub fn project_dir_for(log_root: &Path, cwd: &Path) -> PathBuf {
    let encoded: String = cwd
        .to_string_lossy()
        .chars()
        .map(|c| match c {
            '/' | '\\' | '.' => '-',
            other => other,
        })
        .collect();
    log_root.join(encoded)
}

pub struct Supervisor {
    registry: Arc<Registry>,
    threads: Arc<ThreadMappings>,
    settings: Settings,
    socket_path: PathBuf,
    runner_program: PathBuf,
    log_root: PathBuf,
    events: UnboundedSender<SessionEvent>,
}

impl Supervisor {
    pub fn new(
        registry: Arc<Registry>,
        threads: Arc<ThreadMappings>,
        settings: Settings,
        socket_path: PathBuf,
        runner_program: PathBuf,
        log_root: PathBuf,
        events: UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            registry,
            threads,
            settings,
            socket_path,
            runner_program,
            log_root,
            events,
        }
    }

    /// User-initiated start. Validates settings, pre-generates the session
    /// id handed to the runner, spawns the child, and records the session
    /// as starting. Spawn failure leaves no registry entry.
    pub async fn start_session(
        &self,
        cwd: Option<PathBuf>,
        command: Vec<String>,
        terminal: bool,
    ) -> Result<Session> {
        if command.is_empty() {
            bail!("start_session requires a command");
        }
        let cwd = match cwd.or_else(|| self.settings.default_directory.clone()) {
            Some(cwd) => cwd,
            None => bail!("no working directory given and no default configured"),
        };
        if !self.settings.directory_allowed(&cwd) {
            bail!("directory {} is not in the allowed list", cwd.display());
        }
        if let Some(max) = self.settings.max_concurrent_sessions {
            let active = self.registry.count_active();
            if active >= max {
                bail!("session limit reached ({active}/{max})");
            }
        }

        let id = Uuid::new_v4().to_string();
        let project_dir = project_dir_for(&self.log_root, &cwd);
        let mut session = Session::new(id.clone(), cwd.clone(), project_dir, command.clone());

        if terminal {
            match self.spawn_in_terminal(&session).await {
                Ok(Some(window)) => {
                    session.terminal_window = Some(window);
                }
                Ok(None) => {
                    // Not available on this platform; background instead.
                    session.pid = self.spawn_background(&session)?;
                }
                Err(error) => return Err(error),
            }
        } else {
            session.pid = self.spawn_background(&session)?;
        }

        self.registry.upsert(session.clone())?;
        tracing::info!(
            target = "session_relay::supervisor",
            session = %id,
            pid = session.pid,
            cwd = %cwd.display(),
            "started session"
        );
        Ok(session)
    }

    fn runner_invocation(&self, session: &Session) -> Vec<String> {
        let mut argv = vec![
            self.runner_program.to_string_lossy().into_owned(),
            "--socket".to_string(),
            self.socket_path.to_string_lossy().into_owned(),
            "--session-id".to_string(),
            session.id.clone(),
            "--".to_string(),
        ];
        argv.extend(session.command.iter().cloned());
        argv
    }

    /// Fully detached child: own session group, stdio suppressed, reaped
    /// by a background waiter so the handle can be relinquished.
    fn spawn_background(&self, session: &Session) -> Result<u32> {
        let argv = self.runner_invocation(session);
        let mut command = tokio::process::Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .current_dir(&session.cwd)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());

        #[cfg(unix)]
        unsafe {
            command.pre_exec(|| {
                if nix::libc::setsid() == -1 {
                    Err(std::io::Error::last_os_error())
                } else {
                    Ok(())
                }
            });
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn runner {}", argv[0]))?;
        let pid = child.id().context("spawned runner missing pid")?;
        tokio::spawn(async move {
            let _ = child.wait().await;
        });
        Ok(pid)
    }

    async fn spawn_in_terminal(&self, session: &Session) -> Result<Option<String>> {
        let app = self
            .settings
            .terminal_app
            .as_deref()
            .and_then(TerminalApp::from_name)
            .unwrap_or(TerminalApp::Terminal);
        let command_line = shell_join(&self.runner_invocation(session));
        terminal::open_window(app, &session.cwd.to_string_lossy(), &command_line).await
    }

    /// Stop a session. Graceful by default; `force` goes straight to
    /// SIGKILL. Sessions without a known pid are marked stopping and left
    /// for the runner's own exit (observed via the RPC connection).
    pub async fn stop_session(&self, id: &str, force: bool) -> Result<()> {
        let session = self
            .registry
            .get(id)
            .with_context(|| format!("unknown session '{id}'"))?;
        self.registry.set_status(id, SessionStatus::Stopping)?;

        if session.pid != 0 {
            if force {
                force_kill(session.pid).await?;
            } else {
                graceful_kill(session.pid).await?;
            }
            self.registry.set_status(id, SessionStatus::Stopped)?;
        }
        Ok(())
    }

    /// One health pass over every non-terminal record.
    ///
    /// A session with a known pid is probed by signal-0; a pid-0 session
    /// (terminal-attached or externally started) is judged by whether its
    /// RPC connection is live.
    pub async fn health_tick(&self, hub: &RpcHub) {
        let now = Utc::now();
        for session in self.registry.list_active() {
            let connected = hub.has_session(&session.id);
            let alive = if session.pid != 0 {
                is_pid_alive(session.pid)
            } else {
                connected
            };
            let age = (now - session.started_at)
                .to_std()
                .unwrap_or(Duration::ZERO);

            let next = match session.status {
                SessionStatus::Starting => {
                    if session.pid != 0 && !alive {
                        Some(SessionStatus::Stopped)
                    } else if age > CONNECT_GRACE && !connected {
                        Some(SessionStatus::Orphaned)
                    } else {
                        None
                    }
                }
                SessionStatus::Running | SessionStatus::Idle => {
                    if !alive {
                        Some(SessionStatus::Orphaned)
                    } else {
                        None
                    }
                }
                SessionStatus::Stopping => {
                    if !alive {
                        Some(SessionStatus::Stopped)
                    } else {
                        None
                    }
                }
                SessionStatus::Stopped | SessionStatus::Orphaned => None,
            };

            if let Some(next) = next {
                tracing::info!(
                    target = "session_relay::supervisor",
                    session = %session.id,
                    from = ?session.status,
                    to = ?next,
                    "health transition"
                );
                let _ = self.registry.set_status(&session.id, next);
            } else if let Err(error) = self.registry.touch_verified(&session.id) {
                tracing::warn!(
                    target = "session_relay::supervisor",
                    session = %session.id,
                    error = %error,
                    "failed to record health check"
                );
            }
        }

        if self.settings.auto_cleanup_orphans {
            for session in self.registry.list(|s| s.status == SessionStatus::Orphaned) {
                if session.pid != 0 && is_pid_alive(session.pid) {
                    tracing::info!(
                        target = "session_relay::supervisor",
                        session = %session.id,
                        pid = session.pid,
                        "cleaning up orphaned process"
                    );
                    if force_kill(session.pid).await.is_ok() {
                        let _ = self.registry.set_status(&session.id, SessionStatus::Stopped);
                    }
                }
            }
        }

        self.prune_expired(now);
    }

    fn prune_expired(&self, now: chrono::DateTime<Utc>) {
        for session in self.registry.list_terminal() {
            let age = (now - session.last_verified_at)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if age > RETENTION {
                tracing::info!(
                    target = "session_relay::supervisor",
                    session = %session.id,
                    "pruning expired record"
                );
                let _ = self.registry.remove(&session.id);
                let _ = self.threads.remove(&session.id);
            }
        }
    }

    /// Startup pass: persisted stopped/orphaned records that carry a chat
    /// thread did not survive the restart. Surface a session-lost notice,
    /// drop the record and its mapping, and fence the id so a stray late
    /// connection is ignored rather than resurrected.
    pub fn reconcile_at_startup(&self) {
        for session in self.registry.list_terminal() {
            let binding = session
                .thread
                .clone()
                .or_else(|| self.threads.lookup(&session.id).map(|m| m.binding()));
            let Some(binding) = binding else {
                continue;
            };

            self.registry.mark_reconciling(&session.id);
            let _ = self.events.send(SessionEvent::SessionLost {
                session_id: session.id.clone(),
                thread_id: binding.thread_id,
                channel_id: binding.channel_id,
            });
            if let Err(error) = self.registry.remove(&session.id) {
                tracing::warn!(
                    target = "session_relay::supervisor",
                    session = %session.id,
                    error = %error,
                    "failed to remove reconciled record"
                );
            }
            let _ = self.threads.remove(&session.id);
            // The fence stays up for the rest of this run: a stray late
            // connection must not resurrect the id. Restarting the same
            // work requires a fresh session id.
            tracing::info!(
                target = "session_relay::supervisor",
                session = %session.id,
                "reconciled lost session"
            );
        }
    }

    /// Periodic health loop; runs until the daemon shuts down.
    pub async fn run_health_loop(self: Arc<Self>, hub: Arc<RpcHub>) {
        let mut tick = tokio::time::interval(HEALTH_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            self.health_tick(&hub).await;
        }
    }
}

fn shell_join(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| {
            if arg.chars().all(|c| c.is_ascii_alphanumeric() || "-_./:=".contains(c)) {
                arg.clone()
            } else {
                format!("'{}'", arg.replace('\'', "'\\''"))
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
