//! Rotator subprocess supervision
//!
//! Owns the single long-running rotator child: the binary that accepts the
//! endpoint list file, exposes a local forwarding port, and selects an
//! upstream per request via the `Proxy-Forward-Index` routing header. The
//! child runs in its own process group so a crashed supervisor cannot leak
//! it, and never outlives the process that launched it.
//!
//! Endpoint-file edits need no supervisor action (the child's watch mode
//! reloads), but writers must call [`RotatorSupervisor::quiesce`] after a
//! write so the reload completes before new traffic arrives.
//!
//! Failure semantics: one restart with backoff on unexpected exit; a second
//! unclean exit within the restart window escalates to the orchestrator.

use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use crate::shutdown::ShutdownSignal;

/// Launch and supervision parameters for the rotator
#[derive(Debug, Clone)]
pub struct RotatorConfig {
    /// Rotator binary path
    pub binary: std::path::PathBuf,
    /// Local listen address, e.g. `127.0.0.1:8899`
    pub listen_addr: String,
    /// Endpoint list file (one `{scheme}://{host}:{port}` per line)
    pub endpoint_file: std::path::PathBuf,
    /// Per-upstream timeout passed to the binary
    pub upstream_timeout: Duration,
    /// Errors before the binary skips a forward
    pub max_errors: u32,
    /// SIGTERM grace before SIGKILL
    pub grace: Duration,
    /// Second unclean exit within this window escalates
    pub restart_window: Duration,
    /// URL fetched through the rotator as a health check (expects 200)
    pub health_url: String,
    /// Delay after endpoint-file writes for the watch-mode reload
    pub quiescence: Duration,
}

/// Escalations the supervisor sends to the orchestrator
#[derive(Debug)]
pub enum SupervisorEvent {
    /// The child exited unexpectedly beyond its restart budget
    CrashedBeyondBudget(String),
}

struct ChildState {
    child: Child,
    pid: i32,
    stdout_task: JoinHandle<()>,
    stderr_task: JoinHandle<()>,
}

/// Supervisor owning the rotator child's stdio, PID, and termination
pub struct RotatorSupervisor {
    config: RotatorConfig,
    state: Mutex<Option<ChildState>>,
    events: mpsc::Sender<SupervisorEvent>,
    shutdown: ShutdownSignal,
    watch_task: Mutex<Option<JoinHandle<()>>>,
}

impl RotatorSupervisor {
    #[must_use]
    pub fn new(
        config: RotatorConfig,
        events: mpsc::Sender<SupervisorEvent>,
        shutdown: ShutdownSignal,
    ) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            config,
            state: Mutex::new(None),
            events,
            shutdown,
            watch_task: Mutex::new(None),
        })
    }

    /// Launch the child and block until it answers a health check
    pub async fn start(self: &std::sync::Arc<Self>) -> Result<()> {
        self.spawn_child().await?;
        self.wait_healthy().await?;

        let supervisor = std::sync::Arc::clone(self);
        let task = tokio::spawn(async move {
            supervisor.watch_loop().await;
        });
        *self.watch_task.lock().await = Some(task);

        info!("Rotator healthy on {}", self.config.listen_addr);
        Ok(())
    }

    async fn spawn_child(&self) -> Result<()> {
        let mut cmd = Command::new(&self.config.binary);
        cmd.arg("--addr")
            .arg(&self.config.listen_addr)
            .arg("--file")
            .arg(&self.config.endpoint_file)
            .arg("--watch")
            .arg("--timeout")
            .arg(self.config.upstream_timeout.as_secs().max(1).to_string())
            .arg("--max-errors")
            .arg(self.config.max_errors.to_string())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own process group: signals target the whole group and a crashed
        // supervisor cannot leak the child past kill_on_drop
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().with_context(|| {
            format!("Failed to launch rotator binary {}", self.config.binary.display())
        })?;

        let pid = child
            .id()
            .map(|id| id as i32)
            .context("Rotator child has no PID")?;

        let stdout = child.stdout.take().context("Rotator child has no stdout")?;
        let stderr = child.stderr.take().context("Rotator child has no stderr")?;

        let stdout_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!("rotator: {line}");
            }
        });
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!("rotator: {line}");
            }
        });

        info!("Rotator launched (pid {pid})");
        *self.state.lock().await = Some(ChildState {
            child,
            pid,
            stdout_task,
            stderr_task,
        });
        Ok(())
    }

    /// Poll a GET through the rotator until it returns 200
    async fn wait_healthy(&self) -> Result<()> {
        let client = reqwest::Client::builder()
            .proxy(
                reqwest::Proxy::all(format!("http://{}", self.config.listen_addr))
                    .context("Invalid rotator listen address")?,
            )
            .timeout(Duration::from_secs(5))
            .danger_accept_invalid_certs(true)
            .build()
            .context("Failed to build health-check client")?;

        let deadline = Instant::now() + Duration::from_secs(30);
        let mut delay = Duration::from_millis(250);

        loop {
            if self.shutdown.is_triggered() {
                anyhow::bail!("Shutdown during rotator health check");
            }
            match client.get(&self.config.health_url).send().await {
                Ok(resp) if resp.status().as_u16() == 200 => return Ok(()),
                Ok(resp) => debug!("Rotator health check returned {}", resp.status()),
                Err(e) => debug!("Rotator health check not ready: {e}"),
            }
            if Instant::now() >= deadline {
                anyhow::bail!("Rotator failed health check within 30s");
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(Duration::from_secs(4));
        }
    }

    /// Watch the child; restart once on unclean exit, escalate on the second
    async fn watch_loop(self: std::sync::Arc<Self>) {
        let mut last_unclean_exit: Option<Instant> = None;

        loop {
            let exit_status = {
                let mut guard = self.state.lock().await;
                let Some(state) = guard.as_mut() else { return };

                tokio::select! {
                    status = state.child.wait() => status,
                    () = self.shutdown.wait() => return,
                }
            };

            if self.shutdown.is_triggered() {
                return;
            }

            let status_desc = match exit_status {
                Ok(status) => status.to_string(),
                Err(e) => format!("wait failed: {e}"),
            };
            warn!("Rotator exited unexpectedly: {status_desc}");

            let now = Instant::now();
            if let Some(previous) = last_unclean_exit
                && now.duration_since(previous) < self.config.restart_window
            {
                error!("Rotator crashed twice within {:?}, escalating", self.config.restart_window);
                let _ = self
                    .events
                    .send(SupervisorEvent::CrashedBeyondBudget(status_desc))
                    .await;
                return;
            }
            last_unclean_exit = Some(now);

            // Single restart with backoff
            tokio::time::sleep(Duration::from_secs(2)).await;
            if let Err(e) = self.spawn_child().await {
                error!("Rotator restart failed: {e:#}");
                let _ = self
                    .events
                    .send(SupervisorEvent::CrashedBeyondBudget(format!("restart failed: {e:#}")))
                    .await;
                return;
            }
            if let Err(e) = self.wait_healthy().await {
                error!("Restarted rotator never became healthy: {e:#}");
                let _ = self
                    .events
                    .send(SupervisorEvent::CrashedBeyondBudget(format!("{e:#}")))
                    .await;
                return;
            }
            info!("Rotator restarted");
        }
    }

    /// Honour the watch-mode reload after an endpoint-file write
    pub async fn quiesce(&self) {
        tokio::time::sleep(self.config.quiescence).await;
    }

    /// SIGTERM the process group, wait up to the grace period, then SIGKILL
    pub async fn stop(&self) {
        if let Some(task) = self.watch_task.lock().await.take() {
            task.abort();
        }

        let Some(mut state) = self.state.lock().await.take() else {
            return;
        };

        #[cfg(unix)]
        {
            // Negative PID addresses the whole process group
            let ret = unsafe { libc::kill(-state.pid, libc::SIGTERM) };
            if ret != 0 {
                debug!("SIGTERM to rotator group failed (already gone?)");
            }
        }

        match tokio::time::timeout(self.config.grace, state.child.wait()).await {
            Ok(Ok(status)) => info!("Rotator exited: {status}"),
            Ok(Err(e)) => warn!("Rotator wait failed: {e}"),
            Err(_) => {
                warn!("Rotator ignored SIGTERM for {:?}, killing", self.config.grace);
                if let Err(e) = state.child.kill().await {
                    warn!("SIGKILL failed: {e}");
                }
            }
        }

        state.stdout_task.abort();
        state.stderr_task.abort();
    }

    /// The local front-door URL fetches route through
    #[must_use]
    pub fn proxy_url(&self) -> String {
        format!("http://{}", self.config.listen_addr)
    }
}
