//! Session process supervision
//!
//! Launching walks `Forking → AwaitingSetupAck → AwaitingCallback → Bound
//! → Idle`, each step bounded. Any failure kills what was started and the
//! caller invalidates the slot, so no process outlives a failed Create.
//! Termination sends a shutdown interrupt plus SIGTERM and escalates to
//! SIGKILL from a background poll.

use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::path::PathBuf;
use std::process::Child;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::UnixStream;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use xpd_protocol::{ActionCode, Response, SHUTDOWN_INTERRUPT};

use crate::client::ClientSession;
use crate::launcher::{process, LaunchPlan, SessionSpawner, SpawnAck};
use crate::link::Responder;
use crate::session::{SessionProxy, SessionStatus};

/// Wait for the fork semaphore
pub const FORK_WAIT: Duration = Duration::from_secs(10);

/// Step of a session launch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchPhase {
    Forking,
    AwaitingSetupAck,
    AwaitingCallback,
    Bound,
    Idle,
}

/// Why a launch failed and how far it got
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchError {
    pub phase: LaunchPhase,
    pub reason: String,
    /// Process started before the failure (already killed)
    pub pid: Option<i32>,
}

impl LaunchError {
    fn new(phase: LaunchPhase, reason: impl Into<String>) -> Self {
        Self {
            phase,
            reason: reason.into(),
            pid: None,
        }
    }

    /// Failures before the process is up are answered with an error
    /// reply; later ones arrive as an attn errmsg after the session reply
    pub fn is_setup_failure(&self) -> bool {
        matches!(self.phase, LaunchPhase::Forking | LaunchPhase::AwaitingSetupAck)
    }
}

impl fmt::Display for LaunchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}

impl std::error::Error for LaunchError {}

/// Owner of every session process started by the daemon
pub struct Supervisor {
    spawner: Arc<dyn SessionSpawner>,
    fork_sem: Semaphore,
    fork_wait: Duration,
    children: Mutex<HashMap<i32, Child>>,
    admin_dir: PathBuf,
    kill_poll: Duration,
    kill_polls: u32,
}

impl Supervisor {
    pub fn new(spawner: Arc<dyn SessionSpawner>, admin_dir: impl Into<PathBuf>) -> Self {
        Self {
            spawner,
            fork_sem: Semaphore::new(1),
            fork_wait: FORK_WAIT,
            children: Mutex::new(HashMap::new()),
            admin_dir: admin_dir.into(),
            kill_poll: Duration::from_secs(1),
            kill_polls: 10,
        }
    }

    /// Override the termination poll (interval, count)
    pub fn with_kill_poll(mut self, interval: Duration, polls: u32) -> Self {
        self.kill_poll = interval;
        self.kill_polls = polls;
        self
    }

    pub fn with_fork_wait(mut self, wait: Duration) -> Self {
        self.fork_wait = wait;
        self
    }

    // ==================== Launch ====================

    /// Start the process for `session` and wait until it has called back.
    ///
    /// `serve` receives the accepted callback stream and must run the
    /// connection (whose internal login binds the back-channel).
    pub async fn launch<F>(
        &self,
        plan: LaunchPlan,
        client: &ClientSession,
        session: &Arc<SessionProxy>,
        intwait: Duration,
        serve: F,
    ) -> Result<SpawnAck, LaunchError>
    where
        F: FnOnce(UnixStream) + Send,
    {
        let mut phase = LaunchPhase::Forking;
        let ack = {
            let _permit = match tokio::time::timeout(self.fork_wait, self.fork_sem.acquire()).await {
                Ok(Ok(permit)) => permit,
                _ => return Err(LaunchError::new(phase, "timed-out acquiring fork semaphore")),
            };

            phase = LaunchPhase::AwaitingSetupAck;
            let spawner = Arc::clone(&self.spawner);
            let spawned = tokio::task::spawn_blocking(move || spawner.spawn(&plan)).await;
            match spawned {
                Ok(Ok(ack)) => ack,
                Ok(Err(e)) => {
                    return Err(LaunchError::new(
                        phase,
                        format!("{}: failure setting up proofserv", e),
                    ))
                }
                Err(e) => {
                    return Err(LaunchError::new(
                        phase,
                        format!("launcher task failed ({}): failure setting up proofserv", e),
                    ))
                }
            }
        };
        let SpawnAck { pid, tag, log_file, child } = ack;
        if let Some(child) = child {
            self.children.lock().insert(pid, child);
        }
        session.with(|st| {
            st.pid = Some(pid);
            st.tag = tag.clone();
            st.log_file = Some(log_file.clone());
        });
        debug!("session {} ({}) started as pid {}", session.id(), tag, pid);

        phase = LaunchPhase::AwaitingCallback;
        let stream = match client.accept_callback(intwait).await {
            Ok(stream) => stream,
            Err(e) => {
                debug!("no callback from {}: {}", pid, e);
                return Err(self.abort(phase, "did not receive callback", pid));
            }
        };
        serve(stream);

        if tokio::time::timeout(intwait, session.wait_bound()).await.is_err()
            || session.back_channel().is_none()
        {
            return Err(self.abort(phase, "handshake with internal link failed", pid));
        }

        phase = LaunchPhase::Bound;
        debug!("session {} bound ({:?})", session.id(), phase);
        session.set_status(SessionStatus::Idle);
        phase = LaunchPhase::Idle;
        info!("session {} of {} ready ({:?}, pid {})", session.id(), client.user(), phase, pid);

        Ok(SpawnAck {
            pid,
            tag,
            log_file,
            child: None,
        })
    }

    fn abort(&self, phase: LaunchPhase, what: &str, pid: i32) -> LaunchError {
        let outcome = match self.kill(pid, true) {
            Ok(()) => "process killed",
            Err(_) => "process could not be killed",
        };
        LaunchError {
            phase,
            reason: format!("{}: {}", what, outcome),
            pid: Some(pid),
        }
    }

    // ==================== Termination ====================

    /// Signal `pid` (SIGKILL when `force`, SIGTERM otherwise) and record it
    pub fn kill(&self, pid: i32, force: bool) -> xpd_utils::Result<()> {
        let signal = if force { libc::SIGKILL } else { libc::SIGTERM };
        let res = process::send_signal(pid, signal);
        if res.is_ok() {
            self.log_terminated(pid);
        }
        self.reap_pid(pid);
        res
    }

    /// Graceful termination.
    ///
    /// The process gets a shutdown interrupt on its back-channel and a
    /// SIGTERM; a background task polls and SIGKILLs it if it is still
    /// there after the poll window. Returns false if SIGTERM failed.
    pub fn terminate(self: &Arc<Self>, pid: i32, back_channel: Option<Responder>) -> bool {
        if let Some(ch) = back_channel {
            ch.try_send(Response::attn_info(ActionCode::Interrupt, SHUTDOWN_INTERRUPT));
        }
        let delivered = match self.kill(pid, false) {
            Ok(()) => true,
            Err(e) => {
                warn!("terminate {}: {}", pid, e);
                false
            }
        };
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.poll_then_kill(pid).await;
        });
        delivered
    }

    /// Wait for `pid` to go away, SIGKILL it at the end of the window.
    /// Returns true if the process is gone.
    pub async fn poll_then_kill(&self, pid: i32) -> bool {
        for _ in 0..self.kill_polls {
            self.reap_pid(pid);
            if !process::is_alive(pid) {
                return true;
            }
            tokio::time::sleep(self.kill_poll).await;
        }
        if process::is_alive(pid) {
            warn!("process {} survived SIGTERM, killing", pid);
            if let Err(e) = self.kill(pid, true) {
                warn!("SIGKILL to {} failed: {}", pid, e);
            }
        }
        self.reap_pid(pid);
        !process::is_alive(pid)
    }

    fn log_terminated(&self, pid: i32) {
        if let Err(e) = xpd_utils::ensure_dir(&self.admin_dir) {
            debug!("admin dir {}: {}", self.admin_dir.display(), e);
            return;
        }
        let path = self.admin_dir.join(format!("terminated-{}", pid));
        let res = std::fs::File::create(&path).and_then(|mut f| {
            writeln!(f, "{}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"))
        });
        if let Err(e) = res {
            debug!("cannot record termination of {}: {}", pid, e);
        }
    }

    // ==================== Reaping ====================

    /// Collect the exit status of `pid` if it is our child and has exited
    fn reap_pid(&self, pid: i32) {
        let mut children = self.children.lock();
        if let Some(child) = children.get_mut(&pid) {
            if matches!(child.try_wait(), Ok(Some(_)) | Err(_)) {
                children.remove(&pid);
            }
        }
    }

    /// Reap every exited child; returns their pids
    pub fn reap(&self) -> Vec<i32> {
        let mut exited = Vec::new();
        self.children.lock().retain(|pid, child| match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!("child {} exited: {}", pid, status);
                exited.push(*pid);
                false
            }
            Err(_) => {
                exited.push(*pid);
                false
            }
        });
        exited
    }

    pub fn tracked(&self) -> Vec<i32> {
        self.children.lock().keys().copied().collect()
    }

    /// Kill every tracked child (daemon shutdown)
    pub fn kill_all(&self) {
        for pid in self.tracked() {
            if let Err(e) = self.kill(pid, true) {
                debug!("kill {}: {}", pid, e);
            }
        }
    }
}
