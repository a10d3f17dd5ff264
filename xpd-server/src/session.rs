//! Per-session records
//!
//! A [`SessionProxy`] lives in its client's slot arena for the daemon
//! lifetime: destroying a session only marks it invalid so the slot (and
//! its id) can be handed out again by a later Create.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use xpd_protocol::{ActionCode, Response, Role};

use crate::link::{LinkId, Responder};

/// Session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionStatus {
    Setup,
    Idle,
    Running,
    ShutdownScheduled,
    Invalid,
}

impl SessionStatus {
    pub fn label(self) -> &'static str {
        match self {
            Self::Setup => "setup",
            Self::Idle => "idle",
            Self::Running => "running",
            Self::ShutdownScheduled => "shutdown",
            Self::Invalid => "invalid",
        }
    }
}

/// Mutable part of a session
#[derive(Debug)]
pub struct SessionState {
    pub status: SessionStatus,
    /// Counted as active in its group; survives a pending shutdown
    pub busy: bool,
    pub role: Role,
    pub tag: String,
    pub alias: String,
    pub ordinal: String,
    pub pid: Option<i32>,
    /// Dedicated link to the session process
    pub back_channel: Option<Responder>,
    /// Protocol version of the session process
    pub srv_proto: i32,
    pub client_version: i16,
    pub runtime_tag: String,
    /// Attached clients indexed by client id
    pub attachments: Vec<Option<Responder>>,
    /// Last query-count message, replayed on attach
    pub query_num: Option<Bytes>,
    /// Last start-processing message, replayed on attach while running
    pub start_msg: Option<Bytes>,
    pub inflate: i32,
    pub priority_delta: Option<i32>,
    pub user_envs: String,
    pub log_file: Option<PathBuf>,
    pub work_dir: Option<PathBuf>,
    pub group: String,
    /// Nodes handed out by GetWorkers, released when the session ends
    pub assigned: Vec<String>,
    pub shutdown: Option<CancellationToken>,
}

impl SessionState {
    fn fresh(role: Role) -> Self {
        Self {
            status: SessionStatus::Setup,
            busy: false,
            role,
            tag: String::new(),
            alias: String::new(),
            ordinal: "0".to_string(),
            pid: None,
            back_channel: None,
            srv_proto: -1,
            client_version: -1,
            runtime_tag: String::new(),
            attachments: Vec::new(),
            query_num: None,
            start_msg: None,
            inflate: 1000,
            priority_delta: None,
            user_envs: String::new(),
            log_file: None,
            work_dir: None,
            group: String::new(),
            assigned: Vec::new(),
            shutdown: None,
        }
    }
}

/// A session slot
#[derive(Debug)]
pub struct SessionProxy {
    id: i32,
    state: Mutex<SessionState>,
    /// Signalled when the session process logs in on its callback link
    bound: Notify,
    /// Signalled when the session process acknowledges a ping
    ping: Notify,
}

impl SessionProxy {
    pub fn new(id: i32, role: Role) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: Mutex::new(SessionState::fresh(role)),
            bound: Notify::new(),
            ping: Notify::new(),
        })
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    /// Run `f` with the state locked. Never await inside.
    pub fn with<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        f(&mut self.state.lock())
    }

    pub fn status(&self) -> SessionStatus {
        self.state.lock().status
    }

    pub fn is_valid(&self) -> bool {
        self.status() != SessionStatus::Invalid
    }

    pub fn role(&self) -> Role {
        self.state.lock().role
    }

    pub fn tag(&self) -> String {
        self.state.lock().tag.clone()
    }

    pub fn pid(&self) -> Option<i32> {
        self.state.lock().pid
    }

    pub fn group(&self) -> String {
        self.state.lock().group.clone()
    }

    /// Set the status; returns the previous one
    pub fn set_status(&self, status: SessionStatus) -> SessionStatus {
        let mut st = self.state.lock();
        std::mem::replace(&mut st.status, status)
    }

    pub fn is_busy(&self) -> bool {
        self.state.lock().busy
    }

    /// Mark the session busy or idle; false if it already was.
    ///
    /// A pending shutdown keeps its status, only the busy flag changes.
    pub fn set_busy(&self, busy: bool) -> bool {
        let mut st = self.state.lock();
        if st.status != SessionStatus::ShutdownScheduled {
            st.status = if busy { SessionStatus::Running } else { SessionStatus::Idle };
        }
        std::mem::replace(&mut st.busy, busy) != busy
    }

    /// Schedule a shutdown guarded by `token`, cancelling an earlier one
    pub fn schedule_shutdown(&self, token: CancellationToken) {
        let mut st = self.state.lock();
        if let Some(old) = st.shutdown.replace(token) {
            old.cancel();
        }
        st.status = SessionStatus::ShutdownScheduled;
    }

    /// Cancel a pending shutdown and restore the running or idle status
    pub fn cancel_shutdown(&self) -> bool {
        let mut st = self.state.lock();
        Self::cancel_shutdown_locked(&mut st)
    }

    fn cancel_shutdown_locked(st: &mut SessionState) -> bool {
        let Some(token) = st.shutdown.take() else {
            return false;
        };
        token.cancel();
        if st.status == SessionStatus::ShutdownScheduled {
            st.status = if st.busy { SessionStatus::Running } else { SessionStatus::Idle };
        }
        true
    }

    /// Reinitialize a tombstoned slot for a new session
    pub fn revalidate(&self, role: Role) {
        *self.state.lock() = SessionState::fresh(role);
    }

    /// Tombstone the slot.
    ///
    /// Attachments and the back-channel are dropped, a pending shutdown
    /// timer is cancelled. Returns the status before the reset.
    pub fn reset(&self) -> SessionStatus {
        let mut st = self.state.lock();
        if let Some(token) = st.shutdown.take() {
            token.cancel();
        }
        st.attachments.clear();
        st.back_channel = None;
        st.query_num = None;
        st.start_msg = None;
        std::mem::replace(&mut st.status, SessionStatus::Invalid)
    }

    // ==================== Attachments ====================

    /// Attach client `cid`; replaces a previous attachment of the same id
    pub fn attach(&self, cid: i32, responder: Responder) {
        let Ok(idx) = usize::try_from(cid) else {
            return;
        };
        let mut st = self.state.lock();
        if st.attachments.len() <= idx {
            st.attachments.resize(idx + 1, None);
        }
        st.attachments[idx] = Some(responder);
        Self::cancel_shutdown_locked(&mut st);
    }

    /// Detach client `cid`; false if it was not attached
    pub fn detach(&self, cid: i32) -> bool {
        let Ok(idx) = usize::try_from(cid) else {
            return false;
        };
        let mut st = self.state.lock();
        match st.attachments.get_mut(idx) {
            Some(slot) => slot.take().is_some(),
            None => false,
        }
    }

    /// Drop every attachment going over `link`; returns how many
    pub fn detach_link(&self, link: LinkId) -> usize {
        let mut st = self.state.lock();
        let mut n = 0;
        for slot in st.attachments.iter_mut() {
            if slot.as_ref().is_some_and(|r| r.link().id() == link) {
                *slot = None;
                n += 1;
            }
        }
        n
    }

    pub fn attached(&self, cid: i32) -> Option<Responder> {
        let idx = usize::try_from(cid).ok()?;
        self.state.lock().attachments.get(idx).cloned().flatten()
    }

    /// Whether `cid` is inside the attachment table (attached or not)
    pub fn has_client_slot(&self, cid: i32) -> bool {
        usize::try_from(cid).is_ok_and(|idx| idx < self.state.lock().attachments.len())
    }

    pub fn client_count(&self) -> usize {
        self.state.lock().attachments.iter().flatten().count()
    }

    /// All attached clients with their ids
    pub fn clients(&self) -> Vec<(i32, Responder)> {
        self.state
            .lock()
            .attachments
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.clone().map(|r| (i as i32, r)))
            .collect()
    }

    /// Send an attn text to every attached client except `except`
    pub fn notify_clients(&self, action: ActionCode, text: &str, except: Option<LinkId>) -> usize {
        let mut n = 0;
        for (_, client) in self.clients() {
            if Some(client.link().id()) == except {
                continue;
            }
            if client.try_send(Response::attn_text(action, text)) {
                n += 1;
            }
        }
        n
    }

    // ==================== Back-channel ====================

    /// Bind the session process link and wake the waiting Create
    pub fn bind_back_channel(&self, responder: Responder, srv_proto: i32) {
        {
            let mut st = self.state.lock();
            st.back_channel = Some(responder);
            st.srv_proto = srv_proto;
        }
        self.bound.notify_waiters();
    }

    pub fn back_channel(&self) -> Option<Responder> {
        self.state.lock().back_channel.clone()
    }

    /// Clear the back-channel if it goes over `link`
    pub fn clear_back_channel(&self, link: LinkId) -> bool {
        let mut st = self.state.lock();
        if st.back_channel.as_ref().is_some_and(|r| r.link().id() == link) {
            st.back_channel = None;
            return true;
        }
        false
    }

    /// Wait until the session process has logged in
    pub async fn wait_bound(&self) {
        loop {
            let notified = self.bound.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.state.lock().back_channel.is_some() {
                return;
            }
            notified.await;
        }
    }

    /// Wake the pending ping waiters; an ack with nobody waiting is dropped
    pub fn ping_acked(&self) {
        self.ping.notify_waiters();
    }

    /// Future resolved by the next ack. Enable it before sending the ping.
    pub fn ping_waiter(&self) -> Notified<'_> {
        self.ping.notified()
    }

    // ==================== Reporting ====================

    /// QuerySessions entry: `<id> <tag> <alias> <status> <nclients>`
    pub fn export(&self) -> String {
        let st = self.state.lock();
        let alias = if st.alias.is_empty() { "-" } else { &st.alias };
        format!(
            "{} {} {} {} {}",
            self.id,
            st.tag,
            alias,
            st.status.label(),
            st.attachments.iter().flatten().count()
        )
    }
}
