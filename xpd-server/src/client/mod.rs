//! Per-user client records
//!
//! A [`ClientSession`] is created on the first successful login of a user
//! and lives for the daemon lifetime. It owns the session arena, the
//! table of external connections (the index is the "client id") and the
//! UNIX socket that spawned session processes call back on.

mod registry;
pub mod sandbox;

pub use registry::ClientRegistry;
pub use sandbox::{tag_from_log_path, Sandbox};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info};

use xpd_protocol::Role;
use xpd_utils::{Result, XpdError};

use crate::identity::UserIdentity;
use crate::link::{Link, LinkId};
use crate::session::SessionProxy;

struct ClientInner {
    /// Protocol version announced by the client at login
    version: i16,
    /// Runtime version selected for this client; `None` means the default
    runtime_tag: Option<String>,
    sessions: Vec<Arc<SessionProxy>>,
    /// External connections with the role they logged in with
    links: Vec<Option<(Arc<Link>, Role)>>,
}

/// Everything the daemon knows about one user
pub struct ClientSession {
    identity: UserIdentity,
    group: RwLock<String>,
    sandbox: Sandbox,
    sock_path: PathBuf,
    listener: tokio::sync::Mutex<Option<UnixListener>>,
    inner: Mutex<ClientInner>,
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ClientSession")
            .field("user", &self.identity.user)
            .field("group", &*self.group.read())
            .field("sessions", &inner.sessions.len())
            .field("links", &inner.links.iter().flatten().count())
            .finish()
    }
}

impl ClientSession {
    pub fn new(identity: UserIdentity, group: impl Into<String>, sandbox: Sandbox, sock_path: PathBuf) -> Self {
        Self {
            identity,
            group: RwLock::new(group.into()),
            sandbox,
            sock_path,
            listener: tokio::sync::Mutex::new(None),
            inner: Mutex::new(ClientInner {
                version: -1,
                runtime_tag: None,
                sessions: Vec::new(),
                links: Vec::new(),
            }),
        }
    }

    pub fn user(&self) -> &str {
        &self.identity.user
    }

    pub fn identity(&self) -> &UserIdentity {
        &self.identity
    }

    pub fn group(&self) -> String {
        self.group.read().clone()
    }

    pub fn set_group(&self, group: impl Into<String>) {
        *self.group.write() = group.into();
    }

    /// Whether this record is for `user` (and `group`, when given)
    pub fn matches(&self, user: &str, group: Option<&str>) -> bool {
        self.identity.user == user && group.map_or(true, |g| *self.group.read() == g)
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    /// Path of the callback socket
    pub fn sock_path(&self) -> &Path {
        &self.sock_path
    }

    pub fn version(&self) -> i16 {
        self.inner.lock().version
    }

    pub fn set_version(&self, version: i16) {
        self.inner.lock().version = version;
    }

    pub fn runtime_tag(&self) -> Option<String> {
        self.inner.lock().runtime_tag.clone()
    }

    pub fn set_runtime_tag(&self, tag: Option<String>) {
        self.inner.lock().runtime_tag = tag;
    }

    // ==================== Connections ====================

    /// Register an external connection; returns its client id
    pub fn assign_link(&self, link: Arc<Link>, role: Role) -> i32 {
        let mut inner = self.inner.lock();
        let free = inner
            .links
            .iter()
            .position(|l| l.as_ref().map_or(true, |(l, _)| l.is_closed()));
        let idx = match free {
            Some(idx) => {
                inner.links[idx] = Some((link, role));
                idx
            }
            None => {
                inner.links.push(Some((link, role)));
                inner.links.len() - 1
            }
        };
        debug!("{}: connection assigned client id {}", self.user(), idx);
        idx as i32
    }

    /// Free the client id of `link` and drop every attachment over it
    pub fn release_link(&self, link: LinkId) {
        let sessions = {
            let mut inner = self.inner.lock();
            for slot in inner.links.iter_mut() {
                if slot.as_ref().is_some_and(|(l, _)| l.id() == link) {
                    *slot = None;
                }
            }
            inner.sessions.clone()
        };
        for session in sessions {
            session.detach_link(link);
        }
    }

    /// Live external connections
    pub fn links(&self) -> Vec<Arc<Link>> {
        self.inner
            .lock()
            .links
            .iter()
            .flatten()
            .filter(|(l, _)| !l.is_closed())
            .map(|(l, _)| Arc::clone(l))
            .collect()
    }

    /// Number of live connections opened by top-level clients
    pub fn top_links(&self) -> usize {
        self.inner
            .lock()
            .links
            .iter()
            .flatten()
            .filter(|(l, role)| *role == Role::TopMaster && !l.is_closed())
            .count()
    }

    /// Live connections opened by top-level clients
    pub fn top_master_links(&self) -> Vec<Arc<Link>> {
        self.inner
            .lock()
            .links
            .iter()
            .flatten()
            .filter(|(l, role)| *role == Role::TopMaster && !l.is_closed())
            .map(|(l, _)| Arc::clone(l))
            .collect()
    }

    // ==================== Session Arena ====================

    /// Take the first tombstoned slot, or append a new one
    pub fn allocate_session(&self, role: Role) -> Arc<SessionProxy> {
        let mut inner = self.inner.lock();
        if let Some(session) = inner.sessions.iter().find(|s| !s.is_valid()) {
            session.revalidate(role);
            return Arc::clone(session);
        }
        let session = SessionProxy::new(inner.sessions.len() as i32, role);
        inner.sessions.push(Arc::clone(&session));
        session
    }

    /// Valid session at slot `id`
    pub fn session(&self, id: i32) -> Option<Arc<SessionProxy>> {
        let idx = usize::try_from(id).ok()?;
        self.inner
            .lock()
            .sessions
            .get(idx)
            .filter(|s| s.is_valid())
            .cloned()
    }

    /// Slot `id` whatever its status
    pub fn slot(&self, id: i32) -> Option<Arc<SessionProxy>> {
        let idx = usize::try_from(id).ok()?;
        self.inner.lock().sessions.get(idx).cloned()
    }

    /// Every valid session
    pub fn sessions(&self) -> Vec<Arc<SessionProxy>> {
        self.inner
            .lock()
            .sessions
            .iter()
            .filter(|s| s.is_valid())
            .cloned()
            .collect()
    }

    /// Number of valid worker and master sessions
    pub fn server_counts(&self) -> (usize, usize) {
        let sessions = self.sessions();
        let workers = sessions.iter().filter(|s| s.role().is_worker()).count();
        let masters = sessions.iter().filter(|s| s.role().is_master()).count();
        (workers, masters)
    }

    // ==================== Callback Socket ====================

    /// Accept the next session-process callback, bounded by `wait`.
    ///
    /// The listening socket is created on first use; accepts for one
    /// client are serialized.
    pub async fn accept_callback(&self, wait: Duration) -> Result<UnixStream> {
        let mut guard = self.listener.lock().await;
        if guard.is_none() {
            *guard = Some(self.bind_listener()?);
        }
        let Some(listener) = guard.as_ref() else {
            return Err(XpdError::internal("callback socket missing"));
        };
        match tokio::time::timeout(wait, listener.accept()).await {
            Ok(Ok((stream, _))) => Ok(stream),
            Ok(Err(e)) => Err(XpdError::connection(format!("accept on {} failed: {}", self.sock_path.display(), e))),
            Err(_) => Err(XpdError::ConnectionTimeout {
                seconds: wait.as_secs(),
            }),
        }
    }

    fn bind_listener(&self) -> Result<UnixListener> {
        if let Some(parent) = self.sock_path.parent() {
            xpd_utils::ensure_dir(parent).map_err(|e| XpdError::Directory {
                path: parent.to_path_buf(),
                reason: e.to_string(),
            })?;
        }
        if self.sock_path.exists() {
            std::fs::remove_file(&self.sock_path).map_err(|e| XpdError::FileWrite {
                path: self.sock_path.clone(),
                source: e,
            })?;
        }
        let listener = UnixListener::bind(&self.sock_path).map_err(|e| {
            XpdError::connection(format!("cannot bind {}: {}", self.sock_path.display(), e))
        })?;
        self.sandbox.chown(&self.sock_path)?;
        info!("{}: callback socket at {}", self.user(), self.sock_path.display());
        Ok(listener)
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.sock_path);
    }
}
