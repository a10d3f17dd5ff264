//! Daemon-wide services
//!
//! Everything shared between connections hangs off one [`DaemonState`]
//! built at startup and passed around as [`SharedState`].

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use xpd_utils::Result;

use crate::auth::{Authenticator, NoAuth};
use crate::client::ClientRegistry;
use crate::config::{new_config_handle, ConfigHandle, ConfigReloader, GroupRegistry, VersionRegistry, XpdConfig};
use crate::identity::{IdentityResolver, SingleUserResolver, SystemIdentityResolver};
use crate::launcher::{ProcessLauncher, SessionSpawner};
use crate::scheduler::Scheduler;
use crate::selector::{DefaultSelector, WorkerSelector};
use crate::session::{SessionProxy, SessionStatus};
use crate::supervisor::Supervisor;
use crate::topology::{ClusterTopology, NetworkBroadcaster};

/// Shared daemon state
pub type SharedState = Arc<DaemonState>;

pub struct DaemonState {
    pub config: ConfigHandle,
    reloader: Option<ConfigReloader>,
    pub groups: Arc<GroupRegistry>,
    group_file: Option<PathBuf>,
    pub versions: VersionRegistry,
    pub clients: ClientRegistry,
    pub supervisor: Arc<Supervisor>,
    pub scheduler: Scheduler,
    pub topology: Arc<ClusterTopology>,
    pub broadcaster: NetworkBroadcaster,
    pub selector: Box<dyn WorkerSelector>,
    pub authenticator: Box<dyn Authenticator>,
    pub identities: Box<dyn IdentityResolver>,
    /// Account of the daemon, used on peer daemons
    pub daemon_user: String,
    shutdown_tx: broadcast::Sender<()>,
}

/// Assembles a [`DaemonState`]; collaborators default to the production ones
pub struct DaemonStateBuilder {
    config: XpdConfig,
    spawner: Option<Arc<dyn SessionSpawner>>,
    identities: Option<Box<dyn IdentityResolver>>,
    authenticator: Option<Box<dyn Authenticator>>,
    selector: Option<Box<dyn WorkerSelector>>,
    supervisor: Option<Supervisor>,
}

impl DaemonStateBuilder {
    pub fn spawner(mut self, spawner: Arc<dyn SessionSpawner>) -> Self {
        self.spawner = Some(spawner);
        self
    }

    pub fn identities(mut self, identities: Box<dyn IdentityResolver>) -> Self {
        self.identities = Some(identities);
        self
    }

    pub fn authenticator(mut self, authenticator: Box<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn selector(mut self, selector: Box<dyn WorkerSelector>) -> Self {
        self.selector = Some(selector);
        self
    }

    /// Use a preconfigured supervisor (its spawner wins over `spawner`)
    pub fn supervisor(mut self, supervisor: Supervisor) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    pub fn build(self) -> Result<DaemonState> {
        let config = self.config;
        let groups = match &config.group_file {
            Some(path) => GroupRegistry::load(path)?,
            None => GroupRegistry::new(),
        };
        let groups = Arc::new(groups);
        let group_file = config.group_file.clone();
        let versions = VersionRegistry::new(&config.versions);
        if versions.is_empty() {
            warn!("no runtime version configured: sessions cannot be created");
        }

        let identities = self.identities.unwrap_or_else(|| {
            // SAFETY: geteuid() is always safe to call
            if unsafe { libc::geteuid() } == 0 {
                Box::new(SystemIdentityResolver)
            } else {
                Box::new(SingleUserResolver::current())
            }
        });
        let supervisor = match self.supervisor {
            Some(supervisor) => supervisor,
            None => {
                let spawner = self.spawner.unwrap_or_else(|| Arc::new(ProcessLauncher::new()));
                Supervisor::new(spawner, config.admin_dir())
            }
        };

        let topology = Arc::new(ClusterTopology::from_config(&config));
        let daemon_user = std::env::var("USER").unwrap_or_else(|_| "xpd".to_string());
        let broadcaster = NetworkBroadcaster::new(Arc::clone(&topology), daemon_user.clone(), config.admin_req_timeout);
        let reloader = config
            .source
            .as_ref()
            .map(|path| ConfigReloader::new(path.clone(), config.host.clone()));

        let handle = new_config_handle(config);
        let scheduler = Scheduler::new(Arc::clone(&groups), Arc::clone(&handle));
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(DaemonState {
            config: handle,
            reloader,
            groups,
            group_file,
            versions,
            clients: ClientRegistry::new(),
            supervisor: Arc::new(supervisor),
            scheduler,
            topology,
            broadcaster,
            selector: self.selector.unwrap_or_else(|| Box::new(DefaultSelector::new())),
            authenticator: self.authenticator.unwrap_or_else(|| Box::new(NoAuth)),
            identities,
            daemon_user,
            shutdown_tx,
        })
    }
}

impl DaemonState {
    pub fn builder(config: XpdConfig) -> DaemonStateBuilder {
        DaemonStateBuilder {
            config,
            spawner: None,
            identities: None,
            authenticator: None,
            selector: None,
            supervisor: None,
        }
    }

    /// Current configuration snapshot
    pub fn config(&self) -> Arc<XpdConfig> {
        self.config.load_full()
    }

    // ==================== Reconfiguration ====================

    /// Pick up changes of the config, group and topology files.
    ///
    /// Clients whose selected runtime version vanished fall back to the
    /// default. Returns true if the main config file was reloaded.
    pub fn reconfigure(&self) -> bool {
        let reloaded = self
            .reloader
            .as_ref()
            .is_some_and(|r| r.reload_if_changed(&self.config));
        if reloaded {
            let cfg = self.config();
            self.versions.reload(&cfg.versions);
            self.topology.reconfigure(&cfg);
            if cfg.group_file != self.group_file {
                warn!("group file changed - will apply after restart");
            }
            for client in self.clients.all() {
                if let Some(tag) = client.runtime_tag() {
                    if !self.versions.contains(&tag) {
                        info!("{}: version {} gone, back to default", client.user(), tag);
                        client.set_runtime_tag(None);
                    }
                }
            }
        }
        if self.groups.refresh_if_changed() {
            self.scheduler.recompute(&self.clients);
        }
        self.topology.refresh_if_changed();
        reloaded
    }

    // ==================== Session Transitions ====================

    /// Mark `session` running; counts it in its group and reschedules
    pub fn session_running(&self, session: &SessionProxy) {
        if session.set_busy(true) {
            self.groups.adjust_active(&session.group(), 1);
            self.scheduler.recompute(&self.clients);
        }
    }

    /// Mark `session` idle; the reverse of [`session_running`](Self::session_running)
    pub fn session_idle(&self, session: &SessionProxy) {
        if session.set_busy(false) {
            self.groups.adjust_active(&session.group(), -1);
            self.scheduler.recompute(&self.clients);
        }
    }

    /// Tombstone `session`, releasing its nodes and its group slot
    pub fn invalidate_session(&self, session: &SessionProxy) {
        let (assigned, busy) = session.with(|st| (std::mem::take(&mut st.assigned), std::mem::take(&mut st.busy)));
        if !assigned.is_empty() {
            self.topology.release(&assigned);
        }
        let prev = session.reset();
        debug!("session {} invalidated (was {})", session.id(), prev.label());
        if busy {
            self.groups.adjust_active(&session.group(), -1);
            self.scheduler.recompute(&self.clients);
        }
    }

    // ==================== Shutdown ====================

    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Stop the accept loops and the maintenance task
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::VersionDirective;
    use crate::launcher::tests::fake_runtime;
    use tempfile::TempDir;
    use xpd_protocol::Role;

    /// Daemon state rooted in `root` with one runtime version
    pub(crate) fn test_config(root: &TempDir) -> XpdConfig {
        let runtime = fake_runtime(root, "exec sleep 30");
        XpdConfig {
            host: "lxb01.example.org".into(),
            port: 1093,
            workdir: Some(root.path().join("pool")),
            tmp_dir: root.path().join("tmp"),
            versions: vec![VersionDirective {
                dir: runtime.dir,
                tag: Some("v6".into()),
                proto: Some(16),
            }],
            ..XpdConfig::default()
        }
    }

    pub(crate) fn test_state(root: &TempDir) -> DaemonState {
        DaemonState::builder(test_config(root))
            .identities(Box::new(SingleUserResolver::current()))
            .build()
            .unwrap()
    }

    // ==================== Transition Tests ====================

    #[test]
    fn test_running_and_idle_track_group() {
        let root = tempfile::tempdir().unwrap();
        let state = test_state(&root);
        let session = SessionProxy::new(0, Role::TopMaster);
        session.with(|st| st.group = "default".into());

        state.session_running(&session);
        state.session_running(&session);
        assert_eq!(state.groups.get("default").unwrap().active, 1);

        state.session_idle(&session);
        assert_eq!(session.status(), SessionStatus::Idle);
        assert_eq!(state.groups.get("default").unwrap().active, 0);
    }

    #[test]
    fn test_invalidate_releases_nodes() {
        let root = tempfile::tempdir().unwrap();
        let state = test_state(&root);
        let key = state.topology.workers()[1].key();
        state.topology.assign(&[key.clone()]);

        let session = SessionProxy::new(0, Role::TopMaster);
        session.with(|st| {
            st.group = "default".into();
            st.assigned = vec![key];
        });
        state.session_running(&session);
        state.invalidate_session(&session);

        assert!(!session.is_valid());
        assert_eq!(state.groups.get("default").unwrap().active, 0);
        assert_eq!(state.topology.workers()[1].active, 0);
    }

    #[test]
    fn test_reconfigure_resets_vanished_version() {
        let root = tempfile::tempdir().unwrap();
        let runtime = fake_runtime(&root, "exec sleep 30");
        let cfg_path = root.path().join("xpd.cf");
        std::fs::write(
            &cfg_path,
            format!("xpd.rootsys {} v6 proto:16\nxpd.rootsys {} v7\n", runtime.dir.display(), runtime.dir.display()),
        )
        .unwrap();
        let mut config = crate::config::ConfigLoader::load_from_path(&cfg_path, "lxb01").unwrap();
        config.tmp_dir = root.path().join("tmp");
        let state = DaemonState::builder(config)
            .identities(Box::new(SingleUserResolver::current()))
            .build()
            .unwrap();
        assert!(state.versions.contains("v7"));

        let registered = state
            .clients
            .get_or_create("alice", || Ok(crate::client::tests::test_client(&root, "alice")))
            .unwrap();
        registered.set_runtime_tag(Some("v7".into()));

        std::fs::write(&cfg_path, format!("xpd.rootsys {} v6 proto:16\n", runtime.dir.display())).unwrap();
        let later = std::time::SystemTime::now() + std::time::Duration::from_secs(2);
        std::fs::File::options()
            .write(true)
            .open(&cfg_path)
            .unwrap()
            .set_modified(later)
            .unwrap();

        assert!(state.reconfigure());
        assert!(!state.versions.contains("v7"));
        assert_eq!(registered.runtime_tag(), None);
    }

    #[tokio::test]
    async fn test_shutdown_signal() {
        let root = tempfile::tempdir().unwrap();
        let state = test_state(&root);
        let mut rx = state.subscribe_shutdown();
        state.shutdown();
        assert!(rx.recv().await.is_ok());
    }
}
