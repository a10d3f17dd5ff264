//! Configuration schema types
//!
//! An `XpdConfig` is an immutable snapshot produced by the loader; a reload
//! builds a new snapshot and swaps it in whole.

use std::path::PathBuf;
use std::time::Duration;

use xpd_protocol::Role;

/// Default listening port
pub const DEFAULT_PORT: u16 = 1093;

/// Role this node plays in the cluster (`xpd.role`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeRole {
    #[default]
    Any,
    Worker,
    /// Sub-master in a multi-tier setup
    Master,
    TopMaster,
}

impl NodeRole {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "any" => Some(Self::Any),
            "worker" => Some(Self::Worker),
            "submaster" => Some(Self::Master),
            "master" => Some(Self::TopMaster),
            _ => None,
        }
    }

    /// Whether a login with `role` may be served by this node
    pub fn admits(self, role: Role) -> bool {
        match role {
            Role::TopMaster => matches!(self, Self::Any | Self::TopMaster),
            Role::SubMaster => matches!(self, Self::Any | Self::Master),
            Role::Worker => matches!(self, Self::Any | Self::Worker),
            Role::Admin | Role::Internal => true,
        }
    }

    /// Worker and sub-master nodes only accept masters from `allow`ed hosts
    pub fn checks_master(self) -> bool {
        matches!(self, Self::Worker | Self::Master)
    }
}

/// Worker selection options (`xpd.resource static ...`, `xpd.schedparam`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionMode {
    All,
    #[default]
    RoundRobin,
    Random,
    LoadBased,
}

impl SelectionMode {
    pub fn label(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::RoundRobin => "round-robin",
            Self::Random => "random",
            Self::LoadBased => "load-based",
        }
    }
}

/// Static resource description and worker selection parameters
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceConfig {
    /// Static topology file; `None` synthesizes a localhost-only cluster
    pub file: Option<PathBuf>,
    /// Let users provide their own topology file
    pub user_cfg: bool,
    /// Maximum workers per session (`wmx:`), negative means all
    pub max_workers: i32,
    /// Maximum concurrent sessions (`mxsess:`), negative means unlimited
    pub max_sessions: i32,
    pub selection: SelectionMode,
    /// Fraction of free nodes used by load-based selection (`fraction:`)
    pub nodes_fraction: f32,
    /// Sessions per node above which a node is not free (`optnwrks:`)
    pub opt_workers_per_unit: i32,
    /// Workers always added by load-based selection (`minforquery:`)
    pub min_for_query: i32,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            file: None,
            user_cfg: false,
            max_workers: -1,
            max_sessions: -1,
            selection: SelectionMode::RoundRobin,
            nodes_fraction: 0.5,
            opt_workers_per_unit: 2,
            min_for_query: 2,
        }
    }
}

/// `xpd.priority <delta> [if <user-pattern>]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorityRule {
    pub delta: i32,
    pub pattern: String,
}

/// When to shut down sessions left without clients (`xpd.shutdown`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownPolicy {
    /// 0 never, 1 only idle sessions, 2 always
    pub opt: i32,
    /// Grace period before the shutdown fires
    pub delay: Duration,
}

impl Default for ShutdownPolicy {
    fn default() -> Self {
        Self {
            opt: 1,
            delay: Duration::ZERO,
        }
    }
}

/// Inflate-factor scheduling mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedMode {
    #[default]
    Priority,
    Fraction,
}

/// `xpd.schedopt [overall:<f>] [fraction|priority]`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedOptions {
    pub enabled: bool,
    pub mode: SchedMode,
    /// Global inflate multiplier, never below 1
    pub overall: f32,
}

impl Default for SchedOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: SchedMode::Priority,
            overall: 1.0,
        }
    }
}

/// `xpd.rootsys <dir> [tag] [proto:N]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionDirective {
    pub dir: PathBuf,
    pub tag: Option<String>,
    pub proto: Option<i32>,
}

/// Immutable daemon configuration snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct XpdConfig {
    /// File this snapshot was read from
    pub source: Option<PathBuf>,
    /// Local host name used by `if` qualifiers and tags
    pub host: String,
    pub port: u16,
    pub role: NodeRole,
    /// Root of the per-user sandboxes; `<home>/proof` when unset
    pub workdir: Option<PathBuf>,
    pub dataset_dir: Option<String>,
    pub image: Option<String>,
    /// Data pool URL returned to top-master clients; `root://<host>` when unset
    pub pool_url: Option<String>,
    pub namespace: String,
    pub tmp_dir: PathBuf,
    pub resource: ResourceConfig,
    /// Hosts allowed to connect as masters to a worker/sub-master
    pub allow: Vec<String>,
    pub superusers: Vec<String>,
    /// Controlled mode: only these users may log in (empty means all)
    pub allowed_users: Vec<String>,
    /// Resolve each client to its own system account
    pub multiuser: bool,
    pub priorities: Vec<PriorityRule>,
    /// `NAME=value` pairs exported to session processes
    pub putenv: Vec<String>,
    /// `Key: value` lines added to the session resource file
    pub putrc: Vec<String>,
    pub shutdown: ShutdownPolicy,
    pub sched: SchedOptions,
    pub group_file: Option<PathBuf>,
    pub versions: Vec<VersionDirective>,
    /// Session process log level used when the client sends none
    pub debug_level: i32,
    /// Wait for a spawned session's callback
    pub intwait: Duration,
    /// Wait for the opening handshake bytes
    pub readwait: Duration,
    /// Request timeout on pooled inter-node connections
    pub admin_req_timeout: Duration,
    /// Old session records kept per client
    pub max_old_logs: usize,
    /// Period of the background maintenance task
    pub reload_interval: Duration,
}

impl Default for XpdConfig {
    fn default() -> Self {
        Self {
            source: None,
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            role: NodeRole::Any,
            workdir: None,
            dataset_dir: None,
            image: None,
            pool_url: None,
            namespace: "/proofpool".to_string(),
            tmp_dir: std::env::temp_dir(),
            resource: ResourceConfig::default(),
            allow: Vec::new(),
            superusers: Vec::new(),
            allowed_users: Vec::new(),
            multiuser: false,
            priorities: Vec::new(),
            putenv: Vec::new(),
            putrc: Vec::new(),
            shutdown: ShutdownPolicy::default(),
            sched: SchedOptions::default(),
            group_file: None,
            versions: Vec::new(),
            debug_level: 0,
            intwait: Duration::from_secs(5),
            readwait: Duration::from_secs(5),
            admin_req_timeout: Duration::from_secs(30),
            max_old_logs: 10,
            reload_interval: Duration::from_secs(30),
        }
    }
}

impl XpdConfig {
    /// Sandbox root for a user with home directory `home`
    pub fn sandbox_root(&self, home: &std::path::Path) -> PathBuf {
        match &self.workdir {
            Some(dir) => dir.clone(),
            None => xpd_utils::default_sandbox_root(home),
        }
    }

    pub fn is_superuser(&self, user: &str) -> bool {
        self.superusers.iter().any(|u| u == user)
    }

    /// Priority delta of the most specific rule matching `user`
    pub fn priority_delta(&self, user: &str) -> Option<i32> {
        let mut best: Option<(usize, i32)> = None;
        for rule in &self.priorities {
            if let Some(score) = xpd_utils::match_score(user, &rule.pattern) {
                if best.map_or(true, |(s, _)| score >= s) {
                    best = Some((score, rule.delta));
                }
            }
        }
        best.map(|(_, delta)| delta)
    }

    /// Whether `host` may connect as a master to this node
    pub fn is_allowed_master(&self, host: &str) -> bool {
        self.allow
            .iter()
            .any(|p| xpd_utils::matches(host, p) || xpd_utils::same_host(host, p))
    }

    /// `<poolurl>/<namespace>` sent with the top-master Create reply
    pub fn pool_location(&self) -> String {
        let mut url = self
            .pool_url
            .clone()
            .unwrap_or_else(|| format!("root://{}", self.host));
        if !url.ends_with('/') {
            url.push('/');
        }
        url.push_str(self.namespace.trim_start_matches('/'));
        url
    }

    /// Admin area holding the terminated-process log
    pub fn admin_dir(&self) -> PathBuf {
        xpd_utils::admin_dir(&self.tmp_dir, self.port)
    }
}
