//! Cluster topology
//!
//! The node list comes from the static resource file (`xpd.resource
//! static <file>`), re-read whenever its modification time changes, or is
//! synthesized as one local worker per CPU. The first entry always
//! describes this master. Broadcasts go to the deduplicated unique-node
//! list, over connections kept in a [`ConnectionPool`].

mod broadcast;
mod node;
pub(crate) mod pool;

pub use broadcast::{BroadcastReport, NetworkBroadcaster};
pub use node::{ClusterNode, NodeKind};
pub use pool::ConnectionPool;

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::XpdConfig;

#[derive(Debug, Default)]
struct Nodes {
    workers: Vec<ClusterNode>,
    unique: Vec<ClusterNode>,
}

/// Known nodes of the cluster
pub struct ClusterTopology {
    host: String,
    port: u16,
    ncpu: usize,
    source: Mutex<Option<PathBuf>>,
    mtime: Mutex<Option<SystemTime>>,
    nodes: RwLock<Nodes>,
}

impl ClusterTopology {
    pub fn new(host: impl Into<String>, port: u16, source: Option<PathBuf>) -> Self {
        let ncpu = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::with_cpus(host, port, source, ncpu)
    }

    /// Topology whose file-less default has `ncpu` local workers
    pub fn with_cpus(host: impl Into<String>, port: u16, source: Option<PathBuf>, ncpu: usize) -> Self {
        let topology = Self {
            host: host.into(),
            port,
            ncpu,
            source: Mutex::new(None),
            mtime: Mutex::new(None),
            nodes: RwLock::new(Nodes::default()),
        };
        topology.set_source(source);
        topology
    }

    pub fn from_config(config: &XpdConfig) -> Self {
        Self::new(config.host.clone(), config.port, config.resource.file.clone())
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Follow a reloaded configuration
    pub fn reconfigure(&self, config: &XpdConfig) {
        if *self.source.lock() != config.resource.file {
            self.set_source(config.resource.file.clone());
        }
    }

    fn set_source(&self, source: Option<PathBuf>) {
        let readable = source.filter(|p| {
            let ok = std::fs::File::open(p).is_ok();
            if !ok {
                warn!("resource file {} cannot be read: using defaults", p.display());
            }
            ok
        });
        *self.source.lock() = readable.clone();
        *self.mtime.lock() = None;
        match readable {
            Some(path) => {
                self.refresh_if_changed();
                info!("topology from {}", path.display());
            }
            None => self.install(self.default_workers()),
        }
    }

    fn default_workers(&self) -> Vec<ClusterNode> {
        let mut workers = vec![ClusterNode::new(NodeKind::Master, self.host.clone())];
        for _ in 0..self.ncpu {
            workers.push(ClusterNode::new(NodeKind::Worker, "localhost").with_port(self.port));
        }
        workers
    }

    fn install(&self, workers: Vec<ClusterNode>) {
        let unique = unique_nodes(&workers);
        debug!("{} workers, {} unique nodes", workers.len() - 1, unique.len());
        let mut nodes = self.nodes.write();
        // Keep assignment counters across reloads
        let merged = workers
            .into_iter()
            .map(|mut w| {
                if let Some(old) = nodes.workers.iter().find(|o| o.key() == w.key() && o.kind == w.kind) {
                    w.active = old.active;
                }
                w
            })
            .collect();
        *nodes = Nodes {
            workers: merged,
            unique,
        };
    }

    /// Re-read the resource file if it changed; true if reloaded
    pub fn refresh_if_changed(&self) -> bool {
        let Some(path) = self.source.lock().clone() else {
            return false;
        };
        let current = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
        {
            let mut mtime = self.mtime.lock();
            if current.is_some() && *mtime >= current {
                return false;
            }
            *mtime = current;
        }
        match read_resource_file(&path, &self.host) {
            Ok(workers) => {
                self.install(workers);
                true
            }
            Err(e) => {
                warn!("cannot read resource file {}: {}", path.display(), e);
                false
            }
        }
    }

    /// Full node list; entry 0 is this master
    pub fn workers(&self) -> Vec<ClusterNode> {
        self.refresh_if_changed();
        self.nodes.read().workers.clone()
    }

    /// Deduplicated node list (without the master entry)
    pub fn unique_nodes(&self) -> Vec<ClusterNode> {
        self.refresh_if_changed();
        self.nodes.read().unique.clone()
    }

    /// Count a session on each node of `keys`
    pub fn assign(&self, keys: &[String]) {
        self.adjust(keys, 1);
    }

    /// Undo [`assign`](Self::assign)
    pub fn release(&self, keys: &[String]) {
        self.adjust(keys, -1);
    }

    fn adjust(&self, keys: &[String], delta: i64) {
        let mut nodes = self.nodes.write();
        for key in keys {
            if let Some(w) = nodes
                .workers
                .iter_mut()
                .skip(1)
                .find(|w| &w.key() == key)
            {
                w.active = (w.active as i64 + delta).max(0) as u32;
            }
        }
    }
}

fn read_resource_file(path: &Path, host: &str) -> std::io::Result<Vec<ClusterNode>> {
    let content = std::fs::read_to_string(path)?;
    Ok(parse_resource(&content, host))
}

/// Parse resource-file lines; the first entry is the master of `host`
pub fn parse_resource(content: &str, host: &str) -> Vec<ClusterNode> {
    let mut workers = vec![ClusterNode::new(NodeKind::Master, host)];
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some(node) = ClusterNode::parse(line) else {
            debug!("ignoring resource line '{}'", line);
            continue;
        };
        if node.kind == NodeKind::Master {
            // Only our own master line matters
            if node.host == "localhost" || node.matches_host(host) {
                workers[0] = node;
            }
            continue;
        }
        workers.push(node);
    }
    workers
}

/// Workers deduplicated by daemon, master entry skipped
fn unique_nodes(workers: &[ClusterNode]) -> Vec<ClusterNode> {
    let mut unique: Vec<ClusterNode> = Vec::new();
    for w in workers.iter().skip(1) {
        if !unique.iter().any(|u| u.same_daemon(w)) {
            unique.push(w.clone());
        }
    }
    unique
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const RESOURCE: &str = "\
# test cluster
master lxb01.example.org workdir=/pool/master
worker lxb07 port=2093
worker lxb07 port=2093
slave lxb08
submaster lxb09
master elsewhere
";

    // ==================== Parsing Tests ====================

    #[test]
    fn test_parse_resource_replaces_own_master() {
        let workers = parse_resource(RESOURCE, "lxb01.example.org");
        assert_eq!(workers.len(), 5);
        assert_eq!(workers[0].kind, NodeKind::Master);
        assert_eq!(workers[0].workdir.as_deref(), Some("/pool/master"));
        assert_eq!(workers[4].kind, NodeKind::SubMaster);
    }

    #[test]
    fn test_unique_nodes_deduplicated() {
        let workers = parse_resource(RESOURCE, "lxb01.example.org");
        let unique = unique_nodes(&workers);
        let keys: Vec<String> = unique.iter().map(|n| n.key()).collect();
        assert_eq!(keys, vec!["lxb07:2093", "lxb08", "lxb09"]);
    }

    // ==================== Topology Tests ====================

    #[test]
    fn test_default_topology_is_local() {
        let topology = ClusterTopology::with_cpus("lxb01", 1093, None, 3);
        let workers = topology.workers();
        assert_eq!(workers.len(), 4);
        assert!(workers[1..].iter().all(|w| w.host == "localhost" && w.port == Some(1093)));
        let unique = topology.unique_nodes();
        assert_eq!(unique.len(), 1);
        assert!(unique[0].is_local("lxb01", 1093));
    }

    #[test]
    fn test_unreadable_file_falls_back() {
        let topology = ClusterTopology::with_cpus("lxb01", 1093, Some("/nonexistent/cluster.conf".into()), 2);
        assert_eq!(topology.workers().len(), 3);
    }

    #[test]
    fn test_reload_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster.conf");
        std::fs::write(&path, "worker lxb07\n").unwrap();
        let topology = ClusterTopology::with_cpus("lxb01", 1093, Some(path.clone()), 2);
        assert_eq!(topology.workers().len(), 2);
        assert!(!topology.refresh_if_changed());

        // Make sure the mtime moves forward
        std::thread::sleep(std::time::Duration::from_millis(20));
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(f, "worker lxb08").unwrap();
        drop(f);
        let later = SystemTime::now() + std::time::Duration::from_secs(2);
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(later).unwrap();

        assert!(topology.refresh_if_changed());
        assert_eq!(topology.workers().len(), 3);
    }

    #[test]
    fn test_assign_and_release_counts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster.conf");
        std::fs::write(&path, "worker lxb07\nworker lxb08\n").unwrap();
        let topology = ClusterTopology::with_cpus("lxb01", 1093, Some(path), 2);
        let keys = vec!["lxb07".to_string()];
        topology.assign(&keys);
        topology.assign(&keys);
        assert_eq!(topology.workers()[1].active, 2);
        topology.release(&keys);
        assert_eq!(topology.workers()[1].active, 1);
        assert_eq!(topology.workers()[2].active, 0);
    }
}
