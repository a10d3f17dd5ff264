//! One line of the static resource file

use std::fmt;

/// Role of a node in the cluster tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Master,
    SubMaster,
    Worker,
}

impl NodeKind {
    pub fn code(self) -> char {
        match self {
            Self::Master => 'M',
            Self::SubMaster => 'S',
            Self::Worker => 'W',
        }
    }

    fn from_keyword(word: &str) -> Option<Self> {
        match word {
            "master" | "node" => Some(Self::Master),
            "submaster" => Some(Self::SubMaster),
            "worker" | "slave" => Some(Self::Worker),
            _ => None,
        }
    }
}

/// A cluster node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterNode {
    pub kind: NodeKind,
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub perf: u32,
    pub image: Option<String>,
    pub workdir: Option<String>,
    /// Sessions assigned to this node by the worker selector
    pub active: u32,
}

impl ClusterNode {
    pub fn new(kind: NodeKind, host: impl Into<String>) -> Self {
        Self {
            kind,
            user: None,
            host: host.into(),
            port: None,
            perf: 100,
            image: None,
            workdir: None,
            active: 0,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Parse `<kind> [user@]host [port=N] [perf=N] [image=X] [workdir=X]`
    pub fn parse(line: &str) -> Option<Self> {
        let mut tokens = line.split_whitespace();
        let kind = NodeKind::from_keyword(tokens.next()?)?;
        let target = tokens.next()?;
        let (user, host) = match target.split_once('@') {
            Some((u, h)) => (Some(u.to_string()).filter(|u| !u.is_empty()), h),
            None => (None, target),
        };
        if host.is_empty() {
            return None;
        }
        let mut node = Self::new(kind, host);
        node.user = user;
        for token in tokens {
            let Some((key, value)) = token.split_once('=') else {
                continue;
            };
            match key {
                "port" => node.port = value.parse().ok(),
                "perf" => node.perf = value.parse().unwrap_or(node.perf),
                "image" => node.image = Some(value.to_string()),
                "workdir" => node.workdir = Some(value.to_string()),
                _ => {}
            }
        }
        Some(node)
    }

    /// Whether this node runs on `host`
    pub fn matches_host(&self, host: &str) -> bool {
        xpd_utils::same_host(&self.host, host)
    }

    /// Same daemon: same host and same (or unspecified) port
    pub fn same_daemon(&self, other: &ClusterNode) -> bool {
        self.matches_host(&other.host) && self.port == other.port
    }

    /// Whether this is the daemon at `host:port`
    pub fn is_local(&self, host: &str, port: u16) -> bool {
        let ours = self.host.contains("localhost") || host.contains(self.host.as_str());
        ours && self.port.map_or(true, |p| p == port)
    }

    /// Connection URL `user@host[:port]`
    pub fn url(&self, user: &str) -> String {
        match self.port {
            Some(port) => format!("{}@{}:{}", user, self.host, port),
            None => format!("{}@{}", user, self.host),
        }
    }

    /// Key identifying the daemon of this node
    pub fn key(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{}", self.host, port),
            None => self.host.clone(),
        }
    }

    /// GetWorkers entry: `type|[user@]host|port|-|perf|image|workdir`
    pub fn export(&self) -> String {
        let host = match &self.user {
            Some(u) => format!("{}@{}", u, self.host),
            None => self.host.clone(),
        };
        format!(
            "{}|{}|{}|-|{}|{}|{}",
            self.kind.code(),
            host,
            self.port.map_or_else(|| "-1".to_string(), |p| p.to_string()),
            self.perf,
            self.image.as_deref().unwrap_or("-"),
            self.workdir.as_deref().unwrap_or("-"),
        )
    }
}

impl fmt::Display for ClusterNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.code(), self.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_worker_line() {
        let node = ClusterNode::parse("worker alice@lxb07 port=2093 perf=80 workdir=/pool").unwrap();
        assert_eq!(node.kind, NodeKind::Worker);
        assert_eq!(node.user.as_deref(), Some("alice"));
        assert_eq!(node.host, "lxb07");
        assert_eq!(node.port, Some(2093));
        assert_eq!(node.perf, 80);
        assert_eq!(node.workdir.as_deref(), Some("/pool"));
        assert_eq!(node.export(), "W|alice@lxb07|2093|-|80|-|/pool");
    }

    #[test]
    fn test_parse_kinds_and_junk() {
        assert_eq!(ClusterNode::parse("slave h").unwrap().kind, NodeKind::Worker);
        assert_eq!(ClusterNode::parse("node h").unwrap().kind, NodeKind::Master);
        assert_eq!(ClusterNode::parse("submaster h").unwrap().kind, NodeKind::SubMaster);
        assert!(ClusterNode::parse("printer h").is_none());
        assert!(ClusterNode::parse("worker").is_none());
    }

    #[test]
    fn test_url_and_locality() {
        let node = ClusterNode::new(NodeKind::Worker, "localhost").with_port(1093);
        assert_eq!(node.url("xpd"), "xpd@localhost:1093");
        assert!(node.is_local("lxb01.example.org", 1093));
        assert!(!node.is_local("lxb01.example.org", 2000));

        let remote = ClusterNode::new(NodeKind::Worker, "lxb07");
        assert_eq!(remote.url("xpd"), "xpd@lxb07");
        assert!(!remote.is_local("lxb01.example.org", 1093));
    }

    #[test]
    fn test_same_daemon() {
        let a = ClusterNode::new(NodeKind::Worker, "lxb07").with_port(1093);
        let b = ClusterNode::new(NodeKind::Worker, "lxb07").with_port(1093);
        let c = ClusterNode::new(NodeKind::Worker, "lxb07").with_port(2093);
        assert!(a.same_daemon(&b));
        assert!(!a.same_daemon(&c));
    }
}
