//! Fan-out of administrative requests to the cluster

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, instrument, warn};

use xpd_protocol::{ActionCode, AdminType, ReadBufBody, ServerType};
use xpd_utils::XpdError;

use super::{ClusterTopology, ConnectionPool, NodeKind};
use crate::link::Responder;

/// Outcome of a broadcast
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Nodes that accepted the request
    pub sent: usize,
    /// `"<url>: <reason>"` for every node that did not
    pub failures: Vec<String>,
}

impl BroadcastReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Failures merged into one informational message
    pub fn message(&self) -> Option<String> {
        if self.failures.is_empty() {
            None
        } else {
            Some(self.failures.join("\n"))
        }
    }
}

/// Sends requests to the other daemons of the cluster
pub struct NetworkBroadcaster {
    topology: Arc<ClusterTopology>,
    pool: ConnectionPool,
    user: String,
}

impl NetworkBroadcaster {
    /// `user` is the account used on peer daemons unless a node names one
    pub fn new(topology: Arc<ClusterTopology>, user: impl Into<String>, timeout: Duration) -> Self {
        let pool = ConnectionPool::new(topology.host().to_string(), timeout);
        Self {
            topology,
            pool,
            user: user.into(),
        }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Send admin request `kind` to every unique node but ourselves.
    ///
    /// Only `ChangeDefaultVersion` and `CleanupSessions` travel through the
    /// cluster. A node that fails is reported (and, with `notify`, signalled
    /// to the requester) without stopping the others.
    #[instrument(skip(self, msg, notify), fields(kind = ?kind))]
    pub async fn broadcast(
        &self,
        kind: AdminType,
        msg: &str,
        notify: Option<&Responder>,
    ) -> Result<BroadcastReport, String> {
        if !matches!(kind, AdminType::ChangeDefaultVersion | AdminType::CleanupSessions) {
            return Err(format!("invalid request type {} for broadcast", kind.as_i32()));
        }

        let mut report = BroadcastReport::default();
        for node in self.topology.unique_nodes() {
            if node.kind == NodeKind::Master || node.is_local(self.topology.host(), self.topology.port()) {
                continue;
            }
            let url = node.url(node.user.as_deref().unwrap_or(&self.user));
            let (sid, int2) = match kind {
                AdminType::CleanupSessions => {
                    let srvtype = if node.kind == NodeKind::Worker {
                        ServerType::Worker
                    } else {
                        ServerType::Master
                    };
                    (-1, srvtype.as_i32())
                }
                _ => (0, 0),
            };

            match self.admin(&url, kind, sid, int2, msg.as_bytes().to_vec()).await {
                Ok(_) => report.sent += 1,
                Err(reason) => {
                    let line = format!("{}: {}", url, reason);
                    warn!("broadcast: {}", line);
                    if let Some(r) = notify {
                        r.send_msg(ActionCode::SrvMsg, line.as_bytes()).await;
                    }
                    report.failures.push(line);
                }
            }
        }
        info!("broadcast sent to {} nodes, {} failures", report.sent, report.failures.len());
        Ok(report)
    }

    /// Admin request on the pooled connection to `url`
    async fn admin(&self, url: &str, kind: AdminType, sid: i32, int2: i32, payload: Vec<u8>) -> Result<Bytes, String> {
        let conn = self
            .pool
            .get(url)
            .await
            .map_err(|e| connection_failure(url, &e))?;
        let result = conn.lock().await.admin(kind, sid, int2, payload).await;
        match result {
            Ok(resp) => Ok(resp.body),
            Err(XpdError::Remote { message, .. }) => Err(message),
            Err(e) => Err(self.drop_broken(url, e).await),
        }
    }

    /// Forget the pooled connection after a transport failure
    async fn drop_broken(&self, url: &str, err: XpdError) -> String {
        if err.is_retryable() {
            debug!("dropping connection to {}: {}", url, err);
            self.pool.evict(url).await;
        }
        err.to_string()
    }

    /// Read a piece of `file` on the daemon at `url`
    pub async fn read_remote(&self, url: &str, file: &str, body: ReadBufBody) -> Result<Bytes, String> {
        debug!("reading {} bytes of {} from {}", body.len, file, url);
        let conn = self
            .pool
            .get(url)
            .await
            .map_err(|e| connection_failure(url, &e))?;
        let result = conn.lock().await.read_buffer(body, file.as_bytes().to_vec()).await;
        let resp = match result {
            Ok(resp) => resp,
            Err(e) => return Err(self.drop_broken(url, e).await),
        };
        match resp.error_info() {
            Some((_, message)) => Err(message),
            None => Ok(resp.body),
        }
    }
}

fn connection_failure(url: &str, err: &XpdError) -> String {
    debug!("connection to {} failed: {}", url, err);
    format!("failure attempting connection to {}", url)
}
