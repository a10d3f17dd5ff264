//! Pool of administrative connections to peer daemons

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

use xpd_client::{Connection, LoginParams};
use xpd_protocol::Role;
use xpd_utils::Result;

/// Connections to peer daemons, keyed by `user@host[:port]`
pub struct ConnectionPool {
    origin: String,
    timeout: Duration,
    conns: DashMap<String, Arc<Mutex<Connection>>>,
}

impl ConnectionPool {
    /// `origin` is this daemon's host, announced at login
    pub fn new(origin: impl Into<String>, timeout: Duration) -> Self {
        Self {
            origin: origin.into(),
            timeout,
            conns: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Valid connection to `url`, opening and logging in if needed
    pub async fn get(&self, url: &str) -> Result<Arc<Mutex<Connection>>> {
        let cached = self.conns.get(url).map(|c| c.value().clone());
        if let Some(conn) = cached {
            if conn.lock().await.is_valid() {
                return Ok(conn);
            }
            debug!("evicting stale connection to {}", url);
            self.conns.remove(url);
        }

        let conn = self.open(url).await?;
        let conn = Arc::new(Mutex::new(conn));
        self.conns.insert(url.to_string(), conn.clone());
        Ok(conn)
    }

    async fn open(&self, url: &str) -> Result<Connection> {
        let mut conn = Connection::new(url).with_timeout(self.timeout);
        conn.connect().await?;
        let user = url.split_once('@').map_or("", |(u, _)| u);
        let params = LoginParams::new(user, Role::Admin)
            .with_payload(format!(" Manager connection from {}|ord:000", self.origin));
        if let Err(e) = conn.login(&params).await {
            conn.disconnect().await;
            return Err(e);
        }
        info!("connected to peer {}", url);
        Ok(conn)
    }

    /// Drop the connection to `url`
    pub async fn evict(&self, url: &str) {
        if let Some((_, conn)) = self.conns.remove(url) {
            conn.lock().await.disconnect().await;
        }
    }

    /// Drop every connection
    pub async fn clear(&self) {
        let urls: Vec<String> = self.conns.iter().map(|e| e.key().clone()).collect();
        for url in urls {
            self.evict(&url).await;
        }
    }
}
