//! Registry of known clients
//!
//! Clients are never removed: a user logging in again finds its previous
//! record, sessions included.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use xpd_utils::Result;

use super::ClientSession;

/// All clients known to the daemon
#[derive(Default)]
pub struct ClientRegistry {
    clients: RwLock<Vec<Arc<ClientSession>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Client record of `user` (restricted to `group` when given)
    pub fn find(&self, user: &str, group: Option<&str>) -> Option<Arc<ClientSession>> {
        self.clients
            .read()
            .iter()
            .find(|c| c.matches(user, group))
            .cloned()
    }

    /// Existing record of `user`, or a new one built by `make`
    pub fn get_or_create(
        &self,
        user: &str,
        make: impl FnOnce() -> Result<ClientSession>,
    ) -> Result<Arc<ClientSession>> {
        if let Some(client) = self.find(user, None) {
            return Ok(client);
        }
        let mut clients = self.clients.write();
        // Another login may have raced us between the read and the write
        if let Some(client) = clients.iter().find(|c| c.matches(user, None)) {
            return Ok(Arc::clone(client));
        }
        let client = Arc::new(make()?);
        info!("New client record for user {}", user);
        clients.push(Arc::clone(&client));
        Ok(client)
    }

    pub fn all(&self) -> Vec<Arc<ClientSession>> {
        self.clients.read().clone()
    }

    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }
}
