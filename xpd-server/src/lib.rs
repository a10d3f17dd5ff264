//! xpd-server: the xproofd cluster daemon
//!
//! Accepts clients and peer daemons over TCP, launches one session
//! process per analysis session through a privileged fork and relays
//! messages between the clients, the session processes and the rest of
//! the cluster.

pub mod auth;
pub mod client;
pub mod config;
pub mod connection;
pub mod handlers;
pub mod identity;
pub mod launcher;
pub mod link;
pub mod maintenance;
pub mod scheduler;
pub mod selector;
pub mod session;
pub mod state;
pub mod supervisor;
pub mod tcp;
pub mod topology;

pub use config::XpdConfig;
pub use state::{DaemonState, SharedState};
