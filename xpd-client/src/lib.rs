//! xpd-client: async access to xproofd daemons
//!
//! Provides the [`Connection`] type used by the `xpdadm` tool, by daemons
//! forwarding administrative requests to their peers and by session
//! processes calling back into their parent daemon.

pub mod cli;
pub mod connection;

pub use connection::{Connection, ConnectionState, DaemonAddr, LoginParams, DEFAULT_PORT};
