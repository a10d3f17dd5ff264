//! Configuration management for the daemon
//!
//! The directive file is parsed into an immutable [`XpdConfig`] held in an
//! `ArcSwap`, so request handlers read a consistent snapshot without
//! locking while the maintenance task swaps in reloaded versions.

mod groups;
mod loader;
mod schema;
mod versions;

pub use groups::{Group, GroupRegistry, DEFAULT_GROUP};
pub use loader::{parse_duration, ConfigLoader, ConfigReloader};
pub use schema::*;
pub use versions::{RuntimeVersion, VersionRegistry};

use arc_swap::ArcSwap;
use std::sync::Arc;

/// Global configuration handle
pub type ConfigHandle = Arc<ArcSwap<XpdConfig>>;

/// Create a config handle holding `config`
pub fn new_config_handle(config: XpdConfig) -> ConfigHandle {
    Arc::new(ArcSwap::from_pointee(config))
}
