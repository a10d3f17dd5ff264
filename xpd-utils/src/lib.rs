//! xpd-utils: Common utilities shared across xpd crates
//!
//! This crate provides:
//! - Unified error types ([`XpdError`], [`Result`])
//! - Logging infrastructure ([`init_logging`], [`LogConfig`])
//! - Path utilities ([`paths`] module)
//! - Wildcard host/user pattern matching ([`pattern`] module)

pub mod error;
pub mod logging;
pub mod paths;
pub mod pattern;

pub use error::{Result, XpdError};
pub use logging::{init_logging, init_logging_with_config, LogConfig, LogOutput};

pub use paths::{
    admin_dir, config_dir, config_file, default_sandbox_root, ensure_dir, log_dir, runtime_dir,
    state_dir,
};
pub use pattern::{is_local_alias, local_hostname, match_score, matches, matches_any, same_host};
