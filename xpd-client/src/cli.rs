//! Command-line argument parsing for xpdadm
//!
//! Uses clap for argument parsing with derive macros.

use std::time::Duration;

use clap::{Parser, Subcommand};
use xpd_protocol::{AdminType, ReadBufBody, ServerType};

use crate::connection::DEFAULT_PORT;

/// xpdadm - administer an xproofd daemon
#[derive(Parser, Debug)]
#[command(name = "xpdadm", author, version, about, long_about = None)]
pub struct Args {
    /// Daemon address (`[user@]host[:port]`, `tcp://...` or a socket path)
    #[arg(long, short = 'a', env = "XPD_ADDR", default_value_t = format!("localhost:{}", DEFAULT_PORT))]
    pub addr: String,

    /// Account to log in as (defaults to $USER)
    #[arg(long, short = 'u')]
    pub user: Option<String>,

    /// Request timeout in seconds
    #[arg(long, default_value_t = 30)]
    pub timeout: u64,

    /// Log filter, e.g. `xpd_client=debug`
    #[arg(long)]
    pub log: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Check the daemon, or one of the caller's sessions
    Ping {
        /// Session to ping
        sid: Option<i32>,
    },
    /// List the caller's top-master sessions
    Sessions,
    /// Show the worker nodes known to the daemon
    Workers,
    /// List the runtime versions available
    Versions,
    /// Change the default runtime version
    SetVersion {
        /// Version tag
        tag: String,
        /// Apply to another account (`user[:group]`, superusers only)
        #[arg(long)]
        target: Option<String>,
    },
    /// Show the log files of a session
    Logs {
        /// Session tag; the most recent one when omitted
        tag: Option<String>,
        /// Pick the n-th most recent session when no tag is given
        #[arg(long, default_value_t = 0)]
        index: i32,
    },
    /// Terminate sessions
    Cleanup {
        /// Every client of the daemon (superusers only)
        #[arg(long, conflicts_with = "target")]
        all: bool,
        /// Another account (`user[:group]`, superusers only)
        #[arg(long)]
        target: Option<String>,
        /// Only sessions of this kind: worker, master or topmaster
        #[arg(long, value_parser = parse_server_type)]
        kind: Option<ServerType>,
    },
    /// Set the tag of a session
    Tag { sid: i32, tag: String },
    /// Set the alias of a session
    Alias { sid: i32, alias: String },
    /// Set the priority of the caller's group
    Priority {
        /// Session carrying the group
        sid: i32,
        group: String,
        priority: i32,
    },
    /// Read part of a file known to the daemon
    Read {
        /// Path or `proof://host:port/path` URL
        file: String,
        /// Offset; negative values count from the end
        #[arg(long, allow_hyphen_values = true, default_value_t = -4096)]
        offset: i64,
        /// Bytes to read
        #[arg(long, default_value_t = 4096)]
        len: i32,
        /// Keep only lines containing this text
        #[arg(long, conflicts_with = "exclude")]
        grep: Option<String>,
        /// Drop lines containing this text
        #[arg(long)]
        exclude: Option<String>,
    },
}

fn parse_server_type(s: &str) -> Result<ServerType, String> {
    match s {
        "worker" => Ok(ServerType::Worker),
        "master" => Ok(ServerType::Master),
        "topmaster" => Ok(ServerType::TopMaster),
        "all" => Ok(ServerType::All),
        _ => Err(format!("unknown session kind '{}'", s)),
    }
}

/// An admin request as sent on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminCall {
    pub kind: AdminType,
    pub sid: i32,
    pub int2: i32,
    pub payload: Vec<u8>,
}

impl AdminCall {
    fn new(kind: AdminType) -> Self {
        Self {
            kind,
            sid: 0,
            int2: 0,
            payload: Vec::new(),
        }
    }

    fn payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }
}

impl Args {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout.max(1))
    }

    pub fn login_user(&self) -> String {
        self.user
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "nobody".to_string())
    }
}

impl Command {
    /// The admin request this command maps to, if any
    pub fn admin_call(&self) -> Option<AdminCall> {
        let call = match self {
            Command::Ping { .. } | Command::Read { .. } => return None,
            Command::Sessions => AdminCall::new(AdminType::QuerySessions),
            Command::Workers => AdminCall::new(AdminType::QueryWorkers),
            Command::Versions => AdminCall::new(AdminType::QueryVersions),
            Command::SetVersion { tag, target } => {
                let msg = match target {
                    Some(target) => format!("u:{} {}", target, tag),
                    None => tag.clone(),
                };
                AdminCall::new(AdminType::ChangeDefaultVersion).payload(msg)
            }
            Command::Logs { tag, index } => AdminCall {
                int2: *index,
                ..AdminCall::new(AdminType::QueryLogPaths).payload(tag.clone().unwrap_or_default())
            },
            Command::Cleanup { all, target, kind } => {
                let srvtype = if *all {
                    ServerType::All
                } else {
                    kind.unwrap_or(ServerType::TopMaster)
                };
                AdminCall {
                    int2: srvtype.as_i32(),
                    ..AdminCall::new(AdminType::CleanupSessions).payload(target.clone().unwrap_or_default())
                }
            }
            Command::Tag { sid, tag } => AdminCall {
                sid: *sid,
                ..AdminCall::new(AdminType::SessionTag).payload(tag.clone())
            },
            Command::Alias { sid, alias } => AdminCall {
                sid: *sid,
                ..AdminCall::new(AdminType::SessionAlias).payload(alias.clone())
            },
            Command::Priority { sid, group, priority } => AdminCall {
                sid: *sid,
                int2: *priority,
                ..AdminCall::new(AdminType::GroupProperties).payload(group.clone())
            },
        };
        Some(call)
    }

    /// Body and payload of a `Read` command
    pub fn read_call(&self) -> Option<(ReadBufBody, Vec<u8>)> {
        let Command::Read { file, offset, len, grep, exclude } = self else {
            return None;
        };
        let (int1, pattern) = match (grep, exclude) {
            (Some(p), _) => (1, p.as_str()),
            (None, Some(p)) => (2, p.as_str()),
            (None, None) => (0, ""),
        };
        let body = if pattern.is_empty() {
            ReadBufBody { ofs: *offset, len: *len, int1 }
        } else {
            ReadBufBody { ofs: 0, len: pattern.len() as i32, int1 }
        };
        Some((body, format!("{}{}", file, pattern).into_bytes()))
    }
}
