//! Session process launcher
//!
//! Stages the environment description for a session server and starts it
//! under the client's identity. Starting is synchronous (the supervisor
//! runs it on the blocking pool): `Command::spawn` only returns once the
//! child has exec'd or reported why it could not, which is our setup ack.

pub mod env;
pub mod process;

use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};

use tracing::{debug, info};

use xpd_protocol::Role;
use xpd_utils::{Result, XpdError};

use crate::client::Sandbox;
use crate::config::RuntimeVersion;
use crate::identity::UserIdentity;

pub use env::{resolve_keywords, strategy_for, EnvStrategy, FlatEnv, PreparedEnv, StructuredEnv};

/// Everything needed to start one session process
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub user: UserIdentity,
    pub group: String,
    pub role: Role,
    pub psid: i32,
    /// Client id of the creating connection
    pub cid: i32,
    pub ordinal: String,
    /// Tag received with the request (directory of the master session on
    /// workers and sub-masters)
    pub tag: String,
    pub log_level: i32,
    pub cfg_file: Option<String>,
    /// `A=1,B=2` variables requested by the client
    pub user_envs: String,
    pub runtime: RuntimeVersion,
    pub client_version: i16,
    pub sandbox: Sandbox,
    pub sock_path: PathBuf,
    /// `user[:group]@host` of the requesting peer
    pub entity: String,
    pub host: String,
    pub daemon_pid: u32,
    pub daemon_port: u16,
    pub tmp_dir: PathBuf,
    pub dataset_dir: Option<String>,
    pub config_file: Option<PathBuf>,
    pub use_user_cfg: bool,
    /// `NAME=value` pass-through, keywords already resolved
    pub putenv: Vec<String>,
    pub putrc: Vec<String>,
    /// Switch to the client's uid/gid before exec
    pub change_owner: bool,
    pub credentials: Option<Vec<u8>>,
}

impl LaunchPlan {
    /// `proofserv` for masters, `proofslave` for workers
    pub fn server_kind(&self) -> &'static str {
        if self.role.is_worker() {
            "proofslave"
        } else {
            "proofserv"
        }
    }

    pub fn args(&self) -> Vec<String> {
        vec![
            self.server_kind().to_string(),
            "xpd".to_string(),
            self.daemon_pid.to_string(),
            self.log_level.to_string(),
        ]
    }
}

/// Successful start of a session process
#[derive(Debug)]
pub struct SpawnAck {
    pub pid: i32,
    pub tag: String,
    pub log_file: PathBuf,
    pub child: Option<Child>,
}

/// Starts session processes
pub trait SessionSpawner: Send + Sync {
    /// Stage the environment and start the process. Blocking.
    fn spawn(&self, plan: &LaunchPlan) -> Result<SpawnAck>;
}

/// Spawner running the configured session server binary
#[derive(Debug, Default)]
pub struct ProcessLauncher;

impl ProcessLauncher {
    pub fn new() -> Self {
        Self
    }

    fn command(plan: &LaunchPlan, prepared: &PreparedEnv) -> Command {
        let mut cmd = Command::new(&plan.runtime.prgmsrv);
        cmd.args(plan.args())
            .current_dir(&prepared.session_dir)
            .env("HOME", &plan.user.home)
            .envs(prepared.vars.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        if plan.change_owner {
            let uid = plan.user.uid;
            let gid = plan.user.gid;
            let groups: Vec<libc::gid_t> = plan.user.groups.clone();
            // SAFETY: only async-signal-safe calls between fork and exec
            unsafe {
                cmd.pre_exec(move || {
                    if libc::setgroups(groups.len() as _, groups.as_ptr()) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    if libc::setgid(gid) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    if libc::setuid(uid) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }
        cmd
    }
}

impl SessionSpawner for ProcessLauncher {
    fn spawn(&self, plan: &LaunchPlan) -> Result<SpawnAck> {
        let strategy = strategy_for(plan.runtime.srv_proto);
        debug!(
            "Preparing {} environment for {} session {} of {}",
            strategy.name(),
            plan.role,
            plan.psid,
            plan.user.user
        );
        let prepared = strategy.prepare(plan)?;

        let child = Self::command(plan, &prepared).spawn().map_err(|e| {
            XpdError::spawn(format!("cannot start {}: {}", plan.runtime.prgmsrv.display(), e))
        })?;
        let pid = child.id() as i32;
        info!(
            "Started {} (pid {}) for {} session {}",
            plan.server_kind(),
            pid,
            plan.user.user,
            prepared.tag
        );
        Ok(SpawnAck {
            pid,
            tag: prepared.tag,
            log_file: prepared.log_file,
            child: Some(child),
        })
    }
}
