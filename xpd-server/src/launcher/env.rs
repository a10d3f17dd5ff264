//! Session environment description
//!
//! Session processes learn about their sandbox, tag and parent daemon
//! either from a resource file (`<prefix>.rootrc`, protocol 14 and later)
//! or from flat environment variables (older servers). Both variants also
//! record what was exported in `<prefix>.env`.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use xpd_protocol::{Role, STRUCTURED_ENV_MIN_VERSION};
use xpd_utils::{Result, XpdError};

use super::LaunchPlan;

/// Files and variables staged for one session process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedEnv {
    /// Unique tag of this process (`host-time-pid`)
    pub tag: String,
    /// `<sandbox>/session-<tag>` (or the master's directory on workers)
    pub session_dir: PathBuf,
    /// `<session_dir>/<kind>-<ordinal>-<tag>`; `.rootrc`, `.env` and
    /// `.log` hang off it
    pub work_prefix: PathBuf,
    pub log_file: PathBuf,
    /// Variables to set on the process
    pub vars: Vec<(String, String)>,
}

/// Protocol-dependent environment preparation
pub trait EnvStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn prepare(&self, plan: &LaunchPlan) -> Result<PreparedEnv>;
}

/// Resource-file description for servers speaking protocol 14+
#[derive(Debug, Default)]
pub struct StructuredEnv;

/// Environment-variable description for older servers
#[derive(Debug, Default)]
pub struct FlatEnv;

/// Pick the strategy matching the session server protocol
pub fn strategy_for(srv_proto: i32) -> Box<dyn EnvStrategy> {
    if srv_proto >= STRUCTURED_ENV_MIN_VERSION {
        Box::new(StructuredEnv)
    } else {
        Box::new(FlatEnv)
    }
}

/// Replace `<workdir>`, `<host>` and `<user>` in a pass-through value
pub fn resolve_keywords(value: &str, workdir: &Path, host: &str, user: &str) -> String {
    value
        .replace("<workdir>", &workdir.display().to_string())
        .replace("<host>", host)
        .replace("<user>", user)
}

/// `shorthost-time-pid`
pub fn generate_tag(host: &str, time: u64, pid: u32) -> String {
    let short = host.split('.').next().unwrap_or(host);
    format!("{}-{}-{}", short, time, pid)
}

struct Layout {
    tag: String,
    kind: &'static str,
    session_dir: PathBuf,
    work_prefix: PathBuf,
}

/// Work out the tag and directories and create the session directory.
///
/// Two sessions started in the same second would share a tag, so the time
/// part is bumped until `session-<tag>` is free.
fn layout(plan: &LaunchPlan) -> Result<Layout> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let mut time = now;
    let mut tag = generate_tag(&plan.host, time, plan.daemon_pid);
    while plan.sandbox.session_dir(&tag).exists() {
        time += 1;
        tag = generate_tag(&plan.host, time, plan.daemon_pid);
    }

    let session_dir = if plan.role == Role::TopMaster || plan.tag.is_empty() {
        plan.sandbox.session_dir(&tag)
    } else {
        plan.sandbox.session_dir(&plan.tag)
    };
    plan.sandbox.assert_dir(&session_dir)?;

    let kind = if plan.role.is_worker() { "worker" } else { "master" };
    let work_prefix = session_dir.join(format!("{}-{}-{}", kind, plan.ordinal, tag));
    debug!("session dir {}, prefix {}", session_dir.display(), work_prefix.display());
    Ok(Layout {
        tag,
        kind,
        session_dir,
        work_prefix,
    })
}

fn with_suffix(prefix: &Path, suffix: &str) -> PathBuf {
    let mut s = prefix.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

fn write_owned(plan: &LaunchPlan, path: &Path, content: &str) -> Result<()> {
    fs::write(path, content).map_err(|e| XpdError::FileWrite {
        path: path.to_path_buf(),
        source: e,
    })?;
    plan.sandbox.chown(path)
}

fn replace_symlink(target: &Path, link: &Path) -> Result<()> {
    if fs::symlink_metadata(link).is_ok() {
        fs::remove_file(link).map_err(|e| XpdError::FileWrite {
            path: link.to_path_buf(),
            source: e,
        })?;
    }
    std::os::unix::fs::symlink(target, link).map_err(|e| XpdError::FileWrite {
        path: link.to_path_buf(),
        source: e,
    })
}

fn split_pair(entry: &str) -> Option<(String, String)> {
    let (k, v) = entry.split_once('=')?;
    let k = k.trim();
    if k.is_empty() {
        return None;
    }
    Some((k.to_string(), v.to_string()))
}

/// Variables common to both strategies
fn base_vars(plan: &LaunchPlan) -> Vec<(String, String)> {
    let dir = plan.runtime.dir.display().to_string();
    let mut vars = vec![
        ("LD_LIBRARY_PATH".to_string(), format!("{}/lib", dir)),
        ("ROOTSYS".to_string(), dir.clone()),
        ("ROOTCONFDIR".to_string(), dir),
        ("TMPDIR".to_string(), plan.tmp_dir.display().to_string()),
    ];
    if let Some(creds) = &plan.credentials {
        vars.push(("XrdSecCREDS".to_string(), String::from_utf8_lossy(creds).into_owned()));
    }
    vars
}

/// Pass-through (`putenv`) plus per-session user variables.
///
/// User variables also produce `PROOF_ALLVARS`, the comma separated list
/// of their names.
fn extra_vars(plan: &LaunchPlan) -> Vec<(String, String)> {
    let mut vars: Vec<(String, String)> = plan.putenv.iter().filter_map(|e| split_pair(e)).collect();

    if plan.user_envs.contains('=') {
        let mut names = Vec::new();
        for entry in plan.user_envs.split(',') {
            if let Some((k, v)) = split_pair(entry) {
                names.push(k.clone());
                vars.push((k, v));
            }
        }
        vars.push(("PROOF_ALLVARS".to_string(), names.join(",")));
    }
    vars
}

fn env_lines(vars: &[(String, String)]) -> String {
    let mut out = String::new();
    for (k, v) in vars {
        let _ = writeln!(out, "{}={}", k, v);
    }
    out
}

impl EnvStrategy for StructuredEnv {
    fn name(&self) -> &'static str {
        "structured"
    }

    fn prepare(&self, plan: &LaunchPlan) -> Result<PreparedEnv> {
        let layout = layout(plan)?;
        let log_file = with_suffix(&layout.work_prefix, ".log");

        let mut rc = String::new();
        let mut put = |comment: &str, key: &str, value: &dyn std::fmt::Display| {
            let _ = writeln!(rc, "# {}", comment);
            let _ = writeln!(rc, "{}: {}", key, value);
        };
        put("Daemon listening port", "ProofServ.XpdPort", &plan.daemon_port);
        put("The session working dir", "ProofServ.SessionDir", &layout.work_prefix.display());
        put("Log/Debug level", "Proof.DebugLevel", &plan.log_level);
        put("Ordinal number", "ProofServ.Ordinal", &plan.ordinal);
        put("Runtime version tag", "ProofServ.RootVersionTag", &plan.runtime.tag);
        if !plan.group.is_empty() {
            put("Group", "ProofServ.ProofGroup", &plan.group);
            if plan.role == Role::TopMaster {
                if let Some(root) = &plan.dataset_dir {
                    let dsdir = if root.is_empty() {
                        plan.user.home.join("datasets")
                    } else {
                        Path::new(root).join(&plan.group).join(&plan.user.user)
                    };
                    plan.sandbox.assert_dir(&dsdir)?;
                    put("User's dataset dir", "ProofServ.DataSetDir", &dsdir.display());
                    put("Global root for datasets", "ProofServ.DataSetRoot", root);
                }
            }
        }
        put("User sandbox", "ProofServ.Sandbox", &plan.sandbox.dir().display());
        put("Session tag", "ProofServ.SessionTag", &layout.tag);
        if plan.use_user_cfg {
            put("Whether user specific config files are enabled", "ProofServ.UseUserCfg", &1);
        }
        put("Open socket", "ProofServ.OpenSock", &plan.sock_path.display());
        put("Entity", "ProofServ.Entity", &plan.entity);
        put("Session ID", "ProofServ.SessionID", &plan.psid);
        put("Client ID", "ProofServ.ClientID", &plan.cid);
        put("Client Protocol", "ProofServ.ClientVersion", &plan.client_version);
        if let Some(cfg) = plan.cfg_file.as_deref().filter(|c| !c.is_empty()) {
            put("Config file", "ProofServ.ProofConfFile", &cfg);
        }
        if !plan.putrc.is_empty() {
            let _ = writeln!(rc, "# Additional resources");
            for line in &plan.putrc {
                let _ = writeln!(rc, "{}", line);
            }
        }

        let rcfile = with_suffix(&layout.work_prefix, ".rootrc");
        write_owned(plan, &rcfile, &rc)?;
        if let Err(e) = replace_symlink(&rcfile, &layout.session_dir.join("session.rootrc")) {
            warn!("could not link session.rootrc: {}", e);
        }

        let mut vars = base_vars(plan);
        vars.push(("ROOTVERSIONTAG".to_string(), plan.runtime.tag.clone()));
        vars.push(("ROOTPROOFLOGFILE".to_string(), log_file.display().to_string()));
        if let Some(cf) = &plan.config_file {
            vars.push(("XRDCF".to_string(), cf.display().to_string()));
        }
        vars.extend(extra_vars(plan));
        write_owned(plan, &with_suffix(&layout.work_prefix, ".env"), &env_lines(&vars))?;

        if let Err(e) = plan.sandbox.link_last_session(layout.kind, &layout.session_dir) {
            warn!("could not update last-{}-session: {}", layout.kind, e);
        }

        Ok(PreparedEnv {
            tag: layout.tag,
            session_dir: layout.session_dir,
            work_prefix: layout.work_prefix,
            log_file,
            vars,
        })
    }
}

impl EnvStrategy for FlatEnv {
    fn name(&self) -> &'static str {
        "flat"
    }

    fn prepare(&self, plan: &LaunchPlan) -> Result<PreparedEnv> {
        let layout = layout(plan)?;
        let log_file = with_suffix(&layout.work_prefix, ".log");

        let mut vars = base_vars(plan);
        vars.push(("ROOTPROOFSESSDIR".to_string(), layout.work_prefix.display().to_string()));
        vars.push(("ROOTPROOFLOGLEVEL".to_string(), plan.log_level.to_string()));
        vars.push(("ROOTPROOFORDINAL".to_string(), plan.ordinal.clone()));
        vars.push(("ROOTVERSIONTAG".to_string(), plan.runtime.tag.clone()));

        // Everything else travels through the env file only
        let mut recorded = vec![
            ("ROOTSYS".to_string(), plan.runtime.dir.display().to_string()),
            ("ROOTCONFDIR".to_string(), plan.runtime.dir.display().to_string()),
            ("ROOTTMPDIR".to_string(), plan.tmp_dir.display().to_string()),
            ("ROOTXPDPORT".to_string(), plan.daemon_port.to_string()),
            ("ROOTPROOFWORKDIR".to_string(), plan.sandbox.dir().display().to_string()),
            ("ROOTPROOFSESSIONTAG".to_string(), layout.tag.clone()),
        ];
        if plan.use_user_cfg {
            recorded.push(("ROOTUSEUSERCFG".to_string(), "1".to_string()));
        }
        recorded.extend([
            ("ROOTOPENSOCK".to_string(), plan.sock_path.display().to_string()),
            ("ROOTENTITY".to_string(), plan.entity.clone()),
            ("ROOTSESSIONID".to_string(), plan.psid.to_string()),
            ("ROOTCLIENTID".to_string(), plan.cid.to_string()),
            ("ROOTPROOFCLNTVERS".to_string(), plan.client_version.to_string()),
            ("ROOTPROOFORDINAL".to_string(), plan.ordinal.clone()),
            ("ROOTVERSIONTAG".to_string(), plan.runtime.tag.clone()),
        ]);
        if let Some(cfg) = plan.cfg_file.as_deref().filter(|c| !c.is_empty()) {
            recorded.push(("ROOTPROOFCFGFILE".to_string(), cfg.to_string()));
        }
        recorded.push(("ROOTPROOFLOGFILE".to_string(), log_file.display().to_string()));

        let extra = extra_vars(plan);
        recorded.extend(extra.iter().cloned());
        vars.extend(extra);
        write_owned(plan, &with_suffix(&layout.work_prefix, ".env"), &env_lines(&recorded))?;

        if let Err(e) = plan.sandbox.link_last_session(layout.kind, &layout.session_dir) {
            warn!("could not update last-{}-session: {}", layout.kind, e);
        }

        Ok(PreparedEnv {
            tag: layout.tag,
            session_dir: layout.session_dir,
            work_prefix: layout.work_prefix,
            log_file,
            vars,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tag_from_log_path;
    use crate::launcher::tests::test_plan;

    // ==================== Helper Tests ====================

    #[test]
    fn test_strategy_selection() {
        assert_eq!(strategy_for(14).name(), "structured");
        assert_eq!(strategy_for(16).name(), "structured");
        assert_eq!(strategy_for(13).name(), "flat");
    }

    #[test]
    fn test_resolve_keywords() {
        let v = resolve_keywords("DIR=<workdir>/<user>@<host>", Path::new("/pool"), "lxb01", "alice");
        assert_eq!(v, "DIR=/pool/alice@lxb01");
    }

    #[test]
    fn test_generate_tag_uses_short_host() {
        assert_eq!(generate_tag("lxb01.cern.ch", 1700000000, 42), "lxb01-1700000000-42");
    }

    // ==================== Structured Tests ====================

    #[test]
    fn test_structured_writes_files_and_symlink() {
        let root = tempfile::tempdir().unwrap();
        let mut plan = test_plan(&root, Role::TopMaster);
        plan.user_envs = "A=1,B=2".into();
        plan.putenv = vec!["XPD_EXTRA=yes".into()];
        plan.putrc = vec!["Proof.StatsHist: 1".into()];

        let env = StructuredEnv.prepare(&plan).unwrap();
        assert!(env.session_dir.ends_with(format!("session-{}", env.tag)));

        let rc = fs::read_to_string(with_suffix(&env.work_prefix, ".rootrc")).unwrap();
        assert!(rc.contains(&format!("ProofServ.SessionTag: {}", env.tag)));
        assert!(rc.contains("ProofServ.SessionID: 0"));
        assert!(rc.contains("Proof.StatsHist: 1"));

        let envfile = fs::read_to_string(with_suffix(&env.work_prefix, ".env")).unwrap();
        assert!(envfile.contains("PROOF_ALLVARS=A,B"));
        assert!(envfile.contains("XPD_EXTRA=yes"));
        assert!(env.vars.contains(&("A".to_string(), "1".to_string())));

        let last = fs::read_link(plan.sandbox.dir().join("last-master-session")).unwrap();
        assert_eq!(last, env.session_dir);
        assert_eq!(tag_from_log_path(&env.log_file), Some(env.tag.clone()));
    }

    #[test]
    fn test_consecutive_tags_are_unique() {
        let root = tempfile::tempdir().unwrap();
        let plan = test_plan(&root, Role::TopMaster);
        let a = StructuredEnv.prepare(&plan).unwrap();
        let b = StructuredEnv.prepare(&plan).unwrap();
        assert_ne!(a.tag, b.tag);
    }

    #[test]
    fn test_worker_uses_master_directory() {
        let root = tempfile::tempdir().unwrap();
        let mut plan = test_plan(&root, Role::Worker);
        plan.tag = "session-lxb00-1-1".into();
        plan.ordinal = "0.3".into();

        let env = StructuredEnv.prepare(&plan).unwrap();
        assert_eq!(env.session_dir, plan.sandbox.dir().join("session-lxb00-1-1"));
        let name = env.work_prefix.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("worker-0.3-"));
        assert!(plan.sandbox.dir().join("last-worker-session").exists());
    }

    // ==================== Flat Tests ====================

    #[test]
    fn test_flat_exports_variables() {
        let root = tempfile::tempdir().unwrap();
        let mut plan = test_plan(&root, Role::TopMaster);
        plan.log_level = 3;
        let env = FlatEnv.prepare(&plan).unwrap();

        let get = |k: &str| env.vars.iter().find(|(n, _)| n == k).map(|(_, v)| v.clone());
        assert_eq!(get("ROOTPROOFLOGLEVEL").as_deref(), Some("3"));
        assert_eq!(get("ROOTPROOFSESSDIR"), Some(env.work_prefix.display().to_string()));

        let envfile = fs::read_to_string(with_suffix(&env.work_prefix, ".env")).unwrap();
        assert!(envfile.contains(&format!("ROOTPROOFSESSIONTAG={}", env.tag)));
        assert!(envfile.contains("ROOTSESSIONID=0"));
        assert!(!with_suffix(&env.work_prefix, ".rootrc").exists());
    }
}
