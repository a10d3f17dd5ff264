//! Directive file loader
//!
//! The configuration file is a list of `xpd.<name> <args...> [if <host>]`
//! lines. Lines of other subsystems and comments are skipped. When the
//! same single-valued directive appears several times with `if`
//! qualifiers, the most specific matching host pattern wins.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use xpd_utils::{Result, XpdError};

use super::schema::{
    NodeRole, PriorityRule, SchedMode, SelectionMode, VersionDirective, XpdConfig,
};
use super::ConfigHandle;

const PREFIX: &str = "xpd.";

/// Directives that accumulate instead of overriding
const LIST_DIRECTIVES: &[&str] = &["allow", "superusers", "allowedusers", "putenv", "putrc", "rootsys"];

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path, host: &str) -> Result<XpdConfig> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                XpdError::ConfigNotFound(path.to_path_buf())
            } else {
                XpdError::FileRead {
                    path: path.to_path_buf(),
                    source: e,
                }
            }
        })?;

        let mut config = Self::parse(&content, path, host)?;
        config.source = Some(path.to_path_buf());
        Ok(config)
    }

    /// Parse configuration text; `host` resolves `if` qualifiers
    pub fn parse(content: &str, path: &Path, host: &str) -> Result<XpdConfig> {
        let mut config = XpdConfig {
            host: host.to_string(),
            ..Default::default()
        };
        let mut scores: HashMap<String, usize> = HashMap::new();

        for (idx, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some(rest) = line.strip_prefix(PREFIX) else {
                continue;
            };

            let mut tokens: Vec<&str> = rest.split_whitespace().collect();
            if tokens.is_empty() {
                continue;
            }
            let name = tokens.remove(0);

            let condition = match tokens.iter().position(|t| *t == "if") {
                Some(at) => {
                    let pattern = tokens.get(at + 1).copied().ok_or_else(|| {
                        invalid(path, idx, format!("'{}': 'if' without a pattern", name))
                    })?;
                    tokens.truncate(at);
                    Some(pattern)
                }
                None => None,
            };

            // Priority rules qualify on the user, everything else on the host
            if name == "priority" {
                let delta = tokens
                    .first()
                    .ok_or_else(|| invalid(path, idx, "priority: missing delta".into()))?;
                let delta = delta
                    .parse::<i32>()
                    .map_err(|_| invalid(path, idx, format!("priority: bad delta '{}'", delta)))?;
                config.priorities.push(PriorityRule {
                    delta,
                    pattern: condition.unwrap_or("*").to_string(),
                });
                continue;
            }

            let score = match condition {
                Some(pattern) => match xpd_utils::match_score(host, pattern) {
                    Some(score) => score,
                    None => {
                        debug!("Skipping '{}' for host {}: no match with {}", name, host, pattern);
                        continue;
                    }
                },
                None => 0,
            };
            if !LIST_DIRECTIVES.contains(&name) {
                if let Some(prev) = scores.get(name) {
                    if score < *prev {
                        continue;
                    }
                }
                scores.insert(name.to_string(), score);
            }

            Self::apply(&mut config, name, &tokens)
                .map_err(|message| invalid(path, idx, message))?;
        }

        // A group file turns scheduling on unless schedopt said otherwise
        if config.group_file.is_some() && !scores.contains_key("schedopt") {
            config.sched.enabled = true;
        }
        Ok(config)
    }

    fn apply(
        config: &mut XpdConfig,
        name: &str,
        args: &[&str],
    ) -> std::result::Result<(), String> {
        let first = || {
            args.first()
                .copied()
                .ok_or_else(|| format!("{}: missing value", name))
        };

        match name {
            "port" => config.port = parse_num(name, first()?)?,
            "role" => {
                config.role = NodeRole::parse(first()?)
                    .ok_or_else(|| format!("role: unknown value '{}'", args[0]))?
            }
            "workdir" => config.workdir = Some(PathBuf::from(first()?)),
            "datasetdir" | "datasetsrc" => config.dataset_dir = Some(first()?.to_string()),
            "image" => config.image = Some(first()?.to_string()),
            "poolurl" => config.pool_url = Some(first()?.to_string()),
            "namespace" => config.namespace = first()?.to_string(),
            "tmp" => config.tmp_dir = PathBuf::from(first()?),
            "allow" => config.allow.push(first()?.to_string()),
            "superusers" => config.superusers.extend(split_list(first()?)),
            "allowedusers" => config.allowed_users.extend(split_list(first()?)),
            "multiuser" => config.multiuser = parse_flag(first()?),
            "putenv" => config.putenv.push(args.join(" ")),
            "putrc" => config.putrc.push(args.join(" ")),
            "groupfile" => config.group_file = Some(PathBuf::from(first()?)),
            "debuglevel" => config.debug_level = parse_num(name, first()?)?,
            "intwait" => config.intwait = parse_duration(name, first()?)?,
            "readwait" => config.readwait = parse_duration(name, first()?)?,
            "adminreqto" => config.admin_req_timeout = parse_duration(name, first()?)?,
            "maxoldlogs" => config.max_old_logs = parse_num(name, first()?)?,
            "reloadinterval" => config.reload_interval = parse_duration(name, first()?)?,
            "shutdown" => {
                config.shutdown.opt = parse_num(name, first()?)?;
                if let Some(delay) = args.get(1) {
                    config.shutdown.delay = parse_duration(name, delay)?;
                }
            }
            "schedopt" => {
                for arg in args {
                    if let Some(v) = arg.strip_prefix("overall:") {
                        let overall: f32 = parse_num(name, v)?;
                        if overall >= 1.0 {
                            config.sched.overall = overall;
                        }
                    } else if *arg == "fraction" {
                        config.sched.mode = SchedMode::Fraction;
                    } else if *arg == "priority" {
                        config.sched.mode = SchedMode::Priority;
                    } else if *arg == "off" {
                        config.sched.enabled = false;
                        continue;
                    }
                    config.sched.enabled = true;
                }
            }
            "resource" => {
                let kind = first()?;
                if kind != "static" && kind != "default" {
                    return Err(format!("resource: unsupported type '{}'", kind));
                }
                for arg in &args[1..] {
                    if let Some(v) = arg.strip_prefix("ucfg:") {
                        config.resource.user_cfg = v == "yes";
                    } else if !Self::apply_sched_param(config, arg)? {
                        let file = arg.strip_prefix("sm:").unwrap_or(arg);
                        config.resource.file = Some(PathBuf::from(file));
                    }
                }
            }
            "schedparam" => {
                for arg in args {
                    if !Self::apply_sched_param(config, arg)? && *arg != "default" {
                        return Err(format!("schedparam: unknown parameter '{}'", arg));
                    }
                }
            }
            "rootsys" => {
                let mut directive = VersionDirective {
                    dir: PathBuf::from(first()?),
                    tag: None,
                    proto: None,
                };
                for arg in &args[1..] {
                    match arg.strip_prefix("proto:") {
                        Some(v) => directive.proto = Some(parse_num(name, v)?),
                        None => directive.tag = Some(arg.to_string()),
                    }
                }
                config.versions.push(directive);
            }
            other => {
                warn!("Ignoring unknown directive xpd.{}", other);
            }
        }
        Ok(())
    }

    /// Shared worker-selection tokens; returns false if `arg` is not one
    fn apply_sched_param(config: &mut XpdConfig, arg: &str) -> std::result::Result<bool, String> {
        let res = &mut config.resource;
        if let Some(v) = arg.strip_prefix("wmx:") {
            res.max_workers = parse_num("wmx", v)?;
        } else if let Some(v) = arg.strip_prefix("mxsess:") {
            res.max_sessions = parse_num("mxsess", v)?;
        } else if let Some(v) = arg.strip_prefix("selopt:") {
            res.selection = match v {
                "random" => SelectionMode::Random,
                "load" => SelectionMode::LoadBased,
                "all" => SelectionMode::All,
                _ => SelectionMode::RoundRobin,
            };
        } else if let Some(v) = arg.strip_prefix("fraction:") {
            res.nodes_fraction = parse_num("fraction", v)?;
        } else if let Some(v) = arg.strip_prefix("optnwrks:") {
            res.opt_workers_per_unit = parse_num("optnwrks", v)?;
        } else if let Some(v) = arg.strip_prefix("minforquery:") {
            res.min_for_query = parse_num("minforquery", v)?;
        } else {
            return Ok(false);
        }
        Ok(true)
    }
}

fn invalid(path: &Path, idx: usize, message: String) -> XpdError {
    XpdError::ConfigInvalid {
        path: path.to_path_buf(),
        line: idx + 1,
        message,
    }
}

fn parse_num<T: std::str::FromStr>(name: &str, v: &str) -> std::result::Result<T, String> {
    v.parse::<T>()
        .map_err(|_| format!("{}: invalid number '{}'", name, v))
}

fn parse_flag(v: &str) -> bool {
    matches!(v, "1" | "yes" | "on" | "true")
}

fn split_list(v: &str) -> impl Iterator<Item = String> + '_ {
    v.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from)
}

/// Parse `N`, `Ns`, `Nm` or `Nh`
pub fn parse_duration(name: &str, v: &str) -> std::result::Result<Duration, String> {
    let (digits, unit) = match v.char_indices().find(|(_, c)| !c.is_ascii_digit()) {
        Some((at, _)) => v.split_at(at),
        None => (v, ""),
    };
    let n: u64 = parse_num(name, digits)?;
    let secs = match unit {
        "" | "s" => n,
        "m" => n * 60,
        "h" => n * 3600,
        other => return Err(format!("{}: unknown time unit '{}'", name, other)),
    };
    Ok(Duration::from_secs(secs))
}

/// Reloads the configuration file when its modification time changes
pub struct ConfigReloader {
    path: PathBuf,
    host: String,
    mtime: Mutex<Option<SystemTime>>,
}

impl ConfigReloader {
    pub fn new(path: impl Into<PathBuf>, host: impl Into<String>) -> Self {
        let path = path.into();
        let mtime = modified(&path);
        Self {
            path,
            host: host.into(),
            mtime: Mutex::new(mtime),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read the file if it changed since the last look.
    ///
    /// Returns true if a new snapshot was stored. A broken file keeps the
    /// previous snapshot in place.
    pub fn reload_if_changed(&self, handle: &ConfigHandle) -> bool {
        let current = modified(&self.path);
        {
            let mut last = self.mtime.lock();
            if current.is_none() || current == *last {
                return false;
            }
            *last = current;
        }

        info!("Config file {} changed, reloading...", self.path.display());
        match ConfigLoader::load_from_path(&self.path, &self.host) {
            Ok(new_config) => {
                let old = handle.load();
                if old.port != new_config.port {
                    warn!("port changed - will apply after restart");
                }
                let mut new_config = new_config;
                new_config.port = old.port;
                handle.store(std::sync::Arc::new(new_config));
                info!("Configuration reloaded successfully");
                true
            }
            Err(e) => {
                warn!("Config reload failed (keeping previous): {}", e);
                false
            }
        }
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
