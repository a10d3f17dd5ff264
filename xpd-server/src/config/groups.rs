//! User groups for fair-share scheduling
//!
//! Group file format:
//!
//! ```text
//! group    <name> <user1>,<user2>,...
//! property <name> priority <value>
//! property <name> fraction <percent>
//! ```
//!
//! The `default` group always exists and contains every user not listed
//! elsewhere.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use xpd_utils::{Result, XpdError};

pub const DEFAULT_GROUP: &str = "default";

/// A scheduling group
#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    pub name: String,
    pub members: Vec<String>,
    /// Nominal priority (priority scheduling mode)
    pub priority: f32,
    /// Nominal share in percent, negative when undefined
    pub fraction: f32,
    /// Sessions of this group currently running
    pub active: i32,
}

impl Group {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: Vec::new(),
            priority: 1.0,
            fraction: -1.0,
            active: 0,
        }
    }

    pub fn has_member(&self, user: &str) -> bool {
        self.name == DEFAULT_GROUP || self.members.iter().any(|m| m == user)
    }
}

/// Known groups, reloaded when the group file changes
pub struct GroupRegistry {
    path: Option<PathBuf>,
    mtime: Mutex<Option<SystemTime>>,
    groups: RwLock<Vec<Group>>,
}

impl GroupRegistry {
    /// Registry holding only the default group
    pub fn new() -> Self {
        Self {
            path: None,
            mtime: Mutex::new(None),
            groups: RwLock::new(vec![Group::new(DEFAULT_GROUP)]),
        }
    }

    /// Load from a group file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| XpdError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        let groups = parse_groups(&content, path)?;
        info!("Loaded {} groups from {}", groups.len(), path.display());
        Ok(Self {
            path: Some(path.to_path_buf()),
            mtime: Mutex::new(modified(path)),
            groups: RwLock::new(groups),
        })
    }

    /// Number of defined groups, the default one included
    pub fn len(&self) -> usize {
        self.groups.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.read().is_empty()
    }

    /// Re-read the group file if it changed; active counters survive
    pub fn refresh_if_changed(&self) -> bool {
        let Some(path) = &self.path else {
            return false;
        };
        let current = modified(path);
        {
            let mut last = self.mtime.lock();
            if current.is_none() || current == *last {
                return false;
            }
            *last = current;
        }

        let parsed = std::fs::read_to_string(path)
            .map_err(|e| XpdError::FileRead {
                path: path.clone(),
                source: e,
            })
            .and_then(|content| parse_groups(&content, path));
        match parsed {
            Ok(mut fresh) => {
                let mut groups = self.groups.write();
                for group in fresh.iter_mut() {
                    if let Some(old) = groups.iter().find(|g| g.name == group.name) {
                        group.active = old.active;
                    }
                }
                *groups = fresh;
                info!("Group file {} reloaded", path.display());
                true
            }
            Err(e) => {
                warn!("Group file reload failed (keeping previous): {}", e);
                false
            }
        }
    }

    /// Pick the group of `user`.
    ///
    /// An explicit group must exist and contain the user; otherwise the
    /// first group listing the user is taken, falling back to `default`.
    pub fn resolve(&self, user: &str, requested: Option<&str>) -> std::result::Result<String, String> {
        let groups = self.groups.read();
        if let Some(name) = requested.filter(|g| !g.is_empty()) {
            let group = groups
                .iter()
                .find(|g| g.name == name)
                .ok_or_else(|| format!("group '{}' undefined", name))?;
            if !group.has_member(user) {
                return Err(format!("user '{}' is not a member of group '{}'", user, name));
            }
            return Ok(group.name.clone());
        }
        Ok(groups
            .iter()
            .find(|g| g.name != DEFAULT_GROUP && g.has_member(user))
            .map(|g| g.name.clone())
            .unwrap_or_else(|| DEFAULT_GROUP.to_string()))
    }

    pub fn get(&self, name: &str) -> Option<Group> {
        self.groups.read().iter().find(|g| g.name == name).cloned()
    }

    pub fn snapshot(&self) -> Vec<Group> {
        self.groups.read().clone()
    }

    /// Set the nominal priority; false if the group is unknown
    pub fn set_priority(&self, name: &str, priority: f32) -> bool {
        let mut groups = self.groups.write();
        match groups.iter_mut().find(|g| g.name == name) {
            Some(group) => {
                group.priority = priority;
                true
            }
            None => false,
        }
    }

    /// Adjust the running-session counter of a group.
    ///
    /// A group that vanished with a reload is skipped with a warning.
    pub fn adjust_active(&self, name: &str, delta: i32) {
        let mut groups = self.groups.write();
        match groups.iter_mut().find(|g| g.name == name) {
            Some(group) => {
                group.active = (group.active + delta).max(0);
                debug!("group {}: {} active", name, group.active);
            }
            None => warn!("group {} not defined: active count not updated", name),
        }
    }
}

impl Default for GroupRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_groups(content: &str, path: &Path) -> Result<Vec<Group>> {
    let mut groups = vec![Group::new(DEFAULT_GROUP)];
    let invalid = |line: usize, message: String| XpdError::ConfigInvalid {
        path: path.to_path_buf(),
        line,
        message,
    };

    for (idx, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens.as_slice() {
            ["group", name, rest @ ..] => {
                let pos = match groups.iter().position(|g| g.name == *name) {
                    Some(pos) => pos,
                    None => {
                        groups.push(Group::new(*name));
                        groups.len() - 1
                    }
                };
                for list in rest {
                    groups[pos].members.extend(
                        list.split(',')
                            .filter(|m| !m.is_empty())
                            .map(String::from),
                    );
                }
            }
            ["property", name, key, value] => {
                let value: f32 = value
                    .parse()
                    .map_err(|_| invalid(idx + 1, format!("bad value '{}'", value)))?;
                let group = groups
                    .iter_mut()
                    .find(|g| g.name == *name)
                    .ok_or_else(|| invalid(idx + 1, format!("property for unknown group '{}'", name)))?;
                match *key {
                    "priority" | "nice" => group.priority = value,
                    "fraction" => group.fraction = value,
                    other => return Err(invalid(idx + 1, format!("unknown property '{}'", other))),
                }
            }
            _ => return Err(invalid(idx + 1, format!("unrecognized line '{}'", line))),
        }
    }
    Ok(groups)
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
