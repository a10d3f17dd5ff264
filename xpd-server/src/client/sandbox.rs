//! Per-user sandbox directory
//!
//! Layout under `<root>/<user>`:
//!
//! ```text
//! .sessions              tags of sessions started since the client mapped
//! .sessions.old          tags of earlier sessions, oldest first
//! session-<tag>/         one directory per session
//! last-master-session -> session-<tag>
//! last-worker-session -> session-<tag>
//! ```

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use xpd_utils::{Result, XpdError};

use crate::identity::UserIdentity;

const LEDGER: &str = ".sessions";
const OLD_LEDGER: &str = ".sessions.old";

/// A user's sandbox
#[derive(Debug, Clone)]
pub struct Sandbox {
    dir: PathBuf,
    uid: u32,
    gid: u32,
    change_owner: bool,
}

impl Sandbox {
    /// Make sure `<root>/<user>` exists and is owned by the user
    pub fn assert(root: &Path, identity: &UserIdentity, change_owner: bool) -> Result<Self> {
        let sandbox = Self {
            dir: root.join(&identity.user),
            uid: identity.uid,
            gid: identity.gid,
            change_owner,
        };
        sandbox.assert_dir(&sandbox.dir)?;
        Ok(sandbox)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create `path` (and parents) owned by the sandbox user
    pub fn assert_dir(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path).map_err(|e| XpdError::Directory {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        self.chown(path)
    }

    /// Hand `path` over to the sandbox user when running privileged
    pub fn chown(&self, path: &Path) -> Result<()> {
        if !self.change_owner {
            return Ok(());
        }
        std::os::unix::fs::chown(path, Some(self.uid), Some(self.gid)).map_err(|e| {
            XpdError::Directory {
                path: path.to_path_buf(),
                reason: format!("chown failed: {}", e),
            }
        })
    }

    /// Directory of session `tag`
    pub fn session_dir(&self, tag: &str) -> PathBuf {
        if tag.starts_with("session-") {
            self.dir.join(tag)
        } else {
            self.dir.join(format!("session-{}", tag))
        }
    }

    /// Point `last-<kind>-session` at `target`
    pub fn link_last_session(&self, kind: &str, target: &Path) -> Result<()> {
        let link = self.dir.join(format!("last-{}-session", kind));
        if fs::symlink_metadata(&link).is_ok() {
            fs::remove_file(&link).map_err(|e| XpdError::FileWrite {
                path: link.clone(),
                source: e,
            })?;
        }
        std::os::unix::fs::symlink(target, &link).map_err(|e| XpdError::FileWrite {
            path: link,
            source: e,
        })
    }

    // ==================== Ledger ====================

    /// Record a started session
    pub fn add_session(&self, tag: &str) -> Result<()> {
        let path = self.dir.join(LEDGER);
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| XpdError::FileWrite {
                path: path.clone(),
                source: e,
            })?;
        writeln!(file, "{}", tag).map_err(|e| XpdError::FileWrite { path: path.clone(), source: e })?;
        self.chown(&path)
    }

    /// Drop a session from the active ledger and archive it
    pub fn remove_session(&self, tag: &str) -> Result<()> {
        let mut active = self.read_ledger(LEDGER);
        let before = active.len();
        active.retain(|t| t != tag);
        if active.len() == before {
            return Ok(());
        }
        self.write_ledger(LEDGER, &active)?;
        let mut old = self.read_ledger(OLD_LEDGER);
        old.push(tag.to_string());
        self.write_ledger(OLD_LEDGER, &old)
    }

    /// Tags of sessions recorded as active, oldest first
    pub fn sessions(&self) -> Vec<String> {
        self.read_ledger(LEDGER)
    }

    /// Move every active entry to the archive and keep at most `max_old`
    /// archived sessions, deleting the directories of older ones
    pub fn retire_sessions(&self, max_old: usize) -> Result<()> {
        let active = self.read_ledger(LEDGER);
        let mut old = self.read_ledger(OLD_LEDGER);
        old.extend(active);

        if old.len() > max_old {
            let drop = old.len() - max_old;
            for tag in old.drain(..drop) {
                let dir = self.session_dir(&tag);
                if dir.exists() {
                    debug!("Removing old session directory {}", dir.display());
                    if let Err(e) = fs::remove_dir_all(&dir) {
                        warn!("Could not remove {}: {}", dir.display(), e);
                    }
                }
            }
        }

        self.write_ledger(OLD_LEDGER, &old)?;
        self.write_ledger(LEDGER, &[])
    }

    /// Resolve a session tag.
    ///
    /// An empty pattern, `*` or `last` pick by recency (`ridx` 0 is the
    /// newest, 1 the one before...); anything else is matched as a
    /// substring against the newest entries first.
    pub fn guess_tag(&self, pattern: &str, ridx: i32) -> Option<String> {
        let mut all = self.read_ledger(OLD_LEDGER);
        all.extend(self.read_ledger(LEDGER));
        all.reverse();

        if pattern.is_empty() || pattern == "*" || pattern == "last" {
            let idx = usize::try_from(ridx.unsigned_abs()).ok()?;
            return all.get(idx).cloned();
        }
        all.into_iter().find(|t| t.contains(pattern))
    }

    fn read_ledger(&self, name: &str) -> Vec<String> {
        fs::read_to_string(self.dir.join(name))
            .map(|s| {
                s.lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn write_ledger(&self, name: &str, tags: &[String]) -> Result<()> {
        let path = self.dir.join(name);
        let mut content = tags.join("\n");
        if !content.is_empty() {
            content.push('\n');
        }
        fs::write(&path, content).map_err(|e| XpdError::FileWrite {
            path: path.clone(),
            source: e,
        })?;
        self.chown(&path)
    }
}

/// Recover a session tag from its log path
/// (`.../session-<tag>/master-0-<stag>.log`)
pub fn tag_from_log_path(path: &Path) -> Option<String> {
    let dir = path.parent()?.file_name()?.to_str()?;
    dir.strip_prefix("session-").map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn identity() -> UserIdentity {
        UserIdentity {
            user: "alice".into(),
            uid: 0,
            gid: 0,
            home: PathBuf::from("/home/alice"),
            group: "users".into(),
            groups: Vec::new(),
        }
    }

    #[test]
    fn test_assert_creates_user_dir() {
        let root = tempdir().unwrap();
        let sandbox = Sandbox::assert(root.path(), &identity(), false).unwrap();
        assert_eq!(sandbox.dir(), root.path().join("alice"));
        assert!(sandbox.dir().is_dir());
    }

    #[test]
    fn test_ledger_add_remove() {
        let root = tempdir().unwrap();
        let sandbox = Sandbox::assert(root.path(), &identity(), false).unwrap();
        sandbox.add_session("h-1-1").unwrap();
        sandbox.add_session("h-2-1").unwrap();
        assert_eq!(sandbox.sessions(), vec!["h-1-1", "h-2-1"]);

        sandbox.remove_session("h-1-1").unwrap();
        assert_eq!(sandbox.sessions(), vec!["h-2-1"]);
        assert_eq!(sandbox.guess_tag("", 1).as_deref(), Some("h-1-1"));
    }

    #[test]
    fn test_retire_trims_archive() {
        let root = tempdir().unwrap();
        let sandbox = Sandbox::assert(root.path(), &identity(), false).unwrap();
        for i in 0..4 {
            let tag = format!("h-{}-1", i);
            sandbox.assert_dir(&sandbox.session_dir(&tag)).unwrap();
            sandbox.add_session(&tag).unwrap();
        }
        sandbox.retire_sessions(2).unwrap();

        assert!(sandbox.sessions().is_empty());
        assert!(!sandbox.session_dir("h-0-1").exists());
        assert!(!sandbox.session_dir("h-1-1").exists());
        assert!(sandbox.session_dir("h-3-1").exists());
        assert_eq!(sandbox.guess_tag("last", 0).as_deref(), Some("h-3-1"));
    }

    #[test]
    fn test_guess_tag_by_pattern() {
        let root = tempdir().unwrap();
        let sandbox = Sandbox::assert(root.path(), &identity(), false).unwrap();
        sandbox.add_session("lxb-100-7").unwrap();
        sandbox.add_session("pcx-200-8").unwrap();
        assert_eq!(sandbox.guess_tag("lxb", 0).as_deref(), Some("lxb-100-7"));
        assert_eq!(sandbox.guess_tag("*", 0).as_deref(), Some("pcx-200-8"));
        assert_eq!(sandbox.guess_tag("zzz", 0), None);
        assert_eq!(sandbox.guess_tag("", 5), None);
    }

    #[test]
    fn test_last_session_symlink_roundtrip() {
        let root = tempdir().unwrap();
        let sandbox = Sandbox::assert(root.path(), &identity(), false).unwrap();
        let dir = sandbox.session_dir("lxb-100-7");
        sandbox.assert_dir(&dir).unwrap();
        sandbox.link_last_session("master", &dir).unwrap();
        sandbox.link_last_session("master", &dir).unwrap();

        let target = fs::read_link(sandbox.dir().join("last-master-session")).unwrap();
        let log = target.join("master-0-lxb-100-7.log");
        assert_eq!(tag_from_log_path(&log).as_deref(), Some("lxb-100-7"));
    }
}
