//! Installed runtime versions session processes can be started from

use std::path::PathBuf;

use parking_lot::RwLock;
use tracing::{info, warn};

use xpd_protocol::STRUCTURED_ENV_MIN_VERSION;

use super::schema::VersionDirective;

/// A runtime installation (`xpd.rootsys`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeVersion {
    pub tag: String,
    pub dir: PathBuf,
    /// Session server binary
    pub prgmsrv: PathBuf,
    /// Protocol version spoken by the session server
    pub srv_proto: i32,
}

impl RuntimeVersion {
    pub fn from_directive(d: &VersionDirective) -> Self {
        let tag = d.tag.clone().unwrap_or_else(|| {
            d.dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| d.dir.display().to_string())
        });
        Self {
            tag,
            prgmsrv: d.dir.join("bin").join("proofserv"),
            dir: d.dir.clone(),
            srv_proto: d.proto.unwrap_or(STRUCTURED_ENV_MIN_VERSION),
        }
    }

    /// One-line description used by QueryVersions
    pub fn export(&self) -> String {
        format!("{} | {} | proto:{}", self.tag, self.dir.display(), self.srv_proto)
    }
}

struct Inner {
    versions: Vec<RuntimeVersion>,
    default: usize,
}

/// Registry of runtime versions; the first one is the default
pub struct VersionRegistry {
    inner: RwLock<Inner>,
}

impl VersionRegistry {
    pub fn new(directives: &[VersionDirective]) -> Self {
        let versions = directives.iter().map(RuntimeVersion::from_directive).collect();
        Self {
            inner: RwLock::new(Inner {
                versions,
                default: 0,
            }),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().versions.is_empty()
    }

    pub fn default_version(&self) -> Option<RuntimeVersion> {
        let inner = self.inner.read();
        inner.versions.get(inner.default).cloned()
    }

    /// Look up by tag; `default` and the empty tag map to the default
    pub fn get(&self, tag: &str) -> Option<RuntimeVersion> {
        if tag.is_empty() || tag == "default" {
            return self.default_version();
        }
        self.inner.read().versions.iter().find(|v| v.tag == tag).cloned()
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.get(tag).is_some()
    }

    /// QueryVersions listing: `  * ` marks `selected`, or the default
    /// when no version (or an unknown one) is selected
    pub fn export(&self, selected: Option<&str>) -> String {
        let inner = self.inner.read();
        let marked = selected
            .and_then(|tag| inner.versions.iter().position(|v| v.tag == tag))
            .unwrap_or(inner.default);
        let mut out = String::new();
        for (i, v) in inner.versions.iter().enumerate() {
            out.push_str(if i == marked { "  * " } else { "    " });
            out.push_str(&v.export());
            out.push('\n');
        }
        out
    }

    /// Rebuild from reloaded directives, keeping the default tag if it
    /// still exists
    pub fn reload(&self, directives: &[VersionDirective]) {
        let mut inner = self.inner.write();
        let old_default = inner.versions.get(inner.default).map(|v| v.tag.clone());
        inner.versions = directives.iter().map(RuntimeVersion::from_directive).collect();
        inner.default = old_default
            .and_then(|tag| inner.versions.iter().position(|v| v.tag == tag))
            .unwrap_or(0);
        if inner.versions.is_empty() {
            warn!("No runtime version configured");
        } else {
            info!("{} runtime versions available", inner.versions.len());
        }
    }
}
