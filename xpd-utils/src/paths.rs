//! Path utilities for xproofd
//!
//! Handles XDG Base Directory lookups for the admin tool and the default
//! daemon locations (admin area, sandboxes, config file).

use std::path::{Path, PathBuf};

use directories::ProjectDirs;

/// Application identifier for XDG directories
pub const APP_NAME: &str = "xproofd";

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", APP_NAME)
}

/// Get the runtime directory
///
/// Location: `$XDG_RUNTIME_DIR/xproofd` or `/tmp/xproofd-$UID`
pub fn runtime_dir() -> PathBuf {
    if let Ok(xdg_runtime) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(xdg_runtime).join(APP_NAME)
    } else {
        // SAFETY: getuid() is always safe to call
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/{}-{}", APP_NAME, uid))
    }
}

/// Get the configuration directory
///
/// Location: `$XDG_CONFIG_HOME/xproofd` or `~/.config/xproofd`
pub fn config_dir() -> PathBuf {
    project_dirs()
        .map(|p| p.config_dir().to_path_buf())
        .unwrap_or_else(|| home_dir().join(".config").join(APP_NAME))
}

/// Default daemon configuration file
///
/// Location: `$XDG_CONFIG_HOME/xproofd/xpd.cf`
pub fn config_file() -> PathBuf {
    config_dir().join("xpd.cf")
}

/// Get the state directory
///
/// Location: `$XDG_STATE_HOME/xproofd` or `~/.local/state/xproofd`
pub fn state_dir() -> PathBuf {
    project_dirs()
        .and_then(|p| p.state_dir().map(|d| d.to_path_buf()))
        .unwrap_or_else(|| home_dir().join(".local").join("state").join(APP_NAME))
}

/// Get the log directory
///
/// Location: `$XDG_STATE_HOME/xproofd/log`
pub fn log_dir() -> PathBuf {
    state_dir().join("log")
}

/// Daemon admin area under the temporary directory, one per port
///
/// Location: `<tmp>/.xproofd.<port>`
pub fn admin_dir(tmp: &Path, port: u16) -> PathBuf {
    tmp.join(format!(".{}.{}", APP_NAME, port))
}

/// Default per-user sandbox root when no `workdir` is configured
///
/// Location: `<home>/proof`
pub fn default_sandbox_root(home: &Path) -> PathBuf {
    home.join("proof")
}

/// Ensure a directory exists, creating it if necessary
pub fn ensure_dir(path: &Path) -> std::io::Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    // ==================== Runtime Dir Tests ====================

    #[test]
    fn test_runtime_dir_contains_app_name() {
        let path = runtime_dir();
        assert!(path.to_string_lossy().contains("xproofd"));
    }

    #[test]
    fn test_runtime_dir_xdg_and_fallback() {
        let original = env::var("XDG_RUNTIME_DIR").ok();

        env::set_var("XDG_RUNTIME_DIR", "/run/user/1000");
        assert_eq!(runtime_dir(), PathBuf::from("/run/user/1000/xproofd"));

        env::remove_var("XDG_RUNTIME_DIR");
        let fallback = runtime_dir();
        assert!(fallback.starts_with("/tmp"));
        assert!(fallback.to_string_lossy().contains("xproofd-"));

        match original {
            Some(val) => env::set_var("XDG_RUNTIME_DIR", val),
            None => env::remove_var("XDG_RUNTIME_DIR"),
        }
    }

    // ==================== Config Path Tests ====================

    #[test]
    fn test_config_file_name() {
        let path = config_file();
        assert_eq!(path.file_name().and_then(|n| n.to_str()), Some("xpd.cf"));
        assert!(path.starts_with(config_dir()));
    }

    #[test]
    fn test_log_dir_in_state_dir() {
        assert!(log_dir().starts_with(state_dir()));
        assert!(log_dir().ends_with("log"));
    }

    // ==================== Daemon Layout Tests ====================

    #[test]
    fn test_admin_dir_includes_port() {
        let dir = admin_dir(Path::new("/tmp"), 1093);
        assert_eq!(dir, PathBuf::from("/tmp/.xproofd.1093"));
    }

    #[test]
    fn test_default_sandbox_root() {
        assert_eq!(
            default_sandbox_root(Path::new("/home/alice")),
            PathBuf::from("/home/alice/proof")
        );
    }

    #[test]
    fn test_ensure_dir_creates_nested() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("a").join("b");
        ensure_dir(&nested).unwrap();
        assert!(nested.is_dir());
        // Second call is a no-op
        ensure_dir(&nested).unwrap();
    }
}
