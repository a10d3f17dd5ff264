//! Process inspection and signalling

use std::fs;
use std::path::Path;

use tracing::debug;

use xpd_utils::{Result, XpdError};

/// Whether `pid` runs and is not a zombie
pub fn is_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    match fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => proc_state(&stat).map_or(false, |s| s != 'Z' && s != 'X'),
        // No procfs: fall back to a null signal
        Err(_) if !Path::new("/proc/self").exists() => {
            // SAFETY: kill with signal 0 only checks for existence
            unsafe { libc::kill(pid, 0) == 0 }
        }
        Err(_) => false,
    }
}

/// State letter of a `/proc/<pid>/stat` line (the field after `(comm)`)
fn proc_state(stat: &str) -> Option<char> {
    let after = stat.rfind(')')?;
    stat[after + 1..].trim_start().chars().next()
}

pub fn send_signal(pid: i32, signal: i32) -> Result<()> {
    if pid <= 0 {
        return Err(XpdError::Signal {
            pid,
            signal,
            reason: "invalid pid".into(),
        });
    }
    // SAFETY: plain syscall on a positive pid
    let rc = unsafe { libc::kill(pid, signal) };
    if rc != 0 {
        return Err(XpdError::Signal {
            pid,
            signal,
            reason: std::io::Error::last_os_error().to_string(),
        });
    }
    debug!("signal {} sent to {}", signal, pid);
    Ok(())
}

/// Reset the calling thread's errno
fn clear_errno() {
    // SAFETY: the errno location is a valid thread-local int
    unsafe {
        #[cfg(any(target_os = "linux", target_os = "redox"))]
        let errno = libc::__errno_location();
        #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd", target_os = "dragonfly"))]
        let errno = libc::__error();
        #[cfg(any(target_os = "openbsd", target_os = "netbsd", target_os = "android"))]
        let errno = libc::__errno();
        *errno = 0;
    }
}

/// Shift the nice value of `pid` by `delta`
pub fn renice(pid: i32, delta: i32) -> Result<()> {
    let who = pid as libc::id_t;
    // -1 is a valid priority, so failure shows only through errno
    clear_errno();
    // SAFETY: getpriority/setpriority on a process id
    unsafe {
        let current = libc::getpriority(libc::PRIO_PROCESS, who);
        let err = std::io::Error::last_os_error();
        if current == -1 && err.raw_os_error().is_some_and(|e| e != 0) {
            return Err(XpdError::internal(format!("getpriority({}) failed: {}", pid, err)));
        }
        if libc::setpriority(libc::PRIO_PROCESS, who, current + delta) != 0 {
            return Err(XpdError::internal(format!(
                "setpriority({}, {}) failed: {}",
                pid,
                current + delta,
                std::io::Error::last_os_error()
            )));
        }
    }
    Ok(())
}

/// Session-server processes owned by `uid` that were started by daemon
/// `daemon_pid` (argv `<bin> proofserv|proofslave xpd <daemon_pid> ...`)
pub fn find_session_processes(uid: u32, daemon_pid: u32) -> Vec<i32> {
    let Ok(entries) = fs::read_dir("/proc") else {
        return Vec::new();
    };
    let mut found = Vec::new();
    for entry in entries.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<i32>().ok()) else {
            continue;
        };
        if process_uid(pid) != Some(uid) {
            continue;
        }
        let Ok(cmdline) = fs::read(format!("/proc/{}/cmdline", pid)) else {
            continue;
        };
        let args: Vec<&[u8]> = cmdline.split(|b| *b == 0).collect();
        if is_session_cmdline(&args, daemon_pid) && is_alive(pid) {
            found.push(pid);
        }
    }
    found
}

fn is_session_cmdline(args: &[&[u8]], daemon_pid: u32) -> bool {
    args.len() > 3
        && matches!(args[1], b"proofserv" | b"proofslave")
        && args[2] == b"xpd"
        && args[3] == daemon_pid.to_string().as_bytes()
}

fn process_uid(pid: i32) -> Option<u32> {
    let status = fs::read_to_string(format!("/proc/{}/status", pid)).ok()?;
    let line = status.lines().find(|l| l.starts_with("Uid:"))?;
    line.split_whitespace().nth(1)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proc_state_parsing() {
        assert_eq!(proc_state("123 (sleep) S 1 2 3"), Some('S'));
        assert_eq!(proc_state("77 (odd) name) Z 1"), Some('Z'));
        assert_eq!(proc_state("garbage"), None);
    }

    #[test]
    fn test_session_cmdline_match() {
        let args: Vec<&[u8]> = vec![b"/opt/root/bin/proofserv", b"proofserv", b"xpd", b"4242", b"1"];
        assert!(is_session_cmdline(&args, 4242));
        assert!(!is_session_cmdline(&args, 1));
        let other: Vec<&[u8]> = vec![b"sleep", b"30"];
        assert!(!is_session_cmdline(&other, 4242));
    }

    #[test]
    fn test_signal_lifecycle() {
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id() as i32;
        assert!(is_alive(pid));
        send_signal(pid, libc::SIGKILL).unwrap();
        child.wait().unwrap();
        assert!(!is_alive(pid));
    }

    #[test]
    fn test_invalid_pid() {
        assert!(!is_alive(0));
        assert!(send_signal(-1, libc::SIGTERM).is_err());
    }

    #[test]
    fn test_renice_own_child() {
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        assert!(renice(child.id() as i32, 1).is_ok());
        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn test_renice_missing_process_fails() {
        let err = renice(i32::MAX, 1).unwrap_err();
        assert!(err.to_string().contains("getpriority"));
    }
}
