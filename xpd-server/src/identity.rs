//! User identity resolution
//!
//! Maps a login name to the uid/gid/home the session processes run as.
//! `SystemIdentityResolver` asks the password database;
//! `SingleUserResolver` maps everybody onto the daemon's own account,
//! which is what an unprivileged daemon can offer.

use std::ffi::{CStr, CString};
use std::path::PathBuf;

use xpd_utils::{Result, XpdError};

/// Resolved account of a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub user: String,
    pub uid: u32,
    pub gid: u32,
    pub home: PathBuf,
    /// Primary group name
    pub group: String,
    /// Supplementary group ids
    pub groups: Vec<u32>,
}

/// Resolves login names to system identities
pub trait IdentityResolver: Send + Sync {
    fn resolve(&self, user: &str) -> Result<UserIdentity>;

    /// Whether processes can be started under a different uid
    fn can_change_owner(&self) -> bool;
}

/// Password-database resolver used when running privileged
#[derive(Debug, Default)]
pub struct SystemIdentityResolver;

impl IdentityResolver for SystemIdentityResolver {
    fn resolve(&self, user: &str) -> Result<UserIdentity> {
        let cname = CString::new(user).map_err(|_| XpdError::UnknownUser(user.to_string()))?;
        let (uid, gid, home) =
            passwd_by_name(&cname).ok_or_else(|| XpdError::UnknownUser(user.to_string()))?;
        Ok(UserIdentity {
            user: user.to_string(),
            uid,
            gid,
            home,
            group: group_name(gid).unwrap_or_else(|| gid.to_string()),
            groups: group_list(&cname, gid),
        })
    }

    fn can_change_owner(&self) -> bool {
        // SAFETY: geteuid() is always safe to call
        unsafe { libc::geteuid() == 0 }
    }
}

/// Maps every login onto one account
#[derive(Debug, Clone)]
pub struct SingleUserResolver {
    uid: u32,
    gid: u32,
    home: PathBuf,
    group: String,
}

impl SingleUserResolver {
    pub fn new(uid: u32, gid: u32, home: impl Into<PathBuf>) -> Self {
        Self {
            uid,
            gid,
            home: home.into(),
            group: group_name(gid).unwrap_or_else(|| gid.to_string()),
        }
    }

    /// The daemon's effective identity
    pub fn current() -> Self {
        // SAFETY: geteuid()/getegid() are always safe to call
        let (uid, gid) = unsafe { (libc::geteuid(), libc::getegid()) };
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .or_else(|| passwd_by_uid(uid))
            .unwrap_or_else(|| PathBuf::from("/tmp"));
        Self::new(uid, gid, home)
    }
}

impl IdentityResolver for SingleUserResolver {
    fn resolve(&self, user: &str) -> Result<UserIdentity> {
        if user.is_empty() {
            return Err(XpdError::UnknownUser(String::new()));
        }
        Ok(UserIdentity {
            user: user.to_string(),
            uid: self.uid,
            gid: self.gid,
            home: self.home.clone(),
            group: self.group.clone(),
            groups: Vec::new(),
        })
    }

    fn can_change_owner(&self) -> bool {
        false
    }
}

/// Retry a `get*_r` call with a growing buffer while it reports ERANGE
fn with_buffer<T>(mut call: impl FnMut(&mut [libc::c_char]) -> (libc::c_int, Option<T>)) -> Option<T> {
    let mut size = 1024;
    loop {
        let mut buf = vec![0 as libc::c_char; size];
        let (rc, value) = call(&mut buf);
        if rc == libc::ERANGE && size < 1 << 20 {
            size *= 2;
            continue;
        }
        return if rc == 0 { value } else { None };
    }
}

fn passwd_by_name(name: &CStr) -> Option<(u32, u32, PathBuf)> {
    with_buffer(|buf| {
        // SAFETY: all pointers are valid for the duration of the call and
        // `buf` outlives the borrowed strings we copy out of `pwd`
        unsafe {
            let mut pwd: libc::passwd = std::mem::zeroed();
            let mut result: *mut libc::passwd = std::ptr::null_mut();
            let rc = libc::getpwnam_r(name.as_ptr(), &mut pwd, buf.as_mut_ptr(), buf.len(), &mut result);
            if rc != 0 || result.is_null() {
                return (rc, None);
            }
            let home = CStr::from_ptr(pwd.pw_dir).to_string_lossy().into_owned();
            (0, Some((pwd.pw_uid, pwd.pw_gid, PathBuf::from(home))))
        }
    })
}

fn passwd_by_uid(uid: u32) -> Option<PathBuf> {
    with_buffer(|buf| {
        // SAFETY: as in `passwd_by_name`
        unsafe {
            let mut pwd: libc::passwd = std::mem::zeroed();
            let mut result: *mut libc::passwd = std::ptr::null_mut();
            let rc = libc::getpwuid_r(uid, &mut pwd, buf.as_mut_ptr(), buf.len(), &mut result);
            if rc != 0 || result.is_null() {
                return (rc, None);
            }
            let home = CStr::from_ptr(pwd.pw_dir).to_string_lossy().into_owned();
            (0, Some(PathBuf::from(home)))
        }
    })
}

fn group_name(gid: u32) -> Option<String> {
    with_buffer(|buf| {
        // SAFETY: as in `passwd_by_name`
        unsafe {
            let mut grp: libc::group = std::mem::zeroed();
            let mut result: *mut libc::group = std::ptr::null_mut();
            let rc = libc::getgrgid_r(gid, &mut grp, buf.as_mut_ptr(), buf.len(), &mut result);
            if rc != 0 || result.is_null() {
                return (rc, None);
            }
            (0, Some(CStr::from_ptr(grp.gr_name).to_string_lossy().into_owned()))
        }
    })
}

fn group_list(name: &CStr, gid: u32) -> Vec<u32> {
    let mut n: libc::c_int = 32;
    loop {
        let mut groups = vec![0 as libc::gid_t; n as usize];
        let mut count = n;
        // SAFETY: `groups` has room for `count` entries
        let rc = unsafe { libc::getgrouplist(name.as_ptr(), gid, groups.as_mut_ptr(), &mut count) };
        if rc >= 0 {
            groups.truncate(count as usize);
            return groups;
        }
        if count <= n || n > 4096 {
            return vec![gid];
        }
        n = count;
    }
}
