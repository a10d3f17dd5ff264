//! Wildcard matching for host and user patterns
//!
//! Patterns use `*` for any run of characters, e.g. `lxb*.cern.ch`.
//! A match reports how many literal characters of the pattern were
//! consumed, so callers can pick the most specific of several rules.

use regex::Regex;

/// Match `value` against a `*` wildcard pattern.
///
/// Returns the number of literal (non-wildcard) characters in the pattern
/// on success, `None` when it does not match.
pub fn match_score(value: &str, pattern: &str) -> Option<usize> {
    if !pattern.contains('*') {
        return (value == pattern).then(|| pattern.chars().count());
    }

    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    let re = Regex::new(&format!("^{}$", body)).ok()?;
    re.is_match(value)
        .then(|| pattern.chars().filter(|c| *c != '*').count())
}

/// True if `value` matches the wildcard pattern
pub fn matches(value: &str, pattern: &str) -> bool {
    match_score(value, pattern).is_some()
}

/// True if `value` matches any pattern of a comma separated list
pub fn matches_any(value: &str, list: &str) -> bool {
    list.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .any(|p| matches(value, p))
}

/// True if two host names denote the same machine.
///
/// Short names match their fully qualified form (`lxb01` vs
/// `lxb01.cern.ch`), comparison is case insensitive.
pub fn same_host(a: &str, b: &str) -> bool {
    let a = a.to_ascii_lowercase();
    let b = b.to_ascii_lowercase();
    if a == b {
        return true;
    }
    let short = |h: &str| h.split('.').next().unwrap_or("").to_string();
    (!a.contains('.') || !b.contains('.')) && short(&a) == short(&b)
}

/// True for names that always refer to the local machine
pub fn is_local_alias(host: &str) -> bool {
    host.is_empty() || host == "localhost" || host == "127.0.0.1" || host == "::1"
}

/// Name of this machine, `localhost` if it cannot be read
pub fn local_hostname() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: buf is valid for buf.len() bytes; gethostname NUL-terminates on success
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return "localhost".to_string();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    match std::str::from_utf8(&buf[..end]) {
        Ok(name) if !name.is_empty() => name.to_string(),
        _ => "localhost".to_string(),
    }
}
