//! ReadBuffer handler
//!
//! Serves pieces of log files: local files are read directly, files on
//! other nodes through a pooled connection to their daemon.

use std::io::SeekFrom;
use std::path::Path;

use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

use xpd_protocol::{Request, Response};

use super::{ConnectionContext, HandlerResult, RequestError};

/// Where a ReadBuffer payload points
#[derive(Debug, Clone, PartialEq, Eq)]
struct FileLocation {
    /// `[user@]host[:port]`, empty for a plain path
    authority: String,
    path: String,
}

impl FileLocation {
    /// `[url,]file`, `proof://[user@]host[:port]/file` or a plain path
    fn parse(location: &str) -> Self {
        let strip_scheme = |s: &str| s.split_once("://").map_or(s, |(_, rest)| rest).to_string();
        if let Some((url, file)) = location.split_once(',') {
            return Self {
                authority: strip_scheme(url).trim_end_matches('/').to_string(),
                path: file.to_string(),
            };
        }
        if let Some((_, rest)) = location.split_once("://") {
            let (authority, path) = rest.split_once('/').unwrap_or((rest, ""));
            return Self {
                authority: authority.to_string(),
                path: path.to_string(),
            };
        }
        Self {
            authority: String::new(),
            path: location.to_string(),
        }
    }

    fn host(&self) -> &str {
        let host = self.authority.rsplit_once('@').map_or(self.authority.as_str(), |(_, h)| h);
        host.split(':').next().unwrap_or("")
    }

    fn is_local(&self, our_host: &str) -> bool {
        let host = self.host();
        xpd_utils::is_local_alias(host) || host.contains("localhost") || xpd_utils::same_host(host, our_host)
    }

    /// Pool key of the remote daemon, logging in as `user` unless named
    fn pool_url(&self, user: &str) -> String {
        if self.authority.contains('@') {
            self.authority.clone()
        } else {
            format!("{}@{}", user, self.authority)
        }
    }
}

/// Byte range `[start, end)` of a `size`-byte file for a read of `len`
/// bytes at `ofs` (negative offsets count from the end)
fn read_range(size: u64, ofs: i64, len: i32) -> (u64, u64) {
    if size == 0 {
        return (0, 0);
    }
    let size = size as i64;
    let start = if ofs < 0 { size + ofs } else { ofs };
    let start = start.clamp(0, size - 1);
    let end = (start + i64::from(len.max(0))).min(size);
    (start as u64, end as u64)
}

async fn read_local(path: &Path, ofs: i64, len: i32) -> std::io::Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    let size = file.metadata().await?.len();
    let (start, end) = read_range(size, ofs, len);
    debug!("reading {}: size {}, from {} to {}", path.display(), size, start, end);
    file.seek(SeekFrom::Start(start)).await?;
    let mut buf = Vec::with_capacity((end - start) as usize);
    file.take(end - start).read_to_end(&mut buf).await?;
    Ok(buf)
}

/// Lines of `path` containing `pattern` (`keep`) or not containing it
async fn grep_local(path: &Path, pattern: &str, keep: bool) -> std::io::Result<Vec<u8>> {
    let content = tokio::fs::read(path).await?;
    let content = String::from_utf8_lossy(&content);
    let mut out = String::new();
    for line in content.lines().filter(|l| l.contains(pattern) == keep) {
        out.push_str(line);
        out.push('\n');
    }
    Ok(out.into_bytes())
}

impl ConnectionContext {
    pub(super) async fn handle_read_buffer(&mut self, req: &Request) -> HandlerResult {
        let body = req.readbuf();
        let raw = req.payload_str();
        if raw.is_empty() {
            return Err(RequestError::invalid("ReadBuffer: file name not not found"));
        }
        let grep = match body.int1 {
            1 => Some(true),
            2 => Some(false),
            _ => None,
        };

        // With grep, `len` is the length of the pattern closing the payload
        let (location, pattern) = match grep {
            Some(_) => {
                let plen = usize::try_from(body.len).unwrap_or(0);
                let split = raw.len().checked_sub(plen).filter(|at| plen > 0 && *at > 0 && raw.is_char_boundary(*at));
                let Some(at) = split else {
                    return Err(RequestError::invalid("ReadBuffer: grep pattern undefined"));
                };
                raw.split_at(at)
            }
            None => (raw.as_str(), ""),
        };
        let location = FileLocation::parse(location);
        debug!("readbuf: {} ofs {} len {} grep {:?}", location.path, body.ofs, body.len, grep);

        let cfg = self.state.config();
        if location.is_local(&cfg.host) {
            let path = Path::new(&location.path);
            let data = match grep {
                Some(keep) => grep_local(path, pattern, keep).await,
                None => read_local(path, body.ofs, body.len).await,
            };
            return match data {
                Ok(data) => Ok(Response::ok_data(data).into()),
                Err(e) => {
                    debug!("readbuf {}: {}", location.path, e);
                    Err(RequestError::invalid(format!(
                        "ReadBuffer: could not read buffer from local file {}",
                        location.path
                    )))
                }
            };
        }

        let url = location.pool_url(&self.state.daemon_user);
        let file = format!("{}{}", location.path, pattern);
        match self.state.broadcaster.read_remote(&url, &file, body).await {
            Ok(data) => Ok(Response::ok_data(data).into()),
            Err(e) => {
                debug!("readbuf {} on {}: {}", location.path, url, e);
                Err(RequestError::invalid(format!(
                    "ReadBuffer: could not read buffer from remote file {}",
                    location.path
                )))
            }
        }
    }
}
