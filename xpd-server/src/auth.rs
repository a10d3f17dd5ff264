//! Authentication plugin seam
//!
//! The credential exchange itself is opaque to the daemon: a plugin
//! advertises its parameters in the login reply, then judges each `auth`
//! request, possibly asking for another round.

/// Outcome of one authentication round
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Credentials accepted for `name`; `credentials` may be forwarded to
    /// session processes
    Authenticated {
        name: String,
        credentials: Option<Vec<u8>>,
    },
    /// Another round needed, send this challenge
    Continue(Vec<u8>),
    Failed(String),
}

/// Pluggable credential validator
pub trait Authenticator: Send + Sync {
    /// Parameters sent with the login reply; `None` disables authentication
    fn parameters(&self) -> Option<Vec<u8>>;

    fn authenticate(&self, cred_type: &str, credentials: &[u8], host: &str) -> AuthOutcome;
}

/// Accept every login without an exchange
#[derive(Debug, Default)]
pub struct NoAuth;

impl Authenticator for NoAuth {
    fn parameters(&self) -> Option<Vec<u8>> {
        None
    }

    fn authenticate(&self, _cred_type: &str, _credentials: &[u8], _host: &str) -> AuthOutcome {
        AuthOutcome::Failed("authentication not configured".into())
    }
}
