//! xpd-protocol: wire definitions shared by the daemon and its peers
//!
//! This crate defines the binary request/response framing, the numeric
//! codes carried on the wire and the opening handshake.

pub mod codec;
pub mod codes;
pub mod handshake;
pub mod request;
pub mod response;

pub use codec::{ClientCodec, CodecError, ServerCodec, MAX_MESSAGE_SIZE};
pub use codes::{
    ActionCode, AdminType, ErrorCode, RequestId, ResponseStatus, Role, SendMsgOptions, ServerType,
    SHUTDOWN_INTERRUPT,
};
pub use request::{
    AuthBody, InterruptBody, LoginBody, ProofBody, ReadBufBody, Request, SendRcvBody, StreamId,
    USER_IN_PAYLOAD,
};
pub use response::Response;

/// Daemon version advertised in the handshake and login reply
pub const DAEMON_VERSION: i32 = 1021;

/// Lowest session-process protocol version using the structured
/// environment description
pub const STRUCTURED_ENV_MIN_VERSION: i32 = 14;

/// Largest chunk forwarded in one message
pub const MAX_BUFFER_SIZE: usize = 16 * 1024;

/// Maximum length of a session tag
pub const MAX_TAG_LEN: usize = 64;

/// Maximum length of a session alias
pub const MAX_ALIAS_LEN: usize = 256;

/// Split a payload into forwarding chunks of at most [`MAX_BUFFER_SIZE`].
///
/// An empty payload still yields one empty chunk so the receiver sees the
/// message.
pub fn split_payload(data: &[u8]) -> Vec<&[u8]> {
    if data.is_empty() {
        return vec![data];
    }
    data.chunks(MAX_BUFFER_SIZE).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_payload_bounds() {
        let data = vec![7u8; MAX_BUFFER_SIZE * 2 + 10];
        let chunks = split_payload(&data);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.len() <= MAX_BUFFER_SIZE));
        assert_eq!(chunks[2].len(), 10);
    }

    #[test]
    fn test_split_empty_payload() {
        assert_eq!(split_payload(&[]).len(), 1);
    }
}
