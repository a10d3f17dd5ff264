//! Connection handshake
//!
//! Before any framed traffic the client sends five big-endian `i32`
//! words (`0 0 1 0 0`). The server answers with four words
//! `0 0 <daemon version> 0`, after which the client sends two more
//! ignored words.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::codec::CodecError;

pub const CLIENT_HANDSHAKE_LEN: usize = 20;
pub const SERVER_HANDSHAKE_LEN: usize = 16;
pub const HANDSHAKE_TRAILER_LEN: usize = 8;

/// The five words a client opens with
pub fn client_handshake() -> [u8; CLIENT_HANDSHAKE_LEN] {
    let mut b = [0u8; CLIENT_HANDSHAKE_LEN];
    b[8..12].copy_from_slice(&1i32.to_be_bytes());
    b
}

/// Check the opening words: all zero except the third, which must be 1
pub fn is_valid_client_handshake(b: &[u8; CLIENT_HANDSHAKE_LEN]) -> bool {
    let word = |i: usize| i32::from_be_bytes([b[4 * i], b[4 * i + 1], b[4 * i + 2], b[4 * i + 3]]);
    word(0) == 0 && word(1) == 0 && word(2) == 1 && word(3) == 0 && word(4) == 0
}

/// The server's reply advertising its version
pub fn server_reply(version: i32) -> [u8; SERVER_HANDSHAKE_LEN] {
    let mut b = [0u8; SERVER_HANDSHAKE_LEN];
    b[8..12].copy_from_slice(&version.to_be_bytes());
    b
}

async fn bounded<F, T>(wait: Duration, what: &str, fut: F) -> Result<T, CodecError>
where
    F: std::future::Future<Output = std::io::Result<T>>,
{
    match timeout(wait, fut).await {
        Ok(res) => res.map_err(CodecError::from),
        Err(_) => Err(CodecError::Handshake(format!("{} timed out", what))),
    }
}

/// Server side: validate the opening words and answer.
///
/// Any read failure, timeout or mismatch is an error; the caller closes
/// the link.
pub async fn accept_handshake<S>(stream: &mut S, read_wait: Duration, version: i32) -> Result<(), CodecError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut hs = [0u8; CLIENT_HANDSHAKE_LEN];
    bounded(read_wait, "handshake", stream.read_exact(&mut hs)).await?;
    if !is_valid_client_handshake(&hs) {
        return Err(CodecError::Handshake("handshake not recognized".into()));
    }

    stream.write_all(&server_reply(version)).await?;
    stream.flush().await?;

    let mut dummy = [0u8; HANDSHAKE_TRAILER_LEN];
    bounded(read_wait, "handshake trailer", stream.read_exact(&mut dummy)).await?;
    Ok(())
}

/// Client side: open the handshake and return the server's version
pub async fn initiate_handshake<S>(stream: &mut S, wait: Duration) -> Result<i32, CodecError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&client_handshake()).await?;
    stream.flush().await?;

    let mut reply = [0u8; SERVER_HANDSHAKE_LEN];
    bounded(wait, "handshake reply", stream.read_exact(&mut reply)).await?;
    let version = i32::from_be_bytes([reply[8], reply[9], reply[10], reply[11]]);

    stream.write_all(&[0u8; HANDSHAKE_TRAILER_LEN]).await?;
    stream.flush().await?;
    Ok(version)
}
