//! Response construction and inspection
//!
//! A response is an 8-byte header (`streamid[2] status dlen`) plus body.
//! The body layout depends on the status and, for `Attn`, on the action
//! code that leads the body.

use bytes::{BufMut, Bytes, BytesMut};

use crate::codes::{ActionCode, ErrorCode, ResponseStatus};
use crate::request::StreamId;

/// Size of the fixed response header
pub const RESPONSE_HEADER_LEN: usize = 8;

/// A response (or unsolicited message) sent to a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub stream_id: StreamId,
    pub status: ResponseStatus,
    pub body: Bytes,
}

impl Response {
    fn with_body(status: ResponseStatus, body: impl Into<Bytes>) -> Self {
        Self {
            stream_id: StreamId::default(),
            status,
            body: body.into(),
        }
    }

    /// Address this response to a given stream
    pub fn on_stream(mut self, stream_id: StreamId) -> Self {
        self.stream_id = stream_id;
        self
    }

    // === Ok variants ===

    pub fn ok() -> Self {
        Self::with_body(ResponseStatus::Ok, Bytes::new())
    }

    pub fn ok_data(data: impl Into<Bytes>) -> Self {
        Self::with_body(ResponseStatus::Ok, data)
    }

    pub fn ok_int(value: i32) -> Self {
        Self::with_body(ResponseStatus::Ok, Bytes::copy_from_slice(&value.to_be_bytes()))
    }

    /// `i32` followed by opaque data (login reply carrying auth parameters)
    pub fn ok_int_data(value: i32, data: &[u8]) -> Self {
        let mut b = BytesMut::with_capacity(4 + data.len());
        b.put_i32(value);
        b.put_slice(data);
        Self::with_body(ResponseStatus::Ok, b.freeze())
    }

    /// Create/Attach reply: `psid srvprotvers:i16 daemonvers:i16 [extra]`
    pub fn ok_session(psid: i32, srv_proto: i16, daemon_version: i16, extra: Option<&str>) -> Self {
        let extra = extra.unwrap_or("");
        let mut b = BytesMut::with_capacity(8 + extra.len());
        b.put_i32(psid);
        b.put_i16(srv_proto);
        b.put_i16(daemon_version);
        b.put_slice(extra.as_bytes());
        Self::with_body(ResponseStatus::Ok, b.freeze())
    }

    pub fn oksofar(data: impl Into<Bytes>) -> Self {
        Self::with_body(ResponseStatus::OkSoFar, data)
    }

    pub fn auth_more(data: impl Into<Bytes>) -> Self {
        Self::with_body(ResponseStatus::AuthMore, data)
    }

    // === Asynchronous messages ===

    pub fn attn(action: ActionCode, data: &[u8]) -> Self {
        let mut b = BytesMut::with_capacity(4 + data.len());
        b.put_i32(action.as_i32());
        b.put_slice(data);
        Self::with_body(ResponseStatus::Attn, b.freeze())
    }

    /// Attn text message
    pub fn attn_text(action: ActionCode, text: &str) -> Self {
        Self::attn(action, text.as_bytes())
    }

    /// Message forwarded on behalf of a client id
    pub fn attn_msgsid(cid: i32, data: &[u8]) -> Self {
        let mut b = BytesMut::with_capacity(8 + data.len());
        b.put_i32(ActionCode::MsgSid.as_i32());
        b.put_i32(cid);
        b.put_slice(data);
        Self::with_body(ResponseStatus::Attn, b.freeze())
    }

    /// Attn carrying a single integer (interrupt type, inflate factor)
    pub fn attn_info(action: ActionCode, info: i32) -> Self {
        Self::attn(action, &info.to_be_bytes())
    }

    // === Errors ===

    /// Error reply: `errcode message NUL`
    pub fn error(code: ErrorCode, message: &str) -> Self {
        let mut b = BytesMut::with_capacity(5 + message.len());
        b.put_i32(code.as_i32());
        b.put_slice(message.as_bytes());
        b.put_u8(0);
        Self::with_body(ResponseStatus::Error, b.freeze())
    }

    // === Inspection ===

    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok
    }

    pub fn is_attn(&self) -> bool {
        self.status == ResponseStatus::Attn
    }

    /// Big-endian `i32` at byte offset `at` of the body
    pub fn int_at(&self, at: usize) -> Option<i32> {
        let s = self.body.get(at..at + 4)?;
        Some(i32::from_be_bytes([s[0], s[1], s[2], s[3]]))
    }

    /// Big-endian `i16` at byte offset `at` of the body
    pub fn short_at(&self, at: usize) -> Option<i16> {
        let s = self.body.get(at..at + 2)?;
        Some(i16::from_be_bytes([s[0], s[1]]))
    }

    /// Error code and message of an `Error` response
    pub fn error_info(&self) -> Option<(i32, String)> {
        if self.status != ResponseStatus::Error {
            return None;
        }
        let code = self.int_at(0)?;
        Some((code, text_of(&self.body[4..])))
    }

    /// Action code of an `Attn` message
    pub fn action(&self) -> Option<ActionCode> {
        if !self.is_attn() {
            return None;
        }
        ActionCode::from_i32(self.int_at(0)?)
    }

    /// Payload of an `Attn` message past its action code (and client id)
    pub fn attn_payload(&self) -> Bytes {
        let skip = match self.action() {
            Some(ActionCode::MsgSid) => 8,
            Some(_) => 4,
            None => 0,
        };
        if self.body.len() < skip {
            return Bytes::new();
        }
        self.body.slice(skip..)
    }

    /// Body as text, stopping at the first NUL
    pub fn text(&self) -> String {
        text_of(&self.body)
    }
}

fn text_of(b: &[u8]) -> String {
    let end = b.iter().position(|c| *c == 0).unwrap_or(b.len());
    String::from_utf8_lossy(&b[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== Ok Tests ====================

    #[test]
    fn test_ok_int() {
        let resp = Response::ok_int(1021);
        assert!(resp.is_ok());
        assert_eq!(resp.int_at(0), Some(1021));
        assert_eq!(resp.body.len(), 4);
    }

    #[test]
    fn test_ok_session_layout() {
        let resp = Response::ok_session(3, 14, 1021, Some("proof://pool/ns"));
        assert_eq!(resp.int_at(0), Some(3));
        assert_eq!(resp.short_at(4), Some(14));
        assert_eq!(resp.short_at(6), Some(1021));
        assert_eq!(&resp.body[8..], b"proof://pool/ns");
    }

    #[test]
    fn test_ok_session_without_extra() {
        let resp = Response::ok_session(0, 14, 1021, None);
        assert_eq!(resp.body.len(), 8);
    }

    // ==================== Attn Tests ====================

    #[test]
    fn test_attn_msgsid_payload() {
        let resp = Response::attn_msgsid(2, b"hello");
        assert_eq!(resp.action(), Some(ActionCode::MsgSid));
        assert_eq!(resp.int_at(4), Some(2));
        assert_eq!(&resp.attn_payload()[..], b"hello");
    }

    #[test]
    fn test_attn_info() {
        let resp = Response::attn_info(ActionCode::Inflate, 1500);
        assert_eq!(resp.action(), Some(ActionCode::Inflate));
        assert_eq!(resp.int_at(4), Some(1500));
    }

    #[test]
    fn test_attn_text_payload() {
        let resp = Response::attn_text(ActionCode::SrvMsg, "notice");
        assert_eq!(&resp.attn_payload()[..], b"notice");
    }

    // ==================== Error Tests ====================

    #[test]
    fn test_error_layout() {
        let resp = Response::error(ErrorCode::InvalidRequest, "session ID not found");
        assert_eq!(resp.status, ResponseStatus::Error);
        assert_eq!(*resp.body.last().unwrap(), 0);
        let (code, msg) = resp.error_info().unwrap();
        assert_eq!(code, 3006);
        assert_eq!(msg, "session ID not found");
    }

    #[test]
    fn test_error_info_on_ok_is_none() {
        assert!(Response::ok().error_info().is_none());
        assert!(Response::ok().action().is_none());
    }

    #[test]
    fn test_on_stream() {
        let resp = Response::ok().on_stream(StreamId([0, 9]));
        assert_eq!(resp.stream_id, StreamId([0, 9]));
    }
}
