//! Frame codecs
//!
//! `ServerCodec` decodes requests and encodes responses, `ClientCodec`
//! does the reverse. Both are plain `tokio_util` codecs over the fixed
//! big-endian headers.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::codes::ResponseStatus;
use crate::request::{Request, StreamId, BODY_LEN, REQUEST_HEADER_LEN};
use crate::response::{Response, RESPONSE_HEADER_LEN};

/// Maximum payload size (16 MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Protocol codec error
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Negative data length {dlen} on stream {stream_id:?}")]
    NegativeLength { stream_id: StreamId, dlen: i32 },

    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Unknown response status: {0}")]
    UnknownStatus(u16),

    #[error("Handshake failed: {0}")]
    Handshake(String),
}

/// Codec for the daemon side: decodes `Request`, encodes `Response`
#[derive(Debug, Default)]
pub struct ServerCodec;

impl ServerCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for ServerCodec {
    type Item = Request;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < REQUEST_HEADER_LEN {
            return Ok(None);
        }

        let stream_id = StreamId([src[0], src[1]]);
        let dlen = i32::from_be_bytes([src[20], src[21], src[22], src[23]]);
        if dlen < 0 {
            // Drop the header so the caller can report and close
            src.advance(REQUEST_HEADER_LEN);
            return Err(CodecError::NegativeLength { stream_id, dlen });
        }
        let len = dlen as usize;
        if len > MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge {
                size: len,
                max: MAX_MESSAGE_SIZE,
            });
        }

        if src.len() < REQUEST_HEADER_LEN + len {
            src.reserve(REQUEST_HEADER_LEN + len - src.len());
            return Ok(None);
        }

        let request_id = u16::from_be_bytes([src[2], src[3]]);
        let mut body = [0u8; BODY_LEN];
        body.copy_from_slice(&src[4..4 + BODY_LEN]);
        src.advance(REQUEST_HEADER_LEN);
        let payload = src.split_to(len).freeze();

        Ok(Some(Request {
            stream_id,
            request_id,
            body,
            payload,
        }))
    }
}

impl Encoder<Response> for ServerCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Response, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.body.len() > MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge {
                size: item.body.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        dst.reserve(RESPONSE_HEADER_LEN + item.body.len());
        dst.put_slice(&item.stream_id.0);
        dst.put_u16(item.status.as_u16());
        dst.put_i32(item.body.len() as i32);
        dst.put_slice(&item.body);
        Ok(())
    }
}

/// Codec for peers talking to a daemon: decodes `Response`, encodes `Request`
#[derive(Debug, Default)]
pub struct ClientCodec;

impl ClientCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for ClientCodec {
    type Item = Response;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < RESPONSE_HEADER_LEN {
            return Ok(None);
        }

        let stream_id = StreamId([src[0], src[1]]);
        let raw_status = u16::from_be_bytes([src[2], src[3]]);
        let dlen = i32::from_be_bytes([src[4], src[5], src[6], src[7]]);
        if dlen < 0 {
            return Err(CodecError::NegativeLength { stream_id, dlen });
        }
        let len = dlen as usize;
        if len > MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge {
                size: len,
                max: MAX_MESSAGE_SIZE,
            });
        }
        if src.len() < RESPONSE_HEADER_LEN + len {
            src.reserve(RESPONSE_HEADER_LEN + len - src.len());
            return Ok(None);
        }

        let status = ResponseStatus::try_from(raw_status).map_err(CodecError::UnknownStatus)?;
        src.advance(RESPONSE_HEADER_LEN);
        let body = src.split_to(len).freeze();
        Ok(Some(Response {
            stream_id,
            status,
            body,
        }))
    }
}

impl Encoder<Request> for ClientCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Request, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.payload.len() > MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge {
                size: item.payload.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        dst.reserve(REQUEST_HEADER_LEN + item.payload.len());
        dst.put_slice(&item.stream_id.0);
        dst.put_u16(item.request_id);
        dst.put_slice(&item.body);
        dst.put_i32(item.payload.len() as i32);
        dst.put_slice(&item.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codes::{ErrorCode, RequestId};
    use crate::request::ProofBody;
    use bytes::Bytes;

    fn sample_request() -> Request {
        Request::new(
            StreamId([0, 7]),
            RequestId::Create,
            ProofBody { sid: 0, int1: 1, int2: 0, int3: 0 }.encode(),
            Bytes::from_static(b"T1|ord:0|"),
        )
    }

    // ==================== Request Framing Tests ====================

    #[test]
    fn test_request_wire_layout() {
        let mut buf = BytesMut::new();
        ClientCodec::new().encode(sample_request(), &mut buf).unwrap();

        assert_eq!(buf.len(), REQUEST_HEADER_LEN + 9);
        assert_eq!(&buf[0..2], &[0, 7]);
        assert_eq!(&buf[2..4], &3103u16.to_be_bytes());
        assert_eq!(&buf[20..24], &9i32.to_be_bytes());

        let decoded = ServerCodec::new().decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, sample_request());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_request() {
        let mut buf = BytesMut::new();
        ClientCodec::new().encode(sample_request(), &mut buf).unwrap();

        let mut partial = buf.split_to(10);
        let mut codec = ServerCodec::new();
        assert!(codec.decode(&mut partial).unwrap().is_none());

        // Header complete, payload not yet
        let rest = buf.split_off(REQUEST_HEADER_LEN - 10);
        partial.unsplit(buf);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.unsplit(rest);
        assert!(codec.decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn test_negative_length_rejected() {
        let mut buf = BytesMut::new();
        buf.put_slice(&[0, 3]);
        buf.put_u16(RequestId::Ping.as_u16());
        buf.put_slice(&[0u8; BODY_LEN]);
        buf.put_i32(-5);

        let err = ServerCodec::new().decode(&mut buf).unwrap_err();
        match err {
            CodecError::NegativeLength { stream_id, dlen } => {
                assert_eq!(stream_id, StreamId([0, 3]));
                assert_eq!(dlen, -5);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_request_too_large() {
        let mut buf = BytesMut::new();
        buf.put_slice(&[0, 0]);
        buf.put_u16(RequestId::SendMsg.as_u16());
        buf.put_slice(&[0u8; BODY_LEN]);
        buf.put_i32((MAX_MESSAGE_SIZE + 1) as i32);

        let result = ServerCodec::new().decode(&mut buf);
        assert!(matches!(result, Err(CodecError::MessageTooLarge { .. })));
    }

    // ==================== Response Framing Tests ====================

    #[test]
    fn test_response_wire_layout() {
        let resp = Response::error(ErrorCode::InvalidRequest, "bad").on_stream(StreamId([1, 2]));
        let mut buf = BytesMut::new();
        ServerCodec::new().encode(resp.clone(), &mut buf).unwrap();

        assert_eq!(&buf[0..2], &[1, 2]);
        assert_eq!(&buf[2..4], &4003u16.to_be_bytes());
        assert_eq!(&buf[4..8], &8i32.to_be_bytes());

        let decoded = ClientCodec::new().decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, resp);
    }

    #[test]
    fn test_unknown_status_rejected() {
        let mut buf = BytesMut::new();
        buf.put_slice(&[0, 0]);
        buf.put_u16(17);
        buf.put_i32(0);
        let result = ClientCodec::new().decode(&mut buf);
        assert!(matches!(result, Err(CodecError::UnknownStatus(17))));
    }

    #[test]
    fn test_back_to_back_responses() {
        let mut buf = BytesMut::new();
        let mut enc = ServerCodec::new();
        enc.encode(Response::ok_int(1), &mut buf).unwrap();
        enc.encode(Response::ok_data(Bytes::from_static(b"abc")), &mut buf).unwrap();

        let mut dec = ClientCodec::new();
        assert_eq!(dec.decode(&mut buf).unwrap().unwrap().int_at(0), Some(1));
        assert_eq!(&dec.decode(&mut buf).unwrap().unwrap().body[..], b"abc");
        assert!(dec.decode(&mut buf).unwrap().is_none());
    }
}
