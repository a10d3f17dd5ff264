//! Request header and typed body views
//!
//! Every request is a 24-byte header (`streamid[2] requestid body[16]
//! dlen`) followed by `dlen` payload bytes. The 16-byte body is read
//! through one of the typed views below depending on the request id.

use bytes::Bytes;

use crate::codes::{RequestId, Role};

/// Size of the fixed request header
pub const REQUEST_HEADER_LEN: usize = 24;

/// Size of the request body area inside the header
pub const BODY_LEN: usize = 16;

/// Two-byte stream identifier echoed back in every response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StreamId(pub [u8; 2]);

impl StreamId {
    pub fn from_u16(v: u16) -> Self {
        Self(v.to_be_bytes())
    }

    pub fn as_u16(self) -> u16 {
        u16::from_be_bytes(self.0)
    }
}

/// A decoded request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub stream_id: StreamId,
    /// Raw request id; unknown ids are kept so they can be reported
    pub request_id: u16,
    pub body: [u8; BODY_LEN],
    pub payload: Bytes,
}

impl Request {
    pub fn new(
        stream_id: StreamId,
        id: RequestId,
        body: [u8; BODY_LEN],
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            stream_id,
            request_id: id.as_u16(),
            body,
            payload: payload.into(),
        }
    }

    /// Known request id, or the raw value if unknown
    pub fn id(&self) -> Result<RequestId, u16> {
        RequestId::try_from(self.request_id)
    }

    pub fn login(&self) -> LoginBody {
        LoginBody::decode(&self.body)
    }

    pub fn proof(&self) -> ProofBody {
        ProofBody::decode(&self.body)
    }

    pub fn sendrcv(&self) -> SendRcvBody {
        SendRcvBody::decode(&self.body)
    }

    pub fn interrupt(&self) -> InterruptBody {
        InterruptBody::decode(&self.body)
    }

    pub fn readbuf(&self) -> ReadBufBody {
        ReadBufBody::decode(&self.body)
    }

    pub fn auth(&self) -> AuthBody {
        AuthBody::decode(&self.body)
    }

    /// Payload as text, stopping at the first NUL
    pub fn payload_str(&self) -> String {
        let end = self
            .payload
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(self.payload.len());
        String::from_utf8_lossy(&self.payload[..end]).into_owned()
    }
}

fn read_i32(b: &[u8], at: usize) -> i32 {
    i32::from_be_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

fn write_i32(b: &mut [u8], at: usize, v: i32) {
    b[at..at + 4].copy_from_slice(&v.to_be_bytes());
}

/// Login body: `pid username[8] reserved[2] capver role`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoginBody {
    pub pid: i32,
    pub username: [u8; 8],
    pub reserved: [u8; 2],
    pub capver: u8,
    pub role: u8,
}

/// Username marker meaning "read the user from the payload"
pub const USER_IN_PAYLOAD: &str = "?>buf";

impl LoginBody {
    pub fn decode(b: &[u8; BODY_LEN]) -> Self {
        let mut username = [0u8; 8];
        username.copy_from_slice(&b[4..12]);
        Self {
            pid: read_i32(b, 0),
            username,
            reserved: [b[12], b[13]],
            capver: b[14],
            role: b[15],
        }
    }

    pub fn encode(&self) -> [u8; BODY_LEN] {
        let mut b = [0u8; BODY_LEN];
        write_i32(&mut b, 0, self.pid);
        b[4..12].copy_from_slice(&self.username);
        b[12..14].copy_from_slice(&self.reserved);
        b[14] = self.capver;
        b[15] = self.role;
        b
    }

    /// Build a login body; the user name is truncated to 8 bytes
    pub fn new(pid: i32, user: &str, role: Role, capver: u8, reserved: i16) -> Self {
        let mut username = [0u8; 8];
        let n = user.len().min(8);
        username[..n].copy_from_slice(&user.as_bytes()[..n]);
        Self {
            pid,
            username,
            reserved: reserved.to_be_bytes(),
            capver,
            role: role.as_byte(),
        }
    }

    pub fn username_str(&self) -> String {
        let end = self.username.iter().position(|b| *b == 0).unwrap_or(8);
        String::from_utf8_lossy(&self.username[..end]).into_owned()
    }

    /// The two reserved bytes as a signed short (session id or client version)
    pub fn reserved_i16(&self) -> i16 {
        i16::from_be_bytes(self.reserved)
    }

    pub fn role(&self) -> Option<Role> {
        Role::from_byte(self.role)
    }
}

/// Generic session body: `sid int1 int2 int3`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProofBody {
    pub sid: i32,
    pub int1: i32,
    pub int2: i32,
    pub int3: i32,
}

impl ProofBody {
    pub fn decode(b: &[u8; BODY_LEN]) -> Self {
        Self {
            sid: read_i32(b, 0),
            int1: read_i32(b, 4),
            int2: read_i32(b, 8),
            int3: read_i32(b, 12),
        }
    }

    pub fn encode(&self) -> [u8; BODY_LEN] {
        let mut b = [0u8; BODY_LEN];
        write_i32(&mut b, 0, self.sid);
        write_i32(&mut b, 4, self.int1);
        write_i32(&mut b, 8, self.int2);
        write_i32(&mut b, 12, self.int3);
        b
    }
}

/// SendMsg/Ping body: `sid opt cid reserved[4]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SendRcvBody {
    pub sid: i32,
    pub opt: i32,
    pub cid: i32,
}

impl SendRcvBody {
    pub fn decode(b: &[u8; BODY_LEN]) -> Self {
        Self {
            sid: read_i32(b, 0),
            opt: read_i32(b, 4),
            cid: read_i32(b, 8),
        }
    }

    pub fn encode(&self) -> [u8; BODY_LEN] {
        let mut b = [0u8; BODY_LEN];
        write_i32(&mut b, 0, self.sid);
        write_i32(&mut b, 4, self.opt);
        write_i32(&mut b, 8, self.cid);
        b
    }
}

/// Interrupt body: `sid type reserved[8]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InterruptBody {
    pub sid: i32,
    pub kind: i32,
}

impl InterruptBody {
    pub fn decode(b: &[u8; BODY_LEN]) -> Self {
        Self {
            sid: read_i32(b, 0),
            kind: read_i32(b, 4),
        }
    }

    pub fn encode(&self) -> [u8; BODY_LEN] {
        let mut b = [0u8; BODY_LEN];
        write_i32(&mut b, 0, self.sid);
        write_i32(&mut b, 4, self.kind);
        b
    }
}

/// ReadBuffer body: `ofs:i64 len int1`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadBufBody {
    pub ofs: i64,
    pub len: i32,
    /// 0 plain read, 1 keep lines matching, 2 drop lines matching
    pub int1: i32,
}

impl ReadBufBody {
    pub fn decode(b: &[u8; BODY_LEN]) -> Self {
        let mut ofs = [0u8; 8];
        ofs.copy_from_slice(&b[0..8]);
        Self {
            ofs: i64::from_be_bytes(ofs),
            len: read_i32(b, 8),
            int1: read_i32(b, 12),
        }
    }

    pub fn encode(&self) -> [u8; BODY_LEN] {
        let mut b = [0u8; BODY_LEN];
        b[0..8].copy_from_slice(&self.ofs.to_be_bytes());
        write_i32(&mut b, 8, self.len);
        write_i32(&mut b, 12, self.int1);
        b
    }
}

/// Auth body: `reserved[12] credtype[4]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AuthBody {
    pub cred_type: [u8; 4],
}

impl AuthBody {
    pub fn decode(b: &[u8; BODY_LEN]) -> Self {
        let mut cred_type = [0u8; 4];
        cred_type.copy_from_slice(&b[12..16]);
        Self { cred_type }
    }

    pub fn encode(&self) -> [u8; BODY_LEN] {
        let mut b = [0u8; BODY_LEN];
        b[12..16].copy_from_slice(&self.cred_type);
        b
    }

    pub fn cred_type_str(&self) -> String {
        let end = self.cred_type.iter().position(|b| *b == 0).unwrap_or(4);
        String::from_utf8_lossy(&self.cred_type[..end]).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== Login Body Tests ====================

    #[test]
    fn test_login_body_layout() {
        let body = LoginBody::new(1234, "alice", Role::TopMaster, 16, 7).encode();
        assert_eq!(&body[0..4], &1234i32.to_be_bytes());
        assert_eq!(&body[4..9], b"alice");
        assert_eq!(body[9], 0);
        assert_eq!(&body[12..14], &7i16.to_be_bytes());
        assert_eq!(body[14], 16);
        assert_eq!(body[15], b'M');
    }

    #[test]
    fn test_login_body_accessors() {
        let body = LoginBody::decode(&LoginBody::new(1, "verylongname", Role::Internal, 3, -1).encode());
        assert_eq!(body.username_str(), "verylong");
        assert_eq!(body.reserved_i16(), -1);
        assert_eq!(body.role(), Some(Role::Internal));
    }

    #[test]
    fn test_login_unknown_role() {
        let mut body = LoginBody::new(1, "bob", Role::Worker, 1, 0);
        body.role = b'?';
        assert_eq!(body.role(), None);
    }

    // ==================== Session Body Tests ====================

    #[test]
    fn test_proof_body_layout() {
        let body = ProofBody { sid: 2, int1: -1, int2: 3, int3: 4 }.encode();
        assert_eq!(&body[0..4], &[0, 0, 0, 2]);
        assert_eq!(&body[4..8], &[0xff, 0xff, 0xff, 0xff]);
        assert_eq!(ProofBody::decode(&body).int3, 4);
    }

    #[test]
    fn test_readbuf_negative_offset() {
        let body = ReadBufBody { ofs: -100, len: 50, int1: 2 };
        let decoded = ReadBufBody::decode(&body.encode());
        assert_eq!(decoded, body);
    }

    #[test]
    fn test_auth_cred_type() {
        let body = AuthBody { cred_type: *b"pwd\0" };
        assert_eq!(AuthBody::decode(&body.encode()).cred_type_str(), "pwd");
    }

    // ==================== Request Tests ====================

    #[test]
    fn test_request_unknown_id() {
        let mut req = Request::new(StreamId::from_u16(1), RequestId::Ping, [0; 16], Bytes::new());
        req.request_id = 9999;
        assert_eq!(req.id(), Err(9999));
    }

    #[test]
    fn test_payload_str_stops_at_nul() {
        let req = Request::new(
            StreamId::default(),
            RequestId::Admin,
            [0; 16],
            Bytes::from_static(b"tag\0junk"),
        );
        assert_eq!(req.payload_str(), "tag");
    }

    #[test]
    fn test_stream_id_u16() {
        assert_eq!(StreamId::from_u16(0x0102).0, [1, 2]);
        assert_eq!(StreamId([1, 2]).as_u16(), 0x0102);
    }
}
