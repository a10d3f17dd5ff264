//! Numeric codes carried on the wire
//!
//! Request ids, response status words, error codes, asynchronous action
//! codes, admin sub-types, SendMsg option bits and login roles.

use std::fmt;

/// Request identifiers (`requestid` field of the request header)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum RequestId {
    Login = 3101,
    Auth = 3102,
    Create = 3103,
    Destroy = 3104,
    Attach = 3105,
    Detach = 3106,
    SendMsg = 3107,
    Admin = 3108,
    Interrupt = 3109,
    Ping = 3110,
    Cleanup = 3111,
    ReadBuf = 3112,
    Urgent = 3113,
}

impl RequestId {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Lower-case name used in log lines and error messages
    pub fn name(self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::Auth => "auth",
            Self::Create => "create",
            Self::Destroy => "destroy",
            Self::Attach => "attach",
            Self::Detach => "detach",
            Self::SendMsg => "sendmsg",
            Self::Admin => "admin",
            Self::Interrupt => "interrupt",
            Self::Ping => "ping",
            Self::Cleanup => "cleanup",
            Self::ReadBuf => "readbuf",
            Self::Urgent => "urgent",
        }
    }
}

impl TryFrom<u16> for RequestId {
    type Error = u16;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Ok(match value {
            3101 => Self::Login,
            3102 => Self::Auth,
            3103 => Self::Create,
            3104 => Self::Destroy,
            3105 => Self::Attach,
            3106 => Self::Detach,
            3107 => Self::SendMsg,
            3108 => Self::Admin,
            3109 => Self::Interrupt,
            3110 => Self::Ping,
            3111 => Self::Cleanup,
            3112 => Self::ReadBuf,
            3113 => Self::Urgent,
            other => return Err(other),
        })
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Response status word
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ResponseStatus {
    Ok = 0,
    OkSoFar = 4000,
    Attn = 4001,
    AuthMore = 4002,
    Error = 4003,
}

impl ResponseStatus {
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

impl TryFrom<u16> for ResponseStatus {
    type Error = u16;

    fn try_from(value: u16) -> Result<Self, u16> {
        Ok(match value {
            0 => Self::Ok,
            4000 => Self::OkSoFar,
            4001 => Self::Attn,
            4002 => Self::AuthMore,
            4003 => Self::Error,
            other => return Err(other),
        })
    }
}

/// Error codes carried in the body of an `Error` response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    ArgInvalid = 3000,
    ArgMissing = 3001,
    ArgTooLong = 3002,
    FileNotOpen = 3004,
    InvalidRequest = 3006,
    NoMemory = 3008,
    NotAuthorized = 3010,
    NotFound = 3011,
    ServerError = 3012,
    NoSession = 3014,
}

impl ErrorCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        Some(match value {
            3000 => Self::ArgInvalid,
            3001 => Self::ArgMissing,
            3002 => Self::ArgTooLong,
            3004 => Self::FileNotOpen,
            3006 => Self::InvalidRequest,
            3008 => Self::NoMemory,
            3010 => Self::NotAuthorized,
            3011 => Self::NotFound,
            3012 => Self::ServerError,
            3014 => Self::NoSession,
            _ => return None,
        })
    }
}

/// Action codes of asynchronous (`Attn`) messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ActionCode {
    Msg = 5100,
    Stop = 5101,
    MsgSid = 5102,
    SrvMsg = 5103,
    Interrupt = 5104,
    Ping = 5105,
    Urgent = 5106,
    ErrMsg = 5107,
    Flush = 5108,
    Inflate = 5109,
}

impl ActionCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        Some(match value {
            5100 => Self::Msg,
            5101 => Self::Stop,
            5102 => Self::MsgSid,
            5103 => Self::SrvMsg,
            5104 => Self::Interrupt,
            5105 => Self::Ping,
            5106 => Self::Urgent,
            5107 => Self::ErrMsg,
            5108 => Self::Flush,
            5109 => Self::Inflate,
            _ => return None,
        })
    }
}

/// Sub-types of the `Admin` request (`int1` of the proof body)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum AdminType {
    QuerySessions = 1000,
    SessionTag = 1001,
    SessionAlias = 1002,
    GetWorkers = 1003,
    QueryWorkers = 1004,
    CleanupSessions = 1005,
    QueryLogPaths = 1006,
    ReadBuffer = 1007,
    QueryVersions = 1008,
    ChangeDefaultVersion = 1009,
    GroupProperties = 1010,
}

impl AdminType {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        Some(match value {
            1000 => Self::QuerySessions,
            1001 => Self::SessionTag,
            1002 => Self::SessionAlias,
            1003 => Self::GetWorkers,
            1004 => Self::QueryWorkers,
            1005 => Self::CleanupSessions,
            1006 => Self::QueryLogPaths,
            1007 => Self::ReadBuffer,
            1008 => Self::QueryVersions,
            1009 => Self::ChangeDefaultVersion,
            1010 => Self::GroupProperties,
            _ => return None,
        })
    }
}

/// Interrupt type asking a session process to shut down
pub const SHUTDOWN_INTERRUPT: i32 = 3;

/// Server-type selector of the CleanupSessions admin request (`int2`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ServerType {
    Worker = 0,
    /// Superuser request covering every client and session
    All = 1,
    Master = 2,
    TopMaster = 3,
}

impl ServerType {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        Some(match value {
            0 => Self::Worker,
            1 => Self::All,
            2 => Self::Master,
            3 => Self::TopMaster,
            _ => return None,
        })
    }

    /// Server type of a session spawned for `role`
    pub fn of_role(role: Role) -> Option<Self> {
        match role {
            Role::Worker => Some(Self::Worker),
            Role::SubMaster => Some(Self::Master),
            Role::TopMaster => Some(Self::TopMaster),
            Role::Admin | Role::Internal => None,
        }
    }
}

/// Option bits of the `SendMsg` request (`opt` of the sendrcv body)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SendMsgOptions(pub i32);

impl SendMsgOptions {
    pub const EXTERNAL: i32 = 1;
    pub const INTERNAL: i32 = 2;
    pub const FB_PROG: i32 = 4;
    pub const QUERYNUM: i32 = 8;
    pub const STARTPROCESS: i32 = 16;
    pub const SETIDLE: i32 = 32;
    pub const LOGMSG: i32 = 64;
    pub const PROCESS: i32 = 128;

    pub fn contains(self, bit: i32) -> bool {
        self.0 & bit != 0
    }

    pub fn with(self, bit: i32) -> Self {
        Self(self.0 | bit)
    }
}

/// Role a peer announces in its login request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Admin,
    Internal,
    TopMaster,
    SubMaster,
    Worker,
}

impl Role {
    /// Role byte in the login body
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Admin => b'A',
            Self::Internal => b'i',
            Self::TopMaster => b'M',
            Self::SubMaster => b'm',
            Self::Worker => b's',
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            b'A' => Self::Admin,
            b'i' => Self::Internal,
            b'M' => Self::TopMaster,
            b'm' => Self::SubMaster,
            b's' => Self::Worker,
            _ => return None,
        })
    }

    /// Whether a session spawned for this role runs the worker program
    pub fn is_worker(self) -> bool {
        matches!(self, Self::Worker)
    }

    /// Whether this role is a master of some level
    pub fn is_master(self) -> bool {
        matches!(self, Self::TopMaster | Self::SubMaster)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Admin => "admin",
            Self::Internal => "internal",
            Self::TopMaster => "top-master",
            Self::SubMaster => "sub-master",
            Self::Worker => "worker",
        })
    }
}
