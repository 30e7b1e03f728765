#![deny(unsafe_code)]

//! Wire-level records for the perch coordination protocol.
//!
//! Everything on the wire is a Jute record: big-endian integers, booleans as
//! one byte, strings and buffers as a length-prefixed run of bytes, vectors as
//! a count-prefixed run of elements. Each record is carried inside a
//! `[len: u32 big-endian][payload]` frame (see [`frame`]).

mod codec;
pub mod frame;
mod records;

pub use codec::{Decode, DecodeError, Encode, Reader};
pub use records::*;

/// Reserved xids, recognizable on the reply path.
///
/// User-assigned xids are `>= 1`; everything negative belongs to the
/// protocol. The connect request carries no header (and so no xid) at all.
pub mod xid {
    /// Server-initiated watch notification.
    pub const NOTIFICATION: i32 = -1;
    /// Keep-alive ping.
    pub const PING: i32 = -2;
    /// Authentication packet.
    pub const AUTH: i32 = -4;
    /// Watch re-registration after reconnect.
    pub const SET_WATCHES: i32 = -8;
}

/// Request operation codes.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Notification = 0,
    Create = 1,
    Delete = 2,
    Exists = 3,
    GetData = 4,
    SetData = 5,
    GetAcl = 6,
    SetAcl = 7,
    GetChildren = 8,
    Sync = 9,
    Ping = 11,
    GetChildren2 = 12,
    Auth = 100,
    SetWatches = 101,
    CloseSession = -11,
    Error = -1,
}

impl OpCode {
    /// The on-wire code.
    pub const fn code(self) -> i32 {
        self as i32
    }
}

impl std::fmt::Display for OpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Server result codes carried in [`ReplyHeader::err`].
///
/// Codes the server invents that we do not know about are passed through to
/// callers untouched as raw `i32`s; this enum names the ones the engine
/// itself branches on plus the common domain errors.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Ok = 0,
    SystemError = -1,
    RuntimeInconsistency = -2,
    DataInconsistency = -3,
    ConnectionLoss = -4,
    MarshallingError = -5,
    Unimplemented = -6,
    OperationTimeout = -7,
    BadArguments = -8,
    ApiError = -100,
    NoNode = -101,
    NoAuth = -102,
    BadVersion = -103,
    NoChildrenForEphemerals = -108,
    NodeExists = -110,
    NotEmpty = -111,
    SessionExpired = -112,
    InvalidCallback = -113,
    InvalidAcl = -114,
    AuthFailed = -115,
}

impl ErrorCode {
    /// The on-wire code.
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Map a wire code back to a known variant, if any.
    pub fn from_code(code: i32) -> Option<Self> {
        use ErrorCode::*;
        Some(match code {
            0 => Ok,
            -1 => SystemError,
            -2 => RuntimeInconsistency,
            -3 => DataInconsistency,
            -4 => ConnectionLoss,
            -5 => MarshallingError,
            -6 => Unimplemented,
            -7 => OperationTimeout,
            -8 => BadArguments,
            -100 => ApiError,
            -101 => NoNode,
            -102 => NoAuth,
            -103 => BadVersion,
            -108 => NoChildrenForEphemerals,
            -110 => NodeExists,
            -111 => NotEmpty,
            -112 => SessionExpired,
            -113 => InvalidCallback,
            -114 => InvalidAcl,
            -115 => AuthFailed,
            _ => return None,
        })
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?} ({})", self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_round_trip() {
        for code in [0, -4, -101, -110, -111, -103, -112, -115] {
            let ec = ErrorCode::from_code(code).unwrap();
            assert_eq!(ec.code(), code);
        }
        assert_eq!(ErrorCode::from_code(-999), None);
    }

    #[test]
    fn reserved_xids_are_negative_and_distinct() {
        let xids = [xid::NOTIFICATION, xid::PING, xid::AUTH, xid::SET_WATCHES];
        for x in xids {
            assert!(x < 0);
        }
        for (i, a) in xids.iter().enumerate() {
            for b in &xids[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
