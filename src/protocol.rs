//! Shared protocol constants for the LanShare wire format

use crate::error::ProtocolError;

/// Well-known port for both the TCP file service and UDP announces
pub const DEFAULT_PORT: u16 = 7777;

/// Listen backlog for the TCP service
pub const LISTEN_BACKLOG: i32 = 20;

/// Length of the MD5 content hash carried in list and get frames
pub const HASH_LEN: usize = 16;

// Longest file name accepted on the wire, in UTF-8 bytes (without terminator)
pub const MAX_NAME_LEN: usize = 255;

/// Upper bound for a single announce datagram
pub const MAX_ANNOUNCE_SIZE: usize = 512;

/// Fixed announce prefix: IPv4 (4) | file count (4) | timestamp ms (8)
pub const ANNOUNCE_HEADER_LEN: usize = 16;

/// Chunk size used when streaming file bodies
pub const IO_CHUNK: usize = 64 * 1024;

/// One-byte message tags. Every frame starts with one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    None = 0x00,
    ReqList = 0x01,
    ReqGet = 0x02,
    ReqPut = 0x03,
    RespList = 0x04,
    RespGet = 0x05,
    Error = 0xFF,
}

impl Opcode {
    pub fn from_byte(b: u8) -> Result<Opcode, ProtocolError> {
        match b {
            0x00 => Ok(Opcode::None),
            0x01 => Ok(Opcode::ReqList),
            0x02 => Ok(Opcode::ReqGet),
            0x03 => Ok(Opcode::ReqPut),
            0x04 => Ok(Opcode::RespList),
            0x05 => Ok(Opcode::RespGet),
            0xFF => Ok(Opcode::Error),
            other => Err(ProtocolError::Malformed(format!(
                "unknown opcode 0x{:02x}",
                other
            ))),
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Error codes carried in the body of an `Error` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorCode {
    FileNotFound = 0x01,
    // Reserved; the server never raises it today
    TooManyConnections = 0x02,
    MalformedMessage = 0x03,
    InternalServerError = 0xFF,
}

impl ErrorCode {
    pub fn from_byte(b: u8) -> Result<ErrorCode, ProtocolError> {
        match b {
            0x01 => Ok(ErrorCode::FileNotFound),
            0x02 => Ok(ErrorCode::TooManyConnections),
            0x03 => Ok(ErrorCode::MalformedMessage),
            0xFF => Ok(ErrorCode::InternalServerError),
            other => Err(ProtocolError::Malformed(format!(
                "unknown error code 0x{:02x}",
                other
            ))),
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCode::FileNotFound => "file not found",
            ErrorCode::TooManyConnections => "too many connections",
            ErrorCode::MalformedMessage => "malformed message",
            ErrorCode::InternalServerError => "internal server error",
        };
        f.write_str(s)
    }
}

// Centralized timeout constants shared by the server, client and announcer
pub mod timeouts {
    /// Per-connection socket idle timeout on the server (ms)
    pub const IDLE_MS: u64 = 5_000;

    /// Client-side read/write timeout (ms)
    pub const CLIENT_IO_MS: u64 = 2_000;

    /// Client connection establishment timeout (ms)
    pub const CONNECT_MS: u64 = 2_000;

    /// Interval between announce broadcasts (ms)
    pub const ANNOUNCE_INTERVAL_MS: u64 = 5_000;

    /// Receiver poll interval; bounds how long a stop request can go unnoticed (ms)
    pub const RECEIVER_POLL_MS: u64 = 1_000;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_bytes_are_stable() {
        let all = [
            (Opcode::None, 0x00),
            (Opcode::ReqList, 0x01),
            (Opcode::ReqGet, 0x02),
            (Opcode::ReqPut, 0x03),
            (Opcode::RespList, 0x04),
            (Opcode::RespGet, 0x05),
            (Opcode::Error, 0xFF),
        ];
        for (op, byte) in all {
            assert_eq!(op.as_byte(), byte);
            assert_eq!(Opcode::from_byte(byte).unwrap(), op);
        }
    }

    #[test]
    fn unknown_opcode_is_malformed() {
        for b in [0x06u8, 0x7E, 0xFE] {
            let err = Opcode::from_byte(b).unwrap_err();
            assert_eq!(err.error_code(), Some(ErrorCode::MalformedMessage));
        }
    }

    #[test]
    fn error_code_bytes_are_stable() {
        for code in [
            ErrorCode::FileNotFound,
            ErrorCode::TooManyConnections,
            ErrorCode::MalformedMessage,
            ErrorCode::InternalServerError,
        ] {
            assert_eq!(ErrorCode::from_byte(code.as_byte()).unwrap(), code);
        }
        assert!(ErrorCode::from_byte(0x00).is_err());
        assert!(ErrorCode::from_byte(0x04).is_err());
    }
}
