//! Typed errors for the pure layers of the proxy.
//!
//! The event loop never lets any of these escape: decode errors become
//! SOCKS5 replies, DNS errors become host-unreachable replies, and
//! session errors are logged as internal inconsistencies.

use thiserror::Error;

/// DecodeError describes why a client message could not be decoded
#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    /// More bytes are needed before the message can be decoded
    #[error("incomplete message")]
    Incomplete,

    #[error("unsupported SOCKS version: {0:#04x}")]
    UnsupportedVersion(u8),

    #[error("unsupported command: {0:#04x}")]
    UnsupportedCommand(u8),

    #[error("reserved byte must be 0x00, got {0:#04x}")]
    NonZeroReserved(u8),

    #[error("unsupported address type: {0:#04x}")]
    UnsupportedAddressType(u8),

    #[error("invalid domain name: {0}")]
    InvalidDomain(String),
}

/// DnsError covers query construction and reply parsing failures
#[derive(Debug, Error)]
pub enum DnsError {
    #[error("dns wire format error: {0}")]
    Proto(#[from] hickory_proto::error::ProtoError),

    #[error("dns socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("dns datagram too short to carry an id: {0} bytes")]
    Malformed(usize),

    #[error("no free dns query id")]
    Exhausted,
}

/// SessionError reports misuse of the session table
#[derive(Debug, Error, PartialEq)]
pub enum SessionError {
    #[error("unknown connection")]
    UnknownConnection,

    #[error("connection already bound")]
    AlreadyBound,

    #[error("dns query id {0} already pending")]
    DuplicateQuery(u16),
}
