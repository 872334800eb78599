// RSV: Fields marked RESERVED (RSV) must be set to X'00'.
pub const RSV: u8 = 0x00;

/// BUFFER_SIZE bounds a single non-blocking read on any socket
pub const BUFFER_SIZE: usize = 4096;

/// MAX_PENDING_WRITE is the outbound queue size above which the
/// opposite peer stops being read
pub const MAX_PENDING_WRITE: usize = 64 * 1024;

/// MAX_DGRAM is the largest DNS reply accepted from the resolver
pub const MAX_DGRAM: usize = 4096;

/// AddressType represents the SOCKS5 address types:
/// IPv4, Domain Name, IPv6
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AddressType {
    IPv4 = 0x01,
    DomainName = 0x03,
    IPv6 = 0x04,
}

/// AddressType implementation block
impl AddressType {
    /// from_byte converts a byte to its related network address type
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(AddressType::IPv4),
            0x03 => Some(AddressType::DomainName),
            0x04 => Some(AddressType::IPv6),
            _ => None,
        }
    }
}

/// Version represents available SOCKS proxy versions.
/// Only SOCKS5 is spoken here
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Version {
    SOCKS5 = 0x05,
}

/// AuthMethod represents the SOCKS5 authentication methods
/// this proxy can answer with
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AuthMethod {
    NoAuth = 0x00,
    // 0x01 GSSAPI and 0x02 username/password are never selected
    NoAcceptable = 0xFF,
}

/// Command represents SOCKS5 protocol commands
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    Connect = 0x01,
    Bind = 0x02,
    UdpAssociate = 0x03,
}

/// Command implementation block
impl Command {
    /// from_byte converts a byte to its related SOCKS5 protocol command
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Command::Connect),
            0x02 => Some(Command::Bind),
            0x03 => Some(Command::UdpAssociate),
            _ => None,
        }
    }
}

/// ReplyCode lists the only REP values this proxy ever sends
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReplyCode {
    Succeeded = 0x00,
    HostUnreachable = 0x04,
    CommandNotSupported = 0x07,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_type_from_byte() {
        assert_eq!(AddressType::from_byte(0x01), Some(AddressType::IPv4));
        assert_eq!(AddressType::from_byte(0x03), Some(AddressType::DomainName));
        assert_eq!(AddressType::from_byte(0x04), Some(AddressType::IPv6));
        assert_eq!(AddressType::from_byte(0x02), None);
    }

    #[test]
    fn command_from_byte() {
        assert_eq!(Command::from_byte(0x01), Some(Command::Connect));
        assert_eq!(Command::from_byte(0x02), Some(Command::Bind));
        assert_eq!(Command::from_byte(0x03), Some(Command::UdpAssociate));
        assert_eq!(Command::from_byte(0x09), None);
    }
}
