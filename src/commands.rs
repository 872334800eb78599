use crate::address::{Destination, parse_domain_address, parse_ipv4_address};
use crate::error::DecodeError;
use crate::protocol::{AddressType, Command, RSV, ReplyCode, Version};
use std::net::{Ipv4Addr, SocketAddrV4};

/// ConnectRequest is a decoded CONNECT request
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectRequest {
    pub destination: Destination,
    pub port: u16,
}

/// decode_connect_request decodes a client request, accepting only CONNECT
/// to an IPv4 literal or a domain name. Returns the request and the number
/// of bytes it occupied
pub fn decode_connect_request(data: &[u8]) -> Result<(ConnectRequest, usize), DecodeError> {
    // SOCKS5 request format
    // +----+-----+-------+------+----------+----------+
    // |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
    // +----+-----+-------+------+----------+----------+
    // | 1  |  1  | X'00' |  1   | Variable |    2     |
    // +----+-----+-------+------+----------+----------+

    if data.len() < 4 {
        return Err(DecodeError::Incomplete);
    }

    let version = data[0];
    let command = data[1];
    let reserved = data[2];
    let atyp = data[3];

    if version != Version::SOCKS5 as u8 {
        return Err(DecodeError::UnsupportedVersion(version));
    }

    if Command::from_byte(command) != Some(Command::Connect) {
        return Err(DecodeError::UnsupportedCommand(command));
    }

    if reserved != RSV {
        return Err(DecodeError::NonZeroReserved(reserved));
    }

    // Set offset -> starts after ATYP
    let mut offset = 4;

    let (destination, port) = match AddressType::from_byte(atyp) {
        Some(AddressType::IPv4) => parse_ipv4_address(data, &mut offset)?,
        Some(AddressType::DomainName) => parse_domain_address(data, &mut offset)?,
        _ => return Err(DecodeError::UnsupportedAddressType(atyp)),
    };

    Ok((ConnectRequest { destination, port }, offset))
}

/// encode_reply builds a server reply with an IPv4 bound address
pub fn encode_reply(reply_code: ReplyCode, bound_addr: SocketAddrV4) -> [u8; 10] {
    // SOCKS5 reply format
    // +----+-----+-------+------+----------+----------+
    // |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
    // +----+-----+-------+------+----------+----------+
    // | 1  |  1  | X'00' |  1   |    4     |    2     |
    // +----+-----+-------+------+----------+----------+

    let [a, b, c, d] = bound_addr.ip().octets();
    let [p1, p2] = bound_addr.port().to_be_bytes();

    [
        Version::SOCKS5 as u8,
        reply_code as u8,
        RSV,
        AddressType::IPv4 as u8,
        a,
        b,
        c,
        d,
        p1,
        p2,
    ]
}

/// encode_failure builds a reply carrying an all-zero bound address
pub fn encode_failure(reply_code: ReplyCode) -> [u8; 10] {
    encode_reply(reply_code, SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
}
