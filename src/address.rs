use crate::error::DecodeError;
use std::fmt;
use std::net::Ipv4Addr;

/// Destination represents the DST.ADDR of a connect request:
/// an IPv4 literal or a domain name still to be resolved
#[derive(Debug, Clone, PartialEq)]
pub enum Destination {
    IPv4(Ipv4Addr),
    DomainName(String),
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::IPv4(ip) => write!(f, "{ip}"),
            Destination::DomainName(name) => write!(f, "{name}"),
        }
    }
}

/// parse_ipv4_address parses an IPv4 address and port from a byte slice,
/// advancing offset past both
pub fn parse_ipv4_address(
    data: &[u8],
    offset: &mut usize,
) -> Result<(Destination, u16), DecodeError> {
    // Ensure we have enough data for an IPv4 address + port (6 bytes)
    if *offset + 6 > data.len() {
        return Err(DecodeError::Incomplete);
    }

    // Grab IP bytes
    let ip = Ipv4Addr::new(
        data[*offset],
        data[*offset + 1],
        data[*offset + 2],
        data[*offset + 3],
    );

    // Push offset past address -> 4 bytes
    *offset += 4;

    let port = parse_port(data, offset);

    Ok((Destination::IPv4(ip), port))
}

/// parse_domain_address parses a length-prefixed domain and port from a
/// byte slice, advancing offset past both
pub fn parse_domain_address(
    data: &[u8],
    offset: &mut usize,
) -> Result<(Destination, u16), DecodeError> {
    // Ensure there are bytes to read
    if *offset + 1 > data.len() {
        return Err(DecodeError::Incomplete);
    }

    // First octet of DST.ADDR holds the number of octets to follow
    let domain_len = data[*offset] as usize;

    if domain_len == 0 {
        return Err(DecodeError::InvalidDomain(
            "domain length cannot be 0".into(),
        ));
    }

    if *offset + 1 + domain_len + 2 > data.len() {
        return Err(DecodeError::Incomplete);
    }

    // Push offset to start of domain
    *offset += 1;

    let domain = std::str::from_utf8(&data[*offset..*offset + domain_len])
        .map_err(|e| DecodeError::InvalidDomain(e.to_string()))?
        .to_string();

    // Push offset -> domain_len bytes
    *offset += domain_len;

    let port = parse_port(data, offset);

    Ok((Destination::DomainName(domain), port))
}

// Caller guarantees two bytes are available at offset
fn parse_port(data: &[u8], offset: &mut usize) -> u16 {
    // Grab port -> BigEndian (network order)
    let port = u16::from_be_bytes([data[*offset], data[*offset + 1]]);
    *offset += 2;
    port
}
