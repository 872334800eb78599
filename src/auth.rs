use crate::error::DecodeError;
use crate::protocol::{AuthMethod, Version};

/// decode_greeting decodes the client's version identifier/method selection
/// message and returns the method the server picks, together with the number
/// of bytes the greeting occupied
pub fn decode_greeting(data: &[u8]) -> Result<(AuthMethod, usize), DecodeError> {
    // ClientHello format
    // +----+----------+----------+
    // |VER | NMETHODS | METHODS  |
    // +----+----------+----------+
    // | 1  |    1     | 1 to 255 |
    // +----+----------+----------+

    let Some(&version) = data.first() else {
        return Err(DecodeError::Incomplete);
    };

    // Ensure version is 0x05 -> SOCKS5
    if version != Version::SOCKS5 as u8 {
        return Err(DecodeError::UnsupportedVersion(version));
    }

    let Some(&n_methods) = data.get(1) else {
        return Err(DecodeError::Incomplete);
    };

    // The method list must be exactly NMETHODS long
    let end = 2 + n_methods as usize;
    if data.len() < end {
        return Err(DecodeError::Incomplete);
    }

    Ok((select_auth_method(&data[2..end]), end))
}

/// select_auth_method returns no-auth when the client offers it,
/// otherwise no-acceptable-method
fn select_auth_method(client_methods: &[u8]) -> AuthMethod {
    if client_methods.contains(&(AuthMethod::NoAuth as u8)) {
        AuthMethod::NoAuth
    } else {
        AuthMethod::NoAcceptable
    }
}

/// encode_method_reply builds the server's method selection message
pub fn encode_method_reply(method: AuthMethod) -> [u8; 2] {
    // ServerChoice method selection reply format
    // +----+--------+
    // |VER | METHOD |
    // +----+--------+
    // | 1  |   1    |
    // +----+--------+
    [Version::SOCKS5 as u8, method as u8]
}
