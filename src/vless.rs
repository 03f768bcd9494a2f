use std::net::{Ipv4Addr, Ipv6Addr};

use crate::address::{Address, NetLocation};
use crate::uuid_util::format_uuid;

/// Hostname a client uses on a TCP/UDP command to request Mux mode.
pub const MUX_SENTINEL_HOST: &str = "v1.mux.cool";

/// Synthetic address recorded for tunnels opened with the MUX command,
/// which carries no address fields of its own.
pub const MUX_SYNTHETIC_HOST: &str = "mux.cool";

// The smallest complete greeting: version, uuid, opt length, command,
// port, address type, and a one-byte domain with its length prefix.
const MIN_GREETING_LEN: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Tcp,
    Udp,
    Mux,
}

#[derive(Debug, Clone)]
pub struct Greeting {
    pub version: u8,
    /// Canonical lowercase hyphenated form, as authorized.
    pub uuid: String,
    pub command: Command,
    pub location: NetLocation,
    /// 0-based index of the first payload byte.
    pub payload_index: usize,
}

impl Greeting {
    /// Two bytes prepended exactly once to the tunnel's first
    /// server-to-client message.
    pub fn response_prefix(&self) -> [u8; 2] {
        [self.version, 0]
    }

    /// Mux mode is selected either by the MUX command byte or by a
    /// TCP/UDP command addressed at the mux sentinel host.
    pub fn wants_mux(&self) -> bool {
        if self.command == Command::Mux {
            return true;
        }
        matches!(
            self.location.address().hostname(),
            Some(h) if h.eq_ignore_ascii_case(MUX_SENTINEL_HOST)
        )
    }
}

/// Parse the tunnel greeting from an accumulated buffer.
///
/// Returns `Ok(None)` when the buffer does not yet hold a complete
/// greeting (the caller buffers more data), and an error for malformed
/// input or a UUID the validator rejects.
pub fn parse_greeting<F>(buf: &[u8], validator: F) -> std::io::Result<Option<Greeting>>
where
    F: Fn(&str) -> bool,
{
    if buf.len() < MIN_GREETING_LEN {
        return Ok(None);
    }

    let version = buf[0];

    let mut uuid_bytes = [0u8; 16];
    uuid_bytes.copy_from_slice(&buf[1..17]);
    let uuid = format_uuid(&uuid_bytes);
    if !validator(&uuid) {
        return Err(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "Invalid user",
        ));
    }

    let opt_len = buf[17] as usize;
    let mut index = 18 + opt_len;

    let Some(&command_byte) = buf.get(index) else {
        return Ok(None);
    };
    index += 1;

    let command = match command_byte {
        1 => Command::Tcp,
        2 => Command::Udp,
        3 => Command::Mux,
        unknown => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Unsupported command: {}", unknown),
            ));
        }
    };

    if command == Command::Mux {
        // MUX greetings carry no port or address; the payload (the first
        // mux frame) starts immediately after the command byte.
        return Ok(Some(Greeting {
            version,
            uuid,
            command,
            location: NetLocation::new(Address::Hostname(MUX_SYNTHETIC_HOST.to_string()), 0),
            payload_index: index,
        }));
    }

    if buf.len() < index + 3 {
        return Ok(None);
    }
    let port = ((buf[index] as u16) << 8) | (buf[index + 1] as u16);
    let address_type = buf[index + 2];
    index += 3;

    let address = match address_type {
        1 => {
            let Some(octets) = buf.get(index..index + 4) else {
                return Ok(None);
            };
            index += 4;
            Address::Ipv4(Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]))
        }
        2 => {
            let Some(&domain_len) = buf.get(index) else {
                return Ok(None);
            };
            index += 1;
            if domain_len == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "Empty address",
                ));
            }
            let Some(domain_bytes) = buf.get(index..index + domain_len as usize) else {
                return Ok(None);
            };
            index += domain_len as usize;
            let domain = std::str::from_utf8(domain_bytes).map_err(|e| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("Failed to decode address: {}", e),
                )
            })?;
            // Clients pass IP literals in the domain slot too, so sniff
            // rather than taking Hostname at face value.
            Address::from(domain)?
        }
        3 => {
            let Some(octets) = buf.get(index..index + 16) else {
                return Ok(None);
            };
            index += 16;
            let mut segments = [0u16; 8];
            for (i, chunk) in octets.chunks_exact(2).enumerate() {
                segments[i] = ((chunk[0] as u16) << 8) | (chunk[1] as u16);
            }
            Address::Ipv6(Ipv6Addr::new(
                segments[0], segments[1], segments[2], segments[3], segments[4], segments[5],
                segments[6], segments[7],
            ))
        }
        invalid => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Invalid address type: {}", invalid),
            ));
        }
    };

    Ok(Some(Greeting {
        version,
        uuid,
        command,
        location: NetLocation::new(address, port),
        payload_index: index,
    }))
}
