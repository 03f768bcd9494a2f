// Mux.Cool frame codec. Wire format:
//   [u16 metadata_len][metadata][u16 data_len][data]   (data iff option bit 0)
// Metadata leads with [u16 sub_id][u8 status][u8 option]; New frames append
// [u8 network][u16 port][u8 addr_type][addr] and may trail an 8-byte XUDP
// GlobalID, Keep frames may repeat the address tuple for UDP.

use std::net::{Ipv4Addr, Ipv6Addr};

use bytes::{BufMut, BytesMut};

use crate::address::{Address, NetLocation};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MuxStatus {
    New = 0x01,
    Keep = 0x02,
    End = 0x03,
    KeepAlive = 0x04,
}

impl TryFrom<u8> for MuxStatus {
    type Error = std::io::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(MuxStatus::New),
            0x02 => Ok(MuxStatus::Keep),
            0x03 => Ok(MuxStatus::End),
            0x04 => Ok(MuxStatus::KeepAlive),
            other => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid mux status: {}", other),
            )),
        }
    }
}

pub const OPTION_DATA: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MuxNetwork {
    Tcp = 0x01,
    Udp = 0x02,
}

impl TryFrom<u8> for MuxNetwork {
    type Error = std::io::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(MuxNetwork::Tcp),
            0x02 => Ok(MuxNetwork::Udp),
            other => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid mux network: {}", other),
            )),
        }
    }
}

/// One parsed frame. `data` borrows from the input buffer; nothing is
/// copied until the engine decides it has to queue.
#[derive(Debug)]
pub struct MuxFrame<'a> {
    pub id: u16,
    pub status: MuxStatus,
    pub option: u8,
    pub network: Option<MuxNetwork>,
    pub target: Option<NetLocation>,
    pub data: Option<&'a [u8]>,
    /// Total encoded length, including both length prefixes.
    pub frame_len: usize,
}

impl MuxFrame<'_> {
    pub fn has_data(&self) -> bool {
        self.option & OPTION_DATA != 0
    }
}

/// Parse one frame from the head of `buf`.
///
/// `Ok(None)` means the buffer holds less than one complete frame and the
/// caller should wait for more bytes. Errors are protocol violations that
/// terminate parsing on this tunnel.
pub fn parse_frame(buf: &[u8]) -> std::io::Result<Option<MuxFrame<'_>>> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let metadata_len = ((buf[0] as usize) << 8) | (buf[1] as usize);
    if metadata_len < 4 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("mux metadata too short: {}", metadata_len),
        ));
    }
    if buf.len() < 2 + metadata_len {
        return Ok(None);
    }

    let metadata = &buf[2..2 + metadata_len];
    let id = ((metadata[0] as u16) << 8) | (metadata[1] as u16);
    let status = MuxStatus::try_from(metadata[2])?;
    let option = metadata[3];

    let mut network = None;
    let mut target = None;
    let extra = &metadata[4..];

    match status {
        MuxStatus::New => {
            let (net, location, _used) = parse_target(extra)?;
            network = Some(net);
            target = Some(location);
            // Anything after the address tuple (XUDP GlobalID, padding)
            // is skipped, not rejected.
        }
        MuxStatus::Keep => {
            // Keep frames only carry a target when they re-state a UDP
            // destination; the leading network byte disambiguates.
            if !extra.is_empty() && extra[0] == MuxNetwork::Udp as u8 {
                let (net, location, _used) = parse_target(extra)?;
                network = Some(net);
                target = Some(location);
            }
        }
        MuxStatus::End | MuxStatus::KeepAlive => {}
    }

    let mut frame_len = 2 + metadata_len;
    let mut data = None;
    if option & OPTION_DATA != 0 {
        let rest = &buf[frame_len..];
        if rest.len() < 2 {
            return Ok(None);
        }
        let data_len = ((rest[0] as usize) << 8) | (rest[1] as usize);
        if rest.len() < 2 + data_len {
            return Ok(None);
        }
        data = Some(&buf[frame_len + 2..frame_len + 2 + data_len]);
        frame_len += 2 + data_len;
    }

    Ok(Some(MuxFrame {
        id,
        status,
        option,
        network,
        target,
        data,
        frame_len,
    }))
}

/// Parse [network][port][addr_type][addr] out of frame metadata. The
/// metadata section is complete by the time this runs, so running short
/// here is malformed input rather than a need for more bytes.
fn parse_target(extra: &[u8]) -> std::io::Result<(MuxNetwork, NetLocation, usize)> {
    if extra.len() < 4 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "mux target truncated",
        ));
    }
    let network = MuxNetwork::try_from(extra[0])?;
    let port = ((extra[1] as u16) << 8) | (extra[2] as u16);
    let addr_type = extra[3];
    let mut used = 4;

    let address = match addr_type {
        0x01 => {
            let octets = extra.get(used..used + 4).ok_or_else(truncated)?;
            used += 4;
            Address::Ipv4(Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]))
        }
        0x02 => {
            let &len = extra.get(used).ok_or_else(truncated)?;
            used += 1;
            if len == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "empty mux address",
                ));
            }
            let bytes = extra.get(used..used + len as usize).ok_or_else(truncated)?;
            used += len as usize;
            let s = std::str::from_utf8(bytes).map_err(|e| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("failed to decode mux address: {}", e),
                )
            })?;
            Address::from(s)?
        }
        0x03 => {
            let octets = extra.get(used..used + 16).ok_or_else(truncated)?;
            used += 16;
            let mut raw = [0u8; 16];
            raw.copy_from_slice(octets);
            Address::Ipv6(Ipv6Addr::from(raw))
        }
        other => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid mux address type: {}", other),
            ));
        }
    };

    Ok((network, NetLocation::new(address, port), used))
}

fn truncated() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, "mux target truncated")
}

/// Keep frame for `id`; the data option bit is set iff `data` is
/// non-empty.
pub fn encode_keep(id: u16, data: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(8 + data.len());
    buf.put_u16(4);
    buf.put_u16(id);
    buf.put_u8(MuxStatus::Keep as u8);
    if data.is_empty() {
        buf.put_u8(0);
    } else {
        buf.put_u8(OPTION_DATA);
        buf.put_u16(data.len() as u16);
        buf.put_slice(data);
    }
    buf.to_vec()
}

pub fn encode_end(id: u16) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(6);
    buf.put_u16(4);
    buf.put_u16(id);
    buf.put_u8(MuxStatus::End as u8);
    buf.put_u8(0);
    buf.to_vec()
}

/// The sub-id of a keep-alive is meaningless; any value goes.
pub fn encode_keep_alive() -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(6);
    buf.put_u16(4);
    buf.put_u16(rand::random::<u16>());
    buf.put_u8(MuxStatus::KeepAlive as u8);
    buf.put_u8(0);
    buf.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_frame_bytes(id: u16, port: u16, addr: [u8; 4], data: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u16(12);
        buf.put_u16(id);
        buf.put_u8(MuxStatus::New as u8);
        buf.put_u8(if data.is_empty() { 0 } else { OPTION_DATA });
        buf.put_u8(MuxNetwork::Tcp as u8);
        buf.put_u16(port);
        buf.put_u8(0x01);
        buf.put_slice(&addr);
        if !data.is_empty() {
            buf.put_u16(data.len() as u16);
            buf.put_slice(data);
        }
        buf.to_vec()
    }

    #[test]
    fn test_parse_new_tcp_with_data() {
        let bytes = new_frame_bytes(7, 443, [1, 1, 1, 1], b"ABC");
        let frame = parse_frame(&bytes).unwrap().unwrap();
        assert_eq!(frame.id, 7);
        assert_eq!(frame.status, MuxStatus::New);
        assert_eq!(frame.network, Some(MuxNetwork::Tcp));
        let target = frame.target.unwrap();
        assert_eq!(target.port(), 443);
        assert_eq!(target.address().to_string(), "1.1.1.1");
        assert_eq!(frame.data, Some(&b"ABC"[..]));
        assert_eq!(frame.frame_len, bytes.len());
    }

    #[test]
    fn test_parse_back_to_back_frames() {
        let mut bytes = new_frame_bytes(7, 443, [1, 1, 1, 1], b"ABC");
        bytes.extend_from_slice(&encode_keep(7, b"XYZ"));
        bytes.extend_from_slice(&encode_end(7));

        let first = parse_frame(&bytes).unwrap().unwrap();
        assert_eq!(first.status, MuxStatus::New);
        let rest = &bytes[first.frame_len..];

        let second = parse_frame(rest).unwrap().unwrap();
        assert_eq!(second.status, MuxStatus::Keep);
        assert_eq!(second.data, Some(&b"XYZ"[..]));
        let rest = &rest[second.frame_len..];

        let third = parse_frame(rest).unwrap().unwrap();
        assert_eq!(third.status, MuxStatus::End);
        assert_eq!(third.frame_len, rest.len());
    }

    #[test]
    fn test_keep_round_trip() {
        let bytes = encode_keep(42, b"payload");
        let frame = parse_frame(&bytes).unwrap().unwrap();
        assert_eq!(frame.id, 42);
        assert_eq!(frame.status, MuxStatus::Keep);
        assert!(frame.has_data());
        assert_eq!(frame.data, Some(&b"payload"[..]));
        assert_eq!(frame.frame_len, bytes.len());
    }

    #[test]
    fn test_keep_without_data_has_no_option_bit() {
        let bytes = encode_keep(42, b"");
        let frame = parse_frame(&bytes).unwrap().unwrap();
        assert!(!frame.has_data());
        assert_eq!(frame.data, None);
        assert_eq!(bytes.len(), 6);
    }

    #[test]
    fn test_end_round_trip() {
        let bytes = encode_end(9);
        let frame = parse_frame(&bytes).unwrap().unwrap();
        assert_eq!(frame.id, 9);
        assert_eq!(frame.status, MuxStatus::End);
        assert_eq!(frame.frame_len, 6);
    }

    #[test]
    fn test_keep_alive_round_trip() {
        let bytes = encode_keep_alive();
        let frame = parse_frame(&bytes).unwrap().unwrap();
        assert_eq!(frame.status, MuxStatus::KeepAlive);
        assert_eq!(frame.frame_len, bytes.len());
    }

    #[test]
    fn test_incomplete_is_none() {
        assert!(parse_frame(&[]).unwrap().is_none());
        assert!(parse_frame(&[0x00]).unwrap().is_none());
        // Complete length prefix, truncated metadata.
        assert!(parse_frame(&[0x00, 0x04, 0x00]).unwrap().is_none());
    }

    #[test]
    fn test_data_bit_with_truncated_data_is_none() {
        let bytes = encode_keep(1, b"0123456789");
        assert!(parse_frame(&bytes[..bytes.len() - 3]).unwrap().is_none());
        // Metadata complete but data length prefix cut off.
        assert!(parse_frame(&bytes[..7]).unwrap().is_none());
    }

    #[test]
    fn test_metadata_too_short_is_error() {
        assert!(parse_frame(&[0x00, 0x02, 0x00, 0x01]).is_err());
    }

    #[test]
    fn test_unknown_status_is_error() {
        assert!(parse_frame(&[0x00, 0x04, 0x00, 0x01, 0x09, 0x00]).is_err());
    }

    #[test]
    fn test_new_with_global_id_suffix() {
        let mut buf = BytesMut::new();
        buf.put_u16(20);
        buf.put_u16(123);
        buf.put_u8(MuxStatus::New as u8);
        buf.put_u8(0);
        buf.put_u8(MuxNetwork::Udp as u8);
        buf.put_u16(53);
        buf.put_u8(0x01);
        buf.put_slice(&[8, 8, 8, 8]);
        buf.put_slice(&[1, 2, 3, 4, 5, 6, 7, 8]); // GlobalID

        let frame = parse_frame(&buf).unwrap().unwrap();
        assert_eq!(frame.id, 123);
        assert_eq!(frame.network, Some(MuxNetwork::Udp));
        assert_eq!(frame.target.unwrap().port(), 53);
        assert_eq!(frame.frame_len, buf.len());
    }

    #[test]
    fn test_keep_with_udp_target() {
        let mut buf = BytesMut::new();
        buf.put_u16(12);
        buf.put_u16(99);
        buf.put_u8(MuxStatus::Keep as u8);
        buf.put_u8(0);
        buf.put_u8(MuxNetwork::Udp as u8);
        buf.put_u16(1234);
        buf.put_u8(0x01);
        buf.put_slice(&[192, 168, 1, 1]);

        let frame = parse_frame(&buf).unwrap().unwrap();
        assert_eq!(frame.network, Some(MuxNetwork::Udp));
        assert_eq!(frame.target.unwrap().port(), 1234);
    }

    #[test]
    fn test_keep_with_tcp_network_byte_skips_target() {
        let mut buf = BytesMut::new();
        buf.put_u16(12);
        buf.put_u16(50);
        buf.put_u8(MuxStatus::Keep as u8);
        buf.put_u8(0);
        buf.put_u8(MuxNetwork::Tcp as u8);
        buf.put_u16(443);
        buf.put_u8(0x01);
        buf.put_slice(&[1, 2, 3, 4]);

        let frame = parse_frame(&buf).unwrap().unwrap();
        assert!(frame.network.is_none());
        assert!(frame.target.is_none());
        assert_eq!(frame.frame_len, buf.len());
    }

    #[test]
    fn test_domain_target() {
        let domain = b"example.com";
        let mut buf = BytesMut::new();
        buf.put_u16(4 + 4 + 1 + domain.len() as u16);
        buf.put_u16(1);
        buf.put_u8(MuxStatus::New as u8);
        buf.put_u8(0);
        buf.put_u8(MuxNetwork::Tcp as u8);
        buf.put_u16(80);
        buf.put_u8(0x02);
        buf.put_u8(domain.len() as u8);
        buf.put_slice(domain);

        let frame = parse_frame(&buf).unwrap().unwrap();
        assert_eq!(frame.target.unwrap().address().to_string(), "example.com");
    }
}
