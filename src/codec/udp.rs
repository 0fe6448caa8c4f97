//! UDP header decode/serialize with pseudo-header checksum (§4.1).

use std::net::IpAddr;

use super::checksum::checksum_over;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub length: u16,
}

impl UdpHeader {
    pub const LEN: usize = 8;

    pub fn parse(bytes: &[u8]) -> Option<(Self, usize)> {
        if bytes.len() < Self::LEN {
            return None;
        }
        Some((
            UdpHeader {
                src_port: u16::from_be_bytes([bytes[0], bytes[1]]),
                dst_port: u16::from_be_bytes([bytes[2], bytes[3]]),
                length: u16::from_be_bytes([bytes[4], bytes[5]]),
            },
            Self::LEN,
        ))
    }

    /// Serializes and recomputes the checksum over the IP pseudo-header plus
    /// this segment; `src`/`dst` must be the same protocol version.
    pub fn serialize(&self, src: IpAddr, dst: IpAddr, payload: &[u8]) -> Vec<u8> {
        let length = (Self::LEN + payload.len()) as u16;
        let mut out = vec![0u8; Self::LEN];
        out[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        out[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        out[4..6].copy_from_slice(&length.to_be_bytes());

        let pseudo = pseudo_header(src, dst, 17, length as u32);
        let checksum = checksum_over(&[&pseudo, &out, payload]);
        out[6..8].copy_from_slice(&checksum.to_be_bytes());
        out
    }
}

pub(super) fn pseudo_header(src: IpAddr, dst: IpAddr, protocol: u8, upper_len: u32) -> Vec<u8> {
    match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            let mut out = Vec::with_capacity(12);
            out.extend_from_slice(&s.octets());
            out.extend_from_slice(&d.octets());
            out.push(0);
            out.push(protocol);
            out.extend_from_slice(&(upper_len as u16).to_be_bytes());
            out
        }
        (IpAddr::V6(s), IpAddr::V6(d)) => {
            let mut out = Vec::with_capacity(40);
            out.extend_from_slice(&s.octets());
            out.extend_from_slice(&d.octets());
            out.extend_from_slice(&upper_len.to_be_bytes());
            out.extend_from_slice(&[0, 0, 0]);
            out.push(protocol);
            out
        }
        _ => Vec::new(),
    }
}
