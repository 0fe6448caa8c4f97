//! TCP header decode/serialize with pseudo-header checksum (§4.1).
//!
//! Options are carried through opaquely; the datapath never needs to
//! interpret them, only preserve them across rewriting.

use std::net::IpAddr;

use super::checksum::checksum_over;
use super::udp::pseudo_header;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq_num: u32,
    pub ack_num: u32,
    pub flags: u16,
    pub window: u16,
    pub urgent_ptr: u16,
    pub options: Vec<u8>,
}

impl TcpHeader {
    pub const MIN_LEN: usize = 20;

    fn data_offset_words(&self) -> u8 {
        5 + (self.options.len() as u8 + 3) / 4
    }

    pub fn parse(bytes: &[u8]) -> Option<(Self, usize)> {
        if bytes.len() < Self::MIN_LEN {
            return None;
        }
        let data_offset = (bytes[12] >> 4) as usize * 4;
        if data_offset < Self::MIN_LEN || bytes.len() < data_offset {
            return None;
        }
        let flags = (((bytes[12] & 0x0F) as u16) << 8) | bytes[13] as u16;

        Some((
            TcpHeader {
                src_port: u16::from_be_bytes([bytes[0], bytes[1]]),
                dst_port: u16::from_be_bytes([bytes[2], bytes[3]]),
                seq_num: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
                ack_num: u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
                flags,
                window: u16::from_be_bytes([bytes[14], bytes[15]]),
                urgent_ptr: u16::from_be_bytes([bytes[18], bytes[19]]),
                options: bytes[20..data_offset].to_vec(),
            },
            data_offset,
        ))
    }

    pub fn serialize(&self, src: IpAddr, dst: IpAddr, payload: &[u8]) -> Vec<u8> {
        let header_len = self.data_offset_words() as usize * 4;
        let mut out = vec![0u8; header_len];
        out[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        out[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        out[4..8].copy_from_slice(&self.seq_num.to_be_bytes());
        out[8..12].copy_from_slice(&self.ack_num.to_be_bytes());
        out[12] = (self.data_offset_words() << 4) | ((self.flags >> 8) as u8 & 0x0F);
        out[13] = self.flags as u8;
        out[14..16].copy_from_slice(&self.window.to_be_bytes());
        out[18..20].copy_from_slice(&self.urgent_ptr.to_be_bytes());
        out[20..header_len].copy_from_slice(&self.options);

        let segment_len = header_len + payload.len();
        let protocol = if matches!(src, IpAddr::V4(_)) { 6 } else { 6 };
        let pseudo = pseudo_header(src, dst, protocol, segment_len as u32);
        let checksum = checksum_over(&[&pseudo, &out, payload]);
        out[16..18].copy_from_slice(&checksum.to_be_bytes());
        out
    }
}
