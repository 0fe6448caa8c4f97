//! IPv4 fragment reassembly (§4.1).
//!
//! Keyed by `(src, dst, identification, protocol)` per RFC 791. Incomplete
//! groups are reaped on a timeout rather than held forever, since a lost
//! final fragment would otherwise leak memory for the life of the process.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use super::ipv4::Ipv4Header;

pub const REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct GroupKey {
    src: Ipv4Addr,
    dst: Ipv4Addr,
    identification: u16,
    protocol: u8,
}

struct Fragment {
    offset_bytes: usize,
    more_fragments: bool,
    data: Vec<u8>,
}

struct Group {
    first_seen: Instant,
    fragments: Vec<Fragment>,
    header_template: Ipv4Header,
}

/// Accumulates IPv4 fragments until a datagram is complete, then hands back
/// the reassembled payload and the header to reconstruct it with.
pub struct Ipv4Reassembler {
    groups: HashMap<GroupKey, Group>,
}

impl Ipv4Reassembler {
    pub fn new() -> Self {
        Self {
            groups: HashMap::new(),
        }
    }

    /// Feeds one fragment in. Returns the reassembled `(header, payload)`
    /// once every offset up to the final fragment has been seen, with no
    /// gaps.
    pub fn push(&mut self, header: &Ipv4Header, payload: &[u8], now: Instant) -> Option<(Ipv4Header, Vec<u8>)> {
        self.reap_expired(now);

        let key = GroupKey {
            src: header.src,
            dst: header.dst,
            identification: header.identification,
            protocol: header.protocol,
        };
        let offset_bytes = header.fragment_offset as usize * 8;

        let group = self.groups.entry(key.clone()).or_insert_with(|| Group {
            first_seen: now,
            fragments: Vec::new(),
            header_template: header.clone(),
        });

        group.fragments.push(Fragment {
            offset_bytes,
            more_fragments: header.more_fragments(),
            data: payload.to_vec(),
        });

        if let Some(reassembled) = try_complete(group) {
            self.groups.remove(&key);
            return Some(reassembled);
        }
        None
    }

    fn reap_expired(&mut self, now: Instant) {
        self.groups
            .retain(|_, g| now.duration_since(g.first_seen) < REASSEMBLY_TIMEOUT);
    }

    pub fn pending_groups(&self) -> usize {
        self.groups.len()
    }
}

impl Default for Ipv4Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

fn try_complete(group: &mut Group) -> Option<(Ipv4Header, Vec<u8>)> {
    let total_len = group
        .fragments
        .iter()
        .find(|f| !f.more_fragments)
        .map(|f| f.offset_bytes + f.data.len())?;

    let mut assembled = vec![0u8; total_len];
    let mut covered = vec![false; total_len];
    for frag in &group.fragments {
        let end = frag.offset_bytes + frag.data.len();
        if end > total_len {
            return None;
        }
        assembled[frag.offset_bytes..end].copy_from_slice(&frag.data);
        for slot in covered.iter_mut().take(end).skip(frag.offset_bytes) {
            *slot = true;
        }
    }

    if covered.iter().all(|c| *c) {
        let mut header = group.header_template.clone();
        header.flags &= !0x1;
        header.fragment_offset = 0;
        Some((header, assembled))
    } else {
        None
    }
}
