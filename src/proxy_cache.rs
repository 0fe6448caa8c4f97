//! Per-flow conversion cache (§4.2).
//!
//! Keyed two ways so both the egress and ingress pipelines can find a flow's
//! pinned replica in one lookup. Reaping is lazy: a row that no longer points
//! at a live replica is removed the next time something touches it, there is
//! no background sweep.

use dashmap::DashMap;
use std::net::IpAddr;

use crate::model::{ConversionEntry, ForwardKey, ReverseKey};

pub struct ProxyCache {
    by_service: DashMap<ForwardKey, ConversionEntry>,
    by_instance: DashMap<ReverseKey, ConversionEntry>,
}

impl ProxyCache {
    pub fn new() -> Self {
        Self {
            by_service: DashMap::new(),
            by_instance: DashMap::new(),
        }
    }

    /// Egress-side lookup: has this 5-tuple already been pinned to a replica?
    pub fn retrieve_by_service_ip(
        &self,
        srcip: IpAddr,
        src_instance_ip: IpAddr,
        srcport: u16,
        dst_service_ip: IpAddr,
        dstport: u16,
    ) -> Option<ConversionEntry> {
        let key = ForwardKey {
            srcip,
            src_instance_ip,
            srcport,
            dst_service_ip,
            dstport,
        };
        self.by_service.get(&key).map(|e| e.clone())
    }

    /// Ingress-side lookup: does this returning datagram belong to a pinned flow?
    pub fn retrieve_by_instance_ip(
        &self,
        dstip: IpAddr,
        dstport: u16,
        srcport: u16,
    ) -> Option<ConversionEntry> {
        let key = ReverseKey {
            dstip,
            dstport,
            srcport,
        };
        self.by_instance.get(&key).map(|e| e.clone())
    }

    /// Idempotent upsert into both indices.
    pub fn add(&self, entry: ConversionEntry) {
        self.by_service.insert(entry.forward_key(), entry.clone());
        self.by_instance.insert(entry.reverse_key(), entry);
    }

    /// Caller-driven liveness check (§3 invariant): a row is valid only while
    /// its `dstip` still names an active replica NsIP for `dst_service_ip`.
    /// Returns `true` if the entry is still valid; as a side effect, removes
    /// it from both indices when it is not.
    pub fn expire_if_stale(&self, entry: &ConversionEntry, current_replica_ns_ips: &[IpAddr]) -> bool {
        if current_replica_ns_ips.contains(&entry.dstip) {
            return true;
        }
        self.by_service.remove(&entry.forward_key());
        self.by_instance.remove(&entry.reverse_key());
        false
    }
}

impl Default for ProxyCache {
    fn default() -> Self {
        Self::new()
    }
}
