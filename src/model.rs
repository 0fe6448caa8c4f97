//! Core addressing types shared by the resolver, proxy cache and tunnel engine.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Name of a deployed job, e.g. `"my-app.my-namespace"`.
pub type JobName = String;

/// Distinguishes a `ServiceIP` entry from the replica's own `InstanceIP`
/// entry within a [`TableEntry::service_ip`] list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IpType {
    ServiceIp,
    InstanceNumber,
}

/// One address pair (v4/v6) tagged with its role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceIpEntry {
    pub ip_type: IpType,
    pub address: Ipv4Addr,
    pub address_v6: Ipv6Addr,
}

/// Cluster-provided record binding a replica's addresses to its hosting node.
///
/// Replaced (not merged) wholesale on every refresh — see the resolver's
/// lifecycle invariant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableEntry {
    pub job_name: JobName,
    pub instance_number: u32,
    pub nsip: Ipv4Addr,
    pub nsipv6: Ipv6Addr,
    pub nodeip: IpAddr,
    pub nodeport: u16,
    pub service_ip: Vec<ServiceIpEntry>,
}

impl TableEntry {
    pub fn full_name(&self) -> String {
        format!("{}#{}", self.job_name, self.instance_number)
    }

    /// The replica's own InstanceIP, aliased across v4/v6, selected by the
    /// protocol version of the packet being converted.
    pub fn instance_ip(&self, is_v4: bool) -> Option<IpAddr> {
        self.service_ip
            .iter()
            .find(|e| e.ip_type == IpType::InstanceNumber)
            .map(|e| {
                if is_v4 {
                    IpAddr::V4(e.address)
                } else {
                    IpAddr::V6(e.address_v6)
                }
            })
    }

    /// The replica's reachable NsIP for the given protocol version.
    pub fn namespace_ip(&self, is_v4: bool) -> IpAddr {
        if is_v4 {
            IpAddr::V4(self.nsip)
        } else {
            IpAddr::V6(self.nsipv6)
        }
    }
}

/// Per-flow cache row pinning a 5-tuple to a chosen replica (§3).
///
/// Keys: forward `(srcip, src_instance_ip, srcport, dst_service_ip, dstport)`,
/// reverse `(dstip, dstport, srcport)` as seen on an ingress packet — both
/// must resolve to the same row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionEntry {
    pub srcip: IpAddr,
    pub src_instance_ip: IpAddr,
    pub srcport: u16,
    pub dstip: IpAddr,
    pub dst_service_ip: IpAddr,
    pub dstport: u16,
}

/// Forward lookup key into the proxy cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ForwardKey {
    pub srcip: IpAddr,
    pub src_instance_ip: IpAddr,
    pub srcport: u16,
    pub dst_service_ip: IpAddr,
    pub dstport: u16,
}

/// Reverse lookup key, as an ingress packet presents it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReverseKey {
    pub dstip: IpAddr,
    pub dstport: u16,
    pub srcport: u16,
}

impl ConversionEntry {
    pub fn forward_key(&self) -> ForwardKey {
        ForwardKey {
            srcip: self.srcip,
            src_instance_ip: self.src_instance_ip,
            srcport: self.srcport,
            dst_service_ip: self.dst_service_ip,
            dstport: self.dstport,
        }
    }

    pub fn reverse_key(&self) -> ReverseKey {
        ReverseKey {
            dstip: self.dstip,
            dstport: self.dstport,
            srcport: self.srcport,
        }
    }
}
