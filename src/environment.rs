//! Environment manager (§4.7).
//!
//! Single authority for constructing and tearing down [`TableEntry`] rows for
//! jobs deployed on this node, and for handing out the next free address in
//! this node's v4/v6 subnets. Everything else treats its output as fact.
//!
//! `next_ip` increments the address as an arbitrary-precision integer rather
//! than a fixed-width one: the original implementation this is descended
//! from overflowed silently past `.255` on the last octet and wrapped the
//! address back into the network portion. Carrying the add through a byte
//! array with explicit carry propagation makes that class of bug impossible,
//! at the cost of returning `None` once the subnet is actually exhausted.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use parking_lot::RwLock;
use rand::Rng;
use tracing::info;

use crate::exposer::ServiceExposer;
use crate::model::{IpType, JobName, ServiceIpEntry, TableEntry};

/// A node's own addressing context: the subnets it hands out replica
/// addresses from, and the public address other nodes reach it at.
pub struct Environment {
    pub host_tun_name: String,
    pub public_address: IpAddr,
    subnet_v4: Ipv4Addr,
    prefix_v4: u8,
    subnet_v6: Ipv6Addr,
    prefix_v6: u8,
    proxy_subnet_v4: Ipv4Addr,
    proxy_prefix_v4: u8,
    proxy_subnet_v6: Ipv6Addr,
    proxy_prefix_v6: u8,
    state: RwLock<State>,
    exposer: Arc<dyn ServiceExposer>,
}

#[derive(Default)]
struct State {
    next_v4: Option<Ipv4Addr>,
    next_v6: Option<Ipv6Addr>,
    deployed: HashMap<JobName, TableEntry>,
}

impl Environment {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        host_tun_name: impl Into<String>,
        public_address: IpAddr,
        subnet_v4: Ipv4Addr,
        prefix_v4: u8,
        subnet_v6: Ipv6Addr,
        prefix_v6: u8,
        proxy_subnet_v4: Ipv4Addr,
        proxy_prefix_v4: u8,
        proxy_subnet_v6: Ipv6Addr,
        proxy_prefix_v6: u8,
        exposer: Arc<dyn ServiceExposer>,
    ) -> Self {
        Self {
            host_tun_name: host_tun_name.into(),
            public_address,
            subnet_v4,
            prefix_v4,
            subnet_v6,
            prefix_v6,
            proxy_subnet_v4,
            proxy_prefix_v4,
            proxy_subnet_v6,
            proxy_prefix_v6,
            state: RwLock::new(State::default()),
            exposer,
        }
    }

    /// True when `ip` falls inside this node's configured ServiceIP subnet
    /// (v4 or v6, whichever matches). Egress traffic aimed outside both is
    /// not this node's concern and gets dropped before any resolver lookup.
    pub fn is_service_ip(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(addr) => in_subnet_v4(addr, self.proxy_subnet_v4, self.proxy_prefix_v4),
            IpAddr::V6(addr) => in_subnet_v6(addr, self.proxy_subnet_v6, self.proxy_prefix_v6),
        }
    }

    /// True while at least one instance of `job_name` is deployed on this
    /// node, regardless of instance number.
    pub fn is_job_locally_deployed(&self, job_name: &str) -> bool {
        let prefix = format!("{job_name}#");
        self.state.read().deployed.keys().any(|k| k.starts_with(&prefix))
    }

    /// Builds a fresh [`TableEntry`] for a newly-deployed replica, allocating
    /// the next free NsIP pair from this node's subnets and programming this
    /// node's exposer so the replica's InstanceIP is reachable.
    /// Idempotent: a repeat call for an already-deployed `(job_name,
    /// instance_number)` returns the previously constructed row rather than
    /// allocating a new address or re-exposing it.
    pub async fn construct_table_entry(
        &self,
        job_name: &JobName,
        instance_number: u32,
        node_port: u16,
        service_ips: Vec<ServiceIpEntry>,
    ) -> Option<TableEntry> {
        let key = full_name(job_name, instance_number);
        if let Some(existing) = self.state.read().deployed.get(&key) {
            return Some(existing.clone());
        }

        let (nsip, nsipv6) = self.allocate_ns_ips()?;
        let mut service_ip = service_ips;
        service_ip.push(ServiceIpEntry {
            ip_type: IpType::InstanceNumber,
            address: nsip,
            address_v6: nsipv6,
        });

        let entry = TableEntry {
            job_name: job_name.clone(),
            instance_number,
            nsip,
            nsipv6,
            nodeip: self.public_address,
            nodeport: node_port,
            service_ip,
        };

        self.state.write().deployed.insert(key, entry.clone());
        if let Err(e) = self.exposer.expose(IpAddr::V4(nsip), node_port).await {
            tracing::warn!(job_name, instance_number, error = %e, "failed to expose replica");
        }
        info!(job_name, instance_number, %nsip, "constructed table entry");
        Some(entry)
    }

    /// Tears down the bookkeeping for a replica this node hosted and
    /// withdraws its exposure. Does not reclaim the address for reuse;
    /// addresses are one-shot per node lifetime, matching the source
    /// allocator's behaviour.
    pub async fn destroy_table_entry(&self, job_name: &JobName, instance_number: u32) {
        let removed = self.state.write().deployed.remove(&full_name(job_name, instance_number));
        if let Some(entry) = removed {
            if let Err(e) = self.exposer.withdraw(IpAddr::V4(entry.nsip), entry.nodeport).await {
                tracing::warn!(job_name, instance_number, error = %e, "failed to withdraw replica exposure");
            }
        }
    }

    pub fn is_locally_deployed(&self, job_name: &JobName, instance_number: u32) -> bool {
        self.state.read().deployed.contains_key(&full_name(job_name, instance_number))
    }

    fn allocate_ns_ips(&self) -> Option<(Ipv4Addr, Ipv6Addr)> {
        let mut state = self.state.write();

        let current_v4 = state.next_v4.unwrap_or(self.subnet_v4);
        let next_v4 = next_ipv4(current_v4, self.subnet_v4, self.prefix_v4)?;
        state.next_v4 = Some(next_v4);

        let current_v6 = state.next_v6.unwrap_or(self.subnet_v6);
        let next_v6 = next_ipv6(current_v6, self.subnet_v6, self.prefix_v6)?;
        state.next_v6 = Some(next_v6);

        Some((next_v4, next_v6))
    }

    /// Random node-port for a replica that doesn't request a specific one.
    pub fn random_node_port(&self) -> u16 {
        rand::rng().random_range(20000..60000)
    }
}

fn full_name(job_name: &JobName, instance_number: u32) -> JobName {
    format!("{}#{}", job_name, instance_number)
}

/// Increments `addr` by one, carrying through the full 32-bit address as a
/// big-endian byte array, and returns `None` once the result would leave
/// `subnet/prefix`.
pub fn next_ipv4(addr: Ipv4Addr, subnet: Ipv4Addr, prefix: u8) -> Option<Ipv4Addr> {
    let mut bytes = addr.octets();
    let mut carry = 1u16;
    for byte in bytes.iter_mut().rev() {
        let sum = *byte as u16 + carry;
        *byte = (sum & 0xFF) as u8;
        carry = sum >> 8;
        if carry == 0 {
            break;
        }
    }
    if carry != 0 {
        return None;
    }
    let candidate = Ipv4Addr::from(bytes);
    if in_subnet_v4(candidate, subnet, prefix) {
        Some(candidate)
    } else {
        None
    }
}

fn in_subnet_v4(addr: Ipv4Addr, subnet: Ipv4Addr, prefix: u8) -> bool {
    if prefix == 0 {
        return true;
    }
    let mask = !0u32 << (32 - prefix as u32);
    (u32::from(addr) & mask) == (u32::from(subnet) & mask)
}

/// Same carry-propagating increment for the 128-bit v6 address space.
pub fn next_ipv6(addr: Ipv6Addr, subnet: Ipv6Addr, prefix: u8) -> Option<Ipv6Addr> {
    let mut bytes = addr.octets();
    let mut carry = 1u16;
    for byte in bytes.iter_mut().rev() {
        let sum = *byte as u16 + carry;
        *byte = (sum & 0xFF) as u8;
        carry = sum >> 8;
        if carry == 0 {
            break;
        }
    }
    if carry != 0 {
        return None;
    }
    let candidate = Ipv6Addr::from(bytes);
    if in_subnet_v6(candidate, subnet, prefix) {
        Some(candidate)
    } else {
        None
    }
}

fn in_subnet_v6(addr: Ipv6Addr, subnet: Ipv6Addr, prefix: u8) -> bool {
    if prefix == 0 {
        return true;
    }
    let mask = !0u128 << (128 - prefix as u32);
    (u128::from(addr) & mask) == (u128::from(subnet) & mask)
}
