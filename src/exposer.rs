//! Service exposer (§9 design note).
//!
//! Programming NAT/firewall rules to make a replica's InstanceIP reachable
//! from outside the node is inherently platform-specific (iptables, nftables,
//! a cloud provider's security group API). The environment manager talks to
//! whichever backend is configured through this trait instead of shelling
//! out directly, so the datapath itself stays testable without root.

use async_trait::async_trait;
use std::net::IpAddr;

use tracing::info;

use crate::error::Result;

#[async_trait]
pub trait ServiceExposer: Send + Sync {
    async fn expose(&self, instance_ip: IpAddr, node_port: u16) -> Result<()>;
    async fn withdraw(&self, instance_ip: IpAddr, node_port: u16) -> Result<()>;
}

/// Default backend: logs the intended rule instead of programming one.
/// Sufficient for single-node testing and for deployments that manage
/// exposure out of band.
pub struct LoggingExposer;

#[async_trait]
impl ServiceExposer for LoggingExposer {
    async fn expose(&self, instance_ip: IpAddr, node_port: u16) -> Result<()> {
        info!(%instance_ip, node_port, "would expose replica (logging exposer, no-op)");
        Ok(())
    }

    async fn withdraw(&self, instance_ip: IpAddr, node_port: u16) -> Result<()> {
        info!(%instance_ip, node_port, "would withdraw replica exposure (logging exposer, no-op)");
        Ok(())
    }
}
