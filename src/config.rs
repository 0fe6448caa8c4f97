//! Node configuration (§3).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{NetError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Name the TUN device is created or attached under.
    #[serde(default = "default_tun_name")]
    pub tun_name: String,

    /// Address other nodes reach this one at (NodeIP).
    pub public_address: IpAddr,

    /// UDP port this node listens for overlay traffic on.
    #[serde(default = "default_overlay_port")]
    pub overlay_port: u16,

    /// HTTP port the admin surface (`/register`, `/healthz`) listens on.
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    pub subnet_v4: Ipv4Addr,
    pub prefix_v4: u8,

    #[serde(default = "default_subnet_v6")]
    pub subnet_v6: Ipv6Addr,
    #[serde(default)]
    pub prefix_v6: u8,

    /// ServiceIP subnet this node's proxy will egress traffic for; distinct
    /// from `subnet_v4`/`subnet_v6`, which are solely for NsIP allocation.
    pub proxy_subnet_v4: Ipv4Addr,
    pub proxy_prefix_v4: u8,

    #[serde(default = "default_subnet_v6")]
    pub proxy_subnet_v6: Ipv6Addr,
    #[serde(default)]
    pub proxy_prefix_v6: u8,

    /// Control-channel broker address, when the deployment uses an external
    /// broker rather than the in-process bus.
    #[serde(default)]
    pub broker_address: Option<String>,

    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

fn default_tun_name() -> String {
    "meshnet0".to_string()
}

fn default_overlay_port() -> u16 {
    9050
}

fn default_admin_port() -> u16 {
    8080
}

fn default_subnet_v6() -> Ipv6Addr {
    Ipv6Addr::UNSPECIFIED
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(NetError::from)
    }

    pub fn validate(&self) -> Result<()> {
        if self.prefix_v4 == 0 || self.prefix_v4 > 32 {
            return Err(NetError::Configuration(format!(
                "prefix_v4 must be in 1..=32, got {}",
                self.prefix_v4
            )));
        }
        if self.proxy_prefix_v4 == 0 || self.proxy_prefix_v4 > 32 {
            return Err(NetError::Configuration(format!(
                "proxy_prefix_v4 must be in 1..=32, got {}",
                self.proxy_prefix_v4
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_in_optional_fields() {
        let json = r#"{
            "public_address": "192.168.1.10",
            "subnet_v4": "10.18.0.0",
            "prefix_v4": 16,
            "proxy_subnet_v4": "10.30.0.0",
            "proxy_prefix_v4": 16
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.tun_name, "meshnet0");
        assert_eq!(config.overlay_port, 9050);
        assert_eq!(config.admin_port, 8080);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_an_invalid_prefix() {
        let config = Config {
            tun_name: "t0".into(),
            public_address: "192.168.1.10".parse().unwrap(),
            overlay_port: 9050,
            admin_port: 8080,
            subnet_v4: "10.18.0.0".parse().unwrap(),
            prefix_v4: 0,
            subnet_v6: Ipv6Addr::UNSPECIFIED,
            prefix_v6: 0,
            proxy_subnet_v4: "10.30.0.0".parse().unwrap(),
            proxy_prefix_v4: 16,
            proxy_subnet_v6: Ipv6Addr::UNSPECIFIED,
            proxy_prefix_v6: 0,
            broker_address: None,
            log_filter: "info".into(),
        };
        assert!(config.validate().is_err());
    }
}
