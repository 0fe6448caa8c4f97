//! Tunnel engine (§4.6): the egress and ingress packet pipelines that give
//! every other component a reason to exist. Egress turns an application's
//! write to the TUN device into an encapsulated UDP datagram addressed at
//! the node hosting the chosen replica; ingress does the reverse for
//! traffic arriving on the overlay socket.

pub mod device;
pub mod pool;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tracing::{trace, warn};

use crate::codec::Codec;
use crate::control_channel::ControlChannel;
use crate::environment::Environment;
use crate::error::Result;
use crate::interest::InterestManager;
use crate::model::{ConversionEntry, TableEntry};
use crate::proxy_cache::ProxyCache;
use crate::resolver::Resolver;
use device::TunDevice;
use pool::UdpConnectionPool;

const MAX_PACKET_SIZE: usize = 65535;

/// Wires together the codec, caches, resolver and transport for one node.
pub struct TunnelEngine {
    tun: Arc<dyn TunDevice>,
    overlay_socket: Arc<UdpSocket>,
    codec: Arc<Codec>,
    proxy_cache: Arc<ProxyCache>,
    resolver: Arc<Resolver>,
    interest: Arc<InterestManager>,
    environment: Arc<Environment>,
    pool: Arc<UdpConnectionPool>,
    shutdown: Arc<Notify>,
    /// Source of randomness for uniform replica selection among ServiceIP
    /// candidates (§4.3 tie-breaks); owned by the engine per §4.6's
    /// component-ownership list.
    rng: SyncMutex<StdRng>,
}

impl TunnelEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tun: Arc<dyn TunDevice>,
        overlay_socket: Arc<UdpSocket>,
        codec: Arc<Codec>,
        proxy_cache: Arc<ProxyCache>,
        resolver: Arc<Resolver>,
        interest: Arc<InterestManager>,
        environment: Arc<Environment>,
        control: Arc<dyn ControlChannel>,
    ) -> Self {
        let _ = &control; // kept alive by callers; engine reaches it only via resolver/interest
        Self {
            tun,
            overlay_socket,
            codec,
            proxy_cache,
            resolver,
            interest,
            environment,
            pool: Arc::new(UdpConnectionPool::new()),
            shutdown: Arc::new(Notify::new()),
            rng: SyncMutex::new(StdRng::from_os_rng()),
        }
    }

    /// Uniformly at random among `candidates`, per §4.3's tie-break rule;
    /// never a deterministic `first()` pick.
    fn pick_replica<'a>(&self, candidates: &'a [TableEntry]) -> Option<&'a TableEntry> {
        if candidates.is_empty() {
            return None;
        }
        let idx = self.rng.lock().random_range(0..candidates.len());
        candidates.get(idx)
    }

    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    pub fn local_overlay_addr(&self) -> std::io::Result<SocketAddr> {
        self.overlay_socket.local_addr()
    }

    pub fn resolver(&self) -> &Arc<Resolver> {
        &self.resolver
    }

    /// Spawns the egress and ingress loops; returns their join handles so
    /// the caller can await clean shutdown.
    pub fn spawn(self: Arc<Self>) -> (tokio::task::JoinHandle<()>, tokio::task::JoinHandle<()>) {
        let egress_engine = self.clone();
        let egress = tokio::spawn(async move { egress_engine.egress_loop().await });
        let ingress_engine = self.clone();
        let ingress = tokio::spawn(async move { ingress_engine.ingress_loop().await });
        (egress, ingress)
    }

    async fn egress_loop(&self) {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    trace!("egress loop shutting down");
                    return;
                }
                result = self.tun.recv(&mut buf) => {
                    match result {
                        Ok(0) => continue,
                        Ok(n) => {
                            if let Err(e) = self.handle_egress(&buf[..n]).await {
                                warn!(error = %e, "egress packet dropped");
                            }
                        }
                        Err(e) => warn!(error = %e, "tun read error"),
                    }
                }
            }
        }
    }

    async fn handle_egress(&self, raw: &[u8]) -> Result<()> {
        let Some(mut packet) = self.codec.decode(raw) else {
            return Ok(());
        };
        let src = packet.network.src();
        let dst = packet.network.dst();
        let sport = packet.transport.src_port();
        let dport = packet.transport.dst_port();
        let is_v4 = packet.network.is_v4();

        // Traffic aimed outside this node's configured ServiceIP subnet is
        // never this datapath's concern, resolved or not.
        if !self.environment.is_service_ip(dst) {
            return Ok(());
        }

        // The caller is itself a deployed instance; its own InstanceIP is
        // how the chosen replica will see it. A NsIP with no local table
        // entry isn't one of ours, so the packet is dropped.
        let Some(caller_entry) = self.resolver.get_table_entry_by_ns_ip(src) else {
            return Ok(());
        };
        let src_instance_ip = caller_entry.instance_ip(is_v4).unwrap_or(src);

        let forward_hit = self
            .proxy_cache
            .retrieve_by_service_ip(src, src_instance_ip, sport, dst, dport);

        // A cache hit is only good while its replica is still a live member
        // of the service; otherwise evict it and fall through to a fresh
        // replica pick rather than dropping the packet outright.
        let live_hit = forward_hit.filter(|entry| {
            let live_ips = self
                .resolver
                .job_for_service_ip(dst)
                .map(|job_name| self.resolver.live_ns_ips(&job_name))
                .unwrap_or_default();
            self.proxy_cache.expire_if_stale(entry, &live_ips)
        });

        let (replica_nsip, replica_node): (IpAddr, SocketAddr) = if let Some(entry) = live_hit {
            let Some(table_entry) = self.resolver.get_table_entry_by_ns_ip(entry.dstip) else {
                return Ok(());
            };
            (entry.dstip, SocketAddr::new(table_entry.nodeip, table_entry.nodeport))
        } else {
            let candidates = self.resolver.get_table_entry_by_service_ip(dst).await?;
            let Some(chosen) = self.pick_replica(&candidates) else {
                return Ok(());
            };
            self.interest.register_interest(&chosen.job_name).await;
            let replica_nsip = chosen.namespace_ip(is_v4);

            self.proxy_cache.add(ConversionEntry {
                srcip: src,
                src_instance_ip,
                srcport: sport,
                dstip: replica_nsip,
                dst_service_ip: dst,
                dstport: dport,
            });

            (replica_nsip, SocketAddr::new(chosen.nodeip, chosen.nodeport))
        };

        packet.network.set_src(src_instance_ip);
        packet.network.set_dst(replica_nsip);
        let encapsulated = self.codec.serialize(&packet);

        // The chosen replica lives on this same node: skip the round trip
        // through the overlay socket and hand the datagram straight to the
        // ingress side.
        if replica_node.ip() == self.environment.public_address {
            return self.handle_ingress(&encapsulated).await;
        }
        self.pool.forward(replica_node, &encapsulated).await
    }

    async fn ingress_loop(&self) {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    trace!("ingress loop shutting down");
                    return;
                }
                result = self.overlay_socket.recv_from(&mut buf) => {
                    match result {
                        Ok((n, _from)) => {
                            if let Err(e) = self.handle_ingress(&buf[..n]).await {
                                warn!(error = %e, "ingress packet dropped");
                            }
                        }
                        Err(e) => warn!(error = %e, "overlay socket read error"),
                    }
                }
            }
        }
    }

    /// Rewrites a returning datagram back into the caller's view, when this
    /// node knows the flow; a cache miss falls through and is delivered as
    /// received, which is the path for a replica's own inbound request (its
    /// network source is already an InstanceIP, nothing to rewrite).
    async fn handle_ingress(&self, raw: &[u8]) -> Result<()> {
        let Some(mut packet) = self.codec.decode(raw) else {
            return Ok(());
        };
        let inner_src = packet.network.src();
        let sport = packet.transport.src_port();
        let dport = packet.transport.dst_port();

        if let Some(entry) = self.proxy_cache.retrieve_by_instance_ip(inner_src, sport, dport) {
            packet.network.set_src(entry.dst_service_ip);
            packet.network.set_dst(entry.srcip);
        }

        let raw_out = self.codec.serialize(&packet);
        self.tun.send(&raw_out).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ipv4::{Ipv4Header, PROTO_UDP};
    use crate::codec::udp::UdpHeader;
    use crate::control_channel::LocalControlChannel;
    use crate::model::{IpType, ServiceIpEntry, TableEntry};
    use std::net::Ipv6Addr;

    fn build_v4_udp(src: &str, dst: &str, sport: u16, dport: u16, payload: &[u8]) -> Vec<u8> {
        let net = Ipv4Header {
            dscp_ecn: 0,
            total_length: 0,
            identification: 1,
            flags: 0,
            fragment_offset: 0,
            ttl: 64,
            protocol: PROTO_UDP,
            src: src.parse().unwrap(),
            dst: dst.parse().unwrap(),
            options: vec![],
        };
        let udp = UdpHeader { src_port: sport, dst_port: dport, length: 0 };
        let udp_bytes = udp.serialize(net.src.into(), net.dst.into(), payload);
        let mut out = net.serialize(udp_bytes.len() + payload.len());
        out.extend_from_slice(&udp_bytes);
        out.extend_from_slice(payload);
        out
    }

    async fn make_engine() -> (
        Arc<TunnelEngine>,
        Arc<device::LoopbackTun>,
        Arc<device::LoopbackTun>,
        Arc<LocalControlChannel>,
    ) {
        let (app_side, engine_tun) = device::LoopbackTun::new_pair();
        let overlay_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let control = Arc::new(LocalControlChannel::new());
        let resolver = Arc::new(Resolver::new(control.clone()));
        let environment = Arc::new(Environment::new(
            "tun0",
            "127.0.0.1".parse().unwrap(),
            "10.18.0.0".parse().unwrap(),
            16,
            Ipv6Addr::UNSPECIFIED,
            0,
            "10.30.0.0".parse().unwrap(),
            16,
            Ipv6Addr::UNSPECIFIED,
            0,
            Arc::new(crate::exposer::LoggingExposer),
        ));
        let interest = Arc::new(InterestManager::new(control.clone(), resolver.clone(), environment.clone()));
        let engine = Arc::new(TunnelEngine::new(
            engine_tun.clone(),
            overlay_socket,
            Arc::new(Codec::new()),
            Arc::new(ProxyCache::new()),
            resolver,
            interest,
            environment,
            control.clone(),
        ));
        (engine, app_side, engine_tun, control)
    }

    #[tokio::test(start_paused = true)]
    async fn egress_queries_and_times_out_on_a_genuinely_unknown_service_ip() {
        let (engine, _app_side, _engine_tun, control) = make_engine().await;
        let caller_entry = TableEntry {
            job_name: "client.ns".to_string(),
            instance_number: 0,
            nsip: "10.18.0.2".parse().unwrap(),
            nsipv6: Ipv6Addr::UNSPECIFIED,
            nodeip: "127.0.0.1".parse().unwrap(),
            nodeport: 19998,
            service_ip: vec![ServiceIpEntry {
                ip_type: IpType::InstanceNumber,
                address: "10.30.1.2".parse().unwrap(),
                address_v6: Ipv6Addr::UNSPECIFIED,
            }],
        };
        engine.resolver.refresh_service_table("client.ns", vec![caller_entry]);

        let raw = build_v4_udp("10.18.0.2", "10.30.0.5", 44000, 80, b"hi");
        // Nothing has ever published an entry for 10.30.0.5: the lookup must
        // publish exactly one table/query and, with nothing answering,
        // eventually time out rather than dropping without any control-
        // channel activity.
        assert!(engine.handle_egress(&raw).await.is_err());
        assert_eq!(control.publish_count("table/query"), 1);
        assert_eq!(engine.proxy_cache.retrieve_by_service_ip(
            "10.18.0.2".parse().unwrap(), "10.30.1.2".parse().unwrap(), 44000, "10.30.0.5".parse().unwrap(), 80
        ), None);
    }

    #[tokio::test]
    async fn egress_pins_a_flow_once_a_service_ip_resolves() {
        let (engine, _app_side, _engine_tun, _control) = make_engine().await;
        let table_entry = TableEntry {
            job_name: "svc.ns".to_string(),
            instance_number: 0,
            nsip: "10.18.9.9".parse().unwrap(),
            nsipv6: Ipv6Addr::UNSPECIFIED,
            nodeip: "127.0.0.1".parse().unwrap(),
            nodeport: 19999,
            service_ip: vec![ServiceIpEntry {
                ip_type: IpType::ServiceIp,
                address: "10.30.0.5".parse().unwrap(),
                address_v6: Ipv6Addr::UNSPECIFIED,
            }],
        };
        engine.resolver.refresh_service_table("svc.ns", vec![table_entry]);

        // The calling instance needs its own local table entry so egress can
        // resolve its InstanceIP; this is what the environment manager would
        // have constructed for it at deploy time.
        let caller_entry = TableEntry {
            job_name: "client.ns".to_string(),
            instance_number: 0,
            nsip: "10.18.0.2".parse().unwrap(),
            nsipv6: Ipv6Addr::UNSPECIFIED,
            nodeip: "127.0.0.1".parse().unwrap(),
            nodeport: 19998,
            service_ip: vec![ServiceIpEntry {
                ip_type: IpType::InstanceNumber,
                address: "10.30.1.2".parse().unwrap(),
                address_v6: Ipv6Addr::UNSPECIFIED,
            }],
        };
        engine.resolver.refresh_service_table("client.ns", vec![caller_entry]);

        let raw = build_v4_udp("10.18.0.2", "10.30.0.5", 44000, 80, b"hi");
        engine.handle_egress(&raw).await.unwrap();

        let pinned = engine.proxy_cache.retrieve_by_service_ip(
            "10.18.0.2".parse().unwrap(),
            "10.30.1.2".parse().unwrap(),
            44000,
            "10.30.0.5".parse().unwrap(),
            80,
        );
        assert!(pinned.is_some());
        assert!(engine.interest.has_interest("svc.ns"));
    }

    #[tokio::test]
    async fn egress_short_circuits_straight_to_ingress_when_replica_is_local() {
        let (engine, app_side, _engine_tun, _control) = make_engine().await;
        // make_engine()'s environment public_address is 127.0.0.1; a replica
        // hosted on that same address should skip the overlay socket.
        let table_entry = TableEntry {
            job_name: "svc.ns".to_string(),
            instance_number: 0,
            nsip: "10.18.9.9".parse().unwrap(),
            nsipv6: Ipv6Addr::UNSPECIFIED,
            nodeip: "127.0.0.1".parse().unwrap(),
            nodeport: 19999,
            service_ip: vec![ServiceIpEntry {
                ip_type: IpType::ServiceIp,
                address: "10.30.0.5".parse().unwrap(),
                address_v6: Ipv6Addr::UNSPECIFIED,
            }],
        };
        engine.resolver.refresh_service_table("svc.ns", vec![table_entry]);
        let caller_entry = TableEntry {
            job_name: "client.ns".to_string(),
            instance_number: 0,
            nsip: "10.18.0.2".parse().unwrap(),
            nsipv6: Ipv6Addr::UNSPECIFIED,
            nodeip: "127.0.0.1".parse().unwrap(),
            nodeport: 19998,
            service_ip: vec![ServiceIpEntry {
                ip_type: IpType::InstanceNumber,
                address: "10.30.1.2".parse().unwrap(),
                address_v6: Ipv6Addr::UNSPECIFIED,
            }],
        };
        engine.resolver.refresh_service_table("client.ns", vec![caller_entry]);

        let raw = build_v4_udp("10.18.0.2", "10.30.0.5", 44000, 80, b"hi");
        engine.handle_egress(&raw).await.unwrap();

        let mut buf = [0u8; 2048];
        let n = tokio::time::timeout(std::time::Duration::from_secs(1), app_side.recv(&mut buf))
            .await
            .expect("short-circuited datagram should be delivered back out the tun")
            .unwrap();
        let decoded = Codec::new().decode(&buf[..n]).unwrap();
        assert_eq!(decoded.network.src(), "10.30.1.2".parse::<std::net::IpAddr>().unwrap());
        assert_eq!(decoded.network.dst(), "10.18.9.9".parse::<std::net::IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn egress_drops_traffic_outside_the_configured_service_ip_subnet() {
        let (engine, _app_side, _engine_tun, _control) = make_engine().await;
        let caller_entry = TableEntry {
            job_name: "client.ns".to_string(),
            instance_number: 0,
            nsip: "10.18.0.2".parse().unwrap(),
            nsipv6: Ipv6Addr::UNSPECIFIED,
            nodeip: "127.0.0.1".parse().unwrap(),
            nodeport: 19998,
            service_ip: vec![ServiceIpEntry {
                ip_type: IpType::InstanceNumber,
                address: "10.30.1.2".parse().unwrap(),
                address_v6: Ipv6Addr::UNSPECIFIED,
            }],
        };
        engine.resolver.refresh_service_table("client.ns", vec![caller_entry]);

        // 8.8.8.8 is well outside make_engine()'s 10.30.0.0/16 ServiceIP subnet.
        let raw = build_v4_udp("10.18.0.2", "8.8.8.8", 44000, 80, b"hi");
        assert!(engine.handle_egress(&raw).await.is_ok());
        assert_eq!(engine.proxy_cache.retrieve_by_service_ip(
            "10.18.0.2".parse().unwrap(), "10.30.1.2".parse().unwrap(), 44000, "8.8.8.8".parse().unwrap(), 80
        ), None);
    }

    #[tokio::test]
    async fn a_stale_cache_hit_is_evicted_and_re_resolved_instead_of_dropped() {
        let (engine, _app_side, _engine_tun, _control) = make_engine().await;

        let old_replica = TableEntry {
            job_name: "svc.ns".to_string(),
            instance_number: 0,
            nsip: "10.18.9.9".parse().unwrap(),
            nsipv6: Ipv6Addr::UNSPECIFIED,
            nodeip: "127.0.0.1".parse().unwrap(),
            nodeport: 19999,
            service_ip: vec![ServiceIpEntry {
                ip_type: IpType::ServiceIp,
                address: "10.30.0.5".parse().unwrap(),
                address_v6: Ipv6Addr::UNSPECIFIED,
            }],
        };
        engine.resolver.refresh_service_table("svc.ns", vec![old_replica]);

        let caller_entry = TableEntry {
            job_name: "client.ns".to_string(),
            instance_number: 0,
            nsip: "10.18.0.2".parse().unwrap(),
            nsipv6: Ipv6Addr::UNSPECIFIED,
            nodeip: "127.0.0.1".parse().unwrap(),
            nodeport: 19998,
            service_ip: vec![ServiceIpEntry {
                ip_type: IpType::InstanceNumber,
                address: "10.30.1.2".parse().unwrap(),
                address_v6: Ipv6Addr::UNSPECIFIED,
            }],
        };
        engine.resolver.refresh_service_table("client.ns", vec![caller_entry]);

        let raw = build_v4_udp("10.18.0.2", "10.30.0.5", 44000, 80, b"hi");
        engine.handle_egress(&raw).await.unwrap();
        assert!(engine.proxy_cache.retrieve_by_service_ip(
            "10.18.0.2".parse().unwrap(), "10.30.1.2".parse().unwrap(), 44000, "10.30.0.5".parse().unwrap(), 80
        ).is_some());

        // The old replica is replaced by a new one at a different NsIP; the
        // pinned cache entry now points at a NsIP that's no longer live.
        let new_replica = TableEntry {
            job_name: "svc.ns".to_string(),
            instance_number: 1,
            nsip: "10.18.9.10".parse().unwrap(),
            nsipv6: Ipv6Addr::UNSPECIFIED,
            nodeip: "127.0.0.1".parse().unwrap(),
            nodeport: 20000,
            service_ip: vec![ServiceIpEntry {
                ip_type: IpType::ServiceIp,
                address: "10.30.0.5".parse().unwrap(),
                address_v6: Ipv6Addr::UNSPECIFIED,
            }],
        };
        engine.resolver.refresh_service_table("svc.ns", vec![new_replica]);

        engine.handle_egress(&raw).await.unwrap();

        let pinned = engine
            .proxy_cache
            .retrieve_by_service_ip(
                "10.18.0.2".parse().unwrap(),
                "10.30.1.2".parse().unwrap(),
                44000,
                "10.30.0.5".parse().unwrap(),
                80,
            )
            .expect("re-resolved onto the new replica");
        assert_eq!(pinned.dstip, "10.18.9.10".parse::<std::net::IpAddr>().unwrap());
    }
}
