use std::sync::Arc;

use meshnet_datapath::admin::{AdminServer, AdminState};
use meshnet_datapath::codec::Codec;
use meshnet_datapath::common::Component;
use meshnet_datapath::config::Config;
use meshnet_datapath::control_channel::LocalControlChannel;
use meshnet_datapath::environment::Environment;
use meshnet_datapath::exposer::LoggingExposer;
use meshnet_datapath::interest::InterestManager;
use meshnet_datapath::proxy_cache::ProxyCache;
use meshnet_datapath::resolver::Resolver;
use meshnet_datapath::tunnel::device::TunDevice;
use meshnet_datapath::tunnel::TunnelEngine;
use tokio::net::UdpSocket;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.json".to_string());
    let config = Config::load(&config_path).unwrap_or_else(|e| {
        eprintln!("failed to load {config_path}: {e}, using defaults");
        default_config()
    });
    config.validate()?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!(tun_name = %config.tun_name, overlay_port = config.overlay_port, "starting meshnet-datapath");

    let control = Arc::new(LocalControlChannel::new());
    let environment = Arc::new(Environment::new(
        config.tun_name.clone(),
        config.public_address,
        config.subnet_v4,
        config.prefix_v4,
        config.subnet_v6,
        config.prefix_v6,
        config.proxy_subnet_v4,
        config.proxy_prefix_v4,
        config.proxy_subnet_v6,
        config.proxy_prefix_v6,
        Arc::new(LoggingExposer),
    ));
    let resolver = Arc::new(Resolver::new(control.clone()));
    resolver.subscribe_to_updates().await;
    let proxy_cache = Arc::new(ProxyCache::new());
    let interest = Arc::new(InterestManager::new(control.clone(), resolver.clone(), environment.clone()));

    let overlay_socket = Arc::new(UdpSocket::bind(("0.0.0.0", config.overlay_port)).await?);
    let tun_device = open_tun_device(&config)?;

    let engine = Arc::new(TunnelEngine::new(
        tun_device,
        overlay_socket,
        Arc::new(Codec::new()),
        proxy_cache,
        resolver.clone(),
        interest,
        environment.clone(),
        control,
    ));
    let shutdown = engine.shutdown_handle();
    let (egress_task, ingress_task) = engine.spawn();

    let mut admin = AdminServer::new(AdminState { environment, resolver }, config.admin_port);
    admin.initialize()?;

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    shutdown.notify_waiters();
    admin.shutdown()?;
    let _ = tokio::join!(egress_task, ingress_task);

    Ok(())
}

#[cfg(feature = "tun-device")]
fn open_tun_device(config: &Config) -> anyhow::Result<Arc<dyn TunDevice>> {
    use meshnet_datapath::tunnel::device::platform::PlatformTun;
    let netmask = std::net::Ipv4Addr::new(255, 255, 0, 0);
    let dev = PlatformTun::new(&config.tun_name, config.subnet_v4, netmask)?;
    Ok(Arc::new(dev))
}

#[cfg(not(feature = "tun-device"))]
fn open_tun_device(_config: &Config) -> anyhow::Result<Arc<dyn TunDevice>> {
    use meshnet_datapath::tunnel::device::LoopbackTun;
    tracing::warn!("tun-device feature disabled, running with an in-memory loopback device");
    let (dev, _peer) = LoopbackTun::new_pair();
    Ok(dev)
}

fn default_config() -> Config {
    serde_json::from_str(
        r#"{
            "public_address": "127.0.0.1",
            "subnet_v4": "10.18.0.0",
            "prefix_v4": 16,
            "proxy_subnet_v4": "10.30.0.0",
            "proxy_prefix_v4": 16
        }"#,
    )
    .expect("default config must parse")
}
