//! TUN device abstraction.
//!
//! Real device I/O is behind the optional `tun-device` feature so the crate
//! builds and tests without root or a platform TUN driver. The trait is the
//! only thing the tunnel engine depends on; swapping in a loopback fake for
//! tests costs nothing.

use async_trait::async_trait;
use std::io;

#[async_trait]
pub trait TunDevice: Send + Sync {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;
    async fn send(&self, buf: &[u8]) -> io::Result<usize>;
}

#[cfg(feature = "tun-device")]
pub mod platform {
    use super::TunDevice;
    use async_trait::async_trait;
    use std::io;
    use tun::AsyncDevice;

    pub struct PlatformTun {
        inner: tokio::sync::Mutex<AsyncDevice>,
    }

    impl PlatformTun {
        pub fn new(name: &str, address: std::net::Ipv4Addr, netmask: std::net::Ipv4Addr) -> io::Result<Self> {
            let mut config = tun::Configuration::default();
            config.address(address).netmask(netmask).name(name).up();
            let dev = tun::create_as_async(&config).map_err(io::Error::other)?;
            Ok(Self {
                inner: tokio::sync::Mutex::new(dev),
            })
        }
    }

    #[async_trait]
    impl TunDevice for PlatformTun {
        async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
            use tokio::io::AsyncReadExt;
            self.inner.lock().await.read(buf).await
        }

        async fn send(&self, buf: &[u8]) -> io::Result<usize> {
            use tokio::io::AsyncWriteExt;
            self.inner.lock().await.write(buf).await
        }
    }
}

/// In-memory loopback device for tests and the `S1`-style scenarios: bytes
/// written with `send` can be read back with `recv`, FIFO.
pub struct LoopbackTun {
    tx: tokio::sync::mpsc::Sender<Vec<u8>>,
    rx: tokio::sync::Mutex<tokio::sync::mpsc::Receiver<Vec<u8>>>,
}

impl LoopbackTun {
    pub fn new_pair() -> (std::sync::Arc<Self>, std::sync::Arc<Self>) {
        let (tx_a, rx_b) = tokio::sync::mpsc::channel(64);
        let (tx_b, rx_a) = tokio::sync::mpsc::channel(64);
        let a = std::sync::Arc::new(Self {
            tx: tx_a,
            rx: tokio::sync::Mutex::new(rx_a),
        });
        let b = std::sync::Arc::new(Self {
            tx: tx_b,
            rx: tokio::sync::Mutex::new(rx_b),
        });
        (a, b)
    }
}

#[async_trait]
impl TunDevice for LoopbackTun {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(packet) => {
                let n = packet.len().min(buf.len());
                buf[..n].copy_from_slice(&packet[..n]);
                Ok(n)
            }
            None => Ok(0),
        }
    }

    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .send(buf.to_vec())
            .await
            .map_err(|e| io::Error::other(e.to_string()))?;
        Ok(buf.len())
    }
}
