//! User-space TCP forwarding for `NetIn` mappings.
//!
//! Each mapping owns a listener on the host port. Accepted connections are
//! piped to the container port on loopback and their byte counts are added
//! to the container's traffic counters.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use garden_common::error::{GardenError, Result};
use garden_common::types::NetworkStat;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Bytes moved through a container's forwarders.
#[derive(Debug, Default)]
pub struct TrafficCounters {
    rx: AtomicU64,
    tx: AtomicU64,
}

impl TrafficCounters {
    /// Records bytes delivered into the container.
    pub fn add_rx(&self, bytes: u64) {
        let _ = self.rx.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Records bytes sent by the container.
    pub fn add_tx(&self, bytes: u64) {
        let _ = self.tx.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Current totals.
    #[must_use]
    pub fn snapshot(&self) -> NetworkStat {
        NetworkStat {
            rx_bytes: self.rx.load(Ordering::Relaxed),
            tx_bytes: self.tx.load(Ordering::Relaxed),
        }
    }
}

/// A running port forward. Dropping it stops the listener.
#[derive(Debug)]
pub struct Forwarder {
    host_port: u16,
    task: JoinHandle<()>,
}

impl Forwarder {
    /// Binds `bind_ip:host_port` and forwards to `127.0.0.1:container_port`.
    ///
    /// # Errors
    ///
    /// Returns an error if the host port cannot be bound.
    pub async fn spawn(
        bind_ip: Ipv4Addr,
        host_port: u16,
        container_port: u16,
        counters: Arc<TrafficCounters>,
    ) -> Result<Self> {
        let addr = SocketAddr::from((bind_ip, host_port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| GardenError::io(format!("tcp://{addr}"), e))?;
        let target = SocketAddr::from((Ipv4Addr::LOCALHOST, container_port));
        tracing::info!(%addr, %target, "net-in forward listening");

        let task = tokio::spawn(accept_loop(listener, target, counters));
        Ok(Self { host_port, task })
    }

    /// Host port this forwarder listens on.
    #[must_use]
    pub const fn host_port(&self) -> u16 {
        self.host_port
    }
}

impl Drop for Forwarder {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn accept_loop(listener: TcpListener, target: SocketAddr, counters: Arc<TrafficCounters>) {
    loop {
        let (inbound, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(error = %e, "net-in accept failed");
                continue;
            }
        };
        let counters = Arc::clone(&counters);
        let _ = tokio::spawn(async move {
            if let Err(e) = pipe(inbound, target, &counters).await {
                tracing::debug!(%peer, %target, error = %e, "net-in connection ended");
            }
        });
    }
}

async fn pipe(
    inbound: TcpStream,
    target: SocketAddr,
    counters: &TrafficCounters,
) -> std::io::Result<()> {
    let outbound = TcpStream::connect(target).await?;
    let (mut in_read, mut in_write) = inbound.into_split();
    let (mut out_read, mut out_write) = outbound.into_split();

    let to_container = async {
        let n = tokio::io::copy(&mut in_read, &mut out_write).await?;
        counters.add_rx(n);
        out_write.shutdown().await
    };
    let from_container = async {
        let n = tokio::io::copy(&mut out_read, &mut in_write).await?;
        counters.add_tx(n);
        in_write.shutdown().await
    };
    let (a, b) = tokio::join!(to_container, from_container);
    a.and(b)
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn forwards_and_counts_bytes() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let container_port = backend.local_addr().unwrap().port();
        let _server = tokio::spawn(async move {
            let (mut conn, _) = backend.accept().await.unwrap();
            let mut buf = [0u8; 4];
            let _ = conn.read_exact(&mut buf).await.unwrap();
            conn.write_all(b"hello\n").await.unwrap();
        });

        let free = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let host_port = free.local_addr().unwrap().port();
        drop(free);

        let counters = Arc::new(TrafficCounters::default());
        let forwarder =
            Forwarder::spawn(Ipv4Addr::LOCALHOST, host_port, container_port, Arc::clone(&counters))
                .await
                .unwrap();
        assert_eq!(forwarder.host_port(), host_port);

        let mut client = TcpStream::connect(("127.0.0.1", host_port)).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut reply = String::new();
        let _ = client.read_to_string(&mut reply).await.unwrap();
        assert_eq!(reply, "hello\n");
        drop(client);

        for _ in 0..50 {
            let stat = counters.snapshot();
            if stat.rx_bytes > 0 && stat.tx_bytes > 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        let stat = counters.snapshot();
        assert_eq!(stat.rx_bytes, 4);
        assert_eq!(stat.tx_bytes, 6);
    }

    #[tokio::test]
    async fn busy_port_is_an_error() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();
        let result = Forwarder::spawn(
            Ipv4Addr::LOCALHOST,
            port,
            1,
            Arc::new(TrafficCounters::default()),
        )
        .await;
        assert!(matches!(result, Err(GardenError::Io { .. })));
    }
}
