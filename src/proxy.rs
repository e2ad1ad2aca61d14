use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

use crate::framing::PacketCodec;
use crate::interception::Forward;
use crate::packet::EndpointType;
use crate::session::{RelayServices, RelaySession};

type FramedPeer = Framed<TcpStream, PacketCodec>;

pub struct ProxyServer {
    listener: TcpListener,
    services: Arc<RelayServices>,
}

impl ProxyServer {
    pub async fn bind(services: Arc<RelayServices>) -> Result<Self> {
        let listen_addr = services.config.listen_addr;
        std::fs::create_dir_all(&services.config.log_dir).context("Failed to create logs directory")?;
        let listener = TcpListener::bind(listen_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", listen_addr))?;

        info!(
            "Proxy configured: listening on {}, forwarding to {}",
            listen_addr, services.config.upstream_addr
        );
        Ok(Self { listener, services })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context("Listener has no local address")
    }

    pub async fn run(self) -> Result<()> {
        info!("Proxy server running on {}", self.local_addr()?);
        loop {
            let (client, client_addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                    continue;
                }
            };
            debug!("Accepted connection from {}", client_addr);
            let services = Arc::clone(&self.services);
            tokio::spawn(async move {
                if let Err(e) = relay_connection(services, client, client_addr).await {
                    error!("Connection from {} ended with error: {:#}", client_addr, e);
                }
            });
        }
    }
}

async fn relay_connection(services: Arc<RelayServices>, client: TcpStream, client_addr: SocketAddr) -> Result<()> {
    let upstream_addr = services.config.upstream_addr;
    let upstream = TcpStream::connect(upstream_addr)
        .await
        .with_context(|| format!("Failed to connect to upstream {}", upstream_addr))?;
    client.set_nodelay(true)?;
    upstream.set_nodelay(true)?;

    let mut session = RelaySession::new(&services, client_addr, upstream_addr).context("Failed to create session")?;
    let mut client = Framed::new(client, PacketCodec);
    let mut server = Framed::new(upstream, PacketCodec);
    let mut tick = interval(services.config.poll_interval());
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let result = loop {
        let forwards = tokio::select! {
            frame = client.next() => match frame {
                Some(Ok(wire)) => session.process(EndpointType::Client, wire),
                Some(Err(e)) => break Err(e).context("Failed to read from client"),
                None => {
                    info!(session = %session.id(), "Client disconnected");
                    break Ok(());
                }
            },
            frame = server.next() => match frame {
                Some(Ok(wire)) => session.process(EndpointType::Server, wire),
                Some(Err(e)) => break Err(e).context("Failed to read from upstream"),
                None => {
                    info!(session = %session.id(), "Upstream disconnected");
                    break Ok(());
                }
            },
            _ = tick.tick() => session.drain_injections(),
        };
        if let Err(e) = send_all(&mut client, &mut server, forwards).await {
            break Err(e);
        }
    };

    // Pending log writes are waited on synchronously
    match tokio::task::spawn_blocking(move || session.finish()).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => warn!("{:#}", e),
        Err(e) => error!("Session teardown task failed: {}", e),
    }
    result
}

async fn send_all(client: &mut FramedPeer, server: &mut FramedPeer, forwards: Vec<Forward>) -> Result<()> {
    if forwards.is_empty() {
        return Ok(());
    }
    let (mut to_client, mut to_server) = (false, false);
    for Forward { to, bytes } in forwards {
        match to {
            EndpointType::Client => {
                client.feed(bytes).await.context("Failed to forward to client")?;
                to_client = true;
            }
            EndpointType::Server => {
                server.feed(bytes).await.context("Failed to forward to upstream")?;
                to_server = true;
            }
        }
    }
    if to_client {
        client.flush().await.context("Failed to flush to client")?;
    }
    if to_server {
        server.flush().await.context("Failed to flush to upstream")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::packet::Injection;
    use crate::protocol::ProtocolCatalog;
    use crate::work::WorkQueue;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn start(upstream_addr: SocketAddr, log_dir: &std::path::Path) -> SocketAddr {
        let config = RelayConfig {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            upstream_addr,
            log_dir: log_dir.to_path_buf(),
            key_exchange: None,
            poll_interval_ms: 10,
            ..RelayConfig::default()
        };
        let services = RelayServices::with_catalog(
            config,
            ProtocolCatalog::new(),
            Arc::new(WorkQueue::new("test-proxy").unwrap()),
        );
        let proxy = ProxyServer::bind(Arc::new(services)).await.unwrap();
        let addr = proxy.local_addr().unwrap();
        tokio::spawn(proxy.run());
        addr
    }

    #[tokio::test]
    async fn test_relays_frames_both_ways() {
        let dir = tempfile::tempdir().unwrap();
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = start(upstream.local_addr().unwrap(), dir.path()).await;

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        let (mut server, _) = upstream.accept().await.unwrap();

        client.write_all(&[0x04, 0x00, 0x49, 0x01]).await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0x04, 0x00, 0x49, 0x01]);

        server.write_all(&[0x03, 0x00, 0x00, 0x05, 0x00, 0xfe, 0x02, 0x00]).await.unwrap();
        let mut buf = [0u8; 8];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0x03, 0x00, 0x00, 0x05, 0x00, 0xfe, 0x02, 0x00]);
    }

    #[tokio::test]
    async fn test_send_all_routes_by_destination() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect_a = TcpStream::connect(addr);
        let (a, accepted_a) = tokio::join!(connect_a, listener.accept());
        let connect_b = TcpStream::connect(addr);
        let (b, accepted_b) = tokio::join!(connect_b, listener.accept());
        let mut client = Framed::new(a.unwrap(), PacketCodec);
        let mut server = Framed::new(b.unwrap(), PacketCodec);
        let (mut client_peer, _) = accepted_a.unwrap();
        let (mut server_peer, _) = accepted_b.unwrap();

        let injected = Injection::new(EndpointType::Client, vec![0x49, 0x02]);
        let forwards = vec![
            Forward { to: EndpointType::Server, bytes: injected.body.clone() },
            Forward { to: EndpointType::Client, bytes: bytes::Bytes::from_static(&[0x00]) },
        ];
        send_all(&mut client, &mut server, forwards).await.unwrap();

        let mut buf = [0u8; 4];
        server_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0x04, 0x00, 0x49, 0x02]);
        let mut buf = [0u8; 3];
        client_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0x03, 0x00, 0x00]);
    }
}
