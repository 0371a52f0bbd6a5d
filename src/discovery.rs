/// Client-side UDP actor: finds proxies and subscribes to their traffic.
///
/// One socket does everything: DISCOVER goes to the configured peer address
/// (unicast or broadcast — the socket carries SO_BROADCAST and a LAN-scope
/// multicast TTL so either works), KEEPALIVE goes to individual proxies, and
/// the receive loop translates every inbound datagram into exactly one typed
/// event for the model reducer. This actor owns no model state.
use crate::model::Event;
use crate::protocol::{addr_key, build_discover, build_keepalive, Datagram, MSG_AUDIO, MSG_IAM, MSG_METADATA};
use crate::stats::Stats;
use crate::util::now_ms;
use anyhow::{anyhow, Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Receive tick; bounds how late the loop observes a shutdown.
const RECV_TICK: Duration = Duration::from_millis(100);

/// TTL for multicast-capable sends (LAN scope).
const MULTICAST_TTL: u32 = 4;

pub struct Discovery {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    stats: Arc<Stats>,
}

impl Discovery {
    /// Bind the discovery socket on `0.0.0.0:<local_port>` and resolve the
    /// proxy peer address once.
    pub async fn bind(
        local_port: u16,
        peer_host: &str,
        peer_port: u16,
        stats: Arc<Stats>,
    ) -> Result<Self> {
        let peer = lookup_host((peer_host, peer_port))
            .await
            .with_context(|| format!("resolve proxy host {peer_host}"))?
            .find(SocketAddr::is_ipv4)
            .ok_or_else(|| anyhow!("no IPv4 address for proxy host {peer_host}"))?;

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .context("create discovery socket")?;
        socket.set_reuse_address(true)?;
        socket.set_broadcast(true)?;
        socket.set_multicast_ttl_v4(MULTICAST_TTL)?;
        socket.set_nonblocking(true)?;
        socket
            .bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, local_port).into())
            .with_context(|| format!("bind discovery socket on port {local_port}"))?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket =
            Arc::new(UdpSocket::from_std(std_socket).context("register discovery socket")?);

        info!(%peer, port = local_port, "✅ discovery socket bound");

        Ok(Self { socket, peer, stats })
    }

    /// Local address (ephemeral-port tests).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Send one DISCOVER to the configured peer.
    pub async fn discover(&self) -> Result<()> {
        self.socket.send_to(&build_discover(), self.peer).await?;
        self.stats.record_sent(1);
        debug!(peer = %self.peer, "🔍 DISCOVER sent");
        Ok(())
    }

    /// Send one KEEPALIVE to a known proxy.
    pub async fn send_keepalive(&self, addr: SocketAddr) -> Result<()> {
        self.socket.send_to(&build_keepalive(), addr).await?;
        self.stats.record_sent(1);
        Ok(())
    }

    /// Spawn the receive loop feeding typed events into the reducer queue.
    pub fn spawn_recv_loop(
        &self,
        events: mpsc::Sender<Event>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let socket = self.socket.clone();
        let stats = self.stats.clone();
        tokio::spawn(async move {
            recv_loop(socket, events, cancel, stats).await;
        })
    }
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    events: mpsc::Sender<Event>,
    cancel: CancellationToken,
    stats: Arc<Stats>,
) {
    debug!("proxy receive loop started");
    let mut buf = vec![0u8; 2048];

    loop {
        if cancel.is_cancelled() {
            return;
        }

        let (len, src) = match timeout(RECV_TICK, socket.recv_from(&mut buf)).await {
            Ok(Ok(v)) => v,
            Ok(Err(e)) => {
                warn!(error = %e, "discovery socket recv failed");
                let _ = events
                    .send(Event::ProxyClientCrashed(e.to_string()))
                    .await;
                return;
            }
            Err(_) => continue, // receive tick
        };

        stats.record_recv();

        let datagram = match Datagram::parse(&buf[..len]) {
            Some(d) => d,
            None => {
                stats.record_parse_error();
                warn!(%src, len, "malformed datagram from proxy");
                continue;
            }
        };

        let id = addr_key(&src);
        let ts_ms = now_ms();
        let event = match datagram.msg_type {
            MSG_IAM => Event::IamReceived {
                id,
                ts_ms,
                addr: src,
                info: String::from_utf8_lossy(&datagram.payload).into_owned(),
            },
            MSG_METADATA => Event::MetaReceived {
                id,
                ts_ms,
                meta: String::from_utf8_lossy(&datagram.payload).into_owned(),
            },
            MSG_AUDIO => Event::AudioReceived {
                id,
                ts_ms,
                payload: datagram.payload,
            },
            other => {
                stats.record_parse_error();
                debug!(%src, msg_type = other, "unexpected message type from proxy");
                continue;
            }
        };

        if events.send(event).await.is_err() {
            // Reducer is gone — nothing left to feed.
            return;
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{build_audio, build_iam, build_metadata};

    async fn recv_event(rx: &mut mpsc::Receiver<Event>) -> Event {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_discover_wire_bytes_reach_peer() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_port = peer.local_addr().unwrap().port();

        let discovery = Discovery::bind(0, "127.0.0.1", peer_port, Stats::new())
            .await
            .unwrap();
        discovery.discover().await.unwrap();

        let mut buf = [0u8; 16];
        let (len, _) = timeout(Duration::from_secs(2), peer.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], &[0x00, 0x01, 0x00, 0x00]);
    }

    #[tokio::test]
    async fn test_keepalive_wire_bytes_reach_target() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = peer.local_addr().unwrap();

        let discovery = Discovery::bind(0, "127.0.0.1", 1, Stats::new()).await.unwrap();
        discovery.send_keepalive(target).await.unwrap();

        let mut buf = [0u8; 16];
        let (len, _) = timeout(Duration::from_secs(2), peer.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], &[0x00, 0x03, 0x00, 0x00]);
    }

    #[tokio::test]
    async fn test_datagrams_become_typed_events() {
        let discovery = Discovery::bind(0, "127.0.0.1", 1, Stats::new()).await.unwrap();
        let local = discovery.local_addr().unwrap();
        let target = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, local.port()));

        let (tx, mut rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let handle = discovery.spawn_recv_loop(tx, cancel.clone());

        let proxy = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let proxy_id = addr_key(&proxy.local_addr().unwrap());

        proxy.send_to(&build_iam("Radio R"), target).await.unwrap();
        match recv_event(&mut rx).await {
            Event::IamReceived { id, info, addr, .. } => {
                assert_eq!(id, proxy_id);
                assert_eq!(info, "Radio R");
                assert_eq!(addr.port(), proxy.local_addr().unwrap().port());
            }
            other => panic!("expected IamReceived, got {other:?}"),
        }

        proxy
            .send_to(&build_metadata("StreamTitle='x';"), target)
            .await
            .unwrap();
        match recv_event(&mut rx).await {
            Event::MetaReceived { id, meta, .. } => {
                assert_eq!(id, proxy_id);
                assert_eq!(meta, "StreamTitle='x';");
            }
            other => panic!("expected MetaReceived, got {other:?}"),
        }

        proxy.send_to(&build_audio(b"pcm"), target).await.unwrap();
        match recv_event(&mut rx).await {
            Event::AudioReceived { id, payload, .. } => {
                assert_eq!(id, proxy_id);
                assert_eq!(payload, b"pcm");
            }
            other => panic!("expected AudioReceived, got {other:?}"),
        }

        cancel.cancel();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn test_discover_roundtrip_populates_model() {
        use crate::broadcaster::{Broadcaster, UdpBroadcaster};
        use crate::model::Model;

        // Real proxy control plane on an ephemeral port.
        let cancel = CancellationToken::new();
        let proxy =
            UdpBroadcaster::bind(0, None, "Radio R".into(), 5, &cancel, Stats::new()).unwrap();
        let proxy_port = proxy.local_addr().unwrap().port();

        let discovery = Discovery::bind(0, "127.0.0.1", proxy_port, Stats::new())
            .await
            .unwrap();
        let (tx, mut rx) = mpsc::channel(64);
        let recv_task = discovery.spawn_recv_loop(tx, cancel.clone());

        discovery.discover().await.unwrap();

        // IAM then METADATA drive the reducer; the proxy table ends up with
        // exactly one entry carrying the advertised name.
        let mut model = Model::new(5);
        for _ in 0..2 {
            let event = recv_event(&mut rx).await;
            model.handle_event(event);
        }
        let known: Vec<_> = model.proxies().collect();
        assert_eq!(known.len(), 1);
        assert_eq!(known[0].info, "Radio R");
        assert_eq!(known[0].meta, "");

        cancel.cancel();
        let _ = recv_task.await;
        proxy.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_types_are_dropped() {
        let discovery = Discovery::bind(0, "127.0.0.1", 1, Stats::new()).await.unwrap();
        let local = discovery.local_addr().unwrap();
        let target = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, local.port()));

        let (tx, mut rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let handle = discovery.spawn_recv_loop(tx, cancel.clone());

        let proxy = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        // Reserved type 5 and a client-plane DISCOVER: both dropped.
        proxy.send_to(&[0x00, 0x05, 0x00, 0x00], target).await.unwrap();
        proxy.send_to(&build_discover(), target).await.unwrap();
        proxy.send_to(&build_iam("after"), target).await.unwrap();

        match recv_event(&mut rx).await {
            Event::IamReceived { info, .. } => assert_eq!(info, "after"),
            other => panic!("expected IamReceived, got {other:?}"),
        }

        cancel.cancel();
        let _ = handle.await;
    }
}
