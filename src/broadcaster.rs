/// Fan-out side of the proxy: takes demuxed ICY parts and republishes them.
///
/// Two implementations sit behind the `Broadcaster` seam:
/// * `StdoutBroadcaster` — fan-out disabled, audio goes to stdout;
/// * `UdpBroadcaster` — the real thing: a listener registry fed by a
///   DISCOVER/KEEPALIVE control task, timeout-based eviction, and AUDIO /
///   METADATA fragmentation on the data plane.
///
/// The registry mutex is the only lock shared between the planes: the data
/// plane holds it for the duration of one `broadcast`, the control task for
/// one message + eviction sweep, so every AUDIO datagram targets exactly the
/// membership set at send time.
use crate::icy::IcyPart;
use crate::protocol::{
    addr_key, audio_chunks, build_audio, build_iam, build_metadata, Datagram, MSG_DISCOVER,
    MSG_KEEPALIVE,
};
use crate::stats::Stats;
use crate::util::now_ms;
use anyhow::{Context, Result};
use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// ═══════════════════════════════════════════════════════════════════════
//  Constants
// ═══════════════════════════════════════════════════════════════════════

/// Control-plane receive tick; bounds how late a shutdown is observed.
const CONTROL_TICK: Duration = Duration::from_millis(100);

/// TTL for multicast-capable sends (LAN scope).
const MULTICAST_TTL: u32 = 4;

// ═══════════════════════════════════════════════════════════════════════
//  Broadcaster seam
// ═══════════════════════════════════════════════════════════════════════

/// One demuxed ICY part in, zero or more datagrams (or stdout bytes) out.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    /// Publish `data[..part.size]` plus the part's metadata boundary.
    async fn broadcast(&self, part: &IcyPart, data: &[u8]) -> Result<()>;

    /// Cooperative teardown; must be safe to call more than once.
    async fn shutdown(&self);
}

// ═══════════════════════════════════════════════════════════════════════
//  StdoutBroadcaster
// ═══════════════════════════════════════════════════════════════════════

/// Fallback sink when no UDP port is configured: raw audio on stdout,
/// metadata reported on stderr.
pub struct StdoutBroadcaster {
    stats: Arc<Stats>,
}

impl StdoutBroadcaster {
    pub fn new(stats: Arc<Stats>) -> Self {
        Self { stats }
    }
}

#[async_trait]
impl Broadcaster for StdoutBroadcaster {
    async fn broadcast(&self, part: &IcyPart, data: &[u8]) -> Result<()> {
        let mut stdout = tokio::io::stdout();
        stdout.write_all(&data[..part.size]).await?;
        stdout.flush().await?;
        self.stats.record_audio_bytes(part.size);

        if let Some(meta) = &part.meta {
            if !meta.is_empty() {
                info!(meta = %meta.trim_end_matches('\0'), "🎵 metadata");
            }
        }
        Ok(())
    }

    async fn shutdown(&self) {}
}

// ═══════════════════════════════════════════════════════════════════════
//  Listener registry
// ═══════════════════════════════════════════════════════════════════════

/// One registered listener, keyed in the registry by `addr_key`.
#[derive(Debug, Clone)]
pub struct ClientRegistration {
    pub addr: SocketAddr,
    pub last_contact_ms: u64,
}

/// Listener table plus the most recent non-empty metadata block, replayed to
/// every newly discovered listener.
#[derive(Debug, Default)]
pub struct Registry {
    clients: HashMap<u64, ClientRegistration>,
    last_meta: String,
}

impl Registry {
    /// Insert or refresh a listener. Returns `true` on first contact.
    pub fn refresh(&mut self, addr: SocketAddr, now_ms: u64) -> bool {
        let entry = self.clients.entry(addr_key(&addr));
        match entry {
            std::collections::hash_map::Entry::Occupied(mut o) => {
                o.get_mut().last_contact_ms = now_ms;
                false
            }
            std::collections::hash_map::Entry::Vacant(v) => {
                v.insert(ClientRegistration {
                    addr,
                    last_contact_ms: now_ms,
                });
                true
            }
        }
    }

    /// Drop every listener not heard from within `timeout_ms`. Strictly
    /// later than the deadline evicts; exactly on it is retained.
    pub fn evict_stale(&mut self, now_ms: u64, timeout_ms: u64) -> usize {
        let before = self.clients.len();
        self.clients
            .retain(|_, c| now_ms.saturating_sub(c.last_contact_ms) <= timeout_ms);
        before - self.clients.len()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn addrs(&self) -> impl Iterator<Item = SocketAddr> + '_ {
        self.clients.values().map(|c| c.addr)
    }

    pub fn last_meta(&self) -> &str {
        &self.last_meta
    }

    pub fn set_last_meta(&mut self, meta: String) {
        self.last_meta = meta;
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  UdpBroadcaster
// ═══════════════════════════════════════════════════════════════════════

pub struct UdpBroadcaster {
    socket: Arc<UdpSocket>,
    registry: Arc<Mutex<Registry>>,
    /// A control-task crash parks its error here; the next `broadcast`
    /// re-surfaces it on the data plane.
    control_error: Arc<std::sync::Mutex<Option<anyhow::Error>>>,
    control_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    multicast_group: Option<Ipv4Addr>,
    stats: Arc<Stats>,
}

impl UdpBroadcaster {
    /// Bind the fan-out socket and start the control task.
    ///
    /// The socket is broadcast-capable with a LAN-scope multicast TTL; when
    /// `multicast_group` is set, membership is joined here and dropped at
    /// shutdown.
    pub fn bind(
        port: u16,
        multicast_group: Option<Ipv4Addr>,
        radio_info: String,
        eviction_timeout_secs: u64,
        cancel: &CancellationToken,
        stats: Arc<Stats>,
    ) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .context("create fan-out socket")?;
        socket.set_reuse_address(true)?;
        socket.set_broadcast(true)?;
        socket.set_multicast_ttl_v4(MULTICAST_TTL)?;
        if let Some(group) = multicast_group {
            socket
                .join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)
                .with_context(|| format!("join multicast group {group}"))?;
        }
        socket.set_nonblocking(true)?;
        socket
            .bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())
            .with_context(|| format!("bind fan-out socket on port {port}"))?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = Arc::new(UdpSocket::from_std(std_socket).context("register fan-out socket")?);

        let registry = Arc::new(Mutex::new(Registry::default()));
        let control_error = Arc::new(std::sync::Mutex::new(None));
        let task_cancel = cancel.child_token();

        let handle = tokio::spawn({
            let socket = socket.clone();
            let registry = registry.clone();
            let control_error = control_error.clone();
            let cancel = task_cancel.clone();
            let stats = stats.clone();
            let timeout_ms = eviction_timeout_secs * 1000;
            async move {
                if let Err(e) =
                    control_loop(socket, registry, radio_info, timeout_ms, cancel, stats).await
                {
                    error!(error = %e, "UDP control loop failed");
                    *control_error.lock().unwrap() = Some(e);
                }
            }
        });

        info!(port, group = ?multicast_group, "✅ UDP fan-out bound");

        Ok(Self {
            socket,
            registry,
            control_error,
            control_task: std::sync::Mutex::new(Some(handle)),
            cancel: task_cancel,
            multicast_group,
            stats,
        })
    }

    /// Local address of the fan-out socket.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Current registry size (logging and tests).
    pub async fn listener_count(&self) -> usize {
        self.registry.lock().await.len()
    }
}

#[async_trait]
impl Broadcaster for UdpBroadcaster {
    async fn broadcast(&self, part: &IcyPart, data: &[u8]) -> Result<()> {
        if let Some(e) = self.control_error.lock().unwrap().take() {
            return Err(e);
        }

        let mut registry = self.registry.lock().await;
        let targets: Vec<SocketAddr> = registry.addrs().collect();
        let mut sent = 0u64;

        for chunk in audio_chunks(&data[..part.size]) {
            let datagram = build_audio(chunk);
            for addr in &targets {
                match self.socket.send_to(&datagram, addr).await {
                    Ok(_) => sent += 1,
                    Err(e) => warn!(%addr, error = %e, "AUDIO send failed"),
                }
            }
        }

        if let Some(meta) = &part.meta {
            // Sent even when empty: a zero-payload METADATA datagram marks
            // the boundary for listeners.
            let datagram = build_metadata(meta);
            for addr in &targets {
                match self.socket.send_to(&datagram, addr).await {
                    Ok(_) => sent += 1,
                    Err(e) => warn!(%addr, error = %e, "METADATA send failed"),
                }
            }
            if !meta.is_empty() {
                registry.set_last_meta(meta.clone());
            }
        }

        self.stats.record_sent(sent);
        self.stats.record_audio_bytes(part.size);
        Ok(())
    }

    async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.control_task.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        if let Some(group) = self.multicast_group {
            if let Err(e) = self.socket.leave_multicast_v4(group, Ipv4Addr::UNSPECIFIED) {
                debug!(error = %e, "leave multicast group failed");
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Control plane
// ═══════════════════════════════════════════════════════════════════════

async fn control_loop(
    socket: Arc<UdpSocket>,
    registry: Arc<Mutex<Registry>>,
    radio_info: String,
    timeout_ms: u64,
    cancel: CancellationToken,
    stats: Arc<Stats>,
) -> Result<()> {
    debug!("UDP control loop started");
    let mut buf = vec![0u8; 2048];

    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }

        match timeout(CONTROL_TICK, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, src))) => {
                stats.record_recv();
                handle_control(&socket, &registry, &radio_info, &buf[..len], src, &stats).await;
            }
            Ok(Err(e)) => return Err(e).context("control socket recv"),
            Err(_) => {} // receive tick, fall through to eviction
        }

        let mut reg = registry.lock().await;
        let evicted = reg.evict_stale(now_ms(), timeout_ms);
        if evicted > 0 {
            stats.record_eviction(evicted as u64);
            info!(evicted, remaining = reg.len(), "📴 listeners evicted");
        }
    }
}

async fn handle_control(
    socket: &UdpSocket,
    registry: &Mutex<Registry>,
    radio_info: &str,
    data: &[u8],
    src: SocketAddr,
    stats: &Stats,
) {
    let datagram = match Datagram::parse(data) {
        Some(d) => d,
        None => {
            stats.record_parse_error();
            warn!(%src, len = data.len(), "malformed control datagram");
            return;
        }
    };

    match datagram.msg_type {
        MSG_DISCOVER => {
            if !datagram.is_empty() {
                stats.record_parse_error();
                warn!(%src, len = datagram.payload.len(), "DISCOVER with non-empty payload");
                return;
            }

            let (first_contact, last_meta) = {
                let mut reg = registry.lock().await;
                let first = reg.refresh(src, now_ms());
                (first, reg.last_meta().to_string())
            };

            let iam = build_iam(radio_info);
            if let Err(e) = socket.send_to(&iam, src).await {
                warn!(%src, error = %e, "IAM send failed");
                return;
            }
            // Replay the latest metadata right away (empty string before any
            // block was seen) so the listener never waits for a boundary.
            let metadata = build_metadata(&last_meta);
            if let Err(e) = socket.send_to(&metadata, src).await {
                warn!(%src, error = %e, "METADATA send failed");
                return;
            }
            stats.record_sent(2);

            if first_contact {
                info!(%src, "📻 listener discovered");
            } else {
                debug!(%src, "repeat DISCOVER");
            }
        }

        MSG_KEEPALIVE => {
            registry.lock().await.refresh(src, now_ms());
            debug!(%src, "💓 keepalive");
        }

        other => {
            stats.record_parse_error();
            debug!(%src, msg_type = other, "unexpected control message type");
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{HEADER_SIZE, MAX_PAYLOAD, MSG_AUDIO, MSG_IAM, MSG_METADATA};

    fn test_addr(port: u16) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), port))
    }

    // ── Registry semantics ───────────────────────────────────────────

    #[test]
    fn test_registry_first_contact_and_refresh() {
        let mut reg = Registry::default();
        assert!(reg.refresh(test_addr(5000), 0));
        assert!(!reg.refresh(test_addr(5000), 100));
        assert_eq!(reg.len(), 1);
        assert!(reg.refresh(test_addr(5001), 100));
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_registry_eviction_boundary() {
        // Register at t=0, keepalive at t=4000, timeout 5000 ms:
        // alive at t=8000 (diff 4000), alive at t=9000 (diff exactly 5000),
        // evicted at t=9001.
        let mut reg = Registry::default();
        reg.refresh(test_addr(5000), 0);
        reg.refresh(test_addr(5000), 4000);

        assert_eq!(reg.evict_stale(8000, 5000), 0);
        assert_eq!(reg.len(), 1);

        assert_eq!(reg.evict_stale(9000, 5000), 0);
        assert_eq!(reg.len(), 1);

        assert_eq!(reg.evict_stale(9001, 5000), 1);
        assert!(reg.is_empty());
    }

    #[test]
    fn test_registry_eviction_is_selective() {
        let mut reg = Registry::default();
        reg.refresh(test_addr(1), 0);
        reg.refresh(test_addr(2), 6000);
        assert_eq!(reg.evict_stale(6001, 5000), 1);
        let remaining: Vec<SocketAddr> = reg.addrs().collect();
        assert_eq!(remaining, vec![test_addr(2)]);
    }

    #[test]
    fn test_registry_last_meta_replay_default() {
        let reg = Registry::default();
        assert_eq!(reg.last_meta(), "");
    }

    // ── End-to-end control + data plane ──────────────────────────────

    async fn recv_datagram(socket: &UdpSocket) -> Datagram {
        let mut buf = vec![0u8; HEADER_SIZE + MAX_PAYLOAD];
        let (len, _) = timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .expect("timed out waiting for datagram")
            .expect("recv failed");
        Datagram::parse(&buf[..len]).expect("malformed datagram")
    }

    async fn bind_broadcaster(cancel: &CancellationToken) -> (UdpBroadcaster, SocketAddr) {
        let b = UdpBroadcaster::bind(0, None, "R".into(), 5, cancel, Stats::new()).unwrap();
        let port = b.local_addr().unwrap().port();
        (b, SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)))
    }

    #[tokio::test]
    async fn test_discover_replies_iam_then_metadata() {
        let cancel = CancellationToken::new();
        let (broadcaster, target) = bind_broadcaster(&cancel).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(&[0x00, 0x01, 0x00, 0x00], target).await.unwrap();

        let iam = recv_datagram(&client).await;
        assert_eq!(iam.msg_type, MSG_IAM);
        assert_eq!(iam.payload, b"R");

        let meta = recv_datagram(&client).await;
        assert_eq!(meta.msg_type, MSG_METADATA);
        assert!(meta.is_empty());

        assert_eq!(broadcaster.listener_count().await, 1);
        broadcaster.shutdown().await;
    }

    #[tokio::test]
    async fn test_chunked_audio_broadcast() {
        let cancel = CancellationToken::new();
        let (broadcaster, target) = bind_broadcaster(&cancel).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(&crate::protocol::build_discover(), target).await.unwrap();
        recv_datagram(&client).await; // IAM
        recv_datagram(&client).await; // METADATA

        let data: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();
        let part = IcyPart { size: 2500, meta: None };
        broadcaster.broadcast(&part, &data).await.unwrap();

        let mut received = Vec::new();
        let mut sizes = Vec::new();
        for _ in 0..3 {
            let d = recv_datagram(&client).await;
            assert_eq!(d.msg_type, MSG_AUDIO);
            sizes.push(d.payload.len());
            received.extend_from_slice(&d.payload);
        }
        assert_eq!(sizes, vec![1024, 1024, 452]);
        assert_eq!(received, data);

        broadcaster.shutdown().await;
    }

    #[tokio::test]
    async fn test_metadata_broadcast_and_replay() {
        let cancel = CancellationToken::new();
        let (broadcaster, target) = bind_broadcaster(&cancel).await;

        let first = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        first.send_to(&crate::protocol::build_discover(), target).await.unwrap();
        recv_datagram(&first).await;
        recv_datagram(&first).await;

        // One audio byte with a metadata boundary.
        let part = IcyPart {
            size: 1,
            meta: Some("StreamTitle='t';".into()),
        };
        broadcaster.broadcast(&part, b"x").await.unwrap();

        let audio = recv_datagram(&first).await;
        assert_eq!(audio.msg_type, MSG_AUDIO);
        let meta = recv_datagram(&first).await;
        assert_eq!(meta.msg_type, MSG_METADATA);
        assert_eq!(meta.payload, b"StreamTitle='t';");

        // A listener discovered later gets the same block replayed.
        let second = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        second.send_to(&crate::protocol::build_discover(), target).await.unwrap();
        recv_datagram(&second).await; // IAM
        let replay = recv_datagram(&second).await;
        assert_eq!(replay.msg_type, MSG_METADATA);
        assert_eq!(replay.payload, b"StreamTitle='t';");

        broadcaster.shutdown().await;
    }

    #[tokio::test]
    async fn test_empty_metadata_boundary_is_sent_but_not_stored() {
        let cancel = CancellationToken::new();
        let (broadcaster, target) = bind_broadcaster(&cancel).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(&crate::protocol::build_discover(), target).await.unwrap();
        recv_datagram(&client).await;
        recv_datagram(&client).await;

        let with_meta = IcyPart { size: 1, meta: Some("StreamTitle='t';".into()) };
        broadcaster.broadcast(&with_meta, b"x").await.unwrap();
        recv_datagram(&client).await; // AUDIO
        recv_datagram(&client).await; // METADATA

        let empty_boundary = IcyPart { size: 1, meta: Some(String::new()) };
        broadcaster.broadcast(&empty_boundary, b"y").await.unwrap();
        recv_datagram(&client).await; // AUDIO
        let boundary = recv_datagram(&client).await;
        assert_eq!(boundary.msg_type, MSG_METADATA);
        assert!(boundary.is_empty());

        // Replay still carries the last non-empty block.
        assert_eq!(
            broadcaster.registry.lock().await.last_meta(),
            "StreamTitle='t';"
        );

        broadcaster.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_control_type_is_dropped() {
        let cancel = CancellationToken::new();
        let (broadcaster, target) = bind_broadcaster(&cancel).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        // Reserved type 5, then a valid DISCOVER. Only the latter registers.
        client.send_to(&[0x00, 0x05, 0x00, 0x00], target).await.unwrap();
        client.send_to(&crate::protocol::build_discover(), target).await.unwrap();

        let iam = recv_datagram(&client).await;
        assert_eq!(iam.msg_type, MSG_IAM);
        recv_datagram(&client).await; // METADATA
        assert_eq!(broadcaster.listener_count().await, 1);

        broadcaster.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_control_task() {
        let cancel = CancellationToken::new();
        let (broadcaster, _) = bind_broadcaster(&cancel).await;
        timeout(Duration::from_secs(1), broadcaster.shutdown())
            .await
            .expect("shutdown did not complete");
    }
}
