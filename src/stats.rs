use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// Lock-free traffic counters shared by every actor.
#[derive(Debug)]
pub struct Stats {
    pub datagrams_received: AtomicU64,
    pub datagrams_sent: AtomicU64,
    pub audio_bytes_relayed: AtomicU64,
    pub parse_errors: AtomicU64,
    pub clients_evicted: AtomicU64,
}

impl Stats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            datagrams_received: AtomicU64::new(0),
            datagrams_sent: AtomicU64::new(0),
            audio_bytes_relayed: AtomicU64::new(0),
            parse_errors: AtomicU64::new(0),
            clients_evicted: AtomicU64::new(0),
        })
    }

    #[inline(always)]
    pub fn record_recv(&self) {
        self.datagrams_received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_sent(&self, datagrams: u64) {
        self.datagrams_sent.fetch_add(datagrams, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_audio_bytes(&self, bytes: usize) {
        self.audio_bytes_relayed
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_eviction(&self, count: u64) {
        self.clients_evicted.fetch_add(count, Ordering::Relaxed);
    }

    /// Snapshot and reset counters, return rates.
    pub fn snapshot_and_reset(&self, elapsed: Duration) -> StatsSnapshot {
        let secs = elapsed.as_secs_f64().max(0.001);

        let recv = self.datagrams_received.swap(0, Ordering::Relaxed);
        let sent = self.datagrams_sent.swap(0, Ordering::Relaxed);
        let audio = self.audio_bytes_relayed.swap(0, Ordering::Relaxed);
        let parse_err = self.parse_errors.swap(0, Ordering::Relaxed);
        let evicted = self.clients_evicted.swap(0, Ordering::Relaxed);

        StatsSnapshot {
            recv_pps: (recv as f64) / secs,
            sent_pps: (sent as f64) / secs,
            audio_kbps: ((audio as f64) * 8.0) / (secs * 1000.0),
            parse_errors: parse_err,
            clients_evicted: evicted,
        }
    }
}

#[derive(Debug)]
pub struct StatsSnapshot {
    pub recv_pps: f64,
    pub sent_pps: f64,
    pub audio_kbps: f64,
    pub parse_errors: u64,
    pub clients_evicted: u64,
}

/// Background stats reporter task. Reports via tracing on stderr — stdout
/// may be carrying raw audio in both binaries.
pub async fn stats_reporter(stats: Arc<Stats>, interval_secs: u64) {
    if interval_secs == 0 {
        // Stats disabled — park forever
        std::future::pending::<()>().await;
        return;
    }

    let interval = Duration::from_secs(interval_secs);
    let mut last = Instant::now();

    loop {
        tokio::time::sleep(interval).await;
        let now = Instant::now();
        let elapsed = now - last;
        last = now;

        let snap = stats.snapshot_and_reset(elapsed);
        info!(
            recv_pps = format!("{:.0}", snap.recv_pps),
            sent_pps = format!("{:.0}", snap.sent_pps),
            audio_kbps = format!("{:.1}", snap.audio_kbps),
            parse_errors = snap.parse_errors,
            evicted = snap.clients_evicted,
            "📊 traffic"
        );
    }
}

// ─────────────────────────────────────────────────────────────────────
//  Tests
// ─────────────────────────────────────────────────────────────────────
