/// Single-threaded model reducer behind the menu UI.
///
/// Every I/O actor (telnet reader, proxy receive loop) funnels typed events
/// into one mpsc queue; this reducer is the queue's only consumer and the
/// only writer of the proxy table, the cursor and the input history. The
/// pure reduction (`handle_event`) is synchronous and returns the follow-up
/// `Action`; the async loop around it just performs I/O — rendering,
/// keepalives, audio pass-through to stdout.
///
/// Menu rows are 1-indexed: row 1 searches for proxies, the last row quits,
/// and everything in between selects one proxy (id-ascending order).
use crate::discovery::Discovery;
use crate::telnet::TelnetWriter;
use crate::util::{now_ms, stream_title};
use anyhow::{anyhow, Result};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// ═══════════════════════════════════════════════════════════════════════
//  Constants
// ═══════════════════════════════════════════════════════════════════════

/// Reducer wake tick; bounds eviction/keepalive latency and shutdown lag.
const WAKE_TICK: Duration = Duration::from_millis(100);

/// Minimum gap between keepalive bursts.
pub const KEEPALIVE_INTERVAL_MS: u64 = 3500;

// Arrow keys arrive as ESC [ A/B; the history below is newest-first.
const UP_ARROW: [u8; 3] = [65, 91, 27];
const DOWN_ARROW: [u8; 3] = [66, 91, 27];

// ═══════════════════════════════════════════════════════════════════════
//  Events
// ═══════════════════════════════════════════════════════════════════════

/// Everything the reducer can react to. Produced by the telnet and
/// discovery actors, consumed exclusively here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    UserInput(u8),
    IamReceived {
        id: u64,
        ts_ms: u64,
        addr: SocketAddr,
        info: String,
    },
    MetaReceived {
        id: u64,
        ts_ms: u64,
        meta: String,
    },
    AudioReceived {
        id: u64,
        ts_ms: u64,
        payload: Vec<u8>,
    },
    ProxyClientCrashed(String),
    TelnetServerCrashed(String),
}

/// Side effect requested by a reduction; executed by the async loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    None,
    Discover,
    Quit,
    WriteAudio(Vec<u8>),
    Fatal(String),
}

// ═══════════════════════════════════════════════════════════════════════
//  Proxy table
// ═══════════════════════════════════════════════════════════════════════

/// One known proxy, keyed by the address fold of its control socket.
#[derive(Debug, Clone)]
pub struct ProxyInfo {
    pub id: u64,
    /// Radio name from the IAM payload.
    pub info: String,
    /// Current track title (already extracted from the metadata block).
    pub meta: String,
    pub addr: SocketAddr,
    pub last_contact_ms: u64,
    pub active: bool,
}

// ═══════════════════════════════════════════════════════════════════════
//  Model
// ═══════════════════════════════════════════════════════════════════════

pub struct Model {
    proxies: BTreeMap<u64, ProxyInfo>,
    /// Selected menu row, clamped to `[1, 2 + |proxies|]`.
    cursor: usize,
    /// Rolling 3-byte input history, newest at index 0.
    input_history: [u8; 3],
    timeout_ms: u64,
    last_keepalive_ms: u64,
}

impl Model {
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            proxies: BTreeMap::new(),
            cursor: 1,
            input_history: [0xff; 3],
            timeout_ms: timeout_secs * 1000,
            last_keepalive_ms: 0,
        }
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn proxies(&self) -> impl Iterator<Item = &ProxyInfo> {
        self.proxies.values()
    }

    fn menu_rows(&self) -> usize {
        2 + self.proxies.len()
    }

    fn clamp_cursor(&mut self) {
        self.cursor = self.cursor.clamp(1, self.menu_rows());
    }

    /// Pure reduction step: mutate state, report whether the UI is dirty and
    /// which side effect (if any) the loop must perform.
    pub fn handle_event(&mut self, event: Event) -> (bool, Action) {
        match event {
            Event::UserInput(byte) => {
                self.input_history = [byte, self.input_history[0], self.input_history[1]];
                let action = match self.input_history {
                    UP_ARROW => {
                        self.cursor = self.cursor.saturating_sub(1);
                        Action::None
                    }
                    DOWN_ARROW => {
                        self.cursor += 1;
                        Action::None
                    }
                    // Enter arrives as CR NUL — newest-first prefix [0, 13].
                    [0, 13, _] => self.activate_row(),
                    _ => Action::None,
                };
                self.clamp_cursor();
                (true, action)
            }

            Event::IamReceived { id, ts_ms, addr, info } => {
                let entry = self.proxies.entry(id).or_insert_with(|| ProxyInfo {
                    id,
                    info: String::new(),
                    meta: String::new(),
                    addr,
                    last_contact_ms: ts_ms,
                    active: false,
                });
                entry.info = info;
                entry.addr = addr;
                entry.last_contact_ms = ts_ms;
                self.clamp_cursor();
                (true, Action::None)
            }

            Event::MetaReceived { id, ts_ms, meta } => match self.proxies.get_mut(&id) {
                Some(proxy) => {
                    proxy.meta = stream_title(&meta);
                    proxy.last_contact_ms = ts_ms;
                    (true, Action::None)
                }
                None => {
                    debug!(id, "metadata from unknown proxy dropped");
                    (false, Action::None)
                }
            },

            Event::AudioReceived { id, ts_ms, payload } => match self.proxies.get_mut(&id) {
                Some(proxy) => {
                    proxy.last_contact_ms = ts_ms;
                    if proxy.active {
                        (false, Action::WriteAudio(payload))
                    } else {
                        (false, Action::None)
                    }
                }
                None => {
                    debug!(id, "audio from unknown proxy dropped");
                    (false, Action::None)
                }
            },

            Event::ProxyClientCrashed(msg) => {
                (false, Action::Fatal(format!("proxy client crashed: {msg}")))
            }
            Event::TelnetServerCrashed(msg) => {
                (false, Action::Fatal(format!("telnet server crashed: {msg}")))
            }
        }
    }

    /// Enter on the current row: search, quit, or proxy toggle.
    fn activate_row(&mut self) -> Action {
        if self.cursor == 1 {
            return Action::Discover;
        }
        if self.cursor == self.menu_rows() {
            return Action::Quit;
        }

        let target = self.proxies.keys().copied().nth(self.cursor - 2);
        if let Some(id) = target {
            let was_active = self.proxies[&id].active;
            for proxy in self.proxies.values_mut() {
                proxy.active = false;
            }
            if let Some(proxy) = self.proxies.get_mut(&id) {
                proxy.active = !was_active;
            }
        }
        Action::None
    }

    /// Drop proxies not heard from within the timeout (equality retained).
    /// Returns `true` when anything was removed.
    pub fn evict(&mut self, now_ms: u64) -> bool {
        let before = self.proxies.len();
        let timeout_ms = self.timeout_ms;
        self.proxies
            .retain(|_, p| now_ms.saturating_sub(p.last_contact_ms) <= timeout_ms);
        let removed = before - self.proxies.len();
        if removed > 0 {
            debug!(removed, remaining = self.proxies.len(), "proxies evicted");
            self.clamp_cursor();
            true
        } else {
            false
        }
    }

    /// Addresses to keepalive this wake, when the burst interval elapsed.
    pub fn keepalive_due(&mut self, now_ms: u64) -> Option<Vec<SocketAddr>> {
        if now_ms.saturating_sub(self.last_keepalive_ms) < KEEPALIVE_INTERVAL_MS {
            return None;
        }
        self.last_keepalive_ms = now_ms;
        Some(self.proxies.values().map(|p| p.addr).collect())
    }

    /// The menu as one CRLF-terminated string.
    pub fn render_text(&self) -> String {
        let mut text = String::from("Szukaj pośrednika\r\n");
        for proxy in self.proxies.values() {
            text.push_str("Pośrednik ");
            text.push_str(&proxy.info);
            if proxy.active {
                text.push_str(" *");
            }
            text.push_str("\r\n");
        }
        text.push_str("Koniec\r\n");
        for proxy in self.proxies.values() {
            if proxy.active {
                text.push_str(&proxy.meta);
                text.push_str("\r\n");
            }
        }
        text
    }

    /// Reducer loop: drain events, evict, keepalive, re-render when dirty.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<Event>,
        telnet: TelnetWriter,
        discovery: Arc<Discovery>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut stdout = tokio::io::stdout();
        telnet.render(&self.render_text(), self.cursor).await;

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            let mut dirty = false;
            match timeout(WAKE_TICK, events.recv()).await {
                Ok(Some(event)) => {
                    dirty |= self
                        .step(event, &mut stdout, &discovery, &cancel)
                        .await?;
                    while let Ok(event) = events.try_recv() {
                        dirty |= self
                            .step(event, &mut stdout, &discovery, &cancel)
                            .await?;
                    }
                }
                Ok(None) => return Ok(()), // all producers gone
                Err(_) => {}               // wake tick
            }

            dirty |= self.evict(now_ms());

            if let Some(targets) = self.keepalive_due(now_ms()) {
                for addr in targets {
                    if let Err(e) = discovery.send_keepalive(addr).await {
                        warn!(%addr, error = %e, "keepalive send failed");
                    }
                }
            }

            if dirty {
                telnet.render(&self.render_text(), self.cursor).await;
            }
        }
    }

    async fn step(
        &mut self,
        event: Event,
        stdout: &mut tokio::io::Stdout,
        discovery: &Discovery,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let (dirty, action) = self.handle_event(event);
        match action {
            Action::None => {}
            Action::Discover => {
                if let Err(e) = discovery.discover().await {
                    warn!(error = %e, "DISCOVER send failed");
                }
            }
            Action::Quit => {
                info!("quit selected");
                cancel.cancel();
            }
            Action::WriteAudio(payload) => {
                stdout.write_all(&payload).await?;
                stdout.flush().await?;
            }
            Action::Fatal(msg) => {
                cancel.cancel();
                return Err(anyhow!(msg));
            }
        }
        Ok(dirty)
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════
