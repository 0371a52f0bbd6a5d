/// Minimal TELNET terminal driver for the menu UI.
///
/// Accepts exactly one terminal at a time (backlog 1; the next client is
/// picked up after a disconnect), switches it into character-at-a-time mode
/// with three option negotiations, and forwards every received byte as a
/// `UserInput` event. All keystroke semantics live in the model reducer —
/// this server interprets nothing.
///
/// Rendering goes through a `TelnetWriter` handle so the reducer can push
/// frames without owning the connection. Write failures (peer already gone)
/// are logged and swallowed; the read loop notices the disconnect and
/// re-accepts.
use crate::model::Event;
use anyhow::{Context, Result};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpSocket};
use tokio::select;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// ═══════════════════════════════════════════════════════════════════════
//  Protocol bytes
// ═══════════════════════════════════════════════════════════════════════

pub const IAC: u8 = 255;
pub const DO: u8 = 253;
pub const WILL: u8 = 251;
pub const SB: u8 = 250;
pub const SE: u8 = 240;
pub const OPT_ECHO: u8 = 1;
pub const OPT_LINEMODE: u8 = 34;

/// IAC DO LINEMODE
pub const DO_LINEMODE: [u8; 3] = [IAC, DO, OPT_LINEMODE];
/// IAC SB LINEMODE MODE 0 IAC SE — character-at-a-time
pub const LINEMODE_CHAR_MODE: [u8; 7] = [IAC, SB, OPT_LINEMODE, 1, 0, IAC, SE];
/// IAC WILL ECHO
pub const WILL_ECHO: [u8; 3] = [IAC, WILL, OPT_ECHO];

/// Home + clear-screen ANSI prefix of every frame.
const CLEAR_SCREEN: &[u8] = b"\x1b[H\x1b[2J";

/// Build one UI frame: clear, text verbatim, cursor to `cursor_row`
/// (1-indexed).
pub fn render_frame(text: &str, cursor_row: usize) -> Vec<u8> {
    let mut frame = Vec::with_capacity(CLEAR_SCREEN.len() + text.len() + 16);
    frame.extend_from_slice(CLEAR_SCREEN);
    frame.extend_from_slice(text.as_bytes());
    frame.extend_from_slice(format!("\x1b[{cursor_row};0H").as_bytes());
    frame
}

// ═══════════════════════════════════════════════════════════════════════
//  Writer handle
// ═══════════════════════════════════════════════════════════════════════

/// Cloneable render handle; holds the write half of whichever terminal is
/// currently connected (None between clients).
#[derive(Clone)]
pub struct TelnetWriter {
    slot: Arc<Mutex<Option<OwnedWriteHalf>>>,
}

impl TelnetWriter {
    fn empty() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
        }
    }

    /// Push one frame to the connected terminal, if any. Errors drop the
    /// stale write half and are otherwise ignored.
    pub async fn render(&self, text: &str, cursor_row: usize) {
        let mut slot = self.slot.lock().await;
        if let Some(writer) = slot.as_mut() {
            let frame = render_frame(text, cursor_row);
            let result = async {
                writer.write_all(&frame).await?;
                writer.flush().await
            }
            .await;
            if let Err(e) = result {
                debug!(error = %e, "render write failed, dropping terminal writer");
                *slot = None;
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Server
// ═══════════════════════════════════════════════════════════════════════

pub struct TelnetServer {
    listener: TcpListener,
    writer: TelnetWriter,
}

impl TelnetServer {
    /// Bind `0.0.0.0:<port>` with a backlog of 1.
    pub fn bind(port: u16) -> Result<Self> {
        let socket = TcpSocket::new_v4().context("create telnet socket")?;
        socket.set_reuseaddr(true)?;
        socket
            .bind(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)))
            .with_context(|| format!("bind telnet socket on port {port}"))?;
        let listener = socket.listen(1).context("listen on telnet socket")?;
        info!(port, "✅ telnet server bound");
        Ok(Self {
            listener,
            writer: TelnetWriter::empty(),
        })
    }

    /// Render handle; grab it before `run` consumes the server.
    pub fn writer(&self) -> TelnetWriter {
        self.writer.clone()
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept/serve loop. One terminal at a time; each received byte becomes
    /// one `UserInput` event. A listener-level failure emits
    /// `TelnetServerCrashed` and ends the task.
    pub async fn run(self, events: mpsc::Sender<Event>, cancel: CancellationToken) {
        loop {
            let (stream, peer) = select! {
                _ = cancel.cancelled() => return,
                accepted = self.listener.accept() => match accepted {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "telnet accept failed");
                        let _ = events
                            .send(Event::TelnetServerCrashed(e.to_string()))
                            .await;
                        return;
                    }
                },
            };
            info!(%peer, "🖥️ terminal connected");

            let (mut read_half, mut write_half) = stream.into_split();

            let negotiated = async {
                write_half.write_all(&DO_LINEMODE).await?;
                write_half.write_all(&LINEMODE_CHAR_MODE).await?;
                write_half.write_all(&WILL_ECHO).await?;
                write_half.flush().await
            }
            .await;
            if let Err(e) = negotiated {
                debug!(%peer, error = %e, "option negotiation failed");
                continue;
            }

            *self.writer.slot.lock().await = Some(write_half);

            let mut buf = [0u8; 256];
            loop {
                let read = select! {
                    _ = cancel.cancelled() => {
                        *self.writer.slot.lock().await = None;
                        return;
                    }
                    r = read_half.read(&mut buf) => r,
                };
                match read {
                    Ok(0) => break,
                    Ok(n) => {
                        for &byte in &buf[..n] {
                            if events.send(Event::UserInput(byte)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        debug!(%peer, error = %e, "terminal read failed");
                        break;
                    }
                }
            }

            *self.writer.slot.lock().await = None;
            info!(%peer, "terminal disconnected");
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpStream;
    use tokio::time::timeout;

    #[test]
    fn test_negotiation_bytes() {
        assert_eq!(DO_LINEMODE, [0xff, 0xfd, 0x22]);
        assert_eq!(LINEMODE_CHAR_MODE, [0xff, 0xfa, 0x22, 0x01, 0x00, 0xff, 0xf0]);
        assert_eq!(WILL_ECHO, [0xff, 0xfb, 0x01]);
    }

    #[test]
    fn test_render_frame_layout() {
        let frame = render_frame("line\r\n", 5);
        assert!(frame.starts_with(b"\x1b[H\x1b[2J"));
        assert!(frame.ends_with(b"\x1b[5;0H"));
        let middle = &frame[7..frame.len() - 6];
        assert_eq!(middle, b"line\r\n");
    }

    async fn read_exactly(stream: &mut TcpStream, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        timeout(Duration::from_secs(2), stream.read_exact(&mut buf))
            .await
            .expect("timed out")
            .expect("read failed");
        buf
    }

    #[tokio::test]
    async fn test_client_negotiation_input_and_render() {
        let server = TelnetServer::bind(0).unwrap();
        let addr = server.local_addr().unwrap();
        let writer = server.writer();
        let (tx, mut rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(server.run(tx, cancel.clone()));

        let mut client = TcpStream::connect(("127.0.0.1", addr.port())).await.unwrap();

        // The three negotiations arrive back-to-back on accept.
        let negotiation = read_exactly(&mut client, 13).await;
        assert_eq!(&negotiation[..3], &DO_LINEMODE);
        assert_eq!(&negotiation[3..10], &LINEMODE_CHAR_MODE);
        assert_eq!(&negotiation[10..], &WILL_ECHO);

        // Keystrokes become UserInput events, byte by byte.
        client.write_all(&[27, 91, 66]).await.unwrap();
        for expected in [27u8, 91, 66] {
            match timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap() {
                Event::UserInput(b) => assert_eq!(b, expected),
                other => panic!("expected UserInput, got {other:?}"),
            }
        }

        // Rendering reaches the terminal through the writer handle.
        writer.render("Koniec\r\n", 1).await;
        let frame = read_exactly(&mut client, 7 + 8 + 6).await;
        assert_eq!(frame, render_frame("Koniec\r\n", 1));

        cancel.cancel();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn test_next_client_accepted_after_disconnect() {
        let server = TelnetServer::bind(0).unwrap();
        let addr = server.local_addr().unwrap();
        let (tx, _rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(server.run(tx, cancel.clone()));

        let mut first = TcpStream::connect(("127.0.0.1", addr.port())).await.unwrap();
        read_exactly(&mut first, 13).await;
        drop(first);

        let mut second = TcpStream::connect(("127.0.0.1", addr.port())).await.unwrap();
        let negotiation = read_exactly(&mut second, 13).await;
        assert_eq!(&negotiation[..3], &DO_LINEMODE);

        cancel.cancel();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn test_render_without_client_is_a_noop() {
        let server = TelnetServer::bind(0).unwrap();
        let writer = server.writer();
        writer.render("anything\r\n", 1).await;
    }
}
