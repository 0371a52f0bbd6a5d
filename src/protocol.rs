/// Proxy ↔ Listener UDP Fan-out Protocol
///
/// Datagram format (4-byte header + variable payload):
/// ```text
/// ┌─────────────┬─────────────┬────────────────┐
/// │ Byte 0-1    │ Byte 2-3    │ Byte 4..N      │
/// │ Type        │ Payload Len │ Payload        │
/// │ (u16 BE)    │ (u16 BE)    │ (up to 1024B)  │
/// └─────────────┴─────────────┴────────────────┘
/// ```
///
/// A listener announces itself with DISCOVER, stays registered with
/// KEEPALIVE, and receives IAM / AUDIO / METADATA in return. Audio chunks
/// larger than `MAX_PAYLOAD` are fragmented into back-to-back AUDIO
/// datagrams. METADATA is sent even when empty — a zero-payload datagram
/// marks a metadata boundary.
use bytes::{BufMut, BytesMut};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;

// ═══════════════════════════════════════════════════════════════════════
//  Constants
// ═══════════════════════════════════════════════════════════════════════

/// Fixed header size (type + payload length).
pub const HEADER_SIZE: usize = 4;

/// Maximum payload of an outbound AUDIO/METADATA datagram.
pub const MAX_PAYLOAD: usize = 1024;

// ── Message Types ──────────────────────────────────────────────────────
// Code 5 is reserved and never used on the wire.

/// Listener → proxy: register and request IAM + current metadata.
pub const MSG_DISCOVER: u16 = 1;
/// Proxy → listener: radio identification string.
pub const MSG_IAM: u16 = 2;
/// Listener → proxy: refresh registration.
pub const MSG_KEEPALIVE: u16 = 3;
/// Proxy → listener: one audio fragment.
pub const MSG_AUDIO: u16 = 4;
/// Proxy → listener: one metadata block (possibly empty).
pub const MSG_METADATA: u16 = 6;

// ═══════════════════════════════════════════════════════════════════════
//  Parsed Datagram
// ═══════════════════════════════════════════════════════════════════════

/// A structurally valid fan-out datagram.
///
/// Parsing only validates the frame shape; unknown type codes still parse so
/// that callers can log them before dropping (protocol errors are
/// message-local, never fatal to the receive loop).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub msg_type: u16,
    pub payload: Vec<u8>,
}

impl Datagram {
    /// Parse a datagram from raw UDP bytes.
    ///
    /// Returns `None` if the buffer is shorter than the header or shorter
    /// than the declared payload length. Bytes past the declared length are
    /// ignored.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }

        let msg_type = u16::from_be_bytes([buf[0], buf[1]]);
        let len = u16::from_be_bytes([buf[2], buf[3]]) as usize;

        if buf.len() < HEADER_SIZE + len {
            return None;
        }

        Some(Datagram {
            msg_type,
            payload: buf[HEADER_SIZE..HEADER_SIZE + len].to_vec(),
        })
    }

    /// `true` when the payload is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Datagram Builders
// ═══════════════════════════════════════════════════════════════════════

/// Build a raw datagram for transmission. `payload` must fit in a u16.
pub fn build(msg_type: u16, payload: &[u8]) -> Vec<u8> {
    debug_assert!(payload.len() <= u16::MAX as usize);
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    buf.put_u16(msg_type);
    buf.put_u16(payload.len() as u16);
    buf.put_slice(payload);
    buf.to_vec()
}

/// Build an empty-payload DISCOVER (`00 01 00 00`).
pub fn build_discover() -> Vec<u8> {
    build(MSG_DISCOVER, &[])
}

/// Build an empty-payload KEEPALIVE.
pub fn build_keepalive() -> Vec<u8> {
    build(MSG_KEEPALIVE, &[])
}

/// Build an IAM carrying the radio identification string.
pub fn build_iam(radio_info: &str) -> Vec<u8> {
    build(MSG_IAM, radio_info.as_bytes())
}

/// Build one AUDIO fragment. `chunk` must not exceed `MAX_PAYLOAD`.
pub fn build_audio(chunk: &[u8]) -> Vec<u8> {
    debug_assert!(chunk.len() <= MAX_PAYLOAD);
    build(MSG_AUDIO, chunk)
}

/// Build one METADATA datagram (empty payload is a boundary marker).
pub fn build_metadata(meta: &str) -> Vec<u8> {
    build(MSG_METADATA, meta.as_bytes())
}

/// Split an ICY chunk into the `MAX_PAYLOAD`-sized fragments that go on the
/// wire, in order. An empty chunk yields no fragments.
pub fn audio_chunks(data: &[u8]) -> impl Iterator<Item = &[u8]> {
    data.chunks(MAX_PAYLOAD)
}

// ═══════════════════════════════════════════════════════════════════════
//  Address Key
// ═══════════════════════════════════════════════════════════════════════

/// Fold a peer address into the u64 key used by registries and proxy tables.
///
/// IPv4 addresses (the only ones the fan-out protocol targets) use the
/// stable `(ip << 32) | port` fold so the key is reproducible across runs.
pub fn addr_key(addr: &SocketAddr) -> u64 {
    match addr {
        SocketAddr::V4(v4) => {
            let ip = u32::from_be_bytes(v4.ip().octets()) as u64;
            (ip << 32) | v4.port() as u64
        }
        SocketAddr::V6(_) => {
            let mut hasher = DefaultHasher::new();
            addr.hash(&mut hasher);
            hasher.finish()
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    #[test]
    fn test_discover_wire_bytes() {
        assert_eq!(build_discover(), vec![0x00, 0x01, 0x00, 0x00]);
    }

    #[test]
    fn test_keepalive_wire_bytes() {
        assert_eq!(build_keepalive(), vec![0x00, 0x03, 0x00, 0x00]);
    }

    #[test]
    fn test_header_layout() {
        let payload = b"R";
        let d = build_iam("R");
        assert_eq!(&d[0..2], &MSG_IAM.to_be_bytes());
        assert_eq!(&d[2..4], &(payload.len() as u16).to_be_bytes());
        assert_eq!(d.len(), HEADER_SIZE + payload.len());
        assert_eq!(&d[4..], payload);
    }

    #[test]
    fn test_empty_metadata_datagram() {
        let d = build_metadata("");
        assert_eq!(d, vec![0x00, 0x06, 0x00, 0x00]);
    }

    #[test]
    fn test_parse_roundtrip() {
        let d = build_audio(b"abc");
        let parsed = Datagram::parse(&d).unwrap();
        assert_eq!(parsed.msg_type, MSG_AUDIO);
        assert_eq!(parsed.payload, b"abc");
    }

    #[test]
    fn test_parse_short_buffer() {
        assert_eq!(Datagram::parse(&[0x00, 0x01, 0x00]), None);
        assert_eq!(Datagram::parse(&[]), None);
    }

    #[test]
    fn test_parse_truncated_payload() {
        // Declared length 5, only 2 payload bytes present.
        let buf = [0x00, 0x04, 0x00, 0x05, 0xaa, 0xbb];
        assert_eq!(Datagram::parse(&buf), None);
    }

    #[test]
    fn test_parse_ignores_trailing_bytes() {
        let buf = [0x00, 0x04, 0x00, 0x02, 0xaa, 0xbb, 0xcc, 0xdd];
        let parsed = Datagram::parse(&buf).unwrap();
        assert_eq!(parsed.payload, vec![0xaa, 0xbb]);
    }

    #[test]
    fn test_parse_keeps_unknown_types() {
        // Reserved/unknown codes parse — dispatch logs and drops them.
        let buf = [0x00, 0x05, 0x00, 0x00];
        let parsed = Datagram::parse(&buf).unwrap();
        assert_eq!(parsed.msg_type, 5);
        assert!(parsed.is_empty());
    }

    #[test]
    fn test_audio_chunking_2500_bytes() {
        let data = vec![0x42u8; 2500];
        let sizes: Vec<usize> = audio_chunks(&data).map(|c| c.len()).collect();
        assert_eq!(sizes, vec![1024, 1024, 452]);

        let total: Vec<u8> = audio_chunks(&data).flatten().copied().collect();
        assert_eq!(total, data);
    }

    #[test]
    fn test_audio_chunking_exact_multiple() {
        let data = vec![0u8; 2048];
        let sizes: Vec<usize> = audio_chunks(&data).map(|c| c.len()).collect();
        assert_eq!(sizes, vec![1024, 1024]);
    }

    #[test]
    fn test_audio_chunking_empty() {
        assert_eq!(audio_chunks(&[]).count(), 0);
    }

    #[test]
    fn test_addr_key_fold() {
        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 2), 7777));
        let ip = u32::from_be_bytes([192, 168, 1, 2]) as u64;
        assert_eq!(addr_key(&addr), (ip << 32) | 7777);
    }

    #[test]
    fn test_addr_key_distinguishes_ports() {
        let a = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 1000));
        let b = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 1001));
        assert_ne!(addr_key(&a), addr_key(&b));
    }
}
