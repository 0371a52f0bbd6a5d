/// ICY / SHOUTcast stream reader.
///
/// Speaks the HTTP/1.0 dialect of SHOUTcast servers and demuxes the response
/// body into audio and inline metadata:
/// ```text
/// ┌──────────────────┬────────┬──────────────────┬──────────────────┬────────┬───
/// │ audio (metaint B)│ L byte │ metadata (L*16 B)│ audio (metaint B)│ L byte │ …
/// └──────────────────┴────────┴──────────────────┴──────────────────┴────────┴───
/// ```
/// Metadata blocks only appear when the request carried `Icy-MetaData: 1`
/// *and* the response announced `icy-metaint`. Without metadata the body is
/// a plain byte stream read in `DEFAULT_META_INTERVAL`-sized chunks.
///
/// The demux is byte-exact: concatenating `IcyPart` audio slices reproduces
/// the audio-only subsequence of the upstream bytes, and concatenating the
/// metadata strings reproduces the metadata-only subsequence.
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

// ═══════════════════════════════════════════════════════════════════════
//  Constants
// ═══════════════════════════════════════════════════════════════════════

/// Chunk size used when the server announces no metadata interval.
pub const DEFAULT_META_INTERVAL: usize = 16384;

/// Status lines accepted from the upstream server (ASCII case-insensitive).
const OK_STATUS_LINES: [&str; 3] = ["ICY 200 OK", "HTTP/1.0 200 OK", "HTTP/1.1 200 OK"];

/// Upper bound on a single response header line.
const MAX_HEADER_LINE: usize = 4096;

// ═══════════════════════════════════════════════════════════════════════
//  Errors
// ═══════════════════════════════════════════════════════════════════════

/// Reader failure taxonomy. `Timeout` is the only retryable variant — the
/// caller loops on it; everything else tears the stream down.
#[derive(Debug, Error)]
pub enum IcyError {
    #[error("upstream receive timeout elapsed")]
    Timeout,

    #[error("upstream closed the connection")]
    ConnectionClosed,

    #[error("invalid status line: {0:?}")]
    InvalidStatus(String),

    #[error("invalid response header: {0}")]
    InvalidHeader(String),

    #[error("server interleaves metadata that was not requested")]
    UnsolicitedMetadata,

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl IcyError {
    /// `true` for the receive-timeout tick the caller should retry on.
    #[inline]
    pub fn is_retryable(&self) -> bool {
        matches!(self, IcyError::Timeout)
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  ICYPart
// ═══════════════════════════════════════════════════════════════════════

/// One demuxed slice of the upstream body.
///
/// `size` bytes of the caller's buffer hold audio. `meta` is `Some` exactly
/// when this read landed on a metadata boundary — `Some(String::new())` is a
/// zero-length metadata block, which still matters to listeners as a
/// boundary signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IcyPart {
    pub size: usize,
    pub meta: Option<String>,
}

// ═══════════════════════════════════════════════════════════════════════
//  IcyStream
// ═══════════════════════════════════════════════════════════════════════

/// A connected, header-parsed ICY stream.
///
/// Generic over the transport so the demux state machine can be driven by
/// scripted readers in tests; production code uses `IcyStream::open`.
pub struct IcyStream<R> {
    reader: R,
    read_timeout: Duration,
    /// Metadata mode after header resolution (requested AND announced).
    meta_enabled: bool,
    /// Audio bytes between metadata boundaries.
    meta_interval: usize,
    /// Audio bytes still owed in the current block.
    remaining: usize,
    radio_info: String,
}

fn build_request(host: &str, resource: &str, request_meta: bool) -> String {
    let mut req = format!(
        "GET {resource} HTTP/1.0\r\nHost: {host}\r\nUser-Agent: radio-proxy\r\n"
    );
    if request_meta {
        req.push_str("Icy-MetaData: 1\r\n");
    }
    req.push_str("\r\n");
    req
}

/// Case-insensitive `name: value` extraction; empty values are ignored.
fn header_value<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    if line.len() <= name.len() {
        return None;
    }
    let (head, rest) = line.split_at(name.len());
    if !head.eq_ignore_ascii_case(name) {
        return None;
    }
    let value = rest.strip_prefix(':')?.trim_start();
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

impl IcyStream<TcpStream> {
    /// Connect to the upstream server, send the request, parse the response
    /// headers. Every socket operation is bounded by `timeout_secs`.
    pub async fn open(
        host: &str,
        port: u16,
        resource: &str,
        timeout_secs: u64,
        request_meta: bool,
    ) -> Result<Self, IcyError> {
        let read_timeout = Duration::from_secs(timeout_secs);

        let mut stream = timeout(read_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| IcyError::Timeout)??;

        let request = build_request(host, resource, request_meta);
        timeout(read_timeout, stream.write_all(request.as_bytes()))
            .await
            .map_err(|_| IcyError::Timeout)??;

        let default_info = format!("{host}:{port}{resource}");
        Self::from_reader(stream, request_meta, default_info, read_timeout).await
    }

    /// Shut the transport down. Idempotent; errors are swallowed so this is
    /// safe in failure paths.
    pub async fn close(&mut self) {
        let _ = self.reader.shutdown().await;
    }
}

impl<R: AsyncRead + Unpin> IcyStream<R> {
    /// Parse response headers from an already-connected transport.
    pub async fn from_reader(
        reader: R,
        request_meta: bool,
        default_radio_info: String,
        read_timeout: Duration,
    ) -> Result<Self, IcyError> {
        let mut stream = IcyStream {
            reader,
            read_timeout,
            meta_enabled: false,
            meta_interval: DEFAULT_META_INTERVAL,
            remaining: 0,
            radio_info: default_radio_info,
        };
        stream.parse_headers(request_meta).await?;
        Ok(stream)
    }

    /// Chunk size the read buffer must accommodate.
    pub fn chunk_size(&self) -> usize {
        self.meta_interval
    }

    /// Radio name: the `icy-name` header when the server sent one, the
    /// constructed `host:port/resource` string otherwise.
    pub fn radio_info(&self) -> &str {
        &self.radio_info
    }

    /// `true` when metadata blocks will be demuxed from the body.
    pub fn meta_enabled(&self) -> bool {
        self.meta_enabled
    }

    async fn read_u8_timed(&mut self) -> Result<u8, IcyError> {
        match timeout(self.read_timeout, self.reader.read_u8()).await {
            Ok(Ok(b)) => Ok(b),
            Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                Err(IcyError::ConnectionClosed)
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(IcyError::Timeout),
        }
    }

    async fn read_exact_timed(&mut self, buf: &mut [u8]) -> Result<(), IcyError> {
        match timeout(self.read_timeout, self.reader.read_exact(buf)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                Err(IcyError::ConnectionClosed)
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(IcyError::Timeout),
        }
    }

    /// Read one header line, terminated by the first `\r\n`. NUL bytes and
    /// EOF inside the header block are fatal.
    async fn read_header_line(&mut self) -> Result<String, IcyError> {
        let mut line = Vec::new();
        loop {
            let b = self.read_u8_timed().await?;
            if b == 0 {
                return Err(IcyError::InvalidHeader("NUL byte in header".into()));
            }
            line.push(b);
            if line.len() >= 2 && line[line.len() - 2] == b'\r' && line[line.len() - 1] == b'\n' {
                return Ok(String::from_utf8_lossy(&line).into_owned());
            }
            if line.len() > MAX_HEADER_LINE {
                return Err(IcyError::InvalidHeader("header line too long".into()));
            }
        }
    }

    async fn parse_headers(&mut self, request_meta: bool) -> Result<(), IcyError> {
        let status = self.read_header_line().await?;
        let status_line = status.strip_suffix("\r\n").unwrap_or(&status);
        if !OK_STATUS_LINES
            .iter()
            .any(|ok| ok.eq_ignore_ascii_case(status_line))
        {
            return Err(IcyError::InvalidStatus(status_line.to_string()));
        }

        let mut meta_found = false;
        loop {
            let raw = self.read_header_line().await?;
            if raw == "\r\n" {
                break;
            }
            let line = raw.strip_suffix("\r\n").unwrap_or(&raw);

            if let Some(value) = header_value(line, "icy-metaint") {
                let interval: usize = value
                    .parse()
                    .map_err(|_| IcyError::InvalidHeader(format!("icy-metaint: {value}")))?;
                if interval == 0 {
                    return Err(IcyError::InvalidHeader("icy-metaint: 0".into()));
                }
                self.meta_interval = interval;
                meta_found = true;
            } else if let Some(value) = header_value(line, "icy-name") {
                self.radio_info = value.to_string();
            }
        }

        if request_meta && !meta_found {
            // Server ignores Icy-MetaData — fall back to a plain body.
            debug!("no icy-metaint in response, continuing without metadata");
            self.meta_enabled = false;
        } else if !request_meta && meta_found {
            // We cannot safely skip metadata we did not ask for.
            return Err(IcyError::UnsolicitedMetadata);
        } else {
            self.meta_enabled = meta_found;
        }
        Ok(())
    }

    /// Read one part of the body into `buf`.
    ///
    /// `buf` must hold at least `chunk_size()` bytes. A single `read` is
    /// issued; partial reads roll the shortfall into the next call so
    /// metadata boundaries land exactly every `meta_interval` audio bytes.
    pub async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<IcyPart, IcyError> {
        let want = if self.remaining > 0 {
            self.remaining
        } else {
            self.meta_interval
        };
        let span = want.min(buf.len());

        let n = match timeout(self.read_timeout, self.reader.read(&mut buf[..span])).await {
            Ok(Ok(0)) => return Err(IcyError::ConnectionClosed),
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(IcyError::Timeout),
        };
        self.remaining = want - n;

        let meta = if self.meta_enabled && self.remaining == 0 {
            Some(self.read_meta().await?)
        } else {
            None
        };

        Ok(IcyPart { size: n, meta })
    }

    /// Read one metadata block: a length byte `L` followed by `L * 16` bytes,
    /// returned verbatim (lossy UTF-8, NUL padding preserved).
    async fn read_meta(&mut self) -> Result<String, IcyError> {
        let len = self.read_u8_timed().await? as usize * 16;
        let mut block = vec![0u8; len];
        self.read_exact_timed(&mut block).await?;
        Ok(String::from_utf8_lossy(&block).into_owned())
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════
