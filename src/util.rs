use once_cell::sync::Lazy;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Process-start anchor for the monotonic millisecond clock.
static START: Lazy<Instant> = Lazy::new(Instant::now);

/// Milliseconds elapsed since process start (monotonic).
///
/// All liveness bookkeeping (listener registries, proxy tables, keepalive
/// cadence) runs on this clock so wall-clock jumps cannot evict anyone.
#[inline]
pub fn now_ms() -> u64 {
    START.elapsed().as_millis() as u64
}

/// Extract the display title from a raw ICY metadata block.
///
/// Metadata blocks arrive NUL-padded to a multiple of 16 bytes and usually
/// look like `StreamTitle='Artist - Title';StreamUrl='';`. The padding is
/// stripped first; the title span runs from the first `StreamTitle='` to the
/// last `'` in the block. Anything that doesn't match is returned as-is
/// (minus padding).
pub fn stream_title(meta: &str) -> String {
    let trimmed = meta.trim_end_matches('\0');
    const PREFIX: &str = "StreamTitle='";
    if let Some(start) = trimmed.find(PREFIX) {
        let rest = &trimmed[start + PREFIX.len()..];
        if let Some(end) = rest.rfind('\'') {
            return rest[..end].to_string();
        }
    }
    trimmed.to_string()
}

/// Watch for SIGINT/SIGTERM and flip the shared cancellation token.
///
/// The sole outside writer of the token; every actor loop observes it within
/// one 100 ms tick. SIGPIPE needs no handling here — socket writes surface
/// `EPIPE` as ordinary `io::Error`s.
pub async fn signal_watcher(cancel: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to install SIGTERM handler");
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("SIGINT received, shutting down"),
        _ = sigterm.recv() => info!("SIGTERM received, shutting down"),
    }
    cancel.cancel();
}

// ─────────────────────────────────────────────────────────────────────
//  Tests
// ─────────────────────────────────────────────────────────────────────
