use anyhow::Result;
use clap::Parser;
use radio_relay::broadcaster::{Broadcaster, StdoutBroadcaster, UdpBroadcaster};
use radio_relay::config::ProxyConfig;
use radio_relay::icy::IcyStream;
use radio_relay::stats::{self, Stats};
use radio_relay::util;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Traffic report cadence.
const STATS_INTERVAL_SECS: u64 = 5;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_ansi(atty::is(atty::Stream::Stderr))
        .init();

    // Flag errors exit 1 (clap's default usage-error code is 2).
    let config = match ProxyConfig::try_parse() {
        Ok(config) => config,
        Err(e) => {
            let _ = e.print();
            std::process::exit(if e.use_stderr() { 1 } else { 0 });
        }
    };

    info!(
        host = %config.host,
        resource = %config.resource,
        port = config.port,
        meta = config.meta_requested(),
        udp_port = ?config.udp_port,
        "🚀 radio-proxy starting"
    );

    let cancel = CancellationToken::new();
    tokio::spawn(util::signal_watcher(cancel.clone()));

    let stats = Stats::new();
    tokio::spawn(stats::stats_reporter(stats.clone(), STATS_INTERVAL_SECS));

    let mut stream = IcyStream::open(
        &config.host,
        config.port,
        &config.resource,
        config.timeout,
        config.meta_requested(),
    )
    .await?;
    info!(
        radio = stream.radio_info(),
        chunk_size = stream.chunk_size(),
        meta = stream.meta_enabled(),
        "✅ upstream connected"
    );

    let broadcaster: Box<dyn Broadcaster> = match config.udp_port {
        Some(port) => Box::new(UdpBroadcaster::bind(
            port,
            config.multicast_group,
            config.radio_info(),
            config.udp_timeout,
            &cancel,
            stats.clone(),
        )?),
        None => Box::new(StdoutBroadcaster::new(stats.clone())),
    };

    let mut buf = vec![0u8; stream.chunk_size()];
    let result = relay_loop(&mut stream, broadcaster.as_ref(), &mut buf, &cancel).await;

    stream.close().await;
    broadcaster.shutdown().await;
    cancel.cancel();

    result?;
    info!("bye");
    Ok(())
}

/// Pump the upstream stream into the broadcaster until shutdown.
async fn relay_loop<R: AsyncRead + Unpin>(
    stream: &mut IcyStream<R>,
    broadcaster: &dyn Broadcaster,
    buf: &mut [u8],
    cancel: &CancellationToken,
) -> Result<()> {
    loop {
        let part = match stream.read_chunk(buf).await {
            Ok(part) => part,
            Err(e) if e.is_retryable() => {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                continue;
            }
            Err(e) => {
                if cancel.is_cancelled() {
                    // Shutdown was already requested — the error is noise.
                    debug!(error = %e, "upstream read error during shutdown");
                    return Ok(());
                }
                return Err(e.into());
            }
        };

        broadcaster.broadcast(&part, buf).await?;

        if cancel.is_cancelled() {
            return Ok(());
        }
    }
}
