use anyhow::Result;
use clap::Parser;
use radio_relay::config::ClientConfig;
use radio_relay::discovery::Discovery;
use radio_relay::model::Model;
use radio_relay::stats::{self, Stats};
use radio_relay::telnet::TelnetServer;
use radio_relay::util;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Traffic report cadence.
const STATS_INTERVAL_SECS: u64 = 5;

/// Event queue depth between the I/O actors and the reducer.
const EVENT_QUEUE_DEPTH: usize = 1024;

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
    let config = match ClientConfig::try_parse() {
        Ok(config) => config,
        Err(e) => {
            let _ = e.print();
            std::process::exit(if e.use_stderr() { 1 } else { 0 });
        }
    };

    info!(
        proxy_host = %config.proxy_host,
        proxy_port = config.proxy_port,
        telnet_port = config.telnet_port,
        "🚀 radio-client starting"
    );

    let cancel = CancellationToken::new();
    tokio::spawn(util::signal_watcher(cancel.clone()));

    let stats = Stats::new();
    tokio::spawn(stats::stats_reporter(stats.clone(), STATS_INTERVAL_SECS));

    let telnet = TelnetServer::bind(config.telnet_port)?;
    let writer = telnet.writer();
    let discovery = Arc::new(
        Discovery::bind(
            config.telnet_port,
            &config.proxy_host,
            config.proxy_port,
            stats.clone(),
        )
        .await?,
    );

    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
    let telnet_task = tokio::spawn(telnet.run(events_tx.clone(), cancel.clone()));
    let recv_task = discovery.spawn_recv_loop(events_tx, cancel.clone());

    let model = Model::new(config.timeout);
    let result = model
        .run(events_rx, writer, discovery.clone(), cancel.clone())
        .await;

    cancel.cancel();
    let _ = telnet_task.await;
    let _ = recv_task.await;

    result?;
    info!("bye");
    Ok(())
}
