use clap::Parser;
use std::net::Ipv4Addr;

/// ICY proxy side of the relay: pulls one SHOUTcast/ICY stream and fans it
/// out to UDP listeners (or stdout when fan-out is disabled).
///
/// The auto help flag is disabled because `-h` is the upstream host flag.
#[derive(Parser, Debug, Clone)]
#[command(version, about, disable_help_flag = true)]
pub struct ProxyConfig {
    /// Upstream radio host
    #[arg(short = 'h', value_name = "HOST")]
    pub host: String,

    /// Upstream resource path (e.g. /stream.mp3)
    #[arg(short = 'r', value_name = "RESOURCE")]
    pub resource: String,

    /// Upstream TCP port
    #[arg(short = 'p', value_name = "PORT")]
    pub port: u16,

    /// Request inline ICY metadata (yes|no)
    #[arg(short = 'm', value_name = "YES|NO", default_value = "no", value_parser = ["yes", "no"])]
    pub meta: String,

    /// Upstream connect/send/recv timeout in seconds (may not be 0)
    #[arg(short = 't', value_name = "SECONDS", default_value_t = 5,
          value_parser = clap::value_parser!(u64).range(1..))]
    pub timeout: u64,

    /// UDP fan-out port; absent disables fan-out and audio goes to stdout
    #[arg(short = 'P', value_name = "UDP_PORT")]
    pub udp_port: Option<u16>,

    /// Multicast group to join for control datagrams; absent disables membership
    #[arg(short = 'B', value_name = "GROUP")]
    pub multicast_group: Option<Ipv4Addr>,

    /// Listener eviction timeout in seconds (may not be 0)
    #[arg(short = 'T', value_name = "SECONDS", default_value_t = 5,
          value_parser = clap::value_parser!(u64).range(1..))]
    pub udp_timeout: u64,
}

impl ProxyConfig {
    /// `true` when inline metadata was requested with `-m yes`.
    pub fn meta_requested(&self) -> bool {
        self.meta == "yes"
    }

    /// The identification string advertised in IAM replies. Always the
    /// constructed `host:port/resource` form, never the upstream icy-name.
    pub fn radio_info(&self) -> String {
        format!("{}:{}{}", self.host, self.port, self.resource)
    }
}

/// Discovery client side of the relay: finds proxies on the LAN and drives
/// the telnet menu UI.
#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct ClientConfig {
    /// Proxy host (unicast or broadcast address)
    #[arg(short = 'H', value_name = "HOST")]
    pub proxy_host: String,

    /// Proxy UDP control port
    #[arg(short = 'P', value_name = "PORT")]
    pub proxy_port: u16,

    /// Local telnet UI port (also the local UDP bind port)
    #[arg(short = 'p', value_name = "PORT")]
    pub telnet_port: u16,

    /// Proxy eviction timeout in seconds (may not be 0)
    #[arg(short = 'T', value_name = "SECONDS", default_value_t = 5,
          value_parser = clap::value_parser!(u64).range(1..))]
    pub timeout: u64,
}

// ─────────────────────────────────────────────────────────────────────
//  Tests
// ─────────────────────────────────────────────────────────────────────
