use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "rendezvous",
    version,
    about = "WebSocket relay between a phone provider and its clients"
)]
pub struct Cli {
    /// Port to listen on (overrides config file setting)
    pub port: Option<u16>,

    /// Path to the configuration file
    #[arg(short, long, default_value = "relay.yaml")]
    pub config: PathBuf,

    /// Interface to bind (overrides config file setting)
    #[arg(long)]
    pub listen: Option<IpAddr>,

    /// Seconds between liveness pings (overrides config file setting)
    #[arg(long)]
    pub ping_interval: Option<u64>,

    /// Write an audit trail to this JSON-lines file
    #[arg(long)]
    pub audit_log: Option<PathBuf>,
}
