use std::net::{SocketAddr, TcpListener};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ofp_lb::config::{LbConfig, DEFAULT_LISTEN};
use ofp_lb::ofp_controller::openflow0x01::OF0x01Controller;
use ofp_lb::ofp_controller::OfpController;
use ofp_lb::policy::{HashInput, PolicyKind};
use ofp_lb::runtime::EventLoop;
use ofp_lb::{LoadBalancer, ServerId};

#[derive(Debug, Parser)]
#[command(name = "ofp_lb_controller")]
#[command(about = "OpenFlow 1.0 load-balancing controller", long_about = None)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    verbose: bool,

    /// Number of servers 10.1.1.1..N on switch ports 1..N, used when no --server is given
    #[arg(short = 'n', long, default_value = "4")]
    number: u8,

    /// Load balancer type: random, round-robin or ip-hashing
    #[arg(short = 't', long = "type", default_value = "round-robin")]
    policy: PolicyKind,

    /// Backend as ADDR@PORT or ADDR@PORT/WEIGHT, repeatable
    #[arg(long = "server", value_name = "SERVER")]
    servers: Vec<ServerId>,

    /// Address the controller listens on for switches
    #[arg(long, default_value = DEFAULT_LISTEN)]
    listen: SocketAddr,

    /// Seconds without traffic before a flow is dropped
    #[arg(long, default_value = "30")]
    idle_timeout: u64,

    /// Seconds after which an installed rule expires regardless of traffic (0 = never)
    #[arg(long, default_value = "0")]
    hard_timeout: u64,

    /// Seed of the random policy
    #[arg(long, default_value = "0")]
    seed: u64,

    #[arg(short = 'w', long, default_value = "4")]
    workers: usize,

    /// Milliseconds an install may stay unacknowledged
    #[arg(long, default_value = "2000")]
    ack_timeout: u64,

    /// Reinstalls before a flow is abandoned
    #[arg(long, default_value = "3")]
    max_retries: u32,

    /// Seconds between flow statistics requests, below the idle timeout (0 = never)
    #[arg(long, default_value = "5")]
    stats_interval: u64,

    /// Hash the whole 5-tuple instead of the client address
    #[arg(long)]
    hash_five_tuple: bool,
}

impl Cli {
    fn into_config(self) -> LbConfig {
        let servers = if self.servers.is_empty() {
            LbConfig::numbered_servers(self.number)
        } else {
            self.servers
        };
        let secs = |s: u64| if s == 0 { None } else { Some(Duration::from_secs(s)) };
        LbConfig {
            policy: self.policy,
            servers,
            idle_timeout: Duration::from_secs(self.idle_timeout),
            hard_timeout: secs(self.hard_timeout),
            seed: self.seed,
            workers: self.workers,
            ack_timeout: Duration::from_millis(self.ack_timeout),
            max_install_retries: self.max_retries,
            stats_interval: secs(self.stats_interval),
            hash_input: if self.hash_five_tuple {
                HashInput::FiveTuple
            } else {
                HashInput::ClientAddr
            },
            listen: self.listen,
            ..LbConfig::default()
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let config = cli.into_config();
    let listen = config.listen;

    let (ack_tx, ack_rx) = mpsc::channel();
    let switches = Arc::new(OF0x01Controller::new(ack_tx, config.stats_interval));
    let lb = Arc::new(
        LoadBalancer::new(config, switches.clone()).context("invalid configuration")?,
    );
    for (server, _) in lb.servers() {
        info!(%server, weight = server.weight, "backend");
    }
    let event_loop = EventLoop::start(lb.clone(), ack_rx).context("failed to start workers")?;

    let listener =
        TcpListener::bind(listen).with_context(|| format!("failed to listen on {}", listen))?;
    info!(%listen, policy = %lb.policy_kind(), "waiting for switches");

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let peer = stream.peer_addr().ok();
                let switches = switches.clone();
                let sink = event_loop.dispatcher();
                thread::spawn(move || {
                    if let Err(e) = switches.handle_client_connected(stream, &sink) {
                        warn!(?peer, error = %e, "switch connection closed");
                    }
                });
            }
            Err(e) => warn!(error = %e, "connection failed"),
        }
    }

    event_loop.shutdown();
    Ok(())
}
