//! Standalone SIP proxy / media relay binary

use clap::Parser;
use siprelay::auth::MemoryUserDirectory;
use siprelay::cdr::NullCdr;
use siprelay::limits::ParserLimits;
use siprelay::timers::spawn_timers;
use siprelay::tracker::MessageTracker;
use siprelay::transport::{run_tcp_listener, run_udp_listener, CoreEvent, ReplySink};
use siprelay::{Core, MediaMode, RelayConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "siprelay", about = "SIP proxy with B2BUA media relay")]
struct Args {
    /// Listening address for SIP over UDP and TCP
    #[arg(long, default_value = "0.0.0.0:5060")]
    bind: SocketAddr,

    /// Host written into Via and Record-Route (public name of this server)
    #[arg(long)]
    advertised_host: Option<String>,

    /// Port written into Via and Record-Route
    #[arg(long, default_value_t = 5060)]
    advertised_port: u16,

    /// Address written into rewritten SDP (where UAs send media)
    #[arg(long, default_value = "127.0.0.1")]
    server_ip: String,

    /// Digest authentication realm
    #[arg(long, default_value = "sip.local")]
    realm: String,

    /// Media handling: relay or passthrough
    #[arg(long, default_value = "relay")]
    media_mode: String,

    /// First RTP port (even)
    #[arg(long, default_value_t = 20000)]
    rtp_port_start: u16,

    /// One past the last RTP port
    #[arg(long, default_value_t = 30000)]
    rtp_port_end: u16,

    /// Strip SRTP attributes and downgrade offers to plain RTP
    #[arg(long)]
    plain_rtp: bool,

    /// Apply the hardened parser limits profile
    #[arg(long)]
    strict_limits: bool,

    /// Provision a user as user:password (repeatable)
    #[arg(long = "user")]
    users: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();
    let media_mode = match args.media_mode.as_str() {
        "relay" => MediaMode::Relay,
        "passthrough" => MediaMode::Passthrough,
        other => {
            error!(mode = other, "unknown media mode, expected relay|passthrough");
            std::process::exit(2);
        }
    };

    let cfg = RelayConfig {
        bind_addr: args.bind,
        advertised_host: args
            .advertised_host
            .unwrap_or_else(|| args.server_ip.clone()),
        advertised_port: args.advertised_port,
        server_ip: args.server_ip,
        realm: args.realm,
        media_mode,
        rtp_port_start: args.rtp_port_start,
        rtp_port_end: args.rtp_port_end,
        force_plain_rtp: args.plain_rtp,
        parser_limits: if args.strict_limits {
            ParserLimits::strict()
        } else {
            ParserLimits::default()
        },
        ..Default::default()
    };

    let mut directory = MemoryUserDirectory::new();
    for entry in &args.users {
        match entry.split_once(':') {
            Some((user, pass)) => directory.insert(user, pass),
            None => {
                error!(%entry, "malformed --user, expected user:password");
                std::process::exit(2);
            }
        }
    }

    let udp = Arc::new(UdpSocket::bind(cfg.bind_addr).await?);
    let tcp = TcpListener::bind(cfg.bind_addr).await?;
    info!(addr = %cfg.bind_addr, "SIP listening on UDP and TCP");

    let tracker = Arc::new(MessageTracker::new(cfg.tracker_capacity));
    let mut core = Core::new(
        cfg,
        Arc::new(directory),
        Arc::new(NullCdr),
        tracker,
        ReplySink::Udp(Arc::clone(&udp)),
    );

    let (tx, mut rx) = mpsc::channel::<CoreEvent>(1024);
    tokio::spawn(run_udp_listener(Arc::clone(&udp), tx.clone()));
    tokio::spawn(run_tcp_listener(tcp, tx.clone()));
    let timers = spawn_timers(tx.clone());

    let shutdown_tx = tx.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(CoreEvent::Shutdown).await;
    });
    drop(tx);

    while let Some(event) = rx.recv().await {
        if !core.handle_event(event) {
            break;
        }
    }

    for timer in timers {
        timer.abort();
    }
    info!("proxy stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
