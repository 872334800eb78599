use anyhow::Result;
use clap::Parser;
use minisocks::Socks5Server;
use std::net::IpAddr;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "A single-threaded SOCKS5 proxy", long_about = None)]
struct Args {
    /// Listening port
    #[arg(short, long, default_value_t = 1080)]
    port: u16,

    /// Listening interface
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Upstream DNS server (host or host:port)
    #[arg(short, long, default_value = minisocks::server::DEFAULT_DNS_SERVER)]
    dns: String,

    /// Give up on a pending DNS query after this many seconds
    #[arg(long)]
    resolve_timeout: Option<u64>,

    /// Close sessions idle for this many seconds
    #[arg(long)]
    idle_timeout: Option<u64>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Parse args
    let args = Args::parse();

    // Initialize tracing subscriber
    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt().with_max_level(level).init();

    let listen = std::net::SocketAddr::new(args.bind, args.port);

    // Instantiate server
    let mut server = Socks5Server::new(listen.to_string())
        .with_dns(args.dns)
        .with_resolve_timeout(args.resolve_timeout.map(Duration::from_secs))
        .with_idle_timeout(args.idle_timeout.map(Duration::from_secs));

    info!("Starting SOCKS5 proxy: {}", server.listen_addr);

    tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
            Ok(())
        }
    }
}
