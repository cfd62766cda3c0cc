use clap::Parser;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vdial::config::{
    with_dialer_timeout, with_dns_cache_expiration, with_dns_refresh_duration,
    with_enable_dns_cache, with_socket_flag, with_tls,
};
use vdial::control::SocketFlag;
use vdial::{Dialer, DialerOption, Network, TlsConfig};

#[derive(Parser)]
#[command(name = "vdial")]
#[command(about = "Dial an address and report the connection", long_about = None)]
struct Args {
    /// Target address (host:port)
    addr: String,

    /// Network: tcp, tcp4, tcp6, udp, udp4, udp6 or unix
    #[arg(short, long, default_value = "tcp")]
    network: String,

    /// Per-attempt timeout, e.g. 500ms or 5s
    #[arg(short, long, default_value = "5s")]
    timeout: String,

    /// Resolve hostnames through the DNS cache
    #[arg(long)]
    dns_cache: bool,

    /// DNS cache refresh interval
    #[arg(long, default_value = "30m")]
    dns_refresh: String,

    /// DNS cache entry lifetime
    #[arg(long, default_value = "1h")]
    dns_expiration: String,

    /// Upgrade TCP connections to TLS
    #[arg(long)]
    tls: bool,

    /// Skip server certificate verification
    #[arg(long)]
    insecure: bool,

    /// PEM file of trusted CA certificates
    #[arg(long)]
    ca: Option<String>,

    /// TLS server name (defaults to the target host)
    #[arg(long)]
    server_name: Option<String>,

    /// ALPN protocol, repeatable (required for QUIC)
    #[arg(long)]
    alpn: Vec<String>,

    /// Set TCP_NODELAY on dialed sockets
    #[arg(long)]
    nodelay: bool,

    /// Number of dials to perform
    #[arg(short, long, default_value = "1")]
    repeat: usize,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,
}

fn build_tls(args: &Args) -> vdial::Result<TlsConfig> {
    let mut builder = TlsConfig::builder()
        .insecure_skip_verify(args.insecure)
        .alpn_protocols(args.alpn.iter().map(|p| p.as_bytes().to_vec()).collect());
    if let Some(ca) = &args.ca {
        builder = builder.ca_file(ca);
    }
    if let Some(name) = &args.server_name {
        builder = builder.server_name(name);
    }
    builder.build()
}

/// QUIC needs the TLS config even without --tls; TCP only upgrades on --tls.
fn wants_tls(args: &Args) -> bool {
    args.tls || (!args.alpn.is_empty() && Network::parse(&args.network).is_udp())
}

fn build_options(args: &Args) -> vdial::Result<Vec<DialerOption>> {
    let mut opts = vec![with_dialer_timeout(&args.timeout)];

    if args.dns_cache {
        opts.push(with_enable_dns_cache());
        opts.push(with_dns_refresh_duration(&args.dns_refresh));
        opts.push(with_dns_cache_expiration(&args.dns_expiration));
    }
    if wants_tls(args) {
        opts.push(with_tls(Arc::new(build_tls(args)?)));
    }
    if args.nodelay {
        opts.push(with_socket_flag(SocketFlag::TCP_NO_DELAY));
    }

    Ok(opts)
}

async fn run(args: Args) -> vdial::Result<()> {
    let dialer = Dialer::new(build_options(&args)?)?;
    dialer.start_dialer_cache();
    let dial = dialer.get_dialer();

    let mut failures = 0;
    for attempt in 1..=args.repeat.max(1) {
        let started = Instant::now();
        match dial(&args.network, &args.addr).await {
            Ok(conn) => {
                println!(
                    "#{} {} {} -> {} in {:?}",
                    attempt,
                    conn.kind(),
                    conn.local_addr().unwrap_or_default(),
                    conn.peer_addr().unwrap_or_default(),
                    started.elapsed()
                );
            }
            Err(e) => {
                failures += 1;
                warn!(attempt, error = %e, "dial failed");
                println!("#{} failed: {}", attempt, e);
            }
        }
    }

    info!(addr = %args.addr, attempts = args.repeat.max(1), failures, "done");
    Ok(())
}

fn main() -> vdial::Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(run(args))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alpn_alone_keeps_tcp_plain() {
        let args = Args::parse_from(["vdial", "127.0.0.1:8081", "--alpn", "h2"]);

        assert!(!wants_tls(&args));
    }

    #[test]
    fn alpn_alone_enables_tls_for_udp() {
        let args = Args::parse_from(["vdial", "127.0.0.1:4433", "-n", "udp", "--alpn", "vald"]);

        assert!(wants_tls(&args));
    }

    #[test]
    fn tls_flag_upgrades_tcp() {
        let args = Args::parse_from(["vdial", "127.0.0.1:8443", "--tls"]);

        assert!(wants_tls(&args));
    }
}
