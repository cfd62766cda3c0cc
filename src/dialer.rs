//! The dialer: turns a `(network, address)` pair into a live connection.
//!
//! With DNS caching on, hostnames resolve through the cache and every
//! cached IP is tried in round-robin order before the entry is dropped and
//! re-resolved. Retries share one deadline and a fixed number of resolve
//! rounds; when they run out the original address is dialed directly.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::addr::{self, AddrInfo};
use crate::config::{DialerConfig, DialerOption};
use crate::control::SocketController;
use crate::dns::DialerCacheEntry;
use crate::error::{Error, Result};
use crate::resolver::{CachedResolver, DnsCache};
use crate::transport::quic::QuicDialer;
use crate::transport::tcp::TcpConnector;
use crate::transport::tls::TlsHandshaker;
use crate::transport::{Conn, Network};

/// Retry window when no dial timeout is configured.
const DEFAULT_RETRY_WINDOW: Duration = Duration::from_secs(30);

/// Resolutions a single cached dial may perform.
const MAX_RESOLVE_ROUNDS: u32 = 3;

/// UDP port that stays on plain transport instead of QUIC.
const DNS_PORT: u16 = 53;

/// Dial function handed to connection pools and clients.
pub type DialFunc = Arc<dyn Fn(&str, &str) -> BoxFuture<'static, Result<Conn>> + Send + Sync>;

/// Connection dialer. Cheap to clone; clones share caches and sessions.
#[derive(Clone)]
pub struct Dialer {
    inner: Arc<DialerInner>,
}

struct DialerInner {
    config: DialerConfig,
    connector: TcpConnector,
    resolver: Option<CachedResolver>,
    tls: Option<TlsHandshaker>,
    quic: QuicDialer,
    addrs: RwLock<FxHashMap<String, Arc<AddrInfo>>>,
}

enum DialState {
    ResolveOrCacheHit,
    AttemptIp(Arc<DialerCacheEntry>),
    Exhausted,
}

impl Dialer {
    /// Build a dialer from `opts`, applied in order over the defaults.
    pub fn new(opts: impl IntoIterator<Item = DialerOption>) -> Result<Self> {
        let config = DialerConfig::from_options(opts);
        config.validate()?;

        let keepalive = i32::try_from(config.keepalive.as_secs()).unwrap_or(i32::MAX);
        let ctrl = SocketController::new(config.socket_flag, keepalive);
        let connector = TcpConnector::new(ctrl.get_control())
            .timeout(config.timeout)
            .dual_stack(config.dual_stack)
            .fallback_delay(config.fallback_delay);

        let resolver = config.enable_dns_cache.then(|| match &config.dns_cache {
            Some(cache) => CachedResolver::new(cache.clone()),
            None => CachedResolver::with_refresh(config.dns_expiration, config.dns_refresh),
        });

        let tls = config
            .tls
            .clone()
            .map(|tls| TlsHandshaker::new(tls, connector.clone(), config.timeout));

        debug!(config = ?config, "dialer created");

        Ok(Self {
            inner: Arc::new(DialerInner {
                config,
                connector,
                resolver,
                tls,
                quic: QuicDialer::new(),
                addrs: RwLock::new(FxHashMap::default()),
            }),
        })
    }

    /// The dial function backed by this dialer.
    pub fn get_dialer(&self) -> DialFunc {
        let dialer = self.clone();
        Arc::new(move |network: &str, addr: &str| {
            let dialer = dialer.clone();
            let network = network.to_string();
            let addr = addr.to_string();
            Box::pin(async move { dialer.dial_context(&network, &addr).await })
        })
    }

    pub async fn dial_context(&self, network: &str, addr: &str) -> Result<Conn> {
        let network = Network::parse(network);
        match &self.inner.resolver {
            Some(resolver) => self.cached_dial(resolver, network, addr).await,
            None => self.dial(network, addr).await,
        }
    }

    /// Start the DNS cache expiry loop. Later calls do nothing.
    pub fn start_dialer_cache(&self) {
        if let Some(resolver) = &self.inner.resolver {
            resolver.cache().start();
        }
    }

    /// The DNS cache in use, if caching is enabled.
    pub fn dns_cache(&self) -> Option<Arc<DnsCache>> {
        self.inner.resolver.as_ref().map(|r| r.cache().clone())
    }

    pub fn config(&self) -> &DialerConfig {
        &self.inner.config
    }

    fn addr_info(&self, addr: &str) -> Result<Arc<AddrInfo>> {
        if let Ok(addrs) = self.inner.addrs.read() {
            if let Some(info) = addrs.get(addr) {
                return Ok(info.clone());
            }
        }

        match addr::parse(addr) {
            Ok(info) => {
                let info = Arc::new(info);
                if let Ok(mut addrs) = self.inner.addrs.write() {
                    addrs.insert(addr.to_string(), info.clone());
                }
                Ok(info)
            }
            Err(e) => {
                if let Ok(mut addrs) = self.inner.addrs.write() {
                    addrs.remove(addr);
                }
                Err(e)
            }
        }
    }

    async fn cached_dial(
        &self,
        resolver: &CachedResolver,
        network: Network,
        addr: &str,
    ) -> Result<Conn> {
        if network == Network::Unix {
            return self.dial(network, addr).await;
        }
        let info = self.addr_info(addr)?;
        if info.is_ip() {
            return self.dial(network, addr).await;
        }

        let window = match self.inner.config.timeout {
            t if t.is_zero() => DEFAULT_RETRY_WINDOW,
            t => t,
        };
        let deadline = Instant::now() + window;
        let mut rounds = 0;
        let mut state = DialState::ResolveOrCacheHit;

        loop {
            state = match state {
                DialState::ResolveOrCacheHit => {
                    rounds += 1;
                    match resolver.lookup(&info.host).await {
                        Ok(entry) => DialState::AttemptIp(entry),
                        Err(e) => {
                            warn!(host = %info.host, error = %e, "failed to resolve host");
                            DialState::Exhausted
                        }
                    }
                }
                DialState::AttemptIp(entry) => {
                    for _ in 0..entry.len() {
                        if Instant::now() >= deadline {
                            break;
                        }
                        let target = addr::join_host_port(entry.ip(), info.port);
                        match tokio::time::timeout_at(deadline, self.dial(network, &target)).await {
                            Ok(Ok(conn)) => return Ok(conn),
                            Ok(Err(e)) => {
                                warn!(target = %target, error = %e, "failed to dial cached ip")
                            }
                            Err(_) => {
                                warn!(target = %target, window = ?window, "cached dial window elapsed");
                                break;
                            }
                        }
                    }
                    resolver.invalidate(&info.host);
                    if rounds < MAX_RESOLVE_ROUNDS && Instant::now() < deadline {
                        DialState::ResolveOrCacheHit
                    } else {
                        DialState::Exhausted
                    }
                }
                DialState::Exhausted => {
                    let res = self.dial(network, addr).await;
                    resolver.invalidate(&info.host);
                    return res;
                }
            };
        }
    }

    /// One connection attempt, without caching or retries.
    async fn dial(&self, network: Network, addr: &str) -> Result<Conn> {
        if addr.trim().is_empty() {
            return Err(Error::InvalidAddress(addr.to_string()));
        }
        debug!(network = %network, addr = %addr, "dialing");

        let conn = match AssertUnwindSafe(self.connect(network, addr))
            .catch_unwind()
            .await
        {
            Ok(res) => res?,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(network = %network, addr = %addr, panic = %message, "panic while dialing");
                return Err(Error::Panic {
                    addr: addr.to_string(),
                    message,
                });
            }
        };

        debug!(
            addr = %addr,
            kind = conn.kind(),
            local = ?conn.local_addr().ok(),
            remote = ?conn.peer_addr().ok(),
            "connected"
        );
        Ok(conn)
    }

    async fn connect(&self, network: Network, addr: &str) -> Result<Conn> {
        let mut network = network;
        if network.is_udp() {
            match addr::split_host_port(addr) {
                Ok((_, port)) if port != DNS_PORT => {
                    let tls = self.inner.config.tls.as_deref();
                    return self.inner.quic.dial_context(addr, tls).await.map(Conn::Quic);
                }
                _ => network = network.to_tcp(),
            }
        }

        if network == Network::Unix {
            return self.connect_unix(addr).await;
        }

        let stream = self.inner.connector.connect(network, addr).await?;
        match &self.inner.tls {
            Some(handshaker) => {
                let tls = handshaker.handshake(stream, network, addr).await?;
                Ok(Conn::Tls(Box::new(tls)))
            }
            None => Ok(Conn::Tcp(stream)),
        }
    }

    #[cfg(unix)]
    async fn connect_unix(&self, path: &str) -> Result<Conn> {
        let timeout = self.inner.config.timeout;
        let connect = tokio::net::UnixStream::connect(path);
        crate::transport::tcp::with_timeout(timeout, "connect", path, connect)
            .await
            .map(Conn::Unix)
    }

    #[cfg(not(unix))]
    async fn connect_unix(&self, path: &str) -> Result<Conn> {
        Err(Error::InvalidAddress(path.to_string()))
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
