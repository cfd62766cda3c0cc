//! TCP connector.
//!
//! Connects through a [`TcpSocket`] so the socket controller can tune the
//! raw socket before the handshake. Hostnames resolve through the OS; with
//! dual-stack on, the second address family starts after the fallback delay
//! and the first connection to succeed wins.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use socket2::SockRef;
use tokio::net::{TcpSocket, TcpStream};
use tracing::debug;

use super::Network;
use crate::control::Control;
use crate::error::{Error, Result};

/// Default delay before racing the other address family.
pub const DEFAULT_FALLBACK_DELAY: Duration = Duration::from_millis(300);

/// Await `fut`, bounded by `timeout` unless it is zero.
pub(crate) async fn with_timeout<T, E, F>(
    timeout: Duration,
    stage: &'static str,
    addr: &str,
    fut: F,
) -> Result<T>
where
    F: Future<Output = std::result::Result<T, E>>,
    E: Into<Error>,
{
    if timeout.is_zero() {
        return fut.await.map_err(Into::into);
    }
    match tokio::time::timeout(timeout, fut).await {
        Ok(res) => res.map_err(Into::into),
        Err(_) => Err(Error::Timeout {
            stage,
            addr: addr.to_string(),
            timeout,
        }),
    }
}

/// Socket-controlled TCP connector.
#[derive(Clone)]
pub struct TcpConnector {
    control: Control,
    timeout: Duration,
    dual_stack: bool,
    fallback_delay: Duration,
}

impl TcpConnector {
    /// Create a connector applying `control` to every socket.
    pub fn new(control: Control) -> Self {
        Self {
            control,
            timeout: Duration::ZERO,
            dual_stack: true,
            fallback_delay: DEFAULT_FALLBACK_DELAY,
        }
    }

    /// Per-attempt timeout; zero disables it.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn dual_stack(mut self, enabled: bool) -> Self {
        self.dual_stack = enabled;
        self
    }

    pub fn fallback_delay(mut self, delay: Duration) -> Self {
        self.fallback_delay = delay;
        self
    }

    pub fn get_timeout(&self) -> Duration {
        self.timeout
    }

    /// Resolve `addr` and connect to one of its addresses.
    pub async fn connect(&self, network: Network, addr: &str) -> Result<TcpStream> {
        let addrs: Vec<SocketAddr> =
            with_timeout(self.timeout, "resolve", addr, tokio::net::lookup_host(addr))
                .await?
                .filter(|a| network.accepts(a))
                .collect();

        let Some(first) = addrs.first() else {
            return Err(Error::LookupIpAddrNotFound(addr.to_string()));
        };

        let (primaries, fallbacks): (Vec<SocketAddr>, Vec<SocketAddr>) = addrs
            .iter()
            .partition(|a| a.is_ipv4() == first.is_ipv4());

        if !self.dual_stack || fallbacks.is_empty() {
            return self.connect_serial(network, &addrs).await;
        }

        let primary = self.connect_serial(network, &primaries);
        let fallback = async {
            tokio::time::sleep(self.fallback_delay).await;
            self.connect_serial(network, &fallbacks).await
        };
        tokio::pin!(primary);
        tokio::pin!(fallback);

        tokio::select! {
            res = &mut primary => match res {
                Ok(stream) => Ok(stream),
                Err(e) => fallback.await.map_err(|_| e),
            },
            res = &mut fallback => match res {
                Ok(stream) => Ok(stream),
                Err(_) => primary.await,
            },
        }
    }

    /// Try each address in order, returning the first error if all fail.
    async fn connect_serial(&self, network: Network, addrs: &[SocketAddr]) -> Result<TcpStream> {
        let mut first_err = None;
        for addr in addrs {
            match self.connect_addr(network, *addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!(addr = %addr, error = %e, "tcp connect attempt failed");
                    first_err.get_or_insert(e);
                }
            }
        }
        Err(first_err.unwrap_or_else(|| Error::LookupIpAddrNotFound(String::new())))
    }

    /// Connect to one socket address.
    ///
    /// Socket option failures are logged and never fail the connect.
    pub async fn connect_addr(&self, network: Network, addr: SocketAddr) -> Result<TcpStream> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };

        if let Err(e) = (self.control)(network, &addr, SockRef::from(&socket)) {
            debug!(addr = %addr, error = %e, "socket control failed");
        }

        let target = addr.to_string();
        with_timeout(self.timeout, "connect", &target, socket.connect(addr)).await
    }
}
