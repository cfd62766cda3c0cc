//! QUIC sessions and streams.
//!
//! [`QuicDialer`] keeps one session per address and opens a new
//! bidirectional stream for every dial. Sessions are established under a
//! per-address lock so concurrent dials to the same address share one
//! handshake.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use quinn::{Connection, ConnectionError, Endpoint, RecvStream, SendStream};
use rustc_hash::FxHashMap;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{OnceCell, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::tls::TlsConfig;
use crate::addr;
use crate::error::{Error, Result};

/// Streams buffered by a listener before `accept` is called.
const ACCEPT_BACKLOG: usize = 128;

#[derive(Clone)]
struct Session {
    conn: Connection,
    local: SocketAddr,
}

type SessionSlot = Arc<tokio::sync::Mutex<Option<Session>>>;

/// Client side session manager.
#[derive(Default)]
pub struct QuicDialer {
    v4: OnceCell<Endpoint>,
    v6: OnceCell<Endpoint>,
    sessions: Mutex<FxHashMap<String, SessionSlot>>,
}

impl QuicDialer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a stream to `addr`, reusing a live session when one exists.
    ///
    /// Fails without any I/O when `tls` is missing or has no ALPN protocols.
    pub async fn dial_context(&self, addr: &str, tls: Option<&TlsConfig>) -> Result<QuicConn> {
        let tls = tls.ok_or(Error::CertificationFailed)?;
        if tls.alpn_protocols().is_empty() {
            return Err(Error::EmptyAlpns);
        }

        let slot = self.slot(addr);
        let connected = {
            let mut guard = slot.lock().await;
            match guard.as_ref() {
                Some(s) if s.conn.close_reason().is_none() => Ok(s.clone()),
                _ => self.connect(addr, tls).await.inspect(|s| *guard = Some(s.clone())),
            }
        };
        let session = match connected {
            Ok(session) => session,
            Err(e) => {
                self.invalidate(addr);
                return Err(e);
            }
        };

        match session.conn.open_bi().await {
            Ok((send, recv)) => Ok(QuicConn::new(session.conn, send, recv, session.local)),
            Err(e) => {
                self.invalidate(addr);
                Err(e.into())
            }
        }
    }

    /// Forget the session for `addr`.
    pub fn invalidate(&self, addr: &str) {
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.remove(addr);
        }
    }

    pub fn session_count(&self) -> usize {
        let Ok(sessions) = self.sessions.lock() else {
            return 0;
        };
        sessions.len()
    }

    fn slot(&self, addr: &str) -> SessionSlot {
        let Ok(mut sessions) = self.sessions.lock() else {
            return SessionSlot::default();
        };
        sessions.entry(addr.to_string()).or_default().clone()
    }

    async fn connect(&self, addr: &str, tls: &TlsConfig) -> Result<Session> {
        let target = tokio::net::lookup_host(addr)
            .await?
            .next()
            .ok_or_else(|| Error::LookupIpAddrNotFound(addr.to_string()))?;
        let host = addr::split_host_port(addr)
            .map(|(host, _)| host)
            .unwrap_or(addr);

        let crypto = QuicClientConfig::try_from(tls.client_config().clone())
            .map_err(|e| Error::TlsConfig(e.to_string()))?;
        let config = quinn::ClientConfig::new(Arc::new(crypto));

        let endpoint = self.endpoint(target.is_ipv4()).await?;
        let conn = endpoint.connect_with(config, target, host)?.await?;
        info!(addr = %addr, remote = %conn.remote_address(), "quic session established");

        Ok(Session {
            conn,
            local: endpoint.local_addr()?,
        })
    }

    async fn endpoint(&self, ipv4: bool) -> Result<&Endpoint> {
        let (cell, bind) = if ipv4 {
            (&self.v4, SocketAddr::from(([0, 0, 0, 0], 0)))
        } else {
            (&self.v6, SocketAddr::from(([0u16; 8], 0)))
        };
        let endpoint = cell.get_or_try_init(|| async { Endpoint::client(bind) }).await?;
        Ok(endpoint)
    }
}

/// One bidirectional stream on a QUIC session.
pub struct QuicConn {
    conn: Connection,
    send: SendStream,
    recv: RecvStream,
    local: SocketAddr,
}

impl QuicConn {
    fn new(conn: Connection, send: SendStream, recv: RecvStream, local: SocketAddr) -> Self {
        Self {
            conn,
            send,
            recv,
            local,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local)
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.conn.remote_address()
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Finish this stream. The session stays open for other streams.
    pub fn close(&mut self) -> Result<()> {
        self.send.finish().map_err(io::Error::other)?;
        Ok(())
    }
}

impl fmt::Debug for QuicConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuicConn")
            .field("local", &self.local)
            .field("remote", &self.conn.remote_address())
            .field("stream", &self.send.id())
            .finish()
    }
}

impl AsyncRead for QuicConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        AsyncRead::poll_read(Pin::new(&mut self.get_mut().recv), cx, buf)
    }
}

impl AsyncWrite for QuicConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        AsyncWrite::poll_write(Pin::new(&mut self.get_mut().send), cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_flush(Pin::new(&mut self.get_mut().send), cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_shutdown(Pin::new(&mut self.get_mut().send), cx)
    }
}

/// Server side: accepts sessions and hands out their streams.
pub struct QuicListener {
    endpoint: Endpoint,
    streams: mpsc::Receiver<QuicConn>,
    accept_task: JoinHandle<()>,
}

impl QuicListener {
    pub fn bind(addr: SocketAddr, tls: rustls::ServerConfig) -> Result<Self> {
        let crypto = QuicServerConfig::try_from(Arc::new(tls))
            .map_err(|e| Error::TlsConfig(e.to_string()))?;
        let endpoint = Endpoint::server(quinn::ServerConfig::with_crypto(Arc::new(crypto)), addr)?;
        let local = endpoint.local_addr()?;

        let (tx, streams) = mpsc::channel(ACCEPT_BACKLOG);
        let accept_task = tokio::spawn(run_accept_loop(endpoint.clone(), local, tx));
        debug!(addr = %local, "quic listener bound");

        Ok(Self {
            endpoint,
            streams,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Next stream opened by any peer.
    pub async fn accept(&mut self) -> Result<QuicConn> {
        self.streams.recv().await.ok_or(Error::ListenerClosed)
    }

    pub fn close(&self) {
        self.endpoint.close(0u32.into(), b"listener closed");
    }
}

impl Drop for QuicListener {
    fn drop(&mut self) {
        self.accept_task.abort();
        self.endpoint.close(0u32.into(), b"listener dropped");
    }
}

async fn run_accept_loop(endpoint: Endpoint, local: SocketAddr, tx: mpsc::Sender<QuicConn>) {
    while let Some(incoming) = endpoint.accept().await {
        let tx = tx.clone();
        tokio::spawn(async move {
            let conn = match incoming.await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "quic session failed");
                    return;
                }
            };
            serve_session(conn, local, tx).await;
        });
    }
}

async fn serve_session(conn: Connection, local: SocketAddr, tx: mpsc::Sender<QuicConn>) {
    loop {
        match conn.accept_bi().await {
            Ok((send, recv)) => {
                if tx.send(QuicConn::new(conn.clone(), send, recv, local)).await.is_err() {
                    return;
                }
            }
            Err(ConnectionError::ApplicationClosed(_) | ConnectionError::LocallyClosed) => {
                debug!(remote = %conn.remote_address(), "quic session closed");
                return;
            }
            Err(e) => {
                warn!(remote = %conn.remote_address(), error = %e, "quic session ended");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dial_without_tls_fails_before_io() {
        let dialer = QuicDialer::new();

        let err = dialer.dial_context("10.0.0.1:4433", None).await.unwrap_err();

        assert!(matches!(err, Error::CertificationFailed));
        assert_eq!(dialer.session_count(), 0);
    }

    #[tokio::test]
    async fn dial_without_alpn_fails_before_io() {
        let dialer = QuicDialer::new();
        let tls = TlsConfig::builder().insecure_skip_verify(true).build().unwrap();

        let err = dialer.dial_context("10.0.0.1:4433", Some(&tls)).await.unwrap_err();

        assert!(matches!(err, Error::EmptyAlpns));
        assert_eq!(dialer.session_count(), 0);
    }

    #[tokio::test]
    async fn failed_connect_drops_session_slot() {
        let dialer = QuicDialer::new();
        let tls = TlsConfig::builder()
            .insecure_skip_verify(true)
            .alpn_protocols(vec![b"vald".to_vec()])
            .build()
            .unwrap();

        let err = dialer.dial_context("127.0.0.1", Some(&tls)).await;

        assert!(err.is_err());
        assert_eq!(dialer.session_count(), 0);
    }

    #[test]
    fn invalidate_forgets_session_slot() {
        let dialer = QuicDialer::new();
        dialer.slot("10.0.0.1:4433");
        assert_eq!(dialer.session_count(), 1);

        dialer.invalidate("10.0.0.1:4433");

        assert_eq!(dialer.session_count(), 0);
    }

    #[test]
    fn slot_is_shared_per_address() {
        let dialer = QuicDialer::new();

        let a = dialer.slot("10.0.0.1:4433");
        let b = dialer.slot("10.0.0.1:4433");
        let c = dialer.slot("10.0.0.2:4433");

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
