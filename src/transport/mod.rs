//! Transport layer: the connection types the dialer hands out.
//!
//! Provides TCP (socket controlled, dual-stack aware), TLS over TCP, QUIC
//! streams and Unix domain streams behind one [`Conn`] type.

pub mod quic;
pub mod tcp;
pub mod tls;

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

use quic::QuicConn;

/// Network identifier of a dial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Tcp,
    Tcp4,
    Tcp6,
    Udp,
    Udp4,
    Udp6,
    Unix,
}

impl Network {
    /// Parse a network name. Unknown names are treated as TCP.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp4" => Network::Tcp4,
            "tcp6" => Network::Tcp6,
            "udp" => Network::Udp,
            "udp4" => Network::Udp4,
            "udp6" => Network::Udp6,
            "unix" => Network::Unix,
            _ => Network::Tcp,
        }
    }

    pub fn is_tcp(self) -> bool {
        matches!(self, Network::Tcp | Network::Tcp4 | Network::Tcp6)
    }

    pub fn is_udp(self) -> bool {
        matches!(self, Network::Udp | Network::Udp4 | Network::Udp6)
    }

    /// TCP network of the same address family.
    pub fn to_tcp(self) -> Self {
        match self {
            Network::Udp4 => Network::Tcp4,
            Network::Udp6 => Network::Tcp6,
            Network::Udp => Network::Tcp,
            other => other,
        }
    }

    /// Whether a resolved address is allowed for this network.
    pub fn accepts(self, addr: &SocketAddr) -> bool {
        match self {
            Network::Tcp4 | Network::Udp4 => addr.is_ipv4(),
            Network::Tcp6 | Network::Udp6 => addr.is_ipv6(),
            _ => true,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Tcp4 => "tcp4",
            Network::Tcp6 => "tcp6",
            Network::Udp => "udp",
            Network::Udp4 => "udp4",
            Network::Udp6 => "udp6",
            Network::Unix => "unix",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// TLS client stream over TCP.
pub type TlsStream = tokio_rustls::client::TlsStream<TcpStream>;

/// A live connection returned by the dialer.
pub enum Conn {
    Tcp(TcpStream),
    Tls(Box<TlsStream>),
    Quic(QuicConn),
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
}

impl Conn {
    pub fn local_addr(&self) -> io::Result<String> {
        match self {
            Conn::Tcp(s) => s.local_addr().map(|a| a.to_string()),
            Conn::Tls(s) => s.get_ref().0.local_addr().map(|a| a.to_string()),
            Conn::Quic(s) => s.local_addr().map(|a| a.to_string()),
            #[cfg(unix)]
            Conn::Unix(s) => s.local_addr().map(|a| format!("{:?}", a)),
        }
    }

    pub fn peer_addr(&self) -> io::Result<String> {
        match self {
            Conn::Tcp(s) => s.peer_addr().map(|a| a.to_string()),
            Conn::Tls(s) => s.get_ref().0.peer_addr().map(|a| a.to_string()),
            Conn::Quic(s) => Ok(s.remote_address().to_string()),
            #[cfg(unix)]
            Conn::Unix(s) => s.peer_addr().map(|a| format!("{:?}", a)),
        }
    }

    /// Transport name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Conn::Tcp(_) => "tcp",
            Conn::Tls(_) => "tls",
            Conn::Quic(_) => "quic",
            #[cfg(unix)]
            Conn::Unix(_) => "unix",
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, Conn::Tls(_))
    }

    /// Whether this is a TLS connection whose handshake finished.
    pub fn handshake_complete(&self) -> bool {
        match self {
            Conn::Tls(s) => !s.get_ref().1.is_handshaking(),
            _ => false,
        }
    }

    /// Negotiated ALPN protocol, if any.
    pub fn alpn_protocol(&self) -> Option<Vec<u8>> {
        match self {
            Conn::Tls(s) => s.get_ref().1.alpn_protocol().map(<[u8]>::to_vec),
            _ => None,
        }
    }
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("kind", &self.kind())
            .field("local", &self.local_addr().ok())
            .field("peer", &self.peer_addr().ok())
            .finish()
    }
}

impl AsyncRead for Conn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Conn::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Conn::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            Conn::Quic(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            Conn::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Conn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Conn::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Conn::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            Conn::Quic(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            Conn::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Conn::Tcp(s) => Pin::new(s).poll_flush(cx),
            Conn::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            Conn::Quic(s) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            Conn::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Conn::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Conn::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            Conn::Quic(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            Conn::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_known_networks() {
        assert_eq!(Network::parse("tcp"), Network::Tcp);
        assert_eq!(Network::parse("TCP6"), Network::Tcp6);
        assert_eq!(Network::parse("udp4"), Network::Udp4);
        assert_eq!(Network::parse("unix"), Network::Unix);
    }

    #[test]
    fn parse_unknown_is_tcp() {
        assert_eq!(Network::parse(""), Network::Tcp);
        assert_eq!(Network::parse("sctp"), Network::Tcp);
    }

    #[test]
    fn udp_downgrades_to_same_family_tcp() {
        assert_eq!(Network::Udp.to_tcp(), Network::Tcp);
        assert_eq!(Network::Udp4.to_tcp(), Network::Tcp4);
        assert_eq!(Network::Udp6.to_tcp(), Network::Tcp6);
        assert_eq!(Network::Unix.to_tcp(), Network::Unix);
    }

    #[test]
    fn accepts_filters_family() {
        let v4: SocketAddr = "10.0.0.1:80".parse().unwrap();
        let v6: SocketAddr = "[fd00::1]:80".parse().unwrap();

        assert!(Network::Tcp.accepts(&v4) && Network::Tcp.accepts(&v6));
        assert!(Network::Tcp4.accepts(&v4) && !Network::Tcp4.accepts(&v6));
        assert!(!Network::Tcp6.accepts(&v4) && Network::Tcp6.accepts(&v6));
    }
}
