//! Error types for the dialer.

use std::fmt;
use std::time::Duration;

/// Result type for dialer operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Dialer errors.
///
/// Every variant that comes out of a dial names the stage that failed
/// (resolution, connect or handshake) and, where it applies, the target.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid dns cache config: refresh duration {refresh:?} is longer than expiration {expiration:?}")]
    InvalidDnsConfig {
        refresh: Duration,
        expiration: Duration,
    },

    #[error("no address found for host {0}")]
    LookupIpAddrNotFound(String),

    #[error("invalid address: {0:?}")]
    InvalidAddress(String),

    #[error("invalid port in address {0:?}")]
    InvalidPort(String),

    #[error("hostname {0:?} cannot be converted to ascii")]
    Idna(String),

    #[error("failed to handshake tls connection over {network} to {addr}: {source}")]
    TlsHandshake {
        network: String,
        addr: String,
        #[source]
        source: Box<Error>,
    },

    #[error("tls handshake did not complete")]
    HandshakeIncomplete,

    #[error("tls config error: {0}")]
    TlsConfig(String),

    #[error("failed to set socket options: {}", join(.0))]
    SocketOptions(Vec<SocketOptionError>),

    #[error("quic dial requires a tls config")]
    CertificationFailed,

    #[error("quic dial requires at least one alpn protocol")]
    EmptyAlpns,

    #[error("quic connect error: {0}")]
    QuicConnect(#[from] quinn::ConnectError),

    #[error("quic connection error: {0}")]
    QuicConnection(#[from] quinn::ConnectionError),

    #[error("{stage} timed out after {timeout:?} for {addr}")]
    Timeout {
        stage: &'static str,
        addr: String,
        timeout: Duration,
    },

    #[error("panic while dialing {addr}: {message}")]
    Panic { addr: String, message: String },

    #[error("listener closed")]
    ListenerClosed,
}

/// A single socket option that could not be applied.
#[derive(Debug)]
pub struct SocketOptionError {
    pub option: &'static str,
    pub source: std::io::Error,
}

impl fmt::Display for SocketOptionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.option, self.source)
    }
}

fn join(errs: &[SocketOptionError]) -> String {
    errs.iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl Error {
    /// Whether this error came from the address itself rather than the network.
    pub fn is_invalid_address(&self) -> bool {
        matches!(self, Error::InvalidAddress(_) | Error::InvalidPort(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_options_error_lists_every_option() {
        let err = Error::SocketOptions(vec![
            SocketOptionError {
                option: "SO_REUSEPORT",
                source: std::io::Error::from_raw_os_error(1),
            },
            SocketOptionError {
                option: "IP_TRANSPARENT",
                source: std::io::Error::from_raw_os_error(1),
            },
        ]);

        let msg = err.to_string();
        assert!(msg.contains("SO_REUSEPORT"));
        assert!(msg.contains("IP_TRANSPARENT"));
    }

    #[test]
    fn tls_handshake_error_names_target() {
        let err = Error::TlsHandshake {
            network: "tcp".to_string(),
            addr: "10.0.0.1:443".to_string(),
            source: Box::new(Error::HandshakeIncomplete),
        };

        let msg = err.to_string();
        assert!(msg.contains("tcp"));
        assert!(msg.contains("10.0.0.1:443"));
    }
}
