//! vdial - connection dialer with DNS caching, socket tuning, TLS fallback
//! and QUIC streams.
//!
//! [`Dialer`] is the entry point; the modules below are public for
//! benchmarking, testing and for callers that need a single layer.

pub mod addr;
pub mod cache;
pub mod config;
pub mod control;
pub mod dialer;
pub mod dns;
pub mod error;
pub mod resolver;
pub mod transport;

pub use config::{DialerConfig, DialerOption};
pub use dialer::{DialFunc, Dialer};
pub use error::{Error, Result};
pub use transport::tls::TlsConfig;
pub use transport::{Conn, Network};
