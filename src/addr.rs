//! Address parsing and classification.
//!
//! Supported address formats:
//! - "localhost"  - "localhost:8080"
//! - "10.0.0.1"   - "10.0.0.1:8080"
//! - "[::1]"      - "[::1]:8080"
//! - "::1"        (IPv6 without brackets, no port)
//!
//! A missing port defaults to [`DEFAULT_PORT`].

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::{Error, Result};

/// Port used when an address carries none.
pub const DEFAULT_PORT: u16 = 80;

/// What kind of host an address names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKind {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Hostname,
}

/// Parsed address components, memoized by the dialer per address string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddrInfo {
    pub host: String,
    pub port: u16,
    pub kind: HostKind,
}

impl AddrInfo {
    /// Whether the host is an IP literal (no resolution needed).
    pub fn is_ip(&self) -> bool {
        !matches!(self.kind, HostKind::Hostname)
    }

    pub fn is_ipv4(&self) -> bool {
        matches!(self.kind, HostKind::Ipv4(_))
    }

    pub fn is_ipv6(&self) -> bool {
        matches!(self.kind, HostKind::Ipv6(_))
    }

    /// Loopback literal or the well-known local hostname.
    pub fn is_local(&self) -> bool {
        match self.kind {
            HostKind::Ipv4(ip) => ip.is_loopback(),
            HostKind::Ipv6(ip) => ip.is_loopback(),
            HostKind::Hostname => self.host.eq_ignore_ascii_case("localhost"),
        }
    }

    /// RFC 1918 IPv4 or unique-local IPv6 literal.
    pub fn is_private(&self) -> bool {
        match self.kind {
            HostKind::Ipv4(ip) => ip.is_private(),
            HostKind::Ipv6(ip) => (ip.segments()[0] & 0xfe00) == 0xfc00,
            HostKind::Hostname => false,
        }
    }

    /// `host:port`, bracketing IPv6 hosts.
    pub fn addr(&self) -> String {
        join_host_port(&self.host, self.port)
    }
}

/// Parse and classify an address string.
pub fn parse(addr: &str) -> Result<AddrInfo> {
    let (host, port) = split_host_port(addr)?;
    let kind = match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => HostKind::Ipv4(ip),
        Ok(IpAddr::V6(ip)) => match ip.to_ipv4_mapped() {
            Some(v4) => HostKind::Ipv4(v4),
            None => HostKind::Ipv6(ip),
        },
        Err(_) => HostKind::Hostname,
    };

    Ok(AddrInfo {
        host: host.to_string(),
        port,
        kind,
    })
}

/// Split an address into host and numeric port.
pub fn split_host_port(addr: &str) -> Result<(&str, u16)> {
    let addr = addr.trim();
    if addr.is_empty() {
        return Err(Error::InvalidAddress(addr.to_string()));
    }

    if let Some(rest) = addr.strip_prefix('[') {
        let close = rest
            .find(']')
            .ok_or_else(|| Error::InvalidAddress(addr.to_string()))?;
        let host = &rest[..close];
        let tail = &rest[close + 1..];
        if host.is_empty() {
            return Err(Error::InvalidAddress(addr.to_string()));
        }
        return match tail {
            "" => Ok((host, DEFAULT_PORT)),
            _ => match tail.strip_prefix(':') {
                Some(port) => Ok((host, parse_port(addr, port)?)),
                None => Err(Error::InvalidAddress(addr.to_string())),
            },
        };
    }

    match addr.rfind(':') {
        // More than one colon without brackets is a bare IPv6 literal.
        Some(pos) if addr[..pos].contains(':') => Ok((addr, DEFAULT_PORT)),
        Some(pos) => {
            let host = &addr[..pos];
            if host.is_empty() {
                return Err(Error::InvalidAddress(addr.to_string()));
            }
            Ok((host, parse_port(addr, &addr[pos + 1..])?))
        }
        None => Ok((addr, DEFAULT_PORT)),
    }
}

fn parse_port(addr: &str, port: &str) -> Result<u16> {
    if port.is_empty() {
        return Ok(DEFAULT_PORT);
    }
    port.parse::<u16>()
        .map_err(|_| Error::InvalidPort(addr.to_string()))
}

/// Join a host and port, bracketing IPv6 literals.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ipv4_with_port() {
        let info = parse("127.0.0.1:8080").unwrap();
        assert_eq!(info.host, "127.0.0.1");
        assert_eq!(info.port, 8080);
        assert!(info.is_ipv4());
        assert!(info.is_local());
    }

    #[test]
    fn parse_ipv6_brackets() {
        let info = parse("[::1]:8080").unwrap();
        assert_eq!(info.host, "::1");
        assert_eq!(info.port, 8080);
        assert!(info.is_ipv6());
        assert!(info.is_local());
    }

    #[test]
    fn parse_bare_ipv6_uses_default_port() {
        let info = parse("fd00::1").unwrap();
        assert_eq!(info.host, "fd00::1");
        assert_eq!(info.port, DEFAULT_PORT);
        assert!(info.is_private());
    }

    #[test]
    fn parse_hostname() {
        let info = parse("vald-agent.default.svc:8081").unwrap();
        assert_eq!(info.host, "vald-agent.default.svc");
        assert_eq!(info.port, 8081);
        assert!(!info.is_ip());
        assert!(!info.is_local());
    }

    #[test]
    fn parse_localhost_is_local() {
        assert!(parse("localhost:80").unwrap().is_local());
    }

    #[test]
    fn parse_ipv4_mapped_is_ipv4() {
        let info = parse("[::ffff:10.0.0.1]:80").unwrap();
        assert!(info.is_ipv4());
        assert!(info.is_private());
    }

    #[test]
    fn parse_missing_port_defaults() {
        assert_eq!(parse("example.com").unwrap().port, DEFAULT_PORT);
        assert_eq!(parse("example.com:").unwrap().port, DEFAULT_PORT);
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert!(matches!(parse(""), Err(Error::InvalidAddress(_))));
        assert!(matches!(parse(":80"), Err(Error::InvalidAddress(_))));
        assert!(matches!(parse("[::1"), Err(Error::InvalidAddress(_))));
        assert!(matches!(parse("[::1]x80"), Err(Error::InvalidAddress(_))));
        assert!(matches!(parse("host:http"), Err(Error::InvalidPort(_))));
        assert!(matches!(parse("host:70000"), Err(Error::InvalidPort(_))));
    }

    #[test]
    fn join_brackets_ipv6() {
        assert_eq!(join_host_port("::1", 443), "[::1]:443");
        assert_eq!(join_host_port("10.0.0.1", 443), "10.0.0.1:443");
        assert_eq!(parse("[::1]:443").unwrap().addr(), "[::1]:443");
    }
}
