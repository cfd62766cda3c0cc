//! Hostname resolution and round-robin selection over resolved IPs.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{Error, Result};

/// Resolved IP literals for one host, handed out in round-robin order.
#[derive(Debug)]
pub struct DialerCacheEntry {
    ips: Vec<String>,
    cursor: AtomicU32,
}

impl DialerCacheEntry {
    /// Create an entry; `None` when `ips` is empty.
    pub fn new(ips: Vec<String>) -> Option<Self> {
        Self::with_cursor(ips, 0)
    }

    /// Create an entry continuing from an existing cursor position.
    pub fn with_cursor(ips: Vec<String>, cursor: u32) -> Option<Self> {
        if ips.is_empty() {
            return None;
        }
        Some(Self {
            ips,
            cursor: AtomicU32::new(cursor),
        })
    }

    /// Next IP in round-robin order.
    ///
    /// Selection starts at index 1, not 0. A single IP never moves the
    /// cursor; at `u32::MAX` the cursor wraps to 0.
    pub fn ip(&self) -> &str {
        let len = self.ips.len();
        if len == 1 {
            return &self.ips[0];
        }
        let prev = self
            .cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                Some(c.checked_add(1).unwrap_or(0))
            })
            .unwrap_or_else(|c| c);
        let next = prev.checked_add(1).unwrap_or(0);
        &self.ips[next as usize % len]
    }

    pub fn len(&self) -> usize {
        self.ips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ips.is_empty()
    }

    pub fn ips(&self) -> &[String] {
        &self.ips
    }

    pub fn cursor(&self) -> u32 {
        self.cursor.load(Ordering::Acquire)
    }
}

/// Convert a hostname to its ASCII (punycode) form.
///
/// Lookalike unicode hostnames are normalized before they reach the
/// resolver.
pub fn to_ascii(host: &str) -> Result<String> {
    idna::domain_to_ascii(host).map_err(|_| Error::Idna(host.to_string()))
}

/// Resolve every IP of `host`.
///
/// IPv4-mapped IPv6 answers are reported as plain IPv4 and duplicates are
/// dropped, keeping the resolver's order.
pub async fn resolve(host: &str) -> Result<Vec<String>> {
    let ascii = to_ascii(host)?;
    let addrs = tokio::net::lookup_host((ascii.as_str(), 0)).await?;

    let mut ips: Vec<String> = Vec::new();
    for addr in addrs {
        let ip = canonical(addr.ip()).to_string();
        if !ips.contains(&ip) {
            ips.push(ip);
        }
    }

    if ips.is_empty() {
        return Err(Error::LookupIpAddrNotFound(host.to_string()));
    }
    Ok(ips)
}

fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}
