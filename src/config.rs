//! Dialer configuration.
//!
//! A [`DialerConfig`] starts from defaults and is adjusted by an ordered
//! list of [`DialerOption`]s. Duration options take human readable strings
//! ("30s", "300ms", "1h"); an empty string leaves the field alone and an
//! unparsable one restores the field's default.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::control::SocketFlag;
use crate::error::{Error, Result};
use crate::resolver::DnsCache;
use crate::transport::tcp::DEFAULT_FALLBACK_DELAY;
use crate::transport::tls::TlsConfig;

pub const DEFAULT_TIMEOUT: Duration = Duration::ZERO;
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(30);
pub const DEFAULT_DNS_REFRESH: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_DNS_EXPIRATION: Duration = Duration::from_secs(60 * 60);

/// Settings the dialer is built from.
#[derive(Clone)]
pub struct DialerConfig {
    /// Per-attempt connect and handshake timeout; zero means none.
    pub timeout: Duration,
    pub keepalive: Duration,
    pub dual_stack: bool,
    pub fallback_delay: Duration,
    pub tls: Option<Arc<TlsConfig>>,
    pub enable_dns_cache: bool,
    /// Injected cache, used as-is.
    pub dns_cache: Option<Arc<DnsCache>>,
    pub dns_refresh: Duration,
    pub dns_expiration: Duration,
    pub socket_flag: SocketFlag,
}

impl Default for DialerConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            keepalive: DEFAULT_KEEPALIVE,
            dual_stack: true,
            fallback_delay: DEFAULT_FALLBACK_DELAY,
            tls: None,
            enable_dns_cache: false,
            dns_cache: None,
            dns_refresh: DEFAULT_DNS_REFRESH,
            dns_expiration: DEFAULT_DNS_EXPIRATION,
            socket_flag: SocketFlag::NONE,
        }
    }
}

impl DialerConfig {
    /// Fold `opts` over the defaults, in order.
    pub fn from_options(opts: impl IntoIterator<Item = DialerOption>) -> Self {
        let mut config = Self::default();
        for opt in opts {
            opt(&mut config);
        }
        config
    }

    /// A refresh interval longer than the expiration is rejected.
    pub fn validate(&self) -> Result<()> {
        if self.enable_dns_cache && self.dns_refresh > self.dns_expiration {
            return Err(Error::InvalidDnsConfig {
                refresh: self.dns_refresh,
                expiration: self.dns_expiration,
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for DialerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DialerConfig")
            .field("timeout", &self.timeout)
            .field("keepalive", &self.keepalive)
            .field("dual_stack", &self.dual_stack)
            .field("fallback_delay", &self.fallback_delay)
            .field("tls", &self.tls.is_some())
            .field("enable_dns_cache", &self.enable_dns_cache)
            .field("dns_cache", &self.dns_cache.is_some())
            .field("dns_refresh", &self.dns_refresh)
            .field("dns_expiration", &self.dns_expiration)
            .field("socket_flag", &self.socket_flag)
            .finish()
    }
}

/// A single configuration step.
pub type DialerOption = Box<dyn FnOnce(&mut DialerConfig) + Send>;

fn duration_option(
    name: &'static str,
    dur: &str,
    default: Duration,
    set: fn(&mut DialerConfig, Duration),
) -> DialerOption {
    let dur = dur.trim().to_string();
    Box::new(move |c| {
        if dur.is_empty() {
            return;
        }
        match humantime::parse_duration(&dur) {
            Ok(d) => set(c, d),
            Err(e) => {
                warn!(option = name, value = %dur, error = %e, "invalid duration, using default");
                set(c, default);
            }
        }
    })
}

pub fn with_dialer_timeout(dur: &str) -> DialerOption {
    duration_option("timeout", dur, DEFAULT_TIMEOUT, |c, d| c.timeout = d)
}

pub fn with_dialer_keepalive(dur: &str) -> DialerOption {
    duration_option("keepalive", dur, DEFAULT_KEEPALIVE, |c, d| c.keepalive = d)
}

pub fn with_dialer_dual_stack(enabled: bool) -> DialerOption {
    Box::new(move |c| c.dual_stack = enabled)
}

pub fn with_disable_dialer_dual_stack() -> DialerOption {
    with_dialer_dual_stack(false)
}

pub fn with_dialer_fallback_delay(dur: &str) -> DialerOption {
    duration_option("fallback_delay", dur, DEFAULT_FALLBACK_DELAY, |c, d| {
        c.fallback_delay = d
    })
}

pub fn with_tls(tls: Arc<TlsConfig>) -> DialerOption {
    Box::new(move |c| c.tls = Some(tls))
}

pub fn with_enable_dns_cache() -> DialerOption {
    Box::new(|c| c.enable_dns_cache = true)
}

pub fn with_disable_dns_cache() -> DialerOption {
    Box::new(|c| c.enable_dns_cache = false)
}

/// Use an existing cache. Enables DNS caching.
pub fn with_dns_cache(cache: Arc<DnsCache>) -> DialerOption {
    Box::new(move |c| {
        c.dns_cache = Some(cache);
        c.enable_dns_cache = true;
    })
}

pub fn with_dns_refresh_duration(dur: &str) -> DialerOption {
    duration_option("dns_refresh", dur, DEFAULT_DNS_REFRESH, |c, d| {
        c.dns_refresh = d
    })
}

pub fn with_dns_cache_expiration(dur: &str) -> DialerOption {
    duration_option("dns_expiration", dur, DEFAULT_DNS_EXPIRATION, |c, d| {
        c.dns_expiration = d
    })
}

pub fn with_socket_flag(flag: SocketFlag) -> DialerOption {
    Box::new(move |c| c.socket_flag = flag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;

    #[test]
    fn defaults() {
        let c = DialerConfig::default();

        assert_eq!(c.timeout, Duration::ZERO);
        assert_eq!(c.keepalive, Duration::from_secs(30));
        assert_eq!(c.fallback_delay, Duration::from_millis(300));
        assert!(c.dual_stack);
        assert!(!c.enable_dns_cache);
        assert_eq!(c.dns_refresh, Duration::from_secs(1800));
        assert_eq!(c.dns_expiration, Duration::from_secs(3600));
        assert!(c.socket_flag.is_empty());
    }

    #[test]
    fn options_apply_in_order() {
        let c = DialerConfig::from_options([
            with_enable_dns_cache(),
            with_dialer_timeout("5s"),
            with_disable_dns_cache(),
            with_dialer_timeout("250ms"),
        ]);

        assert!(!c.enable_dns_cache);
        assert_eq!(c.timeout, Duration::from_millis(250));
    }

    #[test]
    fn invalid_duration_restores_default() {
        let c = DialerConfig::from_options([
            with_dialer_keepalive("10s"),
            with_dialer_keepalive("ten seconds"),
        ]);

        assert_eq!(c.keepalive, DEFAULT_KEEPALIVE);
    }

    #[test]
    fn empty_duration_is_ignored() {
        let c = DialerConfig::from_options([
            with_dialer_fallback_delay("1s"),
            with_dialer_fallback_delay(""),
        ]);

        assert_eq!(c.fallback_delay, Duration::from_secs(1));
    }

    #[test]
    fn dual_stack_toggles() {
        let c = DialerConfig::from_options([with_disable_dialer_dual_stack()]);
        assert!(!c.dual_stack);

        let c = DialerConfig::from_options([
            with_disable_dialer_dual_stack(),
            with_dialer_dual_stack(true),
        ]);
        assert!(c.dual_stack);
    }

    #[test]
    fn injected_cache_enables_caching() {
        let cache = Arc::new(Cache::new(Duration::from_secs(1), Duration::from_secs(1)));

        let c = DialerConfig::from_options([with_dns_cache(cache)]);

        assert!(c.enable_dns_cache);
        assert!(c.dns_cache.is_some());
    }

    #[test]
    fn validate_rejects_refresh_longer_than_expiration() {
        let c = DialerConfig::from_options([
            with_enable_dns_cache(),
            with_dns_refresh_duration("50s"),
            with_dns_cache_expiration("10s"),
        ]);

        let err = c.validate().unwrap_err();

        assert!(matches!(
            err,
            Error::InvalidDnsConfig { refresh, expiration }
                if refresh == Duration::from_secs(50) && expiration == Duration::from_secs(10)
        ));
    }

    #[test]
    fn validate_accepts_shorter_or_equal_refresh() {
        for refresh in ["5s", "10s"] {
            let c = DialerConfig::from_options([
                with_enable_dns_cache(),
                with_dns_refresh_duration(refresh),
                with_dns_cache_expiration("10s"),
            ]);
            assert!(c.validate().is_ok());
        }
    }

    #[test]
    fn validate_ignores_dns_settings_without_cache() {
        let c = DialerConfig::from_options([
            with_dns_refresh_duration("50s"),
            with_dns_cache_expiration("10s"),
        ]);

        assert!(c.validate().is_ok());
    }

    #[test]
    fn socket_flag_is_stored() {
        let flag = SocketFlag::REUSE_ADDR | SocketFlag::TCP_NO_DELAY;

        let c = DialerConfig::from_options([with_socket_flag(flag)]);

        assert_eq!(c.socket_flag, flag);
    }
}
