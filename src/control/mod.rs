//! Raw socket tuning applied before connect.
//!
//! The option logic here is OS agnostic. Each platform backend implements
//! [`SocketOptionApplier`], mapping a [`SocketOption`] to its level/name pair
//! (or `None` when the platform has no such option) and providing the
//! integer setter. Options a platform lacks are skipped without error.

#[cfg(any(target_os = "linux", target_os = "android"))]
mod linux;
#[cfg(any(target_os = "linux", target_os = "android"))]
use linux::Platform;

#[cfg(any(target_os = "macos", target_os = "ios"))]
mod darwin;
#[cfg(any(target_os = "macos", target_os = "ios"))]
use darwin::Platform;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows::Platform;

pub mod noop;
#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    windows
)))]
use noop::Noop as Platform;

use std::io;
use std::net::SocketAddr;
use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;

use socket2::SockRef;

use crate::error::{Error, Result, SocketOptionError};
use crate::transport::Network;

/// Independently toggleable socket features.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SocketFlag(u32);

impl SocketFlag {
    pub const NONE: SocketFlag = SocketFlag(0);
    pub const REUSE_PORT: SocketFlag = SocketFlag(1 << 0);
    pub const REUSE_ADDR: SocketFlag = SocketFlag(1 << 1);
    pub const TCP_FAST_OPEN: SocketFlag = SocketFlag(1 << 2);
    pub const TCP_NO_DELAY: SocketFlag = SocketFlag(1 << 3);
    pub const TCP_CORK: SocketFlag = SocketFlag(1 << 4);
    pub const TCP_QUICK_ACK: SocketFlag = SocketFlag(1 << 5);
    pub const TCP_DEFER_ACCEPT: SocketFlag = SocketFlag(1 << 6);
    pub const IP_TRANSPARENT: SocketFlag = SocketFlag(1 << 7);
    pub const IP_RECOVER_DESTINATION_ADDR: SocketFlag = SocketFlag(1 << 8);

    pub fn contains(self, other: SocketFlag) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for SocketFlag {
    type Output = SocketFlag;

    fn bitor(self, rhs: SocketFlag) -> SocketFlag {
        SocketFlag(self.0 | rhs.0)
    }
}

impl BitOrAssign for SocketFlag {
    fn bitor_assign(&mut self, rhs: SocketFlag) {
        self.0 |= rhs.0;
    }
}

/// Boolean form of [`SocketFlag`], as it appears in configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SocketOptions {
    pub reuse_port: bool,
    pub reuse_addr: bool,
    pub tcp_fast_open: bool,
    pub tcp_no_delay: bool,
    pub tcp_cork: bool,
    pub tcp_quick_ack: bool,
    pub tcp_defer_accept: bool,
    pub ip_transparent: bool,
    pub ip_recover_destination_addr: bool,
}

impl SocketOptions {
    pub fn to_flag(self) -> SocketFlag {
        [
            (self.reuse_port, SocketFlag::REUSE_PORT),
            (self.reuse_addr, SocketFlag::REUSE_ADDR),
            (self.tcp_fast_open, SocketFlag::TCP_FAST_OPEN),
            (self.tcp_no_delay, SocketFlag::TCP_NO_DELAY),
            (self.tcp_cork, SocketFlag::TCP_CORK),
            (self.tcp_quick_ack, SocketFlag::TCP_QUICK_ACK),
            (self.tcp_defer_accept, SocketFlag::TCP_DEFER_ACCEPT),
            (self.ip_transparent, SocketFlag::IP_TRANSPARENT),
            (
                self.ip_recover_destination_addr,
                SocketFlag::IP_RECOVER_DESTINATION_ADDR,
            ),
        ]
        .into_iter()
        .filter(|(on, _)| *on)
        .fold(SocketFlag::NONE, |acc, (_, flag)| acc | flag)
    }
}

/// A socket option the controller knows how to set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketOption {
    ReusePort,
    ReuseAddr,
    TcpFastOpen,
    TcpFastOpenConnect,
    TcpNoDelay,
    TcpCork,
    TcpQuickAck,
    TcpDeferAccept,
    IpTransparent,
    Ipv6Transparent,
    IpRecvOrigDstAddr,
    Ipv6RecvOrigDstAddr,
    KeepAlive,
    TcpKeepInterval,
    TcpKeepIdle,
}

impl SocketOption {
    pub fn name(self) -> &'static str {
        match self {
            SocketOption::ReusePort => "SO_REUSEPORT",
            SocketOption::ReuseAddr => "SO_REUSEADDR",
            SocketOption::TcpFastOpen => "TCP_FASTOPEN",
            SocketOption::TcpFastOpenConnect => "TCP_FASTOPEN_CONNECT",
            SocketOption::TcpNoDelay => "TCP_NODELAY",
            SocketOption::TcpCork => "TCP_CORK",
            SocketOption::TcpQuickAck => "TCP_QUICKACK",
            SocketOption::TcpDeferAccept => "TCP_DEFER_ACCEPT",
            SocketOption::IpTransparent => "IP_TRANSPARENT",
            SocketOption::Ipv6Transparent => "IPV6_TRANSPARENT",
            SocketOption::IpRecvOrigDstAddr => "IP_RECVORIGDSTADDR",
            SocketOption::Ipv6RecvOrigDstAddr => "IPV6_RECVORIGDSTADDR",
            SocketOption::KeepAlive => "SO_KEEPALIVE",
            SocketOption::TcpKeepInterval => "TCP_KEEPINTVL",
            SocketOption::TcpKeepIdle => "TCP_KEEPIDLE",
        }
    }
}

/// Platform level/name pair of a socket option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptionKey {
    pub level: i32,
    pub name: i32,
}

impl OptionKey {
    pub const fn new(level: i32, name: i32) -> Self {
        Self { level, name }
    }
}

/// Per-OS socket option backend.
pub trait SocketOptionApplier: Send + Sync {
    /// Key for `opt` on this platform, `None` when unsupported.
    fn key(&self, opt: SocketOption) -> Option<OptionKey>;

    /// Set an integer socket option.
    fn set_int(&self, socket: &SockRef<'_>, key: OptionKey, value: i32) -> io::Result<()>;
}

/// Backend for the platform this crate was built for.
pub fn platform() -> &'static dyn SocketOptionApplier {
    static PLATFORM: Platform = Platform;
    &PLATFORM
}

/// Callback applied to a socket before it connects.
pub type Control = Arc<dyn Fn(Network, &SocketAddr, SockRef<'_>) -> Result<()> + Send + Sync>;

/// Applies the configured [`SocketFlag`] and keepalive to sockets.
#[derive(Clone)]
pub struct SocketController {
    flags: SocketFlag,
    keepalive: i32,
    applier: &'static dyn SocketOptionApplier,
}

impl std::fmt::Debug for SocketController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketController")
            .field("flags", &self.flags)
            .field("keepalive", &self.keepalive)
            .finish()
    }
}

impl SocketController {
    /// Controller for `flags`; keepalive in seconds, `<= 0` disables it.
    pub fn new(flags: SocketFlag, keepalive: i32) -> Self {
        Self::with_applier(flags, keepalive, platform())
    }

    pub fn with_applier(
        flags: SocketFlag,
        keepalive: i32,
        applier: &'static dyn SocketOptionApplier,
    ) -> Self {
        Self {
            flags,
            keepalive,
            applier,
        }
    }

    pub fn flags(&self) -> SocketFlag {
        self.flags
    }

    pub fn keepalive(&self) -> i32 {
        self.keepalive
    }

    /// The options, with values, this controller would set for a socket.
    pub fn plan(&self, network: Network, addr: &SocketAddr) -> Vec<(SocketOption, i32)> {
        let mut plan = Vec::new();
        let on = |flag| self.flags.contains(flag);

        if on(SocketFlag::REUSE_PORT) {
            plan.push((SocketOption::ReusePort, 1));
        }
        if on(SocketFlag::REUSE_ADDR) {
            plan.push((SocketOption::ReuseAddr, 1));
        }

        if network.is_tcp() {
            if on(SocketFlag::TCP_FAST_OPEN) {
                plan.push((SocketOption::TcpFastOpen, 1));
                plan.push((SocketOption::TcpFastOpenConnect, 1));
            }
            if on(SocketFlag::TCP_NO_DELAY) {
                plan.push((SocketOption::TcpNoDelay, 1));
            }
            if on(SocketFlag::TCP_CORK) {
                plan.push((SocketOption::TcpCork, 1));
            }
            if on(SocketFlag::TCP_QUICK_ACK) {
                plan.push((SocketOption::TcpQuickAck, 1));
            }
            if on(SocketFlag::TCP_DEFER_ACCEPT) {
                plan.push((SocketOption::TcpDeferAccept, 1));
            }
        }

        let v4 = addr.is_ipv4();
        if on(SocketFlag::IP_TRANSPARENT) {
            plan.push((
                if v4 {
                    SocketOption::IpTransparent
                } else {
                    SocketOption::Ipv6Transparent
                },
                1,
            ));
        }
        if on(SocketFlag::IP_RECOVER_DESTINATION_ADDR) {
            plan.push((
                if v4 {
                    SocketOption::IpRecvOrigDstAddr
                } else {
                    SocketOption::Ipv6RecvOrigDstAddr
                },
                1,
            ));
        }

        if self.keepalive > 0 {
            plan.push((SocketOption::KeepAlive, 1));
            plan.push((SocketOption::TcpKeepInterval, self.keepalive));
            plan.push((SocketOption::TcpKeepIdle, self.keepalive));
        }

        plan
    }

    /// Apply every planned option, collecting failures instead of stopping
    /// at the first one.
    pub fn apply(&self, network: Network, addr: &SocketAddr, socket: SockRef<'_>) -> Result<()> {
        let mut errs = Vec::new();
        for (opt, value) in self.plan(network, addr) {
            let Some(key) = self.applier.key(opt) else {
                continue;
            };
            if let Err(source) = self.applier.set_int(&socket, key, value) {
                errs.push(SocketOptionError {
                    option: opt.name(),
                    source,
                });
            }
        }

        if errs.is_empty() {
            Ok(())
        } else {
            Err(Error::SocketOptions(errs))
        }
    }

    pub fn get_control(&self) -> Control {
        let ctrl = self.clone();
        Arc::new(move |network: Network, addr: &SocketAddr, socket: SockRef<'_>| {
            ctrl.apply(network, addr, socket)
        })
    }
}

/// Control callback for an optional controller; `None` sets nothing.
pub fn control_of(ctrl: Option<&SocketController>) -> Control {
    match ctrl {
        Some(ctrl) => ctrl.get_control(),
        None => Arc::new(|_: Network, _: &SocketAddr, _: SockRef<'_>| Ok(())),
    }
}

/// `setsockopt` with an int value.
#[cfg(unix)]
fn setsockopt_int(socket: &SockRef<'_>, key: OptionKey, value: i32) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    let fd = socket.as_raw_fd();
    let value: libc::c_int = value;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            key.level,
            key.name,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };

    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use socket2::{Domain, Socket, Type};

    static NOOP: noop::Noop = noop::Noop;

    fn v4() -> SocketAddr {
        "127.0.0.1:80".parse().unwrap()
    }

    fn v6() -> SocketAddr {
        "[::1]:80".parse().unwrap()
    }

    fn names(plan: &[(SocketOption, i32)]) -> Vec<&'static str> {
        plan.iter().map(|(o, _)| o.name()).collect()
    }

    #[test]
    fn flag_contains() {
        let flags = SocketFlag::REUSE_PORT | SocketFlag::TCP_NO_DELAY;

        assert!(flags.contains(SocketFlag::REUSE_PORT));
        assert!(flags.contains(SocketFlag::TCP_NO_DELAY));
        assert!(!flags.contains(SocketFlag::TCP_CORK));
        assert!(!flags.contains(SocketFlag::NONE));
        assert!(SocketFlag::NONE.is_empty());
    }

    #[test]
    fn options_to_flag() {
        let opts = SocketOptions {
            reuse_addr: true,
            tcp_quick_ack: true,
            ..Default::default()
        };

        assert_eq!(
            opts.to_flag(),
            SocketFlag::REUSE_ADDR | SocketFlag::TCP_QUICK_ACK
        );
        assert!(SocketOptions::default().to_flag().is_empty());
    }

    #[test]
    fn plan_empty_without_flags() {
        let ctrl = SocketController::new(SocketFlag::NONE, 0);

        assert!(ctrl.plan(Network::Tcp, &v4()).is_empty());
    }

    #[test]
    fn plan_skips_tcp_options_for_udp() {
        let ctrl = SocketController::new(
            SocketFlag::REUSE_PORT | SocketFlag::TCP_NO_DELAY | SocketFlag::TCP_CORK,
            0,
        );

        assert_eq!(names(&ctrl.plan(Network::Udp, &v4())), ["SO_REUSEPORT"]);
        assert_eq!(
            names(&ctrl.plan(Network::Tcp, &v4())),
            ["SO_REUSEPORT", "TCP_NODELAY", "TCP_CORK"]
        );
    }

    #[test]
    fn plan_picks_family_specific_options() {
        let ctrl = SocketController::new(
            SocketFlag::IP_TRANSPARENT | SocketFlag::IP_RECOVER_DESTINATION_ADDR,
            0,
        );

        assert_eq!(
            names(&ctrl.plan(Network::Tcp, &v4())),
            ["IP_TRANSPARENT", "IP_RECVORIGDSTADDR"]
        );
        assert_eq!(
            names(&ctrl.plan(Network::Tcp, &v6())),
            ["IPV6_TRANSPARENT", "IPV6_RECVORIGDSTADDR"]
        );
    }

    #[test]
    fn plan_keepalive_only_when_positive() {
        let ctrl = SocketController::new(SocketFlag::NONE, 30);
        let plan = ctrl.plan(Network::Tcp, &v4());

        assert_eq!(
            plan,
            [
                (SocketOption::KeepAlive, 1),
                (SocketOption::TcpKeepInterval, 30),
                (SocketOption::TcpKeepIdle, 30),
            ]
        );
        assert!(
            SocketController::new(SocketFlag::NONE, -1)
                .plan(Network::Tcp, &v4())
                .is_empty()
        );
    }

    #[test]
    fn apply_ignores_unsupported_options() {
        let ctrl = SocketController::with_applier(
            SocketFlag::REUSE_PORT | SocketFlag::IP_TRANSPARENT,
            30,
            &NOOP,
        );
        let socket = Socket::new(Domain::IPV4, Type::STREAM, None).unwrap();

        assert!(ctrl.apply(Network::Tcp, &v4(), SockRef::from(&socket)).is_ok());
    }

    #[test]
    fn apply_sets_supported_options() {
        let ctrl = SocketController::new(
            SocketFlag::REUSE_ADDR | SocketFlag::TCP_NO_DELAY,
            15,
        );
        let socket = Socket::new(Domain::IPV4, Type::STREAM, None).unwrap();

        ctrl.apply(Network::Tcp, &v4(), SockRef::from(&socket)).unwrap();

        assert!(socket.reuse_address().unwrap());
        assert!(socket.nodelay().unwrap());
        assert!(socket.keepalive().unwrap());
    }

    #[test]
    fn control_of_none_is_noop() {
        let control = control_of(None);
        let socket = Socket::new(Domain::IPV4, Type::STREAM, None).unwrap();

        assert!(control(Network::Tcp, &v4(), SockRef::from(&socket)).is_ok());
    }
}
