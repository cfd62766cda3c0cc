//! macOS socket option backend.
//!
//! Darwin has no cork, quick-ack, defer-accept or transparent proxy options.

use std::io;

use socket2::SockRef;

use super::{OptionKey, SocketOption, SocketOptionApplier, setsockopt_int};

// TCP_KEEPALIVE is the idle time on darwin.
const TCP_KEEPALIVE: i32 = 0x10;
const TCP_KEEPINTVL: i32 = 0x101;
const TCP_FASTOPEN: i32 = 0x105;

pub(super) struct Platform;

impl SocketOptionApplier for Platform {
    fn key(&self, opt: SocketOption) -> Option<OptionKey> {
        match opt {
            SocketOption::ReusePort => Some(OptionKey::new(libc::SOL_SOCKET, libc::SO_REUSEPORT)),
            SocketOption::ReuseAddr => Some(OptionKey::new(libc::SOL_SOCKET, libc::SO_REUSEADDR)),
            SocketOption::KeepAlive => Some(OptionKey::new(libc::SOL_SOCKET, libc::SO_KEEPALIVE)),
            SocketOption::TcpFastOpen => Some(OptionKey::new(libc::IPPROTO_TCP, TCP_FASTOPEN)),
            SocketOption::TcpNoDelay => Some(OptionKey::new(libc::IPPROTO_TCP, libc::TCP_NODELAY)),
            SocketOption::TcpKeepInterval => Some(OptionKey::new(libc::IPPROTO_TCP, TCP_KEEPINTVL)),
            SocketOption::TcpKeepIdle => Some(OptionKey::new(libc::IPPROTO_TCP, TCP_KEEPALIVE)),
            _ => None,
        }
    }

    fn set_int(&self, socket: &SockRef<'_>, key: OptionKey, value: i32) -> io::Result<()> {
        setsockopt_int(socket, key, value)
    }
}
