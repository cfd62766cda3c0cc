//! Windows socket option backend.
//!
//! Winsock values are listed for the options Windows has; they are set
//! through socket2 since there is no generic int setter here.

use std::io;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};

use super::{OptionKey, SocketOption, SocketOptionApplier};

const SOL_SOCKET: i32 = 0xffff;
const SO_REUSEADDR: i32 = 0x0004;
const SO_KEEPALIVE: i32 = 0x0008;
const IPPROTO_TCP: i32 = 6;
const TCP_NODELAY: i32 = 0x0001;
const TCP_KEEPIDLE: i32 = 3;
const TCP_KEEPINTVL: i32 = 17;

pub(super) struct Platform;

impl SocketOptionApplier for Platform {
    fn key(&self, opt: SocketOption) -> Option<OptionKey> {
        match opt {
            SocketOption::ReuseAddr => Some(OptionKey::new(SOL_SOCKET, SO_REUSEADDR)),
            SocketOption::KeepAlive => Some(OptionKey::new(SOL_SOCKET, SO_KEEPALIVE)),
            SocketOption::TcpNoDelay => Some(OptionKey::new(IPPROTO_TCP, TCP_NODELAY)),
            SocketOption::TcpKeepIdle => Some(OptionKey::new(IPPROTO_TCP, TCP_KEEPIDLE)),
            SocketOption::TcpKeepInterval => Some(OptionKey::new(IPPROTO_TCP, TCP_KEEPINTVL)),
            _ => None,
        }
    }

    fn set_int(&self, socket: &SockRef<'_>, key: OptionKey, value: i32) -> io::Result<()> {
        let on = value != 0;
        let secs = Duration::from_secs(value.max(0) as u64);
        match (key.level, key.name) {
            (SOL_SOCKET, SO_REUSEADDR) => socket.set_reuse_address(on),
            (SOL_SOCKET, SO_KEEPALIVE) => socket.set_keepalive(on),
            (IPPROTO_TCP, TCP_NODELAY) => socket.set_nodelay(on),
            (IPPROTO_TCP, TCP_KEEPIDLE) => {
                socket.set_tcp_keepalive(&TcpKeepalive::new().with_time(secs))
            }
            (IPPROTO_TCP, TCP_KEEPINTVL) => {
                socket.set_tcp_keepalive(&TcpKeepalive::new().with_interval(secs))
            }
            _ => Err(io::Error::from(io::ErrorKind::Unsupported)),
        }
    }
}
