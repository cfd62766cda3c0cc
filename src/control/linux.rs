//! Linux socket option backend.

use std::io;

use socket2::SockRef;

use super::{OptionKey, SocketOption, SocketOptionApplier, setsockopt_int};

const SOL_IP: i32 = 0;
const SOL_IPV6: i32 = 41;
const TCP_CORK: i32 = 3;
const TCP_DEFER_ACCEPT: i32 = 9;
const TCP_QUICKACK: i32 = 12;
const IP_TRANSPARENT: i32 = 19;
const IP_RECVORIGDSTADDR: i32 = 20;
const TCP_FASTOPEN: i32 = 23;
const TCP_FASTOPEN_CONNECT: i32 = 30;
const IPV6_RECVORIGDSTADDR: i32 = 74;
const IPV6_TRANSPARENT: i32 = 75;

pub(super) struct Platform;

impl SocketOptionApplier for Platform {
    fn key(&self, opt: SocketOption) -> Option<OptionKey> {
        let key = match opt {
            SocketOption::ReusePort => OptionKey::new(libc::SOL_SOCKET, libc::SO_REUSEPORT),
            SocketOption::ReuseAddr => OptionKey::new(libc::SOL_SOCKET, libc::SO_REUSEADDR),
            SocketOption::KeepAlive => OptionKey::new(libc::SOL_SOCKET, libc::SO_KEEPALIVE),
            SocketOption::TcpFastOpen => OptionKey::new(libc::IPPROTO_TCP, TCP_FASTOPEN),
            SocketOption::TcpFastOpenConnect => {
                OptionKey::new(libc::IPPROTO_TCP, TCP_FASTOPEN_CONNECT)
            }
            SocketOption::TcpNoDelay => OptionKey::new(libc::IPPROTO_TCP, libc::TCP_NODELAY),
            SocketOption::TcpCork => OptionKey::new(libc::IPPROTO_TCP, TCP_CORK),
            SocketOption::TcpQuickAck => OptionKey::new(libc::IPPROTO_TCP, TCP_QUICKACK),
            SocketOption::TcpDeferAccept => OptionKey::new(libc::IPPROTO_TCP, TCP_DEFER_ACCEPT),
            SocketOption::TcpKeepInterval => OptionKey::new(libc::IPPROTO_TCP, libc::TCP_KEEPINTVL),
            SocketOption::TcpKeepIdle => OptionKey::new(libc::IPPROTO_TCP, libc::TCP_KEEPIDLE),
            SocketOption::IpTransparent => OptionKey::new(SOL_IP, IP_TRANSPARENT),
            SocketOption::Ipv6Transparent => OptionKey::new(SOL_IPV6, IPV6_TRANSPARENT),
            SocketOption::IpRecvOrigDstAddr => OptionKey::new(SOL_IP, IP_RECVORIGDSTADDR),
            SocketOption::Ipv6RecvOrigDstAddr => OptionKey::new(SOL_IPV6, IPV6_RECVORIGDSTADDR),
        };
        Some(key)
    }

    fn set_int(&self, socket: &SockRef<'_>, key: OptionKey, value: i32) -> io::Result<()> {
        setsockopt_int(socket, key, value)
    }
}
