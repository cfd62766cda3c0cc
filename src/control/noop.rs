//! Backend for runtimes without raw socket access; every option is ignored.

use std::io;

use socket2::SockRef;

use super::{OptionKey, SocketOption, SocketOptionApplier};

pub struct Noop;

impl SocketOptionApplier for Noop {
    fn key(&self, _opt: SocketOption) -> Option<OptionKey> {
        None
    }

    fn set_int(&self, _socket: &SockRef<'_>, _key: OptionKey, _value: i32) -> io::Result<()> {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }
}
