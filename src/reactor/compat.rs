// This file is part of cfxmpp.
// Copyright (c) 2019, Cloudflare. All rights reserved.
// See LICENSE for licensing information.

//! Legacy entry points.
//!
//! Earlier consumers of the reactor used a different argument shape for the factories and an
//! event-constant protocol for watched descriptors. These shims translate into the primary
//! surface and must keep working; they carry no behavior of their own.

use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use super::conn::{Conn, ListenerRef};
use super::core::{ListenConfig, Reactor, WatchCallback, WatchHandle};
use super::server::ServerHandle;
use super::tls::TlsConfig;

pub const EV_READ: i32 = 1;
pub const EV_WRITE: i32 = 2;
pub const EV_READWRITE: i32 = 3;
/// Returned by an `addevent` callback to drop both interest bits.
pub const EV_LEAVE: i32 = -1;

/// Old-style `listen`: a TLS context implies direct TLS on accepted sockets.
pub fn addserver(
    reactor: &mut Reactor,
    addr: &str,
    port: u16,
    listeners: ListenerRef,
    read_size: Option<usize>,
    tls_ctx: Option<TlsConfig>,
) -> io::Result<ServerHandle> {
    let ip: std::net::IpAddr = addr.parse().map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("cannot parse address {:?}", addr),
        )
    })?;
    let options = ListenConfig {
        read_size,
        tls_direct: tls_ctx.is_some(),
        tls_ctx,
        ..ListenConfig::default()
    };
    reactor.listen(&SocketAddr::new(ip, port), listeners, options)
}

/// Old-style client wrap. The address and port were advisory (the socket is already
/// connected); they are ignored here.
pub fn wrapclient(
    reactor: &mut Reactor,
    socket: std::net::TcpStream,
    _addr: &str,
    _port: u16,
    listeners: ListenerRef,
    read_size: Option<usize>,
    tls_ctx: Option<TlsConfig>,
    servername: Option<String>,
) -> io::Result<Conn> {
    reactor.wrapclient(socket, listeners, read_size, tls_ctx, servername)
}

/// Watch a descriptor with the old single-callback protocol. The callback's return value
/// selects the next interest set: `EV_LEAVE` drops both bits, any other nonzero value restores
/// the original mode, zero leaves the bits unchanged.
pub fn addevent<F>(
    reactor: &mut Reactor,
    fd: RawFd,
    mode: &str,
    callback: F,
) -> io::Result<WatchHandle>
where
    F: FnMut(&mut Reactor) -> i32 + 'static,
{
    let read = mode.contains('r');
    let write = mode.contains('w');
    let callback = Rc::new(RefCell::new(callback));

    fn wrap<F>(callback: Rc<RefCell<F>>, read: bool, write: bool) -> WatchCallback
    where
        F: FnMut(&mut Reactor) -> i32 + 'static,
    {
        Box::new(move |reactor, fd| {
            let ret = (&mut *callback.borrow_mut())(reactor);
            if ret == EV_LEAVE {
                reactor.watch_interest(fd, false, false);
            } else if ret != 0 {
                reactor.watch_interest(fd, read, write);
            }
        })
    }

    let on_readable = if read {
        Some(wrap(callback.clone(), read, write))
    } else {
        None
    };
    let on_writable = if write {
        Some(wrap(callback, read, write))
    } else {
        None
    };
    reactor.watchfd(fd, on_readable, on_writable)
}

// ------------------------------------------------------------------------
// Tests
// ------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use sloggers::null::NullLoggerBuilder;
    use sloggers::Build;
    use std::cell::Cell;
    use std::time::Duration;

    #[test]
    fn test_addevent_leave_contract() {
        let logger = NullLoggerBuilder.build().unwrap();
        let mut reactor = Reactor::new(logger).unwrap();
        let mut config = super::super::config::Config::default();
        config.max_wait = Duration::from_millis(20);
        reactor.set_config(config);

        let (read_fd, write_fd) = nix::unistd::pipe().unwrap();
        let fired = Rc::new(Cell::new(0usize));
        let counter = fired.clone();
        let watch = addevent(&mut reactor, read_fd, "r", move |_reactor| {
            let mut buf = [0u8; 8];
            let _ = nix::unistd::read(read_fd, &mut buf);
            counter.set(counter.get() + 1);
            EV_LEAVE
        })
        .unwrap();

        nix::unistd::write(write_fd, &[0u8; 1]).unwrap();
        for _ in 0..20 {
            if fired.get() > 0 {
                break;
            }
            reactor.step().unwrap();
        }
        assert_eq!(fired.get(), 1);
        // EV_LEAVE dropped the interest; further writes must not fire the callback.
        assert_eq!(reactor.poller.interest(read_fd), Some((false, false)));
        nix::unistd::write(write_fd, &[0u8; 1]).unwrap();
        for _ in 0..3 {
            reactor.step().unwrap();
        }
        assert_eq!(fired.get(), 1);

        watch.close(&mut reactor);
        assert_eq!(reactor.poller.interest(read_fd), None);
        nix::unistd::close(read_fd).unwrap();
        nix::unistd::close(write_fd).unwrap();
    }
}
