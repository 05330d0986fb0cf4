// This file is part of cfxmpp.
// Copyright (c) 2019, Cloudflare. All rights reserved.
// See LICENSE for licensing information.

//! Socket construction helpers shared by the reactor factories.

use libc::*;
use net2::TcpBuilder;
use std::io::{Error, ErrorKind};
use std::net::{SocketAddr, SocketAddr::*};
use std::os::unix::io::AsRawFd;

fn set_freebind(fd: c_int) -> Result<(), std::io::Error> {
    const IP_FREEBIND: libc::c_int = 0xf;
    match unsafe {
        setsockopt(
            fd,
            SOL_IP,
            IP_FREEBIND,
            &1u32 as *const u32 as *const c_void,
            std::mem::size_of::<u32>() as u32,
        )
    } {
        -1 => Err(std::io::Error::new(
            ErrorKind::Other,
            Error::last_os_error(),
        )),
        _ => Ok(()),
    }
}

/// Build a bound, listening TCP socket with `SO_REUSEADDR` and `IP_FREEBIND` set. The caller
/// hands the result to mio and is responsible for nonblocking mode.
pub fn tcp_listener(addr: &SocketAddr, backlog: i32) -> Result<std::net::TcpListener, std::io::Error> {
    let builder = match addr {
        V4(_) => TcpBuilder::new_v4()?,
        V6(_) => TcpBuilder::new_v6()?,
    };
    builder.reuse_address(true)?;
    set_freebind(builder.as_raw_fd())?;
    builder.bind(addr)?;
    builder.listen(backlog)
}
