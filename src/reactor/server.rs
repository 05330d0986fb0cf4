// This file is part of cfxmpp.
// Copyright (c) 2019, Cloudflare. All rights reserved.
// See LICENSE for licensing information.

//! Passive listener sockets.
//!
//! A `Server` owns one bound TCP listener. Accepted sockets become regular connections
//! inheriting the listener's read size, listener record and TLS configuration; the accepted
//! side keeps only a weak back-reference for those inheritance lookups.

use slog::{debug, error, info};

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::Arc;

use mio::net::TcpListener;

use super::conn::ListenerRef;
use super::core::{Reactor, ACCEPT_COUNTER};
use super::timer::TimerId;
use super::tls::TlsConfig;

pub(crate) struct Server {
    pub(crate) id: String,
    pub(crate) fd: RawFd,
    pub(crate) logger: slog::Logger,
    pub(crate) socket: Option<TcpListener>,
    pub(crate) local: SocketAddr,
    // Template state inherited by accepted connections.
    pub(crate) listeners: ListenerRef,
    pub(crate) read_size: usize,
    pub(crate) tls_ctx: Option<TlsConfig>,
    pub(crate) tls_direct: bool,
    pub(crate) sni_hosts: HashMap<String, Arc<rustls::ServerConfig>>,
    pub(crate) want_read: bool,
    pub(crate) want_write: bool,
    pub(crate) pause_timer_id: Option<TimerId>,
    pub(crate) destroyed: bool,
}

/// Handle to a listening socket.
#[derive(Clone)]
pub struct ServerHandle(pub(crate) Rc<RefCell<Server>>);

impl ServerHandle {
    pub fn id(&self) -> String {
        self.0.borrow().id.clone()
    }

    /// The bound address, useful when listening on port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.0.borrow().local
    }

    pub fn alive(&self) -> bool {
        !self.0.borrow().destroyed
    }

    fn logger(&self) -> slog::Logger {
        self.0.borrow().logger.clone()
    }

    fn set_accepting(&self, reactor: &mut Reactor, accepting: bool) {
        let fd = {
            let mut server = self.0.borrow_mut();
            if server.destroyed {
                return;
            }
            server.want_read = accepting;
            server.fd
        };
        if let Err(err) = reactor.poller.modify(fd, accepting, false) {
            error!(self.logger(), "cannot update poller interest: {}", err);
        }
    }

    /// One readiness event, one accept. A failed accept pauses the listener briefly so an
    /// EMFILE/ENFILE storm cannot spin the loop.
    pub(crate) fn on_acceptable(&self, reactor: &mut Reactor) {
        let result = {
            let server = self.0.borrow();
            if server.destroyed {
                return;
            }
            match server.socket.as_ref() {
                Some(socket) => socket.accept(),
                None => return,
            }
        };
        let (stream, peer) = match result {
            Ok(accepted) => accepted,
            Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => return,
            Err(err) => {
                error!(
                    self.logger(),
                    "encountered error while accepting connection; err={}", err
                );
                self.pause_accepts(reactor);
                return;
            }
        };
        ACCEPT_COUNTER.inc();
        info!(self.logger(), "accepting new connection from {}", peer);
        let (listeners, read_size, tls_ctx, tls_direct) = {
            let server = self.0.borrow();
            (
                server.listeners.clone(),
                server.read_size,
                server.tls_ctx.clone(),
                server.tls_direct,
            )
        };
        let conn = match reactor.wrap_incoming(
            stream,
            peer,
            listeners,
            read_size,
            tls_ctx,
            Rc::downgrade(&self.0),
        ) {
            Ok(conn) => conn,
            Err(err) => {
                error!(self.logger(), "cannot register accepted connection: {}", err);
                return;
            }
        };
        if tls_direct {
            conn.starttls(reactor, None);
        } else {
            conn.announce_connected(reactor);
            if conn.alive() {
                // The readable edge is already known; read before the next poll.
                conn.on_readable(reactor);
            }
        }
    }

    fn pause_accepts(&self, reactor: &mut Reactor) {
        let interval = reactor.config.accept_retry_interval;
        debug!(
            self.logger(),
            "pausing accepts for {:?} after failure", interval
        );
        self.set_accepting(reactor, false);
        let old = self.0.borrow_mut().pause_timer_id.take();
        if let Some(id) = old {
            reactor.stop_timer(id);
        }
        let weak = Rc::downgrade(&self.0);
        let id = reactor.add_task(interval, move |reactor, _now, _id| {
            let server = ServerHandle(weak.upgrade()?);
            {
                let mut inner = server.0.borrow_mut();
                inner.pause_timer_id = None;
                if inner.destroyed {
                    return None;
                }
            }
            server.set_accepting(reactor, true);
            None
        });
        self.0.borrow_mut().pause_timer_id = Some(id);
    }

    /// Stop listening and release the socket. Idempotent.
    pub fn destroy(&self, reactor: &mut Reactor) {
        let (fd, socket, timer) = {
            let mut server = self.0.borrow_mut();
            if server.destroyed {
                return;
            }
            server.destroyed = true;
            server.want_read = false;
            let fd = server.fd;
            server.fd = -1;
            (fd, server.socket.take(), server.pause_timer_id.take())
        };
        if let Some(id) = timer {
            reactor.stop_timer(id);
        }
        if fd >= 0 {
            if let Err(err) = reactor.poller.del(fd) {
                error!(self.logger(), "cannot deregister fd {}: {}", fd, err);
            }
            reactor.remove_entry(fd);
        }
        info!(self.logger(), "stopped listening");
        drop(socket);
    }

    /// `close` on a listener is `destroy`; there is nothing to drain.
    pub fn close(&self, reactor: &mut Reactor) {
        self.destroy(reactor);
    }
}
