// This file is part of cfxmpp.
// Copyright (c) 2019, Cloudflare. All rights reserved.
// See LICENSE for licensing information.

//! Per-socket connection state machine.
//!
//! A `Connection` wraps one nonblocking stream socket together with its interest bits, write
//! buffer, idle timers, optional TLS session and the listener record receiving its events. The
//! original design swapped method slots to change behavior; here the read/write drivers
//! dispatch on an explicit TLS state instead.
//!
//! Handles are reference-counted: the reactor's descriptor map holds the only strong reference,
//! timers and linked peers hold weak ones. All methods on a destroyed connection are no-ops, so
//! teardown is idempotent no matter who still holds a handle.

use slog::{debug, error};

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{IpAddr, SocketAddr};
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::time::Duration;

use mio::net::TcpStream;

use rand::Rng;

use super::core::{Reactor, TIMEOUT_COUNTER};
use super::interface::{DisconnectReason, HandlerResult, SessionListener};
use super::server::Server;
use super::timer::TimerId;
use super::tls::{TlsConfig, TlsSession};

/// Shared listener record. Swappable at runtime via `Conn::set_listener`.
pub type ListenerRef = Rc<dyn SessionListener>;

pub(crate) enum TlsState {
    None,
    Handshaking(TlsSession),
    Established(TlsSession),
}

/// Action to take once the write buffer drains.
enum PostDrain {
    Close,
    StartTls(Option<TlsConfig>),
}

pub(crate) struct Connection {
    pub(crate) id: String,
    pub(crate) fd: RawFd,
    pub(crate) logger: slog::Logger,
    socket: Option<TcpStream>,
    pub(crate) want_read: bool,
    pub(crate) want_write: bool,
    pub(crate) read_size: usize,
    write_buffer: VecDeque<Vec<u8>>,
    tls: TlsState,
    tls_ctx: Option<TlsConfig>,
    // Start a handshake as soon as the outgoing connect completes.
    tls_on_connect: bool,
    pub(crate) server: Weak<RefCell<Server>>,
    servername: Option<String>,
    // True after the first successful read or write (or accept/connect promotion).
    connected: bool,
    // Guards the exactly-once `on_connect`.
    announced: bool,
    outgoing: bool,
    read_timeout_id: Option<TimerId>,
    write_timeout_id: Option<TimerId>,
    pause_timer_id: Option<TimerId>,
    paused: bool,
    write_lock: bool,
    // Inverse byte rate: seconds the peer must wait per received byte.
    limit: Option<f64>,
    peer: Option<SocketAddr>,
    local: Option<SocketAddr>,
    listeners: ListenerRef,
    post_drain: Option<PostDrain>,
    closing: bool,
    destroyed: bool,
    in_opportunistic_write: bool,
}

/// Everything `Reactor` needs to assemble a stream connection, whether accepted, dialed or
/// wrapped.
pub(crate) struct ConnArgs {
    pub socket: TcpStream,
    pub listeners: ListenerRef,
    pub read_size: usize,
    pub tls_ctx: Option<TlsConfig>,
    pub tls_on_connect: bool,
    pub server: Weak<RefCell<Server>>,
    pub servername: Option<String>,
    pub outgoing: bool,
    pub peer: Option<SocketAddr>,
    pub want_read: bool,
    pub want_write: bool,
}

/// Generate the opaque identifier connections carry in their logs.
pub(crate) fn generate_id() -> String {
    const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..9)
        .map(|_| CHARS[rng.gen_range(0, CHARS.len())] as char)
        .collect()
}

/// A cheap, clonable handle to a connection.
#[derive(Clone)]
pub struct Conn(pub(crate) Rc<RefCell<Connection>>);

/// Weak counterpart held by timers and linked peers.
pub struct WeakConn(Weak<RefCell<Connection>>);

impl WeakConn {
    pub fn upgrade(&self) -> Option<Conn> {
        self.0.upgrade().map(Conn)
    }
}

impl Conn {
    pub(crate) fn assemble(id: String, logger: slog::Logger, args: ConnArgs) -> Conn {
        let fd = {
            use std::os::unix::io::AsRawFd;
            args.socket.as_raw_fd()
        };
        Conn(Rc::new(RefCell::new(Connection {
            id,
            fd,
            logger,
            socket: Some(args.socket),
            want_read: args.want_read,
            want_write: args.want_write,
            read_size: args.read_size,
            write_buffer: VecDeque::new(),
            tls: TlsState::None,
            tls_ctx: args.tls_ctx,
            tls_on_connect: args.tls_on_connect,
            server: args.server,
            servername: args.servername,
            connected: false,
            announced: false,
            outgoing: args.outgoing,
            read_timeout_id: None,
            write_timeout_id: None,
            pause_timer_id: None,
            paused: false,
            write_lock: false,
            limit: None,
            peer: args.peer,
            local: None,
            listeners: args.listeners,
            post_drain: None,
            closing: false,
            destroyed: false,
            in_opportunistic_write: false,
        })))
    }

    pub fn downgrade(&self) -> WeakConn {
        WeakConn(Rc::downgrade(&self.0))
    }

    pub(crate) fn same(&self, other: &Conn) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    fn logger(&self) -> slog::Logger {
        self.0.borrow().logger.clone()
    }

    // --------------------------------------------------------------------
    // Accessors
    // --------------------------------------------------------------------

    pub fn id(&self) -> String {
        self.0.borrow().id.clone()
    }

    pub fn alive(&self) -> bool {
        !self.0.borrow().destroyed
    }

    pub fn is_connected(&self) -> bool {
        self.0.borrow().connected
    }

    /// The peer's address.
    pub fn ip(&self) -> Option<IpAddr> {
        self.0.borrow().peer.map(|addr| addr.ip())
    }

    /// The peer's port.
    pub fn port(&self) -> Option<u16> {
        self.0.borrow().peer.map(|addr| addr.port())
    }

    /// Our own port on this connection.
    pub fn clientport(&self) -> Option<u16> {
        self.0.borrow().local.map(|addr| addr.port())
    }

    /// The service port: the local port, falling back to the accepting listener's.
    pub fn serverport(&self) -> Option<u16> {
        let conn = self.0.borrow();
        match conn.local {
            Some(addr) => Some(addr.port()),
            None => conn
                .server
                .upgrade()
                .map(|server| server.borrow().local.port()),
        }
    }

    /// Whether TLS is active (handshaking or established).
    pub fn ssl(&self) -> bool {
        match self.0.borrow().tls {
            TlsState::None => false,
            _ => true,
        }
    }

    pub fn servername(&self) -> Option<String> {
        self.0.borrow().servername.clone()
    }

    pub fn set_servername(&self, name: Option<String>) {
        self.0.borrow_mut().servername = name;
    }

    pub fn set_read_size(&self, read_size: usize) {
        self.0.borrow_mut().read_size = read_size;
    }

    /// Install or clear the read rate limit, in bytes per second.
    pub fn set_limit(&self, bytes_per_second: Option<f64>) {
        self.0.borrow_mut().limit = bytes_per_second
            .filter(|rate| *rate > 0.0)
            .map(|rate| 1.0 / rate);
    }

    /// Historical no-op: some callers install their own send path and expect this to exist.
    pub fn set_send(&self) {}

    // --------------------------------------------------------------------
    // Listener dispatch
    // --------------------------------------------------------------------

    pub(crate) fn raw_listeners(&self) -> ListenerRef {
        self.0.borrow().listeners.clone()
    }

    /// Swap the listener record. The old record sees `on_detach`, the new one `on_attach`.
    pub fn set_listener(&self, reactor: &mut Reactor, listeners: ListenerRef) {
        if self.0.borrow().destroyed {
            return;
        }
        self.fire(reactor, "ondetach", |l, r, c| l.on_detach(r, c));
        self.0.borrow_mut().listeners = listeners;
        self.fire(reactor, "onattach", |l, r, c| l.on_attach(r, c));
    }

    /// Run one listener callback under the configured containment policy.
    pub(crate) fn fire<F>(&self, reactor: &mut Reactor, name: &'static str, f: F)
    where
        F: FnOnce(&dyn SessionListener, &mut Reactor, &Conn) -> HandlerResult,
    {
        if reactor.config.verbose {
            debug!(self.logger(), "calling {}", name);
        }
        let listeners = self.raw_listeners();
        if let Err(err) = f(listeners.as_ref(), reactor, self) {
            error!(self.logger(), "listener {} failed: {}", name, err);
            super::core::LISTENER_ERROR_COUNTER.inc();
            listeners.as_ref().on_error(reactor, self, err.as_ref());
            if !reactor.config.protect_listeners {
                reactor.record_fatal(name, err);
            } else if reactor.config.fatal_errors {
                self.destroy(reactor);
            }
        }
    }

    // --------------------------------------------------------------------
    // Interest and timers
    // --------------------------------------------------------------------

    /// Update interest bits, `None` keeping the current value, and tell the poller.
    pub(crate) fn update_interest(
        &self,
        reactor: &mut Reactor,
        read: Option<bool>,
        write: Option<bool>,
    ) {
        let (fd, read, write) = {
            let mut conn = self.0.borrow_mut();
            if conn.destroyed {
                return;
            }
            let read = read.unwrap_or(conn.want_read);
            let write = write.unwrap_or(conn.want_write);
            conn.want_read = read;
            conn.want_write = write;
            (conn.fd, read, write)
        };
        if let Err(err) = reactor.poller.modify(fd, read, write) {
            error!(self.logger(), "cannot update poller interest: {}", err);
        }
    }

    fn arm_read_timer(&self, reactor: &mut Reactor) {
        let (existing, duration) = {
            let conn = self.0.borrow();
            if conn.destroyed || conn.paused {
                return;
            }
            let duration = match conn.tls {
                TlsState::Handshaking(_) => reactor.config.ssl_handshake_timeout,
                _ => reactor.config.read_timeout,
            };
            (conn.read_timeout_id, duration)
        };
        if let Some(id) = existing {
            if reactor.reschedule_timer(id, duration) {
                return;
            }
        }
        let weak = self.downgrade();
        let id = reactor.add_task(duration, move |reactor, _now, _id| {
            let conn = weak.upgrade()?;
            conn.read_timer_fired(reactor)
        });
        self.0.borrow_mut().read_timeout_id = Some(id);
    }

    fn cancel_read_timer(&self, reactor: &mut Reactor) {
        let id = self.0.borrow_mut().read_timeout_id.take();
        if let Some(id) = id {
            reactor.stop_timer(id);
        }
    }

    fn read_timer_fired(&self, reactor: &mut Reactor) -> Option<Duration> {
        let handshaking = {
            let conn = self.0.borrow();
            if conn.destroyed {
                return None;
            }
            match conn.tls {
                TlsState::Handshaking(_) => true,
                _ => false,
            }
        };
        if handshaking {
            self.0.borrow_mut().read_timeout_id = None;
            TIMEOUT_COUNTER.inc();
            self.disconnect_and_destroy(reactor, Some(DisconnectReason::TlsHandshakeTimeout));
            return None;
        }
        if self.fire_read_timeout(reactor) {
            // The listener wants the connection kept; the deadline re-arms under the same id.
            return Some(reactor.config.read_timeout);
        }
        self.0.borrow_mut().read_timeout_id = None;
        TIMEOUT_COUNTER.inc();
        self.disconnect_and_destroy(reactor, Some(DisconnectReason::ReadTimeout));
        None
    }

    fn fire_read_timeout(&self, reactor: &mut Reactor) -> bool {
        if reactor.config.verbose {
            debug!(self.logger(), "calling onreadtimeout");
        }
        let listeners = self.raw_listeners();
        match listeners.as_ref().on_read_timeout(reactor, self) {
            Ok(keep) => keep,
            Err(err) => {
                error!(self.logger(), "listener onreadtimeout failed: {}", err);
                super::core::LISTENER_ERROR_COUNTER.inc();
                listeners.as_ref().on_error(reactor, self, err.as_ref());
                if !reactor.config.protect_listeners {
                    reactor.record_fatal("onreadtimeout", err);
                }
                false
            }
        }
    }

    /// Arm the connect deadline on a freshly dialed connection.
    pub(crate) fn start_connect_timer(&self, reactor: &mut Reactor) {
        self.arm_write_timer(reactor);
    }

    fn arm_write_timer(&self, reactor: &mut Reactor) {
        let (existing, duration) = {
            let conn = self.0.borrow();
            if conn.destroyed {
                return;
            }
            let duration = match conn.tls {
                TlsState::Handshaking(_) => reactor.config.ssl_handshake_timeout,
                _ if conn.connected => reactor.config.send_timeout,
                _ => reactor.config.connect_timeout,
            };
            (conn.write_timeout_id, duration)
        };
        if let Some(id) = existing {
            if reactor.reschedule_timer(id, duration) {
                return;
            }
        }
        let weak = self.downgrade();
        let id = reactor.add_task(duration, move |reactor, _now, _id| {
            let conn = weak.upgrade()?;
            conn.write_timer_fired(reactor)
        });
        self.0.borrow_mut().write_timeout_id = Some(id);
    }

    fn cancel_write_timer(&self, reactor: &mut Reactor) {
        let id = self.0.borrow_mut().write_timeout_id.take();
        if let Some(id) = id {
            reactor.stop_timer(id);
        }
    }

    fn write_timer_fired(&self, reactor: &mut Reactor) -> Option<Duration> {
        let reason = {
            let mut conn = self.0.borrow_mut();
            if conn.destroyed {
                return None;
            }
            conn.write_timeout_id = None;
            match conn.tls {
                TlsState::Handshaking(_) => DisconnectReason::TlsHandshakeTimeout,
                _ if conn.connected => DisconnectReason::WriteTimeout,
                _ => DisconnectReason::ConnectTimeout,
            }
        };
        TIMEOUT_COUNTER.inc();
        self.disconnect_and_destroy(reactor, Some(reason));
        None
    }

    // --------------------------------------------------------------------
    // Pausing and rate limiting
    // --------------------------------------------------------------------

    /// Stop reading until `resume` is called. Used by `link` for flow control.
    pub fn pause(&self, reactor: &mut Reactor) {
        {
            let mut conn = self.0.borrow_mut();
            if conn.destroyed || conn.paused {
                return;
            }
            conn.paused = true;
        }
        self.cancel_read_timer(reactor);
        self.update_interest(reactor, Some(false), None);
    }

    /// Undo `pause` and drain anything that queued up in the meantime.
    pub fn resume(&self, reactor: &mut Reactor) {
        {
            let mut conn = self.0.borrow_mut();
            if conn.destroyed || !conn.paused {
                return;
            }
            conn.paused = false;
        }
        self.update_interest(reactor, Some(true), None);
        self.arm_read_timer(reactor);
        // The TLS layer may hold decrypted bytes the poller cannot see.
        self.on_readable(reactor);
    }

    /// Suppress reads for a fixed duration, then restore interest and drain buffered data.
    pub fn pause_for(&self, reactor: &mut Reactor, duration: Duration) {
        {
            let conn = self.0.borrow();
            if conn.destroyed {
                return;
            }
        }
        self.cancel_read_timer(reactor);
        self.update_interest(reactor, Some(false), None);
        let old = self.0.borrow_mut().pause_timer_id.take();
        if let Some(id) = old {
            reactor.stop_timer(id);
        }
        let weak = self.downgrade();
        let id = reactor.add_task(duration, move |reactor, _now, _id| {
            let conn = weak.upgrade()?;
            {
                let mut inner = conn.0.borrow_mut();
                inner.pause_timer_id = None;
                if inner.destroyed || inner.paused {
                    return None;
                }
            }
            conn.update_interest(reactor, Some(true), None);
            conn.arm_read_timer(reactor);
            conn.on_readable(reactor);
            None
        });
        self.0.borrow_mut().pause_timer_id = Some(id);
    }

    /// Suppress write readiness regardless of buffer state.
    pub fn pause_writes(&self, reactor: &mut Reactor) {
        {
            let mut conn = self.0.borrow_mut();
            if conn.destroyed || conn.write_lock {
                return;
            }
            conn.write_lock = true;
        }
        self.cancel_write_timer(reactor);
        self.update_interest(reactor, None, Some(false));
    }

    /// Undo `pause_writes`; a nonempty buffer resumes draining.
    pub fn resume_writes(&self, reactor: &mut Reactor) {
        let pending = {
            let mut conn = self.0.borrow_mut();
            if conn.destroyed || !conn.write_lock {
                return;
            }
            conn.write_lock = false;
            !conn.write_buffer.is_empty()
        };
        if pending {
            self.arm_write_timer(reactor);
            self.update_interest(reactor, None, Some(true));
        }
    }

    // --------------------------------------------------------------------
    // Connect bookkeeping
    // --------------------------------------------------------------------

    fn update_names(&self) {
        let mut conn = self.0.borrow_mut();
        if let Some(socket) = conn.socket.as_ref() {
            let peer = socket.peer_addr().ok();
            let local = socket.local_addr().ok();
            if peer.is_some() {
                conn.peer = peer;
            }
            if local.is_some() {
                conn.local = local;
            }
        }
    }

    /// Mark the connection live and fire `on_connect` exactly once.
    pub(crate) fn announce_connected(&self, reactor: &mut Reactor) {
        let fire = {
            let mut conn = self.0.borrow_mut();
            if conn.destroyed {
                return;
            }
            conn.connected = true;
            if conn.announced {
                false
            } else {
                conn.announced = true;
                true
            }
        };
        if fire {
            self.update_names();
            self.fire(reactor, "onconnect", |l, r, c| l.on_connect(r, c));
        }
    }

    // --------------------------------------------------------------------
    // Read path
    // --------------------------------------------------------------------

    pub(crate) fn on_readable(&self, reactor: &mut Reactor) {
        let state = {
            let conn = self.0.borrow();
            if conn.destroyed || conn.paused {
                return;
            }
            match conn.tls {
                TlsState::None => 0,
                TlsState::Handshaking(_) => 1,
                TlsState::Established(_) => 2,
            }
        };
        match state {
            1 => self.tls_step(reactor),
            2 => self.tls_read(reactor),
            _ => self.plain_read(reactor),
        }
    }

    fn plain_read(&self, reactor: &mut Reactor) {
        let (result, buf) = {
            let mut conn = self.0.borrow_mut();
            if conn.destroyed {
                return;
            }
            let size = conn.read_size;
            let mut buf = vec![0u8; size];
            let result = match conn.socket.as_mut() {
                Some(socket) => socket.read(&mut buf),
                None => return,
            };
            (result, buf)
        };
        match result {
            Ok(0) => {
                self.disconnect_and_destroy(reactor, Some(DisconnectReason::Closed));
            }
            Ok(n) => {
                self.announce_connected(reactor);
                if !self.alive() {
                    return;
                }
                let data = &buf[..n];
                self.fire(reactor, "onincoming", |l, r, c| {
                    l.on_incoming(r, c, data, None)
                });
                if !self.alive() {
                    return;
                }
                self.after_read_pacing(reactor, n, n == buf.len());
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                // Spurious wakeup; just refresh the idle deadline.
                self.arm_read_timer(reactor);
            }
            Err(err) => {
                self.disconnect_and_destroy(reactor, Some(DisconnectReason::from(&err)));
            }
        }
    }

    fn tls_read(&self, reactor: &mut Reactor) {
        enum Outcome {
            Fine,
            Eof,
            Fail(DisconnectReason),
        }
        let mut plain = Vec::new();
        let (outcome, wants_write) = {
            let mut conn = self.0.borrow_mut();
            if conn.destroyed {
                return;
            }
            let Connection {
                ref mut socket,
                ref mut tls,
                ..
            } = *conn;
            let socket = match socket.as_mut() {
                Some(socket) => socket,
                None => return,
            };
            let session = match tls {
                TlsState::Established(session) => session,
                _ => return,
            };
            let outcome = match session.read_tls(socket) {
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Outcome::Fine,
                Err(err) => Outcome::Fail(DisconnectReason::from(&err)),
                Ok(0) => Outcome::Eof,
                Ok(_) => match session.process_new_packets() {
                    Err(err) => Outcome::Fail(DisconnectReason::Tls(err.to_string())),
                    Ok(()) => Outcome::Fine,
                },
            };
            // Whatever happened on the wire, hand over the plaintext we already have.
            let _ = session.read_plaintext(&mut plain);
            (outcome, session.wants_write())
        };
        match outcome {
            Outcome::Fine => {
                if !plain.is_empty() {
                    self.announce_connected(reactor);
                    if !self.alive() {
                        return;
                    }
                    let data = &plain[..];
                    self.fire(reactor, "onincoming", |l, r, c| {
                        l.on_incoming(r, c, data, None)
                    });
                    if !self.alive() {
                        return;
                    }
                    self.after_read_pacing(reactor, plain.len(), false);
                } else {
                    self.arm_read_timer(reactor);
                }
                if wants_write {
                    self.update_interest(reactor, None, Some(true));
                }
            }
            Outcome::Eof => {
                if !plain.is_empty() {
                    let reason = DisconnectReason::Closed;
                    let data = &plain[..];
                    self.fire(reactor, "onincoming", |l, r, c| {
                        l.on_incoming(r, c, data, Some(&reason))
                    });
                }
                self.disconnect_and_destroy(reactor, Some(DisconnectReason::Closed));
            }
            Outcome::Fail(reason) => {
                if !plain.is_empty() {
                    let data = &plain[..];
                    let err = reason.clone();
                    self.fire(reactor, "onincoming", |l, r, c| {
                        l.on_incoming(r, c, data, Some(&err))
                    });
                }
                self.disconnect_and_destroy(reactor, Some(reason));
            }
        }
    }

    fn after_read_pacing(&self, reactor: &mut Reactor, bytes: usize, dirty: bool) {
        let cost = {
            let conn = self.0.borrow();
            conn.limit
                .map(|limit| Duration::from_secs_f64(limit * bytes as f64))
        };
        match cost {
            Some(cost) if cost > reactor.config.min_wait => {
                // Throttled: stop reading until the cost is paid off.
                self.pause_for(reactor, cost);
            }
            _ if dirty => {
                // The socket probably has more; yield briefly so other descriptors get a turn.
                let delay = reactor.config.read_retry_delay;
                self.pause_for(reactor, delay);
            }
            _ => {
                self.arm_read_timer(reactor);
            }
        }
    }

    // --------------------------------------------------------------------
    // Write path
    // --------------------------------------------------------------------

    pub(crate) fn on_writable(&self, reactor: &mut Reactor) {
        let (state, first, start_tls) = {
            let mut conn = self.0.borrow_mut();
            if conn.destroyed {
                return;
            }
            let state = match conn.tls {
                TlsState::None => 0,
                TlsState::Handshaking(_) => 1,
                TlsState::Established(_) => 2,
            };
            let first = !conn.connected && conn.outgoing && state == 0;
            let start_tls = first && conn.tls_on_connect;
            if start_tls {
                conn.tls_on_connect = false;
                conn.connected = true;
            }
            (state, first, start_tls)
        };
        if state == 1 {
            return self.tls_step(reactor);
        }
        if start_tls {
            // Direct-TLS dial: the handshake runs first, on_connect waits for it.
            self.update_names();
            self.cancel_write_timer(reactor);
            self.starttls(reactor, None);
            return;
        }
        if first {
            // Connect completed: promote to the established read path.
            self.cancel_write_timer(reactor);
            self.announce_connected(reactor);
            if !self.alive() {
                return;
            }
            self.update_interest(reactor, Some(true), None);
            self.arm_read_timer(reactor);
        }
        match state {
            2 => self.tls_flush(reactor),
            _ => self.plain_flush(reactor),
        }
    }

    fn plain_flush(&self, reactor: &mut Reactor) {
        let (result, buf) = {
            let mut conn = self.0.borrow_mut();
            if conn.destroyed {
                return;
            }
            if conn.write_buffer.is_empty() {
                drop(conn);
                self.update_interest(reactor, None, Some(false));
                return;
            }
            let buf: Vec<u8> = if conn.write_buffer.len() == 1 {
                conn.write_buffer.pop_front().unwrap_or_default()
            } else {
                let total: usize = conn.write_buffer.iter().map(Vec::len).sum();
                let mut merged = Vec::with_capacity(total);
                for chunk in conn.write_buffer.drain(..) {
                    merged.extend_from_slice(&chunk);
                }
                merged
            };
            let result = match conn.socket.as_mut() {
                Some(socket) => socket.write(&buf),
                None => return,
            };
            (result, buf)
        };
        match result {
            Ok(n) if n == buf.len() => {
                self.announce_connected(reactor);
                self.finish_drain(reactor);
            }
            Ok(n) => {
                {
                    let mut conn = self.0.borrow_mut();
                    conn.write_buffer.push_front(buf[n..].to_vec());
                }
                self.announce_connected(reactor);
                if !self.alive() {
                    return;
                }
                self.arm_write_timer(reactor);
                self.update_interest(reactor, None, Some(true));
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                {
                    let mut conn = self.0.borrow_mut();
                    conn.write_buffer.push_front(buf);
                }
                self.update_interest(reactor, None, Some(true));
            }
            Err(err) => {
                self.disconnect_and_destroy(reactor, Some(DisconnectReason::from(&err)));
            }
        }
    }

    fn tls_flush(&self, reactor: &mut Reactor) {
        enum Outcome {
            Fine,
            Fail(DisconnectReason),
        }
        let (outcome, drained) = {
            let mut conn = self.0.borrow_mut();
            if conn.destroyed {
                return;
            }
            let Connection {
                ref mut socket,
                ref mut tls,
                ref mut write_buffer,
                ..
            } = *conn;
            let socket = match socket.as_mut() {
                Some(socket) => socket,
                None => return,
            };
            let session = match tls {
                TlsState::Established(session) => session,
                _ => return,
            };
            // Feed buffered plaintext into the session.
            let mut outcome = Outcome::Fine;
            while let Some(chunk) = write_buffer.front_mut() {
                match session.write_plaintext(chunk) {
                    Ok(n) if n == chunk.len() => {
                        write_buffer.pop_front();
                    }
                    Ok(n) => {
                        chunk.drain(..n);
                        break;
                    }
                    Err(err) => {
                        outcome = Outcome::Fail(DisconnectReason::from(&err));
                        break;
                    }
                }
            }
            // Flush TLS records onto the wire.
            if let Outcome::Fine = outcome {
                while session.wants_write() {
                    match session.write_tls(socket) {
                        Ok(0) => break,
                        Ok(_) => {}
                        Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                        Err(err) => {
                            outcome = Outcome::Fail(DisconnectReason::from(&err));
                            break;
                        }
                    }
                }
            }
            let drained = write_buffer.is_empty() && !session.wants_write();
            (outcome, drained)
        };
        match outcome {
            Outcome::Fail(reason) => {
                self.disconnect_and_destroy(reactor, Some(reason));
            }
            Outcome::Fine if drained => {
                self.announce_connected(reactor);
                self.finish_drain(reactor);
            }
            Outcome::Fine => {
                self.announce_connected(reactor);
                if !self.alive() {
                    return;
                }
                self.arm_write_timer(reactor);
                self.update_interest(reactor, None, Some(true));
            }
        }
    }

    /// Common tail of a fully-drained write buffer.
    fn finish_drain(&self, reactor: &mut Reactor) {
        if !self.alive() {
            return;
        }
        self.cancel_write_timer(reactor);
        self.update_interest(reactor, None, Some(false));
        self.fire(reactor, "ondrain", |l, r, c| l.on_drain(r, c));
        if !self.alive() {
            return;
        }
        let action = self.0.borrow_mut().post_drain.take();
        match action {
            Some(PostDrain::Close) => {
                self.disconnect_and_destroy(reactor, None);
            }
            Some(PostDrain::StartTls(ctx)) => {
                // Re-enters the deferral if on_drain queued more bytes.
                self.starttls(reactor, ctx);
            }
            None => {}
        }
    }

    /// Queue bytes for sending. Returns the number of bytes accepted, which is the full length
    /// unless the connection is closing or gone.
    pub fn write(&self, reactor: &mut Reactor, data: &[u8]) -> usize {
        let opportunistic = {
            let mut conn = self.0.borrow_mut();
            if conn.destroyed || conn.closing {
                return 0;
            }
            conn.write_buffer.push_back(data.to_vec());
            if conn.write_lock {
                return data.len();
            }
            let handshaking = match conn.tls {
                TlsState::Handshaking(_) => true,
                _ => false,
            };
            let opportunistic = reactor.config.opportunistic_writes
                && !conn.in_opportunistic_write
                && conn.connected
                && !handshaking;
            if opportunistic {
                conn.in_opportunistic_write = true;
            }
            opportunistic
        };
        if opportunistic {
            self.on_writable(reactor);
            self.0.borrow_mut().in_opportunistic_write = false;
            return data.len();
        }
        self.arm_write_timer(reactor);
        self.update_interest(reactor, None, Some(true));
        data.len()
    }

    // --------------------------------------------------------------------
    // STARTTLS
    // --------------------------------------------------------------------

    /// Upgrade to TLS, deferring until the write buffer drains.
    pub fn starttls(&self, reactor: &mut Reactor, ctx: Option<TlsConfig>) {
        let defer = {
            let mut conn = self.0.borrow_mut();
            if conn.destroyed {
                return;
            }
            if !conn.write_buffer.is_empty() {
                conn.post_drain = Some(PostDrain::StartTls(ctx.clone()));
                true
            } else {
                false
            }
        };
        if defer {
            self.arm_write_timer(reactor);
            self.update_interest(reactor, None, Some(true));
            return;
        }
        self.starttls_now(reactor, ctx);
    }

    fn starttls_now(&self, reactor: &mut Reactor, ctx: Option<TlsConfig>) {
        self.fire(reactor, "onstarttls", |l, r, c| l.on_starttls(r, c));
        if !self.alive() {
            return;
        }
        let session = {
            let conn = self.0.borrow();
            let config = ctx
                .or_else(|| conn.tls_ctx.clone())
                .or_else(|| {
                    conn.server
                        .upgrade()
                        .and_then(|server| server.borrow().tls_ctx.clone())
                });
            match config {
                None => Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "no TLS context available",
                )),
                Some(TlsConfig::Server(default_config)) => {
                    // An explicit servername picks a per-name context off the listener.
                    let chosen = conn
                        .servername
                        .as_ref()
                        .and_then(|name| {
                            conn.server.upgrade().and_then(|server| {
                                server.borrow().sni_hosts.get(name).cloned()
                            })
                        })
                        .unwrap_or(default_config);
                    Ok(TlsSession::new_server(&chosen))
                }
                Some(TlsConfig::Client(config)) => match conn.servername.as_ref() {
                    Some(name) => TlsSession::new_client(&config, name),
                    None => Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "client TLS requires a servername",
                    )),
                },
            }
        };
        match session {
            Err(err) => {
                error!(self.logger(), "cannot start TLS: {}", err);
                self.disconnect_and_destroy(reactor, Some(DisconnectReason::Tls(err.to_string())));
            }
            Ok(session) => {
                self.0.borrow_mut().tls = TlsState::Handshaking(session);
                self.update_interest(reactor, Some(true), Some(true));
                self.arm_read_timer(reactor);
                self.arm_write_timer(reactor);
                // Client sessions already have a hello queued; get it moving.
                self.tls_step(reactor);
            }
        }
    }

    /// Drive a pending handshake from whichever readiness event fired.
    fn tls_step(&self, reactor: &mut Reactor) {
        enum Outcome {
            Done,
            Continue(bool, bool),
            Eof,
            Fail(DisconnectReason),
        }
        let outcome = {
            let mut conn = self.0.borrow_mut();
            if conn.destroyed {
                return;
            }
            let Connection {
                ref mut socket,
                ref mut tls,
                ..
            } = *conn;
            let socket = match socket.as_mut() {
                Some(socket) => socket,
                None => return,
            };
            let session = match tls {
                TlsState::Handshaking(session) => session,
                _ => return,
            };
            let mut failure = None;
            if session.wants_read() {
                match session.read_tls(socket) {
                    Ok(0) => failure = Some(Outcome::Eof),
                    Ok(_) => {
                        if let Err(err) = session.process_new_packets() {
                            failure =
                                Some(Outcome::Fail(DisconnectReason::Tls(err.to_string())));
                        }
                    }
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
                    Err(err) => failure = Some(Outcome::Fail(DisconnectReason::from(&err))),
                }
            }
            if failure.is_none() {
                while session.wants_write() {
                    match session.write_tls(socket) {
                        Ok(0) => break,
                        Ok(_) => {}
                        Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                        Err(err) => {
                            failure = Some(Outcome::Fail(DisconnectReason::from(&err)));
                            break;
                        }
                    }
                }
            }
            match failure {
                Some(outcome) => outcome,
                None => {
                    if session.is_handshaking() {
                        Outcome::Continue(session.wants_read(), session.wants_write())
                    } else {
                        Outcome::Done
                    }
                }
            }
        };
        match outcome {
            Outcome::Continue(read, write) => {
                self.update_interest(reactor, Some(read), Some(write));
            }
            Outcome::Done => self.handshake_complete(reactor),
            Outcome::Eof => {
                self.disconnect_and_destroy(reactor, Some(DisconnectReason::Closed));
            }
            Outcome::Fail(reason) => {
                self.disconnect_and_destroy(reactor, Some(reason));
            }
        }
    }

    fn handshake_complete(&self, reactor: &mut Reactor) {
        {
            let mut conn = self.0.borrow_mut();
            let tls = std::mem::replace(&mut conn.tls, TlsState::None);
            if let TlsState::Handshaking(session) = tls {
                if conn.servername.is_none() {
                    conn.servername = session.sni_hostname();
                }
                conn.tls = TlsState::Established(session);
            } else {
                conn.tls = tls;
                return;
            }
        }
        debug!(self.logger(), "TLS handshake complete");
        self.cancel_read_timer(reactor);
        self.cancel_write_timer(reactor);
        self.update_names();
        self.fire(reactor, "onstatus", |l, r, c| {
            l.on_status(r, c, "ssl-handshake-complete")
        });
        if !self.alive() {
            return;
        }
        self.announce_connected(reactor);
        if !self.alive() {
            return;
        }
        let write_pending = {
            let conn = self.0.borrow();
            let wants_write = match conn.tls {
                TlsState::Established(ref session) => session.wants_write(),
                _ => false,
            };
            wants_write || !conn.write_buffer.is_empty()
        };
        self.update_interest(reactor, Some(true), Some(write_pending));
        self.arm_read_timer(reactor);
        if write_pending {
            self.arm_write_timer(reactor);
        }
        // Plaintext may have ridden in with the final handshake flight.
        self.on_readable(reactor);
    }

    // --------------------------------------------------------------------
    // Close and destroy
    // --------------------------------------------------------------------

    /// Graceful close: drain the write buffer, then tear down. Further writes are discarded.
    pub fn close(&self, reactor: &mut Reactor) {
        let drain = {
            let mut conn = self.0.borrow_mut();
            if conn.destroyed || conn.closing {
                return;
            }
            conn.closing = true;
            if conn.write_buffer.is_empty() {
                false
            } else {
                debug!(
                    conn.logger,
                    "closing with {} buffered chunk(s) to drain",
                    conn.write_buffer.len()
                );
                conn.post_drain = Some(PostDrain::Close);
                true
            }
        };
        if drain {
            self.arm_write_timer(reactor);
            self.update_interest(reactor, None, Some(true));
        } else {
            self.disconnect_and_destroy(reactor, None);
        }
    }

    pub(crate) fn disconnect_and_destroy(
        &self,
        reactor: &mut Reactor,
        reason: Option<DisconnectReason>,
    ) {
        if !self.alive() {
            return;
        }
        match reason.as_ref() {
            Some(reason) => debug!(self.logger(), "disconnected: {}", reason),
            None => debug!(self.logger(), "disconnected"),
        }
        self.fire(reactor, "ondisconnect", |l, r, c| {
            l.on_disconnect(r, c, reason.as_ref())
        });
        self.destroy(reactor);
    }

    /// Immediate teardown: deregister, cancel timers, close the socket. Idempotent; the handle
    /// stays valid but every method on it becomes a no-op.
    pub fn destroy(&self, reactor: &mut Reactor) {
        let (fd, mut socket, tls, timers) = {
            let mut conn = self.0.borrow_mut();
            if conn.destroyed {
                return;
            }
            conn.destroyed = true;
            conn.closing = true;
            let fd = conn.fd;
            conn.fd = -1;
            conn.want_read = false;
            conn.want_write = false;
            conn.write_buffer.clear();
            let tls = std::mem::replace(&mut conn.tls, TlsState::None);
            conn.limit = None;
            let timers = [
                conn.read_timeout_id.take(),
                conn.write_timeout_id.take(),
                conn.pause_timer_id.take(),
            ];
            (fd, conn.socket.take(), tls, timers)
        };
        // Tell the peer an established TLS session is over before the descriptor closes;
        // best effort, the socket may already be unusable.
        if let TlsState::Established(mut session) = tls {
            if let Some(socket) = socket.as_mut() {
                session.send_close_notify();
                while session.wants_write() {
                    match session.write_tls(socket) {
                        Ok(0) => break,
                        Ok(_) => {}
                        Err(_) => break,
                    }
                }
            }
        }
        for id in timers.iter().flatten() {
            reactor.stop_timer(*id);
        }
        if fd >= 0 {
            if let Err(err) = reactor.poller.del(fd) {
                error!(self.logger(), "cannot deregister fd {}: {}", fd, err);
            }
            reactor.remove_entry(fd);
        }
        self.fire(reactor, "ondetach", |l, r, c| l.on_detach(r, c));
        // Dropping the socket closes the descriptor.
        drop(socket);
    }
}
