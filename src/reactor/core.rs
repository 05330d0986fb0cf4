// This file is part of cfxmpp.
// Copyright (c) 2019, Cloudflare. All rights reserved.
// See LICENSE for licensing information.

//! The reactor proper: descriptor map, timer scheduler and the event loop.
//!
//! Single-threaded and cooperative. The only suspension point is the poller wait; every
//! callback runs to completion before the next dispatch, and the poll budget is derived from
//! the earliest pending timer deadline.

use lazy_static::lazy_static;
use prometheus::{opts, register_counter, register_int_counter, IntCounter};

use slog::{debug, error, info, o};

use std::cell::RefCell;
use std::cmp;
use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use mio::net::{TcpListener, TcpStream};

use crate::cfsock;

use super::conn::{generate_id, Conn, ConnArgs, ListenerRef, WeakConn};
use super::config::Config;
use super::interface::{HandlerResult, SessionListener};
use super::poller::{Poller, Wait};
use super::server::{Server, ServerHandle};
use super::timer::{to_absolute_time, TimerHeap, TimerId};
use super::tls::TlsConfig;

lazy_static! {
    pub(crate) static ref ACCEPT_COUNTER: IntCounter = register_int_counter!(
        "reactor_accepted_connections_total",
        "Number of accepted connections"
    )
    .unwrap();
    pub(crate) static ref TIMEOUT_COUNTER: IntCounter = register_int_counter!(
        "reactor_timeouts_total",
        "Number of connections dropped by a timer"
    )
    .unwrap();
    pub(crate) static ref LISTENER_ERROR_COUNTER: IntCounter = register_int_counter!(
        "reactor_listener_errors_total",
        "Number of failed listener callbacks"
    )
    .unwrap();
}

/// Callback payload stored in the timer heap. A returned duration re-arms the timer under the
/// same id.
pub(crate) type TimerCallback =
    Box<dyn FnMut(&mut Reactor, SystemTime, TimerId) -> Option<Duration>>;

/// Handler attached to a watched foreign descriptor.
pub type WatchCallback = Box<dyn FnMut(&mut Reactor, RawFd)>;

/// Why the loop stopped.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Quit {
    /// The quit flag was raised and the last descriptor went away.
    Quitting,
    /// Single-iteration mode ran its one iteration.
    Once,
}

/// A listener callback failed while `protect_listeners` was off.
#[derive(Debug)]
pub struct ListenerError {
    pub callback: &'static str,
    pub error: Box<dyn Error>,
}

impl fmt::Display for ListenerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener {} failed: {}", self.callback, self.error)
    }
}

impl Error for ListenerError {}

/// Options for `listen` and `wrapserver`.
#[derive(Default)]
pub struct ListenConfig {
    /// Receive cap inherited by accepted connections; the config default applies otherwise.
    pub read_size: Option<usize>,
    /// TLS context accepted connections inherit (for direct TLS or a later STARTTLS).
    pub tls_ctx: Option<TlsConfig>,
    /// Begin the TLS handshake immediately on accept.
    pub tls_direct: bool,
    /// Per-SNI-name server contexts for name-based virtual hosting.
    pub sni_hosts: HashMap<String, Arc<rustls::ServerConfig>>,
}

pub(crate) struct Watch {
    fd: RawFd,
    pub(crate) want_read: bool,
    pub(crate) want_write: bool,
    on_readable: Option<WatchCallback>,
    on_writable: Option<WatchCallback>,
    destroyed: bool,
}

/// Handle to a watched foreign descriptor. The descriptor itself stays owned by the caller;
/// closing here only deregisters it.
#[derive(Clone)]
pub struct WatchHandle(Rc<RefCell<Watch>>);

impl WatchHandle {
    pub fn fd(&self) -> RawFd {
        self.0.borrow().fd
    }

    pub fn alive(&self) -> bool {
        !self.0.borrow().destroyed
    }

    pub fn set_interest(&self, reactor: &mut Reactor, read: bool, write: bool) {
        let fd = {
            let mut watch = self.0.borrow_mut();
            if watch.destroyed {
                return;
            }
            watch.want_read = read;
            watch.want_write = write;
            watch.fd
        };
        let _ = reactor.poller.modify(fd, read, write);
    }

    pub fn close(&self, reactor: &mut Reactor) {
        let fd = {
            let mut watch = self.0.borrow_mut();
            if watch.destroyed {
                return;
            }
            watch.destroyed = true;
            watch.fd
        };
        let _ = reactor.poller.del(fd);
        reactor.remove_entry(fd);
    }

    fn same(&self, other: &WatchHandle) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    fn dispatch_readable(&self, reactor: &mut Reactor) {
        let taken = {
            let mut watch = self.0.borrow_mut();
            if watch.destroyed {
                return;
            }
            watch.on_readable.take()
        };
        if let Some(mut callback) = taken {
            callback(reactor, self.fd());
            let mut watch = self.0.borrow_mut();
            if watch.on_readable.is_none() {
                watch.on_readable = Some(callback);
            }
        }
    }

    fn dispatch_writable(&self, reactor: &mut Reactor) {
        let taken = {
            let mut watch = self.0.borrow_mut();
            if watch.destroyed {
                return;
            }
            watch.on_writable.take()
        };
        if let Some(mut callback) = taken {
            callback(reactor, self.fd());
            let mut watch = self.0.borrow_mut();
            if watch.on_writable.is_none() {
                watch.on_writable = Some(callback);
            }
        }
    }
}

#[derive(Clone)]
pub(crate) enum Entry {
    Client(Conn),
    Listen(ServerHandle),
    Watch(WatchHandle),
}

pub struct Reactor {
    pub config: Config,
    pub(crate) poller: Poller,
    entries: HashMap<RawFd, Entry>,
    timers: TimerHeap<TimerCallback>,
    // Ids stopped while their re-arm was staged inside `run_expired`.
    stopped_while_staged: HashSet<TimerId>,
    quitting: bool,
    fatal: Option<ListenerError>,
    logger: slog::Logger,
}

impl Reactor {
    pub fn new(logger: slog::Logger) -> io::Result<Reactor> {
        Ok(Reactor {
            config: Config::default(),
            poller: Poller::new()?,
            entries: HashMap::new(),
            timers: TimerHeap::new(),
            stopped_while_staged: HashSet::new(),
            quitting: false,
            fatal: None,
            logger,
        })
    }

    pub fn set_config(&mut self, config: Config) {
        self.config = config;
    }

    pub fn logger(&self) -> &slog::Logger {
        &self.logger
    }

    pub(crate) fn remove_entry(&mut self, fd: RawFd) {
        self.entries.remove(&fd);
    }

    pub(crate) fn record_fatal(&mut self, callback: &'static str, error: Box<dyn Error>) {
        if self.fatal.is_none() {
            self.fatal = Some(ListenerError { callback, error });
        }
    }

    // --------------------------------------------------------------------
    // Timers
    // --------------------------------------------------------------------

    /// Schedule `callback` to run after `delay`. Returning a duration from the callback re-arms
    /// it under the same id; the re-arm never fires in the tick that scheduled it.
    pub fn add_task<F>(&mut self, delay: Duration, callback: F) -> TimerId
    where
        F: FnMut(&mut Reactor, SystemTime, TimerId) -> Option<Duration> + 'static,
    {
        self.timers.insert(to_absolute_time(delay), Box::new(callback))
    }

    /// Cancel a timer. Also reliably cancels a re-arm staged in the current tick.
    pub fn stop_timer(&mut self, id: TimerId) -> bool {
        if self.timers.remove(id).is_some() {
            true
        } else {
            self.stopped_while_staged.insert(id);
            false
        }
    }

    /// Move a pending timer to a new deadline relative to now.
    pub fn reschedule_timer(&mut self, id: TimerId, delay: Duration) -> bool {
        self.timers.reschedule(id, to_absolute_time(delay))
    }

    /// Run every expired timer once and return the next poll budget.
    fn run_expired(&mut self) -> Duration {
        let now = Instant::now();
        let wall = SystemTime::now();
        let mut staged: Vec<(TimerId, Instant, TimerCallback)> = Vec::new();
        loop {
            match self.timers.peek() {
                Some((_, deadline)) if deadline <= now => {}
                _ => break,
            }
            let (id, _, mut callback) = match self.timers.pop() {
                Some(entry) => entry,
                None => break,
            };
            if let Some(delay) = callback(self, wall, id) {
                staged.push((id, now + delay, callback));
            }
        }
        // Deferred re-insertion: a timer returning a delay must not fire again this tick, even
        // when its new deadline has already elapsed.
        for (id, deadline, callback) in staged {
            if self.stopped_while_staged.remove(&id) {
                continue;
            }
            self.timers.insert_existing(id, deadline, callback);
        }
        self.stopped_while_staged.clear();
        match self.timers.peek() {
            Some((_, deadline)) => {
                let remaining = if deadline > now {
                    deadline - now
                } else {
                    Duration::from_secs(0)
                };
                cmp::max(self.config.min_wait, remaining)
            }
            None => self.config.max_wait,
        }
    }

    // --------------------------------------------------------------------
    // Event loop
    // --------------------------------------------------------------------

    /// One loop iteration: run expired timers, wait for one readiness event, dispatch it.
    pub fn step(&mut self) -> Result<(), ListenerError> {
        let budget = self.run_expired();
        match self.poller.wait(budget) {
            Ok(Wait::Ready {
                fd,
                readable,
                writable,
            }) => self.dispatch(fd, readable, writable),
            Ok(Wait::Timeout) | Ok(Wait::Signal) => {}
            Err(err) => {
                error!(self.logger, "poller wait failed: {}", err);
            }
        }
        match self.fatal.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// The loop's "once" mode: a single iteration.
    pub fn run_once(&mut self) -> Result<Quit, ListenerError> {
        self.step()?;
        Ok(Quit::Once)
    }

    /// Run until `set_quitting(true)` has been called and every descriptor is gone.
    pub fn run(&mut self) -> Result<Quit, ListenerError> {
        loop {
            self.step()?;
            if self.quitting && self.entries.is_empty() {
                return Ok(Quit::Quitting);
            }
        }
    }

    fn dispatch(&mut self, fd: RawFd, readable: bool, writable: bool) {
        let entry = match self.entries.get(&fd) {
            Some(entry) => entry.clone(),
            None => {
                // A stale event for a descriptor we no longer track.
                let _ = self.poller.del(fd);
                return;
            }
        };
        match entry {
            Entry::Client(conn) => {
                if readable {
                    conn.on_readable(self);
                }
                if writable {
                    // The read handler may have destroyed or replaced this descriptor.
                    let still_live = match self.entries.get(&fd) {
                        Some(Entry::Client(current)) => current.same(&conn),
                        _ => false,
                    };
                    if still_live {
                        conn.on_writable(self);
                    }
                }
            }
            Entry::Listen(server) => {
                if readable {
                    server.on_acceptable(self);
                }
            }
            Entry::Watch(watch) => {
                if readable {
                    watch.dispatch_readable(self);
                }
                if writable {
                    let still_live = match self.entries.get(&fd) {
                        Some(Entry::Watch(current)) => current.same(&watch),
                        _ => false,
                    };
                    if still_live {
                        watch.dispatch_writable(self);
                    }
                }
            }
        }
    }

    // --------------------------------------------------------------------
    // Factories
    // --------------------------------------------------------------------

    /// Bind `addr` and start accepting connections for `listeners`.
    pub fn listen(
        &mut self,
        addr: &SocketAddr,
        listeners: ListenerRef,
        options: ListenConfig,
    ) -> io::Result<ServerHandle> {
        let std_listener = cfsock::tcp_listener(addr, self.config.tcp_backlog)?;
        self.install_listener(std_listener, listeners, options)
    }

    /// Wrap an already-bound listening socket.
    pub fn wrapserver(
        &mut self,
        listener: std::net::TcpListener,
        listeners: ListenerRef,
        options: ListenConfig,
    ) -> io::Result<ServerHandle> {
        self.install_listener(listener, listeners, options)
    }

    fn install_listener(
        &mut self,
        listener: std::net::TcpListener,
        listeners: ListenerRef,
        options: ListenConfig,
    ) -> io::Result<ServerHandle> {
        listener.set_nonblocking(true)?;
        let socket = TcpListener::from_std(listener)?;
        let local = socket.local_addr()?;
        let fd = socket.as_raw_fd();
        let id = generate_id();
        let logger = self
            .logger
            .new(o!("server" => id.clone(), "addr" => local.to_string()));
        self.poller.add(fd, true, false)?;
        let handle = ServerHandle(Rc::new(RefCell::new(Server {
            id,
            fd,
            logger: logger.clone(),
            socket: Some(socket),
            local,
            listeners,
            read_size: options.read_size.unwrap_or(self.config.read_size),
            tls_ctx: options.tls_ctx,
            tls_direct: options.tls_direct,
            sni_hosts: options.sni_hosts,
            want_read: true,
            want_write: false,
            pause_timer_id: None,
            destroyed: false,
        })));
        self.entries.insert(fd, Entry::Listen(handle.clone()));
        info!(logger, "listening on {}", local);
        Ok(handle)
    }

    /// Start a nonblocking connect to `addr:port`. The address family follows from the address
    /// literal. A TLS context arms a handshake that starts as soon as the connect completes.
    pub fn addclient(
        &mut self,
        addr: &str,
        port: u16,
        listeners: ListenerRef,
        read_size: Option<usize>,
        tls_ctx: Option<TlsConfig>,
        servername: Option<String>,
    ) -> io::Result<Conn> {
        let ip: std::net::IpAddr = addr.parse().map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cannot parse address {:?}", addr),
            )
        })?;
        let target = SocketAddr::new(ip, port);
        let socket = TcpStream::connect(&target)?;
        let tls_on_connect = tls_ctx.is_some();
        let conn = self.register_stream(ConnArgs {
            socket,
            listeners,
            read_size: read_size.unwrap_or(self.config.read_size),
            tls_ctx,
            tls_on_connect,
            server: Weak::new(),
            servername,
            outgoing: true,
            peer: Some(target),
            want_read: false,
            want_write: true,
        })?;
        debug!(self.logger, "connecting to {}", target; "conn" => conn.id());
        conn.start_connect_timer(self);
        Ok(conn)
    }

    /// Wrap an already-connected socket as a client connection.
    pub fn wrapclient(
        &mut self,
        socket: std::net::TcpStream,
        listeners: ListenerRef,
        read_size: Option<usize>,
        tls_ctx: Option<TlsConfig>,
        servername: Option<String>,
    ) -> io::Result<Conn> {
        socket.set_nonblocking(true)?;
        let peer = socket.peer_addr().ok();
        let socket = TcpStream::from_stream(socket)?;
        let with_tls = tls_ctx.is_some();
        let conn = self.register_stream(ConnArgs {
            socket,
            listeners,
            read_size: read_size.unwrap_or(self.config.read_size),
            tls_ctx,
            tls_on_connect: false,
            server: Weak::new(),
            servername,
            outgoing: false,
            peer,
            want_read: true,
            want_write: false,
        })?;
        conn.announce_connected(self);
        if with_tls && conn.alive() {
            conn.starttls(self, None);
        }
        Ok(conn)
    }

    /// Register an accepted socket; used by the listener object.
    pub(crate) fn wrap_incoming(
        &mut self,
        socket: TcpStream,
        peer: SocketAddr,
        listeners: ListenerRef,
        read_size: usize,
        tls_ctx: Option<TlsConfig>,
        server: Weak<RefCell<Server>>,
    ) -> io::Result<Conn> {
        self.register_stream(ConnArgs {
            socket,
            listeners,
            read_size,
            tls_ctx,
            tls_on_connect: false,
            server,
            servername: None,
            outgoing: false,
            peer: Some(peer),
            want_read: true,
            want_write: false,
        })
    }

    fn register_stream(&mut self, args: ConnArgs) -> io::Result<Conn> {
        let fd = args.socket.as_raw_fd();
        let id = generate_id();
        let logger = self.logger.new(o!("conn" => id.clone()));
        let interest = (args.want_read, args.want_write);
        self.poller.add(fd, interest.0, interest.1)?;
        let conn = Conn::assemble(id, logger, args);
        self.entries.insert(fd, Entry::Client(conn.clone()));
        conn.fire(self, "onattach", |l, r, c| l.on_attach(r, c));
        Ok(conn)
    }

    /// Watch a descriptor the reactor does not own. Interest follows from which handlers are
    /// given; closing the handle deregisters without closing the descriptor.
    pub fn watchfd(
        &mut self,
        fd: RawFd,
        on_readable: Option<WatchCallback>,
        on_writable: Option<WatchCallback>,
    ) -> io::Result<WatchHandle> {
        let want_read = on_readable.is_some();
        let want_write = on_writable.is_some();
        self.poller.add(fd, want_read, want_write)?;
        let handle = WatchHandle(Rc::new(RefCell::new(Watch {
            fd,
            want_read,
            want_write,
            on_readable,
            on_writable,
            destroyed: false,
        })));
        self.entries.insert(fd, Entry::Watch(handle.clone()));
        Ok(handle)
    }

    /// Pump bytes from `from` into `to` under flow control: incoming data pauses `from` until
    /// `to` has drained it.
    pub fn link(&mut self, from: &Conn, to: &Conn, read_size: Option<usize>) {
        if let Some(size) = read_size {
            from.set_read_size(size);
        }
        let source_inner = from.raw_listeners();
        let sink_inner = to.raw_listeners();
        from.set_listener(
            self,
            Rc::new(Linked {
                role: LinkRole::Source,
                peer: to.downgrade(),
                inner: source_inner,
            }),
        );
        to.set_listener(
            self,
            Rc::new(Linked {
                role: LinkRole::Sink,
                peer: from.downgrade(),
                inner: sink_inner,
            }),
        );
    }

    /// Adjust the interest bits of a watched descriptor by fd; used by the compat layer.
    pub(crate) fn watch_interest(&mut self, fd: RawFd, read: bool, write: bool) {
        if let Some(Entry::Watch(watch)) = self.entries.get(&fd).cloned() {
            watch.set_interest(self, read, write);
        }
    }

    // --------------------------------------------------------------------
    // Shutdown
    // --------------------------------------------------------------------

    /// Gracefully close every connection, listener and watch.
    pub fn closeall(&mut self) {
        let entries: Vec<Entry> = self.entries.values().cloned().collect();
        for entry in entries {
            match entry {
                Entry::Client(conn) => conn.close(self),
                Entry::Listen(server) => server.close(self),
                Entry::Watch(watch) => watch.close(self),
            }
        }
    }

    /// Raise or clear the cooperative quit flag. Raising it closes everything; `run` returns
    /// once the last descriptor drains and goes away.
    pub fn set_quitting(&mut self, quitting: bool) {
        self.quitting = quitting;
        if quitting {
            info!(self.logger, "quitting; closing all connections");
            self.closeall();
        }
    }
}

enum LinkRole {
    Source,
    Sink,
}

/// Listener overlay installed by `link`. The source's `on_incoming` and the sink's `on_drain`
/// are replaced; everything else falls through to the original record.
struct Linked {
    role: LinkRole,
    peer: WeakConn,
    inner: ListenerRef,
}

impl SessionListener for Linked {
    fn on_attach(&self, r: &mut Reactor, c: &Conn) -> HandlerResult {
        self.inner.on_attach(r, c)
    }

    fn on_detach(&self, r: &mut Reactor, c: &Conn) -> HandlerResult {
        self.inner.on_detach(r, c)
    }

    fn on_connect(&self, r: &mut Reactor, c: &Conn) -> HandlerResult {
        self.inner.on_connect(r, c)
    }

    fn on_incoming(
        &self,
        r: &mut Reactor,
        c: &Conn,
        data: &[u8],
        err: Option<&super::interface::DisconnectReason>,
    ) -> HandlerResult {
        match self.role {
            LinkRole::Source => {
                c.pause(r);
                if let Some(peer) = self.peer.upgrade() {
                    peer.write(r, data);
                }
                Ok(())
            }
            LinkRole::Sink => self.inner.on_incoming(r, c, data, err),
        }
    }

    fn on_drain(&self, r: &mut Reactor, c: &Conn) -> HandlerResult {
        match self.role {
            LinkRole::Sink => {
                if let Some(peer) = self.peer.upgrade() {
                    peer.resume(r);
                }
                Ok(())
            }
            LinkRole::Source => self.inner.on_drain(r, c),
        }
    }

    fn on_disconnect(
        &self,
        r: &mut Reactor,
        c: &Conn,
        reason: Option<&super::interface::DisconnectReason>,
    ) -> HandlerResult {
        self.inner.on_disconnect(r, c, reason)
    }

    fn on_read_timeout(&self, r: &mut Reactor, c: &Conn) -> Result<bool, Box<dyn Error>> {
        self.inner.on_read_timeout(r, c)
    }

    fn on_starttls(&self, r: &mut Reactor, c: &Conn) -> HandlerResult {
        self.inner.on_starttls(r, c)
    }

    fn on_status(&self, r: &mut Reactor, c: &Conn, status: &str) -> HandlerResult {
        self.inner.on_status(r, c, status)
    }

    fn on_error(&self, r: &mut Reactor, c: &Conn, err: &dyn Error) {
        self.inner.on_error(r, c, err)
    }
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

    fn test_reactor() -> Reactor {
        let logger = NullLoggerBuilder.build().unwrap();
        let mut reactor = Reactor::new(logger).unwrap();
        let mut config = Config::default();
        // Keep worst-case blocking short; the loopback tests are driven by events.
        config.max_wait = Duration::from_millis(50);
        config.read_timeout = Duration::from_secs(5);
        config.send_timeout = Duration::from_secs(5);
        config.connect_timeout = Duration::from_secs(5);
        reactor.set_config(config);
        reactor
    }

    /// Step the loop until `done` holds or the step budget runs out.
    fn drive<F>(reactor: &mut Reactor, steps: usize, mut done: F) -> bool
    where
        F: FnMut() -> bool,
    {
        for _ in 0..steps {
            if done() {
                return true;
            }
            reactor.step().unwrap();
        }
        done()
    }

    /// Records everything that happens on one side of a connection.
    #[derive(Default)]
    struct Recorder {
        echo: Cell<bool>,
        conn: RefCell<Option<Conn>>,
        incoming: RefCell<Vec<u8>>,
        events: RefCell<Vec<String>>,
        connects: Cell<usize>,
        read_timeouts: Cell<usize>,
        keep_alive_on_timeout: Cell<bool>,
    }

    impl Recorder {
        fn saw(&self, event: &str) -> bool {
            self.events.borrow().iter().any(|e| e == event)
        }
    }

    impl SessionListener for Recorder {
        fn on_attach(&self, _reactor: &mut Reactor, conn: &Conn) -> HandlerResult {
            *self.conn.borrow_mut() = Some(conn.clone());
            Ok(())
        }

        fn on_connect(&self, _reactor: &mut Reactor, _conn: &Conn) -> HandlerResult {
            self.connects.set(self.connects.get() + 1);
            self.events.borrow_mut().push(String::from("connect"));
            Ok(())
        }

        fn on_incoming(
            &self,
            reactor: &mut Reactor,
            conn: &Conn,
            data: &[u8],
            _err: Option<&super::super::interface::DisconnectReason>,
        ) -> HandlerResult {
            self.incoming.borrow_mut().extend_from_slice(data);
            if self.echo.get() {
                conn.write(reactor, data);
            }
            Ok(())
        }

        fn on_drain(&self, _reactor: &mut Reactor, _conn: &Conn) -> HandlerResult {
            self.events.borrow_mut().push(String::from("drain"));
            Ok(())
        }

        fn on_disconnect(
            &self,
            _reactor: &mut Reactor,
            _conn: &Conn,
            reason: Option<&super::super::interface::DisconnectReason>,
        ) -> HandlerResult {
            let tag = match reason {
                Some(reason) => format!("disconnect:{}", reason),
                None => String::from("disconnect:-"),
            };
            self.events.borrow_mut().push(tag);
            Ok(())
        }

        fn on_read_timeout(
            &self,
            _reactor: &mut Reactor,
            _conn: &Conn,
        ) -> Result<bool, Box<dyn Error>> {
            self.read_timeouts.set(self.read_timeouts.get() + 1);
            Ok(self.keep_alive_on_timeout.get())
        }
    }

    fn echo_pair(reactor: &mut Reactor) -> (Rc<Recorder>, Rc<Recorder>, Conn, ServerHandle) {
        let server_rec = Rc::new(Recorder::default());
        server_rec.echo.set(true);
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = reactor
            .listen(&addr, server_rec.clone(), ListenConfig::default())
            .unwrap();
        let port = server.local_addr().port();
        let client_rec = Rc::new(Recorder::default());
        let conn = reactor
            .addclient("127.0.0.1", port, client_rec.clone(), None, None, None)
            .unwrap();
        (server_rec, client_rec, conn, server)
    }

    #[test]
    fn test_echo_roundtrip() {
        let mut reactor = test_reactor();
        let (server_rec, client_rec, conn, _server) = echo_pair(&mut reactor);

        conn.write(&mut reactor, b"hello\n");
        assert!(drive(&mut reactor, 400, || {
            client_rec.incoming.borrow().as_slice() == b"hello\n"
        }));
        assert_eq!(server_rec.incoming.borrow().as_slice(), b"hello\n");
        assert_eq!(client_rec.connects.get(), 1);
        assert_eq!(server_rec.connects.get(), 1);

        conn.close(&mut reactor);
        assert!(drive(&mut reactor, 400, || server_rec.saw("disconnect:closed")));
        assert!(client_rec.saw("disconnect:-"));
        assert!(!conn.alive());
        // on_connect stayed exactly-once through the whole lifecycle.
        assert_eq!(client_rec.connects.get(), 1);
        assert_eq!(server_rec.connects.get(), 1);
    }

    #[test]
    fn test_read_timeout_keep_then_drop() {
        let mut reactor = test_reactor();
        let mut config = reactor.config.clone();
        config.read_timeout = Duration::from_millis(80);
        reactor.set_config(config);

        let (server_rec, client_rec, conn, _server) = echo_pair(&mut reactor);
        // Keep the server side alive too, so the client's own timer is what fires rather
        // than a FIN from a server-side timeout.
        server_rec.keep_alive_on_timeout.set(true);
        client_rec.keep_alive_on_timeout.set(true);

        // Nobody sends anything; the idle deadline fires and the listener keeps the
        // connection, so it fires again.
        assert!(drive(&mut reactor, 400, || client_rec.read_timeouts.get() >= 2));
        assert!(conn.alive());

        client_rec.keep_alive_on_timeout.set(false);
        assert!(drive(&mut reactor, 400, || {
            client_rec.saw("disconnect:read timeout")
        }));
        assert!(!conn.alive());
    }

    #[test]
    fn test_close_drains_buffer_first() {
        let mut reactor = test_reactor();
        let server_rec = Rc::new(Recorder::default());
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = reactor
            .listen(&addr, server_rec.clone(), ListenConfig::default())
            .unwrap();
        let port = server.local_addr().port();
        let client_rec = Rc::new(Recorder::default());
        let conn = reactor
            .addclient("127.0.0.1", port, client_rec.clone(), None, None, None)
            .unwrap();

        let payload = vec![b'x'; 1 << 20];
        assert_eq!(conn.write(&mut reactor, &payload), payload.len());
        conn.close(&mut reactor);
        // Writes after close are discarded.
        assert_eq!(conn.write(&mut reactor, b"more"), 0);

        assert!(drive(&mut reactor, 2000, || {
            server_rec.incoming.borrow().len() == payload.len()
        }));
        assert!(drive(&mut reactor, 400, || client_rec.saw("disconnect:-")));

        let events = client_rec.events.borrow();
        let drain = events.iter().position(|e| e == "drain").unwrap();
        let disconnect = events.iter().position(|e| e == "disconnect:-").unwrap();
        assert!(drain < disconnect);
    }

    #[test]
    fn test_shutdown_returns_quitting() {
        let mut reactor = test_reactor();
        let (server_rec, client_rec, _conn, _server) = echo_pair(&mut reactor);
        assert!(drive(&mut reactor, 400, || {
            server_rec.conn.borrow().is_some() && client_rec.connects.get() == 1
        }));

        reactor.set_quitting(true);
        assert_eq!(reactor.run().unwrap(), Quit::Quitting);
    }

    #[test]
    fn test_run_once() {
        let mut reactor = test_reactor();
        assert_eq!(reactor.run_once().unwrap(), Quit::Once);
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let mut reactor = test_reactor();
        let (_server_rec, client_rec, conn, _server) = echo_pair(&mut reactor);
        assert!(drive(&mut reactor, 400, || client_rec.connects.get() == 1));

        conn.destroy(&mut reactor);
        assert!(!conn.alive());
        let events_after_first = client_rec.events.borrow().len();

        conn.destroy(&mut reactor);
        conn.close(&mut reactor);
        conn.starttls(&mut reactor, None);
        assert_eq!(conn.write(&mut reactor, b"x"), 0);
        assert_eq!(client_rec.events.borrow().len(), events_after_first);
    }

    #[test]
    fn test_poller_interest_matches_connection() {
        let mut reactor = test_reactor();
        let (server_rec, client_rec, conn, _server) = echo_pair(&mut reactor);
        assert!(drive(&mut reactor, 400, || {
            server_rec.conn.borrow().is_some() && client_rec.connects.get() == 1
        }));

        let check = |reactor: &Reactor, conn: &Conn| {
            let inner = conn.0.borrow();
            assert_eq!(
                reactor.poller.interest(inner.fd),
                Some((inner.want_read, inner.want_write))
            );
        };
        check(&reactor, &conn);
        let accepted = server_rec.conn.borrow().clone().unwrap();
        check(&reactor, &accepted);

        conn.pause(&mut reactor);
        check(&reactor, &conn);
        conn.resume(&mut reactor);
        check(&reactor, &conn);
        conn.pause_writes(&mut reactor);
        conn.write(&mut reactor, b"buffered while locked");
        check(&reactor, &conn);
        conn.resume_writes(&mut reactor);
        check(&reactor, &conn);
    }

    #[test]
    fn test_rate_limit_pauses_reads() {
        let mut reactor = test_reactor();
        let server_rec = Rc::new(Recorder::default());
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = reactor
            .listen(&addr, server_rec.clone(), ListenConfig::default())
            .unwrap();
        let port = server.local_addr().port();
        let client_rec = Rc::new(Recorder::default());
        let conn = reactor
            .addclient("127.0.0.1", port, client_rec.clone(), None, None, None)
            .unwrap();
        assert!(drive(&mut reactor, 400, || server_rec.conn.borrow().is_some()));

        // 8 KiB/s: a 4 KiB burst costs half a second of read silence.
        conn.set_limit(Some(8192.0));
        let accepted = server_rec.conn.borrow().clone().unwrap();
        accepted.write(&mut reactor, &[0u8; 4096]);
        assert!(drive(&mut reactor, 400, || {
            client_rec.incoming.borrow().len() == 4096
        }));
        // The pacing pause dropped read interest in the same tick as the delivery.
        {
            let inner = conn.0.borrow();
            assert!(!inner.want_read);
            assert_eq!(reactor.poller.interest(inner.fd), Some((false, false)));
        }

        // Bytes sent during the pause are only delivered once it expires.
        accepted.write(&mut reactor, &[1u8; 16]);
        assert_eq!(client_rec.incoming.borrow().len(), 4096);
        assert!(drive(&mut reactor, 400, || {
            client_rec.incoming.borrow().len() == 4112
        }));
    }

    #[test]
    fn test_link_pumps_with_flow_control() {
        let mut reactor = test_reactor();
        let server_rec = Rc::new(Recorder::default());
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = reactor
            .listen(&addr, server_rec.clone(), ListenConfig::default())
            .unwrap();
        let port = server.local_addr().port();
        let client_rec = Rc::new(Recorder::default());
        let conn = reactor
            .addclient("127.0.0.1", port, client_rec.clone(), None, None, None)
            .unwrap();
        assert!(drive(&mut reactor, 400, || server_rec.conn.borrow().is_some()));

        // Loop the accepted side back onto itself: incoming bytes pause it, get written
        // back, and the drain resumes it.
        let accepted = server_rec.conn.borrow().clone().unwrap();
        reactor.link(&accepted, &accepted, None);

        conn.write(&mut reactor, b"ping");
        assert!(drive(&mut reactor, 400, || {
            client_rec.incoming.borrow().as_slice() == b"ping"
        }));
        assert!(accepted.alive());
    }

    #[test]
    fn test_wrapserver_accepts() {
        let mut reactor = test_reactor();
        let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let server_rec = Rc::new(Recorder::default());
        let server = reactor
            .wrapserver(std_listener, server_rec.clone(), ListenConfig::default())
            .unwrap();
        let port = server.local_addr().port();

        let client_rec = Rc::new(Recorder::default());
        let _conn = reactor
            .addclient("127.0.0.1", port, client_rec.clone(), None, None, None)
            .unwrap();
        assert!(drive(&mut reactor, 400, || {
            server_rec.conn.borrow().is_some() && server_rec.connects.get() == 1
        }));
    }

    #[test]
    fn test_watchfd_dispatch_and_close() {
        let mut reactor = test_reactor();
        let (read_fd, write_fd) = nix::unistd::pipe().unwrap();
        let hits = Rc::new(Cell::new(0usize));
        let counter = hits.clone();
        let watch = reactor
            .watchfd(
                read_fd,
                Some(Box::new(move |_reactor, fd| {
                    let mut buf = [0u8; 8];
                    let _ = nix::unistd::read(fd, &mut buf);
                    counter.set(counter.get() + 1);
                })),
                None,
            )
            .unwrap();

        nix::unistd::write(write_fd, &[0u8; 1]).unwrap();
        assert!(drive(&mut reactor, 40, || hits.get() >= 1));

        watch.close(&mut reactor);
        assert_eq!(reactor.poller.interest(read_fd), None);
        nix::unistd::write(write_fd, &[0u8; 1]).unwrap();
        for _ in 0..3 {
            reactor.step().unwrap();
        }
        assert_eq!(hits.get(), 1);

        nix::unistd::close(read_fd).unwrap();
        nix::unistd::close(write_fd).unwrap();
    }

    #[test]
    fn test_timer_rearm_not_same_tick() {
        let mut reactor = test_reactor();
        let count = Rc::new(Cell::new(0usize));
        let counter = count.clone();
        let id = reactor.add_task(Duration::from_millis(0), move |_reactor, _now, _id| {
            counter.set(counter.get() + 1);
            Some(Duration::from_millis(0))
        });

        // An already-expired re-arm still waits for the next tick.
        reactor.step().unwrap();
        assert_eq!(count.get(), 1);
        reactor.step().unwrap();
        assert_eq!(count.get(), 2);

        assert!(reactor.stop_timer(id));
        reactor.step().unwrap();
        assert_eq!(count.get(), 2);
    }

    #[test]
    fn test_stop_timer_on_staged_rearm() {
        let mut reactor = test_reactor();
        let count = Rc::new(Cell::new(0usize));
        let counter = count.clone();
        // The callback re-arms itself and immediately cancels the staged re-arm.
        reactor.add_task(Duration::from_millis(0), move |reactor, _now, id| {
            counter.set(counter.get() + 1);
            reactor.stop_timer(id);
            Some(Duration::from_millis(0))
        });
        for _ in 0..3 {
            reactor.step().unwrap();
        }
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn test_unprotected_listener_error_stops_loop() {
        struct Exploding;
        impl SessionListener for Exploding {
            fn on_connect(&self, _reactor: &mut Reactor, _conn: &Conn) -> HandlerResult {
                Err("boom".into())
            }
        }

        let mut reactor = test_reactor();
        let mut config = reactor.config.clone();
        config.protect_listeners = false;
        reactor.set_config(config);

        let server_rec = Rc::new(Recorder::default());
        server_rec.echo.set(true);
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = reactor
            .listen(&addr, server_rec.clone(), ListenConfig::default())
            .unwrap();
        let port = server.local_addr().port();
        let _conn = reactor
            .addclient("127.0.0.1", port, Rc::new(Exploding), None, None, None)
            .unwrap();

        let mut failed = None;
        for _ in 0..400 {
            if let Err(err) = reactor.step() {
                failed = Some(err);
                break;
            }
        }
        let err = failed.expect("the loop should surface the listener error");
        assert_eq!(err.callback, "onconnect");
    }
}
