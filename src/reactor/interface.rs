// This file is part of cfxmpp.
// Copyright (c) 2019, Cloudflare. All rights reserved.
// See LICENSE for licensing information.

//! The callback contract between the reactor and the protocol layer above it.
//!
//! A connection's behavior is defined by whichever `SessionListener` is attached to it at the
//! moment an event fires; `Conn::set_listener` swaps the whole record at runtime. Every method
//! has a no-op default, so implementors only write the callbacks they care about.
//!
//! Callbacks take `&self`: a dispatch may re-enter the same record synchronously (an
//! `on_incoming` that writes with opportunistic writes on can trigger `on_drain` on the same
//! stack), so implementors keep their mutable state in cells.

use std::error::Error;
use std::fmt;

use super::conn::Conn;
use super::core::Reactor;

/// Result of a single listener callback. Errors are contained or surfaced according to the
/// `protect_listeners` / `fatal_errors` tunables.
pub type HandlerResult = Result<(), Box<dyn Error>>;

/// Why a connection went away, as delivered to `on_disconnect`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DisconnectReason {
    /// The peer closed the connection.
    Closed,
    /// No bytes arrived within the read-idle deadline.
    ReadTimeout,
    /// The write buffer failed to drain within the send deadline.
    WriteTimeout,
    /// An outgoing connect never became writable.
    ConnectTimeout,
    /// The TLS handshake missed its deadline.
    TlsHandshakeTimeout,
    /// The TLS layer failed mid-stream or mid-handshake.
    Tls(String),
    /// Any other socket error.
    Io(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Closed => write!(f, "closed"),
            DisconnectReason::ReadTimeout => write!(f, "read timeout"),
            DisconnectReason::WriteTimeout => write!(f, "write timeout"),
            DisconnectReason::ConnectTimeout => write!(f, "connection timeout"),
            DisconnectReason::TlsHandshakeTimeout => write!(f, "ssl handshake timeout"),
            DisconnectReason::Tls(msg) => write!(f, "{}", msg),
            DisconnectReason::Io(msg) => write!(f, "{}", msg),
        }
    }
}

impl From<&std::io::Error> for DisconnectReason {
    fn from(error: &std::io::Error) -> DisconnectReason {
        DisconnectReason::Io(error.to_string())
    }
}

/// Callbacks a protocol layer may attach to a connection. All optional.
pub trait SessionListener {
    /// The listener record was attached to `conn`.
    fn on_attach(&self, _reactor: &mut Reactor, _conn: &Conn) -> HandlerResult {
        Ok(())
    }

    /// The listener record was detached (replaced by another, or final teardown).
    fn on_detach(&self, _reactor: &mut Reactor, _conn: &Conn) -> HandlerResult {
        Ok(())
    }

    /// The connection is live: an outgoing connect completed, an accepted socket was set up, or
    /// the TLS handshake of a direct-TLS socket finished. Fires exactly once per connection,
    /// before the first `on_incoming` or `on_drain`.
    fn on_connect(&self, _reactor: &mut Reactor, _conn: &Conn) -> HandlerResult {
        Ok(())
    }

    /// Bytes arrived. When the transport failed with trailing data still buffered, the data is
    /// delivered here once with `err` set, right before `on_disconnect`.
    fn on_incoming(
        &self,
        _reactor: &mut Reactor,
        _conn: &Conn,
        _data: &[u8],
        _err: Option<&DisconnectReason>,
    ) -> HandlerResult {
        Ok(())
    }

    /// The write buffer fully drained. Listeners may enqueue more writes from here.
    fn on_drain(&self, _reactor: &mut Reactor, _conn: &Conn) -> HandlerResult {
        Ok(())
    }

    /// The connection is gone. Fires at most once; `destroy` runs right after.
    fn on_disconnect(
        &self,
        _reactor: &mut Reactor,
        _conn: &Conn,
        _reason: Option<&DisconnectReason>,
    ) -> HandlerResult {
        Ok(())
    }

    /// The read-idle deadline expired. Return `Ok(true)` to keep the connection (the deadline
    /// re-arms); the default drops it with a `"read timeout"` disconnect.
    fn on_read_timeout(
        &self,
        _reactor: &mut Reactor,
        _conn: &Conn,
    ) -> Result<bool, Box<dyn Error>> {
        Ok(false)
    }

    /// A TLS handshake is about to start on this connection.
    fn on_starttls(&self, _reactor: &mut Reactor, _conn: &Conn) -> HandlerResult {
        Ok(())
    }

    /// Out-of-band status notification, e.g. `"ssl-handshake-complete"`.
    fn on_status(&self, _reactor: &mut Reactor, _conn: &Conn, _status: &str) -> HandlerResult {
        Ok(())
    }

    /// Another callback on this record failed while `protect_listeners` was on.
    fn on_error(&self, _reactor: &mut Reactor, _conn: &Conn, _err: &dyn Error) {}
}

/// A listener with every callback left at its default. Test plumbing and placeholder sessions
/// attach this.
pub struct NullListener;

impl SessionListener for NullListener {}
