// This file is part of cfxmpp.
// Copyright (c) 2019, Cloudflare. All rights reserved.
// See LICENSE for licensing information.

//! Event-driven, single-threaded socket multiplexer.
//!
//! This is the runtime substrate the protocol handlers sit on: a level-triggered readiness
//! poller, a timer heap integrated with the poll budget, per-connection state machines with
//! cooperative TLS upgrades, and explicit read/write backpressure. Everything runs on one
//! thread; the only suspension point is the poller wait.

pub mod compat;
mod config;
mod conn;
mod core;
mod interface;
mod poller;
mod server;
mod timer;
mod tls;

pub use self::config::Config;
pub use self::conn::{Conn, ListenerRef, WeakConn};
pub use self::core::{
    ListenConfig, ListenerError, Quit, Reactor, WatchCallback, WatchHandle,
};
pub use self::interface::{DisconnectReason, HandlerResult, NullListener, SessionListener};
pub use self::poller::{Poller, Wait};
pub use self::server::ServerHandle;
pub use self::timer::{to_absolute_time, TimerId};
pub use self::tls::{
    load_certs, load_private_key, make_client_config, make_server_config, TlsConfig,
};

/// The readiness backend in use.
pub fn get_backend() -> &'static str {
    "epoll"
}
