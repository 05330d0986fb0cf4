// This file is part of cfxmpp.
// Copyright (c) 2019, Cloudflare. All rights reserved.
// See LICENSE for licensing information.

//! Echo server instantiation.

use slog::{debug, info, warn};

use std::io;
use std::net::ToSocketAddrs;
use std::rc::Rc;

use crate::metrics;
use crate::reactor::{
    make_server_config, Conn, DisconnectReason, HandlerResult, ListenConfig, Reactor,
    SessionListener, TlsConfig,
};

use super::config::EchoServerConfig;

/// The diagnostic session: whatever arrives goes straight back out.
struct EchoSession {
    logger: slog::Logger,
}

impl SessionListener for EchoSession {
    fn on_connect(&self, _reactor: &mut Reactor, conn: &Conn) -> HandlerResult {
        debug!(self.logger, "session up"; "conn" => conn.id());
        Ok(())
    }

    fn on_incoming(
        &self,
        reactor: &mut Reactor,
        conn: &Conn,
        data: &[u8],
        _err: Option<&DisconnectReason>,
    ) -> HandlerResult {
        conn.write(reactor, data);
        Ok(())
    }

    fn on_disconnect(
        &self,
        _reactor: &mut Reactor,
        conn: &Conn,
        reason: Option<&DisconnectReason>,
    ) -> HandlerResult {
        match reason {
            Some(reason) => debug!(self.logger, "session down: {}", reason; "conn" => conn.id()),
            None => debug!(self.logger, "session down"; "conn" => conn.id()),
        }
        Ok(())
    }
}

/// Echo server instance. `start` binds the listeners and runs the reactor on the calling
/// thread until shutdown.
pub struct EchoServer {
    config: EchoServerConfig,
}

impl EchoServer {
    pub fn new(config: EchoServerConfig) -> EchoServer {
        EchoServer { config }
    }

    pub fn start(&self) -> Result<(), io::Error> {
        let logger = self.config.logger();

        if let Some(metrics_config) = self.config.metrics_config.clone() {
            info!(logger, "spawning metrics");
            let log_metrics = logger.new(slog::o!("component" => "metrics"));
            std::thread::spawn(move || {
                if let Err(error) = metrics::run_metrics(metrics_config, &log_metrics) {
                    slog::error!(log_metrics, "metrics endpoint failed: {}", error);
                }
            });
        }

        let tls_ctx = if self.config.tls_certs.is_empty() {
            None
        } else {
            let server_config = make_server_config(
                self.config.tls_certs.clone(),
                self.config.tls_secret_keys[0].clone(),
            )
            .map_err(|error| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("invalid key or certificate: {}", error),
                )
            })?;
            Some(TlsConfig::Server(server_config))
        };

        let mut reactor = Reactor::new(logger.new(slog::o!("component" => "reactor")))?;
        reactor.set_config(self.config.reactor_config());

        let session: Rc<dyn SessionListener> = Rc::new(EchoSession {
            logger: logger.clone(),
        });
        for addr in &self.config.addrs {
            let addr = addr
                .to_socket_addrs()?
                .next()
                .ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("cannot resolve listen address {:?}", addr),
                    )
                })?;
            let options = ListenConfig {
                tls_ctx: tls_ctx.clone(),
                tls_direct: self.config.direct_tls && tls_ctx.is_some(),
                ..ListenConfig::default()
            };
            reactor.listen(&addr, session.clone(), options)?;
            info!(logger, "echo service listening on {}", addr);
        }

        if let Some(data_dir) = self.config.data_dir.as_ref() {
            notify_ready(data_dir, logger);
        }

        let quit = reactor
            .run()
            .map_err(|error| io::Error::new(io::ErrorKind::Other, error.to_string()))?;
        info!(logger, "reactor stopped: {:?}", quit);
        Ok(())
    }
}

/// Tell the supervising daemon we are up: one `READY=1` datagram to the notification socket in
/// the data directory. Failures are logged and swallowed; the socket only exists when a
/// supervisor put it there.
fn notify_ready(data_dir: &str, logger: &slog::Logger) {
    use nix::sys::socket::{sendto, socket, AddressFamily, MsgFlags, SockAddr, SockFlag, SockType};

    let path = format!("{}/notify.sock", data_dir);
    let result = socket(
        AddressFamily::Unix,
        SockType::Datagram,
        SockFlag::empty(),
        None,
    )
    .and_then(|fd| {
        let addr = SockAddr::new_unix(path.as_str())?;
        let sent = sendto(fd, b"READY=1", &addr, MsgFlags::empty());
        let _ = nix::unistd::close(fd);
        sent
    });
    match result {
        Ok(_) => info!(logger, "notified readiness via {}", path),
        Err(error) => warn!(logger, "cannot notify readiness via {}: {}", path, error),
    }
}
