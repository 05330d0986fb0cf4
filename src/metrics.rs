// This file is part of cfxmpp.
// Copyright (c) 2019, Cloudflare. All rights reserved.
// See LICENSE for licensing information.

//! Prometheus text exposition over a bare TCP responder.

use lazy_static::lazy_static;
use prometheus::{
    self, register_gauge, register_int_gauge, Encoder, __register_gauge, labels, opts,
};

use slog::{error, info};

use std::io;
use std::io::Write;
use std::net;
use std::thread;

const VERSION: &'static str = env!("CARGO_PKG_VERSION");

/// Where the exposition endpoint binds.
#[derive(Clone, Debug)]
pub struct MetricsConfig {
    pub port: u16,
    pub addr: String,
}

lazy_static! {
    static ref VERSION_INFO: prometheus::IntGauge = register_int_gauge!(opts!(
        "build_info",
        "Build and version information",
        labels! {
            "version" => VERSION,
        }
    ))
    .unwrap();
}

fn scrape_result() -> String {
    let mut buffer = Vec::new();
    let encoder = prometheus::TextEncoder::new();
    let families = prometheus::gather();
    encoder.encode(&families, &mut buffer).unwrap();
    "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\n\r\n".to_owned()
        + &String::from_utf8(buffer).unwrap()
}

fn serve_metrics(mut dest: net::TcpStream) {
    let _ = dest.write_all(scrape_result().as_bytes());
    let _ = dest.shutdown(net::Shutdown::Write);
}

/// Run the exposition endpoint on the configured address. Blocks; callers spawn a thread.
pub fn run_metrics(config: MetricsConfig, logger: &slog::Logger) -> Result<(), std::io::Error> {
    VERSION_INFO.set(1);
    let listener = net::TcpListener::bind((config.addr.as_str(), config.port))?;
    info!(
        logger,
        "metrics endpoint listening on {}:{}", config.addr, config.port
    );
    for stream in listener.incoming() {
        match stream {
            Ok(conn) => {
                thread::spawn(move || {
                    serve_metrics(conn);
                });
            }
            Err(err) => {
                error!(logger, "metrics accept failed: {}", err);
                return Err(err);
            }
        }
    }
    Err(io::Error::new(io::ErrorKind::Other, "unreachable"))
}
