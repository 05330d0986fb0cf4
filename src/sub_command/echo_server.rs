// This file is part of cfxmpp.
// Copyright (c) 2019, Cloudflare. All rights reserved.
// See LICENSE for licensing information.

//! The echo-server subcommand.

use std::process;

use crate::echo_server::{EchoServer, EchoServerConfig};

/// Get a configuration file path for `echo-server`.
///
/// If the path is not specified, the system-wide configuration file
/// (/etc/cfxmpp/echo-server.config) will be used instead.
///
fn resolve_config_filename(matches: &clap::ArgMatches<'_>) -> String {
    match matches.value_of("configfile") {
        // If the config file is specified in the arguments, just use it.
        Some(filename) => String::from(filename),
        // If not, use the system-wide configuration file.
        None => String::from("/etc/cfxmpp/echo-server.config"),
    }
}

/// The entry point of `echo-server`.
pub fn run(matches: &clap::ArgMatches<'_>) {
    // This should return the clone of `logger` in the main function.
    let global_logger = slog_scope::logger();

    // Get the config file path.
    let filename = resolve_config_filename(matches);
    let mut config = match EchoServerConfig::parse(&filename) {
        Ok(val) => val,
        // If there is an error, display it.
        Err(err) => {
            eprintln!("{}", err);
            process::exit(1);
        }
    };

    // Let the parsed config use a child of the global logger.
    let logger = global_logger.new(slog::o!("component" => "echo_server"));
    config.set_logger(logger);

    let server = EchoServer::new(config);

    // Bind the listeners and run the loop.
    if let Err(error) = server.start() {
        eprintln!("starting echo server failed: {}", error);
        process::exit(1);
    }
}
