// This file is part of cfxmpp.
// Copyright (c) 2019, Cloudflare. All rights reserved.
// See LICENSE for licensing information.

//! Command line argument definitions and validations.

use clap::{App, Arg, SubCommand};

/// Create the subcommand `echo-server`.
fn create_clap_echo_server_subcommand<'a, 'b>() -> App<'a, 'b> {
    // Arguments for `echo-server` subcommand.
    let args = [
        Arg::with_name("configfile").long("file").short("f")
            .takes_value(true).required(false)
            .help("Specifies a path to the configuration file. If the path is not specified, \
                   the system-wide configuration file (/etc/cfxmpp/echo-server.config) will be \
                   used instead")
    ];

    // Create a new subcommand.
    SubCommand::with_name("echo-server")
        .about("Runs a diagnostic echo service over the reactor, over TCP or TLS/TCP")
        .args(&args)
}

/// Create the whole command-line configuration.
pub fn create_clap_command() -> App<'static, 'static> {
    App::new(env!("CARGO_PKG_NAME"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            Arg::with_name("debug").long("debug").short("d")
                .help("Turns on debug logging"),
        )
        .subcommands(vec![
            // List of all available subcommands.
            create_clap_echo_server_subcommand(),
        ])
}
