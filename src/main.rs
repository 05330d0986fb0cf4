// This file is part of cfxmpp.
// Copyright (c) 2019, Cloudflare. All rights reserved.
// See LICENSE for licensing information.

//! cfxmpp entry point.

use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;

use std::process;

fn main() {
    let matches = cfxmpp::cmd::create_clap_command().get_matches();

    let severity = if matches.is_present("debug") {
        Severity::Debug
    } else {
        Severity::Info
    };

    let mut builder = TerminalLoggerBuilder::new();
    builder.level(severity);
    builder.destination(Destination::Stderr);
    let logger = builder
        .build()
        .expect("BUG: TerminalLoggerBuilder::build shouldn't return an error.");

    // Install the global logger and bridge the `log` facade into it, so records from
    // dependencies end up in the same place. The guard has to outlive the subcommands.
    let _guard = slog_scope::set_global_logger(logger);
    slog_stdlog::init().expect("BUG: the global log dispatcher is set twice.");

    match matches.subcommand() {
        ("echo-server", Some(sub_matches)) => {
            cfxmpp::sub_command::echo_server::run(sub_matches);
        }
        _ => {
            eprintln!("You must specify a subcommand, e.g. echo-server.");
            process::exit(127);
        }
    }
}
