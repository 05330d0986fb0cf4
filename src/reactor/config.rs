// This file is part of cfxmpp.
// Copyright (c) 2019, Cloudflare. All rights reserved.
// See LICENSE for licensing information.

//! Reactor tunables.

use std::time::Duration;

/// Process-wide reactor tunables. Installed with `Reactor::set_config`; changes take effect for
/// subsequently armed timers and new connections, connections mid-flight keep their current
/// timers until the next re-arm.
#[derive(Clone, Debug)]
pub struct Config {
    /// Longest time the poller is allowed to sleep when no timer is pending.
    pub max_wait: Duration,

    /// Shortest poll budget; also the floor under rate-limit pauses.
    pub min_wait: Duration,

    /// Idle deadline for reads on an established connection.
    pub read_timeout: Duration,

    /// Idle deadline for draining the write buffer after connect.
    pub send_timeout: Duration,

    /// Deadline for an outgoing connect to become writable.
    pub connect_timeout: Duration,

    /// Deadline for a TLS handshake in either direction.
    pub ssl_handshake_timeout: Duration,

    /// How long a listener pauses itself after a failed accept.
    pub accept_retry_interval: Duration,

    /// Delay before re-reading a socket that still had buffered data, so other descriptors get
    /// a turn.
    pub read_retry_delay: Duration,

    /// Maximum bytes per receive call.
    pub read_size: usize,

    /// Listen backlog handed to the kernel.
    pub tcp_backlog: i32,

    /// Log every listener dispatch at debug level.
    pub verbose: bool,

    /// A failed listener callback destroys the connection.
    pub fatal_errors: bool,

    /// Trap listener callback errors instead of aborting the loop.
    pub protect_listeners: bool,

    /// Try to send synchronously from `write` instead of waiting for the poller.
    pub opportunistic_writes: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            max_wait: Duration::from_secs(86400),
            min_wait: Duration::from_millis(1),
            read_timeout: Duration::from_secs(14 * 60),
            send_timeout: Duration::from_secs(180),
            connect_timeout: Duration::from_secs(20),
            ssl_handshake_timeout: Duration::from_secs(60),
            accept_retry_interval: Duration::from_secs(10),
            read_retry_delay: Duration::from_micros(1),
            read_size: 8192,
            tcp_backlog: 128,
            verbose: false,
            fatal_errors: false,
            protect_listeners: true,
            opportunistic_writes: false,
        }
    }
}

// ------------------------------------------------------------------------
// Tests
// ------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.read_timeout, Duration::from_secs(840));
        assert_eq!(cfg.send_timeout, Duration::from_secs(180));
        assert_eq!(cfg.connect_timeout, Duration::from_secs(20));
        assert_eq!(cfg.tcp_backlog, 128);
        assert_eq!(cfg.read_size, 8192);
        assert!(cfg.protect_listeners);
        assert!(!cfg.fatal_errors);
        assert!(!cfg.opportunistic_writes);
        assert!(cfg.min_wait < cfg.max_wait);
    }
}
