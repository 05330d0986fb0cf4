// This file is part of cfxmpp.
// Copyright (c) 2019, Cloudflare. All rights reserved.
// See LICENSE for licensing information.

//! Thin readiness poller over mio's level-triggered epoll backend.
//!
//! Everything is keyed by raw file descriptor: registration goes through `EventedFd` with
//! `Token(fd)`, so sockets, listeners and arbitrary watched descriptors all take the same path.
//! A single descriptor is reported per `wait` call, which keeps dispatch reentrancy simple: one
//! handler runs to completion before the next readiness lookup.

use mio::unix::{EventedFd, UnixReady};
use mio::{Events, Poll, PollOpt, Ready, Token};

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Outcome of a single poller wait.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Wait {
    /// One descriptor is ready. Hangup and error conditions are folded into both directions so
    /// the owning handler observes the failure from its own syscall.
    Ready {
        fd: RawFd,
        readable: bool,
        writable: bool,
    },
    /// The timeout elapsed with nothing ready.
    Timeout,
    /// The wait was interrupted by a signal.
    Signal,
}

pub struct Poller {
    poll: Poll,
    events: Events,
    // Interest bits as last told to the kernel, used to uphold the map/poller invariant and by
    // the tests.
    registered: HashMap<RawFd, (bool, bool)>,
}

fn ready_bits(read: bool, write: bool) -> Ready {
    let mut ready = Ready::empty();
    if read {
        ready |= Ready::readable();
    }
    if write {
        ready |= Ready::writable();
    }
    ready
}

impl Poller {
    pub fn new() -> io::Result<Poller> {
        Ok(Poller {
            poll: Poll::new()?,
            // One event per wait call.
            events: Events::with_capacity(1),
            registered: HashMap::new(),
        })
    }

    /// Register a descriptor. A descriptor the kernel already knows about is transparently
    /// re-registered with the new interest set.
    pub fn add(&mut self, fd: RawFd, read: bool, write: bool) -> io::Result<()> {
        let result = self.poll.register(
            &EventedFd(&fd),
            Token(fd as usize),
            ready_bits(read, write),
            PollOpt::level(),
        );
        match result {
            Err(ref e) if e.raw_os_error() == Some(libc::EEXIST) => self.modify(fd, read, write),
            Err(e) => Err(e),
            Ok(()) => {
                self.registered.insert(fd, (read, write));
                Ok(())
            }
        }
    }

    /// Change the interest set of a registered descriptor. A descriptor the kernel has already
    /// forgotten is transparently added back.
    pub fn modify(&mut self, fd: RawFd, read: bool, write: bool) -> io::Result<()> {
        let result = self.poll.reregister(
            &EventedFd(&fd),
            Token(fd as usize),
            ready_bits(read, write),
            PollOpt::level(),
        );
        match result {
            Err(ref e) if e.raw_os_error() == Some(libc::ENOENT) => {
                self.registered.remove(&fd);
                self.add(fd, read, write)
            }
            Err(e) => Err(e),
            Ok(()) => {
                self.registered.insert(fd, (read, write));
                Ok(())
            }
        }
    }

    /// Drop a descriptor. Removing a descriptor that is not registered is a success.
    pub fn del(&mut self, fd: RawFd) -> io::Result<()> {
        self.registered.remove(&fd);
        match self.poll.deregister(&EventedFd(&fd)) {
            Err(ref e) if e.raw_os_error() == Some(libc::ENOENT) => Ok(()),
            other => other,
        }
    }

    /// The interest bits last installed for `fd`, if any.
    pub fn interest(&self, fd: RawFd) -> Option<(bool, bool)> {
        self.registered.get(&fd).cloned()
    }

    /// Block until one descriptor is ready or the timeout elapses.
    pub fn wait(&mut self, timeout: Duration) -> io::Result<Wait> {
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Wait::Signal),
            Err(e) => return Err(e),
            Ok(_) => {}
        }
        let event = match self.events.iter().next() {
            Some(event) => event,
            None => return Ok(Wait::Timeout),
        };
        let kind = event.readiness();
        let unix = UnixReady::from(kind);
        let failed = unix.is_hup() || unix.is_error();
        Ok(Wait::Ready {
            fd: event.token().0 as RawFd,
            readable: kind.is_readable() || failed,
            writable: kind.is_writable() || failed,
        })
    }
}

// ------------------------------------------------------------------------
// Tests
// ------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use nix::unistd;

    #[test]
    fn test_pipe_readiness() {
        let mut poller = Poller::new().unwrap();
        let (read_fd, write_fd) = unistd::pipe().unwrap();

        poller.add(read_fd, true, false).unwrap();
        assert_eq!(poller.interest(read_fd), Some((true, false)));

        // Nothing to read yet.
        assert_eq!(
            poller.wait(Duration::from_millis(20)).unwrap(),
            Wait::Timeout
        );

        unistd::write(write_fd, &[0u8; 1]).unwrap();
        match poller.wait(Duration::from_millis(200)).unwrap() {
            Wait::Ready { fd, readable, .. } => {
                assert_eq!(fd, read_fd);
                assert!(readable);
            }
            other => panic!("expected readiness, got {:?}", other),
        }
        // Drain the pipe so the read end stops reporting before the next wait.
        let mut buf = [0u8; 1];
        unistd::read(read_fd, &mut buf).unwrap();

        // An empty pipe has room, so the write end reports writable right away.
        poller.add(write_fd, false, true).unwrap();
        match poller.wait(Duration::from_millis(200)).unwrap() {
            Wait::Ready { fd, writable, .. } => {
                assert_eq!(fd, write_fd);
                assert!(writable);
            }
            other => panic!("expected readiness, got {:?}", other),
        }

        poller.del(write_fd).unwrap();
        poller.del(read_fd).unwrap();
        unistd::close(read_fd).unwrap();
        unistd::close(write_fd).unwrap();
    }

    #[test]
    fn test_add_twice_and_del_twice() {
        let mut poller = Poller::new().unwrap();
        let (read_fd, write_fd) = unistd::pipe().unwrap();

        poller.add(read_fd, true, false).unwrap();
        // A second add silently becomes a modify.
        poller.add(read_fd, true, true).unwrap();
        assert_eq!(poller.interest(read_fd), Some((true, true)));

        poller.del(read_fd).unwrap();
        // Deleting an absent descriptor is tolerated.
        poller.del(read_fd).unwrap();
        assert_eq!(poller.interest(read_fd), None);

        // Modifying an absent descriptor falls back to an add.
        poller.modify(read_fd, true, false).unwrap();
        assert_eq!(poller.interest(read_fd), Some((true, false)));

        poller.del(read_fd).unwrap();
        unistd::close(read_fd).unwrap();
        unistd::close(write_fd).unwrap();
    }
}
