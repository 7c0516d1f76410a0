use std::collections::{HashSet, VecDeque};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use crate::poller::{IoEv, Poll};

/// Manager for a set of event sources which are polled for an event loop by
/// the reactor by using [`popol`] library.
pub struct Poller {
    sources: popol::Sources<RawFd>,
    events: Vec<popol::Event<RawFd>>,
    queue: VecDeque<(RawFd, IoEv)>,
    registered: HashSet<RawFd>,
}

impl Poller {
    pub fn new() -> Self {
        Self {
            sources: popol::Sources::new(),
            events: empty!(),
            queue: empty!(),
            registered: empty!(),
        }
    }
}

impl Default for Poller {
    fn default() -> Self {
        Poller::new()
    }
}

impl Poll for Poller {
    fn register(&mut self, fd: &impl AsRawFd, interest: IoEv) {
        let raw = fd.as_raw_fd();
        if !self.registered.insert(raw) {
            // popol keeps duplicate keys, so replace instead of accumulating
            self.sources.unregister(&raw);
        }
        self.sources.register(
            raw,
            fd,
            match (interest.is_readable, interest.is_writable) {
                (true, true) => popol::interest::ALL,
                (true, false) => popol::interest::READ,
                (false, true) => popol::interest::WRITE,
                (false, false) => popol::interest::NONE,
            },
        );
    }

    fn unregister(&mut self, fd: RawFd) {
        if self.registered.remove(&fd) {
            self.sources.unregister(&fd);
        }
    }

    fn wait(&mut self, timeout: Duration) -> io::Result<usize> {
        self.events.clear();
        // Blocking call
        match self.sources.poll(&mut self.events, popol::Timeout::from(timeout)) {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::TimedOut => return Ok(0),
            Err(err) => return Err(err),
        }
        for ev in self.events.drain(..) {
            self.queue.push_back((
                ev.key,
                IoEv {
                    // Hangups and errors must wake the source so it can
                    // observe EOF on read.
                    is_readable: ev.is_readable() || ev.is_hangup() || ev.is_error(),
                    is_writable: ev.is_writable(),
                },
            ));
        }
        Ok(self.queue.len())
    }
}

impl Iterator for Poller {
    type Item = (RawFd, IoEv);

    fn next(&mut self) -> Option<Self::Item> {
        self.queue.pop_front()
    }
}
