//! Readiness multiplexer contract consumed by the reactor.

pub mod popol;

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

/// Information about I/O events which has happened for an event source.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug)]
pub struct IoEv {
    /// Specifies whether I/O source has data to read.
    pub is_readable: bool,
    /// Specifies whether I/O source is ready for write operations.
    pub is_writable: bool,
}

impl IoEv {
    pub fn read_only() -> Self {
        IoEv {
            is_readable: true,
            is_writable: false,
        }
    }

    pub fn write_only() -> Self {
        IoEv {
            is_readable: false,
            is_writable: true,
        }
    }

    pub fn read_write() -> Self {
        IoEv {
            is_readable: true,
            is_writable: true,
        }
    }
}

/// Blocking wait over a set of registered descriptors.
///
/// Implementations queue the readiness events produced by [`Poll::wait`] and
/// yield them through their [`Iterator`] implementation, keyed by raw
/// descriptor, in the order the OS facility reported them.
pub trait Poll: Iterator<Item = (RawFd, IoEv)> {
    /// Starts watching a descriptor with the given interest set. Re-registering
    /// the same descriptor replaces its previous interests.
    fn register(&mut self, fd: &impl AsRawFd, interest: IoEv);

    /// Stops watching a descriptor. Unknown descriptors are ignored.
    fn unregister(&mut self, fd: RawFd);

    /// Blocks until at least one descriptor is ready or the timeout elapses.
    ///
    /// Returns the number of queued readiness events; an elapsed timeout is
    /// not an error and reports zero. Signal interruption is surfaced as
    /// [`io::ErrorKind::Interrupted`] so the caller can inspect lifecycle
    /// state before retrying.
    fn wait(&mut self, timeout: Duration) -> io::Result<usize>;
}
