use std::convert::Infallible;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Instant;

use crate::poller::IoEv;

/// A watchable event source: one descriptor, its interest set and the
/// translation of raw readiness into a typed event.
///
/// Resources are owned by the [`crate::Reactor`] they are registered with;
/// the poller itself holds only the raw descriptor. `Reactor::unregister`
/// hands the resource back to the caller, who decides whether to keep it or
/// drop it (closing the underlying descriptor); unregistering through a
/// `Controller` inside a callback drops it once the dispatch completes.
pub trait Resource: AsRawFd {
    /// Event produced when the descriptor becomes ready.
    type Event;

    /// Interest set to register with the readiness multiplexer.
    fn interests(&self) -> IoEv;

    /// Asks the resource to handle I/O readiness reported at `time`.
    ///
    /// Must not block: the descriptor is known to be ready for the operations
    /// indicated by `io`. Returning `None` means the readiness produced
    /// nothing the handler needs to see (e.g. a spurious wakeup).
    fn handle_io(&mut self, io: IoEv, time: Instant) -> Option<Self::Event>;
}

/// Placeholder resource for reactors which only run timers, or for worker
/// delegates that never register additional event sources.
///
/// The type is uninhabited, so none of its methods can ever be called.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug)]
pub enum NoResource {}

impl AsRawFd for NoResource {
    fn as_raw_fd(&self) -> RawFd {
        match *self {}
    }
}

impl Resource for NoResource {
    type Event = Infallible;

    fn interests(&self) -> IoEv {
        match *self {}
    }

    fn handle_io(&mut self, _io: IoEv, _time: Instant) -> Option<Infallible> {
        match *self {}
    }
}
