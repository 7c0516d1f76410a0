use std::io;

use nix::errno::Errno;

#[derive(Debug, Display, Error, From)]
pub enum Error {
    /// I/O failure in the readiness multiplexer or on a descriptor.
    #[from]
    #[display("I/O failure: {0}")]
    Io(io::Error),

    /// Failed OS call (fork, kill, socketpair, descriptor passing).
    #[from]
    #[display("OS call failed: {0}")]
    Os(Errno),

    /// Descriptor handoff addressed a worker slot which is no longer tracked.
    #[display("no worker process tracked at slot {0}")]
    NoWorker(usize),

    /// Descriptor handoff failed because the worker process already exited.
    #[display("worker at slot {0} is gone; descriptor could not be delivered")]
    PeerGone(usize),

    /// Descriptor sends are only valid on the parent end of a socket pair.
    #[display("descriptor passing attempted on the wrong socket pair end")]
    WrongEnd,

    /// Control message arrived without an attached descriptor.
    #[display("control message carried no descriptor")]
    NoDescriptor,
}
