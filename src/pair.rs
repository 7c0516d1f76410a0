use std::io::{IoSlice, IoSliceMut};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Instant;

use nix::cmsg_space;
use nix::errno::Errno;
use nix::sys::socket::{
    recvmsg, sendmsg, socketpair, AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags,
    SockFlag, SockType,
};

use crate::poller::IoEv;
use crate::{Error, Resource};

/// Payload byte accompanying every passed descriptor; ancillary data cannot
/// be sent on an empty message.
const FD_PAYLOAD: u8 = 0xFD;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum Role {
    Parent,
    Child,
}

/// Event produced by the receiving end of a [`SocketPair`].
#[derive(Debug)]
pub enum PairEvent {
    /// A connection descriptor arrived from the master process. The receiver
    /// owns it exclusively from this point on.
    Descriptor(OwnedFd),
    /// The peer process closed its end of the channel.
    Disconnected,
    /// Receiving failed; the channel itself may still be usable.
    Failure(Error),
}

/// One end of a kernel-level bidirectional channel between a master and
/// exactly one worker process.
///
/// The pair is created before fork with [`SocketPair::duplex`]; after fork
/// each process drops the end it does not own. The parent end passes open
/// descriptors to its worker through the ancillary-data facility; a send
/// consumes the descriptor, so the master cannot accidentally keep using a
/// connection it already handed off. The receiver obtains a fresh descriptor
/// value referencing the same underlying kernel object.
#[derive(Debug)]
pub struct SocketPair {
    fd: OwnedFd,
    role: Role,
}

impl SocketPair {
    /// Creates the channel as an AF_UNIX stream socket pair, returning the
    /// `(parent, child)` ends. Must be called before forking; failure here is
    /// fatal to pool construction.
    pub fn duplex() -> Result<(SocketPair, SocketPair), Error> {
        let (parent, child) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )?;
        Ok((
            SocketPair {
                fd: parent,
                role: Role::Parent,
            },
            SocketPair {
                fd: child,
                role: Role::Child,
            },
        ))
    }

    pub fn is_parent_end(&self) -> bool {
        self.role == Role::Parent
    }

    /// Transfers an open descriptor to the worker process on the other end.
    ///
    /// Ownership moves into the call: the kernel duplicates the descriptor
    /// into the in-flight message and the local copy is closed on return,
    /// enforcing the single-owner-at-a-time rule at the API level.
    pub fn send_fd(&self, fd: OwnedFd) -> Result<(), Error> {
        if self.role != Role::Parent {
            return Err(Error::WrongEnd);
        }
        let payload = [FD_PAYLOAD];
        let iov = [IoSlice::new(&payload)];
        let fds = [fd.as_raw_fd()];
        let cmsg = [ControlMessage::ScmRights(&fds)];
        // MSG_NOSIGNAL: a worker which already exited must surface as EPIPE,
        // never as a process-killing SIGPIPE.
        sendmsg::<()>(
            self.fd.as_raw_fd(),
            &iov,
            &cmsg,
            MsgFlags::MSG_NOSIGNAL,
            None,
        )?;
        Ok(())
    }

    /// Receives one descriptor from the peer. `Ok(None)` signals orderly
    /// shutdown: the peer closed its end.
    pub fn recv_fd(&self) -> Result<Option<OwnedFd>, Error> {
        let mut payload = [0u8; 1];
        let mut iov = [IoSliceMut::new(&mut payload)];
        let mut cmsg = cmsg_space!([RawFd; 1]);
        let msg = recvmsg::<()>(
            self.fd.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg),
            MsgFlags::empty(),
        )?;
        if msg.bytes == 0 {
            return Ok(None);
        }
        for cmsg in msg.cmsgs() {
            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                let mut owned = fds
                    .into_iter()
                    .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) });
                if let Some(first) = owned.next() {
                    // Anything beyond the first descriptor is dropped (and
                    // thereby closed) rather than leaked.
                    return Ok(Some(first));
                }
            }
        }
        Err(Error::NoDescriptor)
    }
}

impl AsRawFd for SocketPair {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Resource for SocketPair {
    type Event = PairEvent;

    fn interests(&self) -> IoEv {
        IoEv::read_only()
    }

    fn handle_io(&mut self, io: IoEv, _time: Instant) -> Option<PairEvent> {
        if !io.is_readable {
            return None;
        }
        match self.recv_fd() {
            Ok(Some(fd)) => Some(PairEvent::Descriptor(fd)),
            Ok(None) => Some(PairEvent::Disconnected),
            Err(Error::Os(Errno::EINTR)) => None,
            Err(err) => Some(PairEvent::Failure(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    use super::*;

    #[test]
    fn descriptor_crosses_the_channel_and_stays_usable() {
        let (parent, child) = SocketPair::duplex().unwrap();
        assert!(parent.is_parent_end());
        assert!(!child.is_parent_end());

        let (retained, handed_off) = UnixStream::pair().unwrap();
        parent.send_fd(OwnedFd::from(handed_off)).unwrap();

        let received = child.recv_fd().unwrap().expect("descriptor expected");
        let mut delivered = UnixStream::from(received);
        delivered.write_all(b"hello").unwrap();
        drop(delivered);

        let mut retained = retained;
        let mut buf = String::new();
        retained.read_to_string(&mut buf).unwrap();
        assert_eq!(buf, "hello");
    }

    #[test]
    fn child_end_must_not_send_descriptors() {
        let (_parent, child) = SocketPair::duplex().unwrap();
        let (_keep, give) = UnixStream::pair().unwrap();
        assert!(matches!(
            child.send_fd(OwnedFd::from(give)),
            Err(Error::WrongEnd)
        ));
    }

    #[test]
    fn closed_peer_reads_as_disconnect() {
        let (parent, child) = SocketPair::duplex().unwrap();
        drop(parent);
        assert!(child.recv_fd().unwrap().is_none());
    }
}
