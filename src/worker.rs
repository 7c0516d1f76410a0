use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Instant;

use nix::unistd::{self, Pid};

use crate::poller::{popol, IoEv};
use crate::pool::PoolDelegate;
use crate::{signals, Controller, Error, Handler, PairEvent, Reactor, Resource, SocketPair, TimerHandle};

/// Event source driven by a worker's reactor: either the control channel
/// inherited from the master, or a resource registered by the connection
/// delegate (mirroring the listener/transport split of server reactors).
#[derive(Debug)]
pub enum WorkerResource<R: Resource> {
    Control(SocketPair),
    App(R),
}

/// Event dispatched inside a worker process.
#[derive(Debug)]
pub enum WorkerEvent<E> {
    /// A connection descriptor delivered by the master.
    Descriptor(std::os::unix::io::OwnedFd),
    /// The master closed the control channel.
    Disconnected,
    /// Control channel failure.
    Failure(Error),
    /// Event from a delegate-registered resource.
    App(E),
}

impl<R: Resource> AsRawFd for WorkerResource<R> {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            WorkerResource::Control(pair) => pair.as_raw_fd(),
            WorkerResource::App(resource) => resource.as_raw_fd(),
        }
    }
}

impl<R: Resource> Resource for WorkerResource<R> {
    type Event = WorkerEvent<R::Event>;

    fn interests(&self) -> IoEv {
        match self {
            WorkerResource::Control(pair) => pair.interests(),
            WorkerResource::App(resource) => resource.interests(),
        }
    }

    fn handle_io(&mut self, io: IoEv, time: Instant) -> Option<Self::Event> {
        match self {
            WorkerResource::Control(pair) => pair.handle_io(io, time).map(|event| match event {
                PairEvent::Descriptor(fd) => WorkerEvent::Descriptor(fd),
                PairEvent::Disconnected => WorkerEvent::Disconnected,
                PairEvent::Failure(err) => WorkerEvent::Failure(err),
            }),
            WorkerResource::App(resource) => resource.handle_io(io, time).map(WorkerEvent::App),
        }
    }
}

struct WorkerService<'a, D: PoolDelegate> {
    pid: Pid,
    delegate: &'a mut D,
}

impl<D: PoolDelegate> Handler<WorkerResource<D::Resource>> for WorkerService<'_, D> {
    fn handle_event(
        &mut self,
        fd: RawFd,
        event: WorkerEvent<<D::Resource as Resource>::Event>,
        reactor: &mut Controller<WorkerResource<D::Resource>>,
    ) {
        match event {
            WorkerEvent::Descriptor(conn) => {
                log::trace!(target: "worker", "worker {} received descriptor {}", self.pid, conn.as_raw_fd());
                self.delegate.on_connection(reactor, conn);
            }
            WorkerEvent::Disconnected => {
                log::debug!(target: "worker", "master closed control channel; stopping worker {}", self.pid);
                reactor.quit();
            }
            WorkerEvent::Failure(err) => {
                log::warn!(target: "worker", "control channel failure in worker {}: {err}", self.pid);
            }
            WorkerEvent::App(event) => self.delegate.on_resource_event(reactor, fd, event),
        }
    }

    fn handle_timer(
        &mut self,
        timer: TimerHandle,
        reactor: &mut Controller<WorkerResource<D::Resource>>,
    ) {
        self.delegate.on_timer(reactor, timer);
    }
}

/// Body of code executed inside a forked child: owns its own reactor, binds
/// the inherited channel end as an event source, and hands every received
/// descriptor to the pool delegate's connection callback.
pub struct Worker {
    pid: Pid,
    pair: SocketPair,
}

impl Worker {
    /// Binds the worker to its inherited channel end, recording the child's
    /// own process identity for logging and signal purposes.
    pub fn new(pair: SocketPair) -> Self {
        Worker {
            pid: unistd::getpid(),
            pair,
        }
    }

    /// Installs the worker-side signal bridge and blocks in the worker's
    /// event loop until the bridge stops it (terminate or quit-softly, or
    /// the master going away).
    pub fn run<D: PoolDelegate>(self, delegate: &mut D) -> Result<(), Error> {
        signals::install_worker()?;
        let pid = self.pid;
        log::debug!(target: "worker", "worker {pid} starting event loop");
        let mut reactor = Reactor::new(popol::Poller::new(), WorkerService { pid, delegate });
        reactor.register(WorkerResource::Control(self.pair));
        reactor.run()
    }
}
