use std::os::unix::io::{OwnedFd, RawFd};
use std::process;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{fork, ForkResult, Pid};

use crate::poller::Poll;
use crate::worker::{Worker, WorkerResource};
use crate::{signals, Controller, Error, Handler, Reactor, Resource, SocketPair, TimerHandle};

/// Which continuation of a fork the callback is running in.
///
/// Fork is modelled as a duplication point returning a tagged branch rather
/// than one function returning twice: the child branch never hands control
/// back to the orchestrator.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum Branch {
    /// Master-side continuation; carries the new worker's process id.
    Parent(Pid),
    /// Worker-side continuation.
    Child,
}

/// Application callbacks surrounding the worker pool.
pub trait PoolDelegate {
    /// Resource type the connection callback may register on the worker's
    /// reactor. Use [`crate::NoResource`] when no extra sources are needed.
    type Resource: Resource;

    /// Invoked synchronously in both branches at fork time, for per-branch
    /// setup such as closing resources unrelated to the branch.
    fn on_fork(&mut self, branch: Branch);

    /// Invoked by a worker with its reactor and a newly received connection
    /// descriptor. The callback owns the descriptor: it must register it
    /// with the worker's loop or close it.
    fn on_connection(
        &mut self,
        reactor: &mut Controller<WorkerResource<Self::Resource>>,
        conn: OwnedFd,
    );

    /// Event from a resource the delegate registered on the worker's loop.
    fn on_resource_event(
        &mut self,
        reactor: &mut Controller<WorkerResource<Self::Resource>>,
        fd: RawFd,
        event: <Self::Resource as Resource>::Event,
    ) {
        let _ = (reactor, fd, event);
    }

    /// Timer expiration on the worker's loop.
    fn on_timer(
        &mut self,
        reactor: &mut Controller<WorkerResource<Self::Resource>>,
        timer: TimerHandle,
    ) {
        let _ = (reactor, timer);
    }
}

/// Implemented by the master process service owning the worker pool, so the
/// orchestration loop can reach the pool between reactor runs.
pub trait MasterService<R: Resource>: Handler<R> {
    type Delegate: PoolDelegate;

    fn pool_mut(&mut self) -> &mut ProcessPool<Self::Delegate>;
}

/// Master-side orchestrator of a fixed-size set of worker processes.
///
/// Workers are forked up front over freshly created [`SocketPair`] channels
/// and tracked in two index-aligned sequences of process ids and parent-side
/// channel ends. Accepted connection descriptors are distributed round-robin;
/// pool-wide lifecycle decisions arrive through the signal bridge.
///
/// Dead workers are not respawned: pool capacity can shrink over the server's
/// lifetime and is only reconciled by explicit [`ProcessPool::clear_dead_children`]
/// calls.
pub struct ProcessPool<D: PoolDelegate> {
    delegate: D,
    process_num: usize,
    next: usize,
    running: bool,
    pids: Vec<Pid>,
    pairs: Vec<SocketPair>,
}

impl<D: PoolDelegate> ProcessPool<D> {
    pub fn new(delegate: D) -> Self {
        ProcessPool {
            delegate,
            process_num: 1,
            next: 0,
            running: false,
            pids: vec![],
            pairs: vec![],
        }
    }

    /// Fixes the worker count; must be called before [`ProcessPool::start`].
    pub fn set_process_num(&mut self, process_num: usize) {
        self.process_num = process_num;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Number of currently tracked worker processes; never exceeds the
    /// configured process count after a successful start.
    pub fn worker_count(&self) -> usize {
        debug_assert_eq!(self.pids.len(), self.pairs.len());
        self.pids.len()
    }

    pub fn pids(&self) -> &[Pid] {
        &self.pids
    }

    pub fn delegate(&self) -> &D {
        &self.delegate
    }

    pub fn delegate_mut(&mut self) -> &mut D {
        &mut self.delegate
    }

    /// Installs the master signal bridge and forks the configured number of
    /// workers, each over a freshly created channel.
    ///
    /// In every child this call never returns: the child branch runs the
    /// worker's event loop for the worker's entire lifetime and then exits
    /// the process. Pair-creation or fork failure aborts the start and is
    /// reported to the caller, which must decide whether to retry or give up.
    pub fn start(&mut self) -> Result<(), Error> {
        signals::install_master()?;
        self.pids.reserve(self.process_num);
        self.pairs.reserve(self.process_num);
        for _ in 0..self.process_num {
            self.spawn_worker()?;
        }
        self.running = true;
        log::info!(target: "pool", "started {} worker processes", self.pids.len());
        Ok(())
    }

    fn spawn_worker(&mut self) -> Result<(), Error> {
        let (parent_end, child_end) = SocketPair::duplex()?;
        match unsafe { fork() }? {
            ForkResult::Parent { child } => {
                self.delegate.on_fork(Branch::Parent(child));
                log::debug!(target: "pool", "forked worker process {child}");
                drop(child_end);
                self.pids.push(child);
                self.pairs.push(parent_end);
                debug_assert_eq!(self.pids.len(), self.pairs.len());
                Ok(())
            }
            ForkResult::Child => {
                // Shed the master-side state copied across the fork: the
                // parent end of our own pair and the channels of the
                // previously forked siblings.
                drop(parent_end);
                self.pids.clear();
                self.pairs.clear();
                self.delegate.on_fork(Branch::Child);

                let code = match Worker::new(child_end).run(&mut self.delegate) {
                    Ok(()) => 0,
                    Err(err) => {
                        log::error!(target: "worker", "worker loop failed: {err}");
                        1
                    }
                };
                process::exit(code);
            }
        }
    }

    /// Orchestration loop of the master process: repeatedly runs the master
    /// reactor and inspects lifecycle state after each run.
    ///
    /// Terminate, quit-softly or a child exit tear the pool down via
    /// [`ProcessPool::kill_all`] and end orchestration permanently; restart
    /// and reconfigure requests are acknowledged and the reactor is simply
    /// re-entered for a fresh run, without re-forking.
    pub fn parent_start<R, H, P>(reactor: &mut Reactor<R, H, P>) -> Result<(), Error>
    where
        R: Resource,
        H: MasterService<R, Delegate = D>,
        P: Poll,
    {
        loop {
            reactor.run()?;
            let state = signals::state();
            if state.shutdown() {
                log::info!(target: "pool", "lifecycle signal received; terminating worker pool");
                reactor.handler_mut().pool_mut().kill_all();
                return Ok(());
            }
            if state.restart || state.reconfigure {
                signals::clear_transient();
                log::debug!(target: "pool", "restart/reconfigure requested; re-entering master event loop");
            }
        }
    }

    /// Hands an accepted connection descriptor to the worker selected by
    /// round-robin. The index advances on every call regardless of success,
    /// guaranteeing an even long-run distribution but no load awareness.
    ///
    /// A send to a worker which already exited is reported, not fatal: the
    /// stale record is reconciled later by [`ProcessPool::clear_dead_children`].
    pub fn send_to_child(&mut self, conn: OwnedFd) -> Result<(), Error> {
        if self.process_num == 0 || self.pairs.is_empty() {
            return Err(Error::NoWorker(0));
        }
        let slot = self.next;
        self.next = (self.next + 1) % self.process_num;
        let Some(pair) = self.pairs.get(slot) else {
            return Err(Error::NoWorker(slot));
        };
        pair.send_fd(conn).map_err(|err| match err {
            Error::Os(Errno::EPIPE) | Error::Os(Errno::ECONNRESET) => Error::PeerGone(slot),
            other => other,
        })
    }

    /// Sends a hard-terminate signal to every tracked worker and drops all
    /// worker records, closing the parent-side channel ends.
    pub fn kill_all(&mut self) {
        log::debug!(target: "pool", "terminating {} workers", self.pids.len());
        for pid in &self.pids {
            if let Err(err) = kill(*pid, Signal::SIGINT) {
                log::warn!(target: "pool", "failed to signal worker {pid}: {err}");
            }
        }
        self.pids.clear();
        self.pairs.clear();
        self.next = 0;
        self.running = false;
    }

    /// Requests graceful termination: workers receive the quit-request
    /// signal and are expected to self-exit after draining. Worker records
    /// are kept until [`ProcessPool::clear_dead_children`] reconciles them.
    pub fn kill_softly(&self) {
        log::debug!(target: "pool", "softly terminating {} workers", self.pids.len());
        for pid in &self.pids {
            if let Err(err) = kill(*pid, Signal::SIGQUIT) {
                log::warn!(target: "pool", "failed to signal worker {pid}: {err}");
            }
        }
    }

    /// Scans worker records, probing liveness with the null signal, and
    /// removes entries whose process no longer exists, keeping the pid and
    /// channel sequences index-aligned.
    pub fn clear_dead_children(&mut self) {
        let mut index = 0;
        while index < self.pids.len() {
            match kill(self.pids[index], None) {
                Err(Errno::ESRCH) => {
                    let pid = self.pids.remove(index);
                    self.pairs.remove(index);
                    log::debug!(target: "pool", "cleared dead worker {pid}");
                }
                _ => index += 1,
            }
        }
        debug_assert_eq!(self.pids.len(), self.pairs.len());
    }
}
