use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use nix::unistd::{self, Pid};

use crate::poller::{popol, IoEv, Poll};
use crate::timeouts::{TimerHandle, TimerQueue};
use crate::{signals, Error, Resource};

/// Upper bound on a single multiplexer wait. Even with no I/O and no timers
/// the loop wakes up this often, so lifecycle flags are observed at a bounded
/// latency on platforms where a signal fails to interrupt the wait.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Business logic executed by the reactor: receives the typed events produced
/// by ready resources and timer expirations, and drives the loop through the
/// [`Controller`] passed into every call.
pub trait Handler<R: Resource> {
    /// Called for each event produced by a ready resource, in multiplexer
    /// return order.
    fn handle_event(&mut self, fd: RawFd, event: R::Event, reactor: &mut Controller<R>);

    /// Called when a scheduled timer expires.
    fn handle_timer(&mut self, timer: TimerHandle, reactor: &mut Controller<R>) {
        let _ = (timer, reactor);
    }
}

/// Deferred reactor mutations requested from inside a dispatched callback.
enum Action<R: Resource> {
    Register(R),
    Unregister(RawFd),
}

/// Scoped handle over the reactor internals which are safe to mutate from
/// inside a dispatched callback.
///
/// Resource (un)registration is deferred until the current iteration's
/// dispatch completes; timer scheduling and [`Controller::quit`] take effect
/// immediately. None of these calls block.
pub struct Controller<'a, R: Resource> {
    timers: &'a mut TimerQueue,
    actions: &'a mut VecDeque<Action<R>>,
    running: &'a mut bool,
}

impl<'a, R: Resource> Controller<'a, R> {
    /// Stops the loop after the current iteration's dispatch completes.
    /// Idempotent and safe to call from nested callbacks.
    pub fn quit(&mut self) {
        *self.running = false;
    }

    /// Schedules a one-shot timer expiring at `when`.
    pub fn run_at(&mut self, when: Instant) -> TimerHandle {
        self.timers.schedule_at(when)
    }

    /// Schedules a one-shot timer expiring `delay` from now.
    pub fn run_after(&mut self, delay: Duration) -> TimerHandle {
        self.timers.schedule_after(delay)
    }

    /// Schedules a periodic timer re-armed at `interval` until cancelled.
    pub fn run_every(&mut self, interval: Duration) -> TimerHandle {
        self.timers.schedule_every(interval)
    }

    /// Cancels a timer; no-op if it already fired or was already cancelled.
    pub fn cancel(&mut self, timer: TimerHandle) {
        self.timers.cancel(timer);
    }

    /// Registers a new event source once the current dispatch completes.
    pub fn register(&mut self, resource: R) {
        self.actions.push_back(Action::Register(resource));
    }

    /// Removes an event source once the current dispatch completes; the
    /// resource is dropped, closing its descriptor.
    pub fn unregister(&mut self, fd: RawFd) {
        self.actions.push_back(Action::Unregister(fd));
    }
}

/// Single-threaded event loop: the reactor side of the pre-fork server.
///
/// Owns one readiness multiplexer, one timer queue and the set of registered
/// resources. At most one loop runs per process at a time; the loop method
/// must be called from the thread that created the reactor.
pub struct Reactor<R: Resource, H: Handler<R>, P: Poll = popol::Poller> {
    handler: H,
    poller: P,
    resources: HashMap<RawFd, R>,
    timers: TimerQueue,
    actions: VecDeque<Action<R>>,
    active: Vec<(RawFd, IoEv)>,
    running: bool,
    pid: Pid,
}

impl<R: Resource, H: Handler<R>, P: Poll> Reactor<R, H, P> {
    pub fn new(poller: P, handler: H) -> Self {
        let pid = unistd::getpid();
        log::debug!(target: "reactor", "creating event loop in process {pid}");
        Reactor {
            handler,
            poller,
            resources: HashMap::new(),
            timers: TimerQueue::new(),
            actions: empty!(),
            active: empty!(),
            running: false,
            pid,
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Registers an event source with the multiplexer. An already registered
    /// descriptor is replaced.
    pub fn register(&mut self, resource: R) {
        let fd = resource.as_raw_fd();
        self.poller.register(&resource, resource.interests());
        if self.resources.insert(fd, resource).is_some() {
            log::warn!(target: "reactor", "replacing event source registered for fd {fd}");
        }
    }

    /// Removes an event source, returning it to the caller. Unknown
    /// descriptors yield `None`.
    pub fn unregister(&mut self, fd: RawFd) -> Option<R> {
        let resource = self.resources.remove(&fd);
        if resource.is_some() {
            self.poller.unregister(fd);
        }
        resource
    }

    /// Stops the loop after the current iteration; idempotent.
    pub fn quit(&mut self) {
        self.running = false;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn run_at(&mut self, when: Instant) -> TimerHandle {
        self.timers.schedule_at(when)
    }

    pub fn run_after(&mut self, delay: Duration) -> TimerHandle {
        self.timers.schedule_after(delay)
    }

    pub fn run_every(&mut self, interval: Duration) -> TimerHandle {
        self.timers.schedule_every(interval)
    }

    pub fn cancel(&mut self, timer: TimerHandle) {
        self.timers.cancel(timer);
    }

    /// Runs the poll-dispatch cycle until stopped.
    ///
    /// Each iteration clears the previous ready-set, blocks on the
    /// multiplexer for up to [`WAIT_TIMEOUT`] (or the next timer deadline if
    /// closer), dispatches every ready resource in multiplexer order, fires
    /// due timers, applies deferred registrations, and finally inspects the
    /// process lifecycle flags once. In-flight callbacks are never
    /// interrupted: a pending lifecycle decision or [`Controller::quit`]
    /// takes effect only after the iteration finishes.
    ///
    /// Multiplexer interruption by a signal is transparent; any other
    /// multiplexer failure is fatal and propagated, since a broken reactor
    /// cannot serve connections.
    pub fn run(&mut self) -> Result<(), Error> {
        self.running = true;
        log::debug!(target: "reactor", "process {} entering event loop", self.pid);

        while self.running {
            self.active.clear();
            let timeout = self.timers.next_timeout(WAIT_TIMEOUT, Instant::now());
            match self.poller.wait(timeout) {
                Ok(_) => {}
                // Interrupted by a signal: fall through to the lifecycle
                // check at the bottom of the iteration.
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    log::error!(target: "reactor", "multiplexer failure in process {}: {err}", self.pid);
                    return Err(err.into());
                }
            }
            let now = Instant::now();

            let Self { poller, active, .. } = self;
            active.extend(poller.by_ref());

            self.dispatch(now);
            self.fire_timers(now);
            self.process_actions();

            if signals::state().pending() {
                log::debug!(target: "reactor", "process {} leaving event loop on lifecycle signal", self.pid);
                self.running = false;
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, now: Instant) {
        let Self {
            handler,
            resources,
            timers,
            actions,
            running,
            active,
            ..
        } = self;
        for (fd, io) in active.drain(..) {
            // The source may have been unregistered by an earlier callback
            // of the same batch.
            let Some(resource) = resources.get_mut(&fd) else {
                continue;
            };
            if let Some(event) = resource.handle_io(io, now) {
                let mut ctl = Controller {
                    timers: &mut *timers,
                    actions: &mut *actions,
                    running: &mut *running,
                };
                handler.handle_event(fd, event, &mut ctl);
            }
        }
    }

    fn fire_timers(&mut self, now: Instant) {
        let Self {
            handler,
            timers,
            actions,
            running,
            ..
        } = self;
        while let Some(timer) = timers.pop_expired(now) {
            let mut ctl = Controller {
                timers: &mut *timers,
                actions: &mut *actions,
                running: &mut *running,
            };
            handler.handle_timer(timer, &mut ctl);
        }
    }

    fn process_actions(&mut self) {
        while let Some(action) = self.actions.pop_front() {
            match action {
                Action::Register(resource) => self.register(resource),
                Action::Unregister(fd) => {
                    let _ = self.unregister(fd);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::os::unix::net::UnixStream;

    use super::*;
    use crate::signals::tests::FLAG_GUARD;

    /// One end of a stream pair which reports every readable wakeup.
    struct ByteSource {
        stream: UnixStream,
    }

    impl AsRawFd for ByteSource {
        fn as_raw_fd(&self) -> RawFd {
            self.stream.as_raw_fd()
        }
    }

    impl Resource for ByteSource {
        type Event = ();

        fn interests(&self) -> IoEv {
            IoEv::read_only()
        }

        fn handle_io(&mut self, io: IoEv, _time: Instant) -> Option<()> {
            io.is_readable.then_some(())
        }
    }

    #[derive(Default)]
    struct Counter {
        events: usize,
        timer_fires: usize,
        quit_at: usize,
    }

    impl Handler<ByteSource> for Counter {
        fn handle_event(&mut self, _fd: RawFd, _event: (), reactor: &mut Controller<ByteSource>) {
            self.events += 1;
            reactor.quit();
            // Nested quit must stay safe.
            reactor.quit();
        }

        fn handle_timer(&mut self, _timer: TimerHandle, reactor: &mut Controller<ByteSource>) {
            self.timer_fires += 1;
            if self.timer_fires >= self.quit_at {
                reactor.quit();
            }
        }
    }

    #[test]
    fn quit_from_callback_stops_after_current_dispatch() {
        let _guard = FLAG_GUARD.lock().unwrap();
        crate::signals::reset();

        let (mut ours, theirs) = UnixStream::pair().unwrap();
        let mut reactor = Reactor::new(
            popol::Poller::new(),
            Counter {
                quit_at: usize::MAX,
                ..Default::default()
            },
        );
        reactor.register(ByteSource { stream: theirs });

        ours.write_all(b"x").unwrap();
        reactor.run().unwrap();

        assert_eq!(reactor.handler().events, 1);
        assert!(!reactor.is_running());
    }

    #[test]
    fn periodic_timer_drives_handler_until_quit() {
        let _guard = FLAG_GUARD.lock().unwrap();
        crate::signals::reset();

        let (_ours, theirs) = UnixStream::pair().unwrap();
        let mut reactor = Reactor::new(
            popol::Poller::new(),
            Counter {
                quit_at: 3,
                ..Default::default()
            },
        );
        reactor.register(ByteSource { stream: theirs });

        let timer = reactor.run_every(Duration::from_millis(5));
        reactor.run().unwrap();

        assert_eq!(reactor.handler().timer_fires, 3);
        // The periodic timer is still armed; cancelling twice stays silent.
        reactor.cancel(timer);
        reactor.cancel(timer);
    }

    #[test]
    fn worker_bridge_shields_loop_from_master_signals() {
        let _guard = FLAG_GUARD.lock().unwrap();
        crate::signals::reset();

        // A forked worker first inherits the master bridge, then installs
        // its own on top. Restart/reconfigure requests delivered afterwards
        // must not end its loop; only the timer below may stop it.
        crate::signals::install_master().unwrap();
        crate::signals::install_worker().unwrap();
        unsafe {
            nix::libc::raise(nix::libc::SIGUSR1);
            nix::libc::raise(nix::libc::SIGHUP);
        }

        let mut reactor: Reactor<ByteSource, Counter> = Reactor::new(
            popol::Poller::new(),
            Counter {
                quit_at: 1,
                ..Default::default()
            },
        );
        reactor.run_after(Duration::from_millis(50));
        reactor.run().unwrap();

        assert_eq!(reactor.handler().timer_fires, 1);
        assert!(!crate::signals::state().pending());
    }

    #[test]
    fn unregister_returns_the_resource_to_the_caller() {
        let _guard = FLAG_GUARD.lock().unwrap();
        crate::signals::reset();

        let (_ours, theirs) = UnixStream::pair().unwrap();
        let mut reactor = Reactor::new(popol::Poller::new(), Counter::default());
        let fd = theirs.as_raw_fd();
        reactor.register(ByteSource { stream: theirs });

        let resource = reactor.unregister(fd).expect("registered source");
        assert_eq!(resource.as_raw_fd(), fd);
        assert!(reactor.unregister(fd).is_none());
    }

    #[test]
    fn one_shot_timer_fires_once() {
        let _guard = FLAG_GUARD.lock().unwrap();
        crate::signals::reset();

        let mut reactor: Reactor<ByteSource, Counter> = Reactor::new(
            popol::Poller::new(),
            Counter {
                quit_at: 1,
                ..Default::default()
            },
        );
        reactor.run_after(Duration::from_millis(5));
        reactor.run().unwrap();
        assert_eq!(reactor.handler().timer_fires, 1);
    }
}
