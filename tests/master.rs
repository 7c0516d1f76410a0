//! Master orchestration: a termination signal delivered mid-loop must stop
//! the reactor, tear the pool down and return from orchestration.
//!
//! Single test in this binary since it forks and raises process-wide signals.

use std::convert::Infallible;
use std::os::unix::io::{OwnedFd, RawFd};
use std::time::Duration;

use prefork::{
    Branch, Controller, Handler, MasterService, NoResource, PoolDelegate, ProcessPool, Reactor,
    TimerHandle, WorkerResource,
};

struct NullDelegate;

impl PoolDelegate for NullDelegate {
    type Resource = NoResource;

    fn on_fork(&mut self, _branch: Branch) {}

    fn on_connection(
        &mut self,
        _reactor: &mut Controller<WorkerResource<NoResource>>,
        _conn: OwnedFd,
    ) {
    }
}

/// Master service with no event sources of its own; its only job here is to
/// raise the termination signal once the timer fires.
struct Orchestrator {
    pool: ProcessPool<NullDelegate>,
}

impl Handler<NoResource> for Orchestrator {
    fn handle_event(&mut self, _fd: RawFd, event: Infallible, _reactor: &mut Controller<NoResource>) {
        match event {}
    }

    fn handle_timer(&mut self, _timer: TimerHandle, _reactor: &mut Controller<NoResource>) {
        unsafe {
            nix::libc::raise(nix::libc::SIGINT);
        }
    }
}

impl MasterService<NoResource> for Orchestrator {
    type Delegate = NullDelegate;

    fn pool_mut(&mut self) -> &mut ProcessPool<NullDelegate> {
        &mut self.pool
    }
}

#[test]
fn termination_signal_ends_orchestration_and_tears_pool_down() {
    let mut pool = ProcessPool::new(NullDelegate);
    pool.set_process_num(1);
    pool.start().expect("pool start");
    assert_eq!(pool.worker_count(), 1);

    let mut reactor = Reactor::new(prefork::poller::popol::Poller::new(), Orchestrator { pool });
    reactor.run_after(Duration::from_millis(20));

    ProcessPool::parent_start(&mut reactor).expect("orchestration");

    let pool = &mut reactor.handler_mut().pool;
    assert_eq!(pool.worker_count(), 0);
    assert!(!pool.is_running());
}
