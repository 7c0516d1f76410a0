//! Graceful pool termination: a quit-request keeps the worker records in
//! place, the worker drains and exits on its own, and only explicit
//! reconciliation removes the stale record.
//!
//! Single test in this binary since it forks real worker processes.

use std::os::unix::io::OwnedFd;
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::Pid;

use prefork::{Branch, Controller, NoResource, PoolDelegate, ProcessPool, WorkerResource};

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

#[test]
fn soft_termination_retains_records_until_reconciled() {
    let mut pool = ProcessPool::new(NullDelegate);
    pool.set_process_num(1);
    pool.start().expect("pool start");
    assert_eq!(pool.worker_count(), 1);

    pool.kill_softly();
    // The record stays: soft termination trusts the worker to exit on its
    // own and defers bookkeeping to reconciliation.
    assert_eq!(pool.worker_count(), 1);

    // The worker observes the quit request, leaves its loop and exits;
    // once reaped, the liveness probe clears the stale record.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        // The child-exit bridge usually reaps the worker; this covers the
        // case where the delivery raced the probe below.
        let _ = waitpid(None::<Pid>, Some(WaitPidFlag::WNOHANG));
        pool.clear_dead_children();
        if pool.worker_count() == 0 {
            break;
        }
        assert!(Instant::now() < deadline, "worker did not exit on quit request");
        thread::sleep(Duration::from_millis(10));
    }
}
