//! End-to-end exercise of a real forked pool: the master distributes
//! connection descriptors round-robin and every worker answers through the
//! very descriptor it received.
//!
//! Kept as the single test of this binary: forking from a multi-threaded
//! test harness while sibling tests run is not reliable.

use std::io::Read;
use std::os::unix::io::OwnedFd;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use nix::sys::wait::waitpid;

use prefork::{Branch, Controller, NoResource, PoolDelegate, ProcessPool, WorkerResource};

const ANSWER: u8 = 0xA5;

/// Writes one byte back through every connection handed to it and closes it.
struct Echo {
    parent_forks: usize,
}

impl PoolDelegate for Echo {
    type Resource = NoResource;

    fn on_fork(&mut self, branch: Branch) {
        if let Branch::Parent(_) = branch {
            self.parent_forks += 1;
        }
    }

    fn on_connection(
        &mut self,
        _reactor: &mut Controller<WorkerResource<NoResource>>,
        conn: OwnedFd,
    ) {
        use std::io::Write;
        let mut stream = UnixStream::from(conn);
        stream.write_all(&[ANSWER]).expect("write to delivered connection");
    }
}

#[test]
fn forked_workers_answer_on_delivered_descriptors() {
    let mut pool = ProcessPool::new(Echo { parent_forks: 0 });
    pool.set_process_num(3);
    pool.start().expect("pool start");
    assert!(pool.is_running());
    assert_eq!(pool.worker_count(), 3);
    assert_eq!(pool.delegate().parent_forks, 3);
    let pids: Vec<_> = pool.pids().to_vec();

    // Two full round-robin laps.
    let mut retained = vec![];
    for _ in 0..6 {
        let (ours, theirs) = UnixStream::pair().expect("stream pair");
        pool.send_to_child(OwnedFd::from(theirs)).expect("distribute");
        retained.push(ours);
    }

    for mut stream in retained {
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("read timeout");
        let mut buf = [0u8; 1];
        stream.read_exact(&mut buf).expect("worker answer");
        assert_eq!(buf[0], ANSWER);
    }

    pool.kill_all();
    assert_eq!(pool.worker_count(), 0);
    assert!(!pool.is_running());
    for pid in pids {
        // May already be reaped by the child-exit bridge.
        let _ = waitpid(pid, None);
    }
}
