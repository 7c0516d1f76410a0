//! Bridge between asynchronous signal delivery and the single-threaded
//! reactor loop.
//!
//! Signal handlers run in a context where almost nothing is safe: no
//! allocation, no locking, no unbounded I/O. The handler installed here is
//! therefore reduced to storing one sticky flag per condition (plus a
//! non-blocking reap of one exited child for `SIGCHLD`), and every reactor
//! reads the flags exactly once per loop iteration through [`state`]. All
//! branching and heavier work happens there, on the thread owning the loop.
//!
//! The flags are process-wide: there is a single writer (signal context) and
//! a single reader (the loop), so relaxed atomics are sufficient; the only
//! requirement is that reads and writes cannot be torn.

use std::sync::atomic::{AtomicBool, Ordering};

use nix::libc;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::Pid;

use crate::Error;

static TERMINATE: AtomicBool = AtomicBool::new(false);
static QUIT_SOFTLY: AtomicBool = AtomicBool::new(false);
static CHILD_EXITED: AtomicBool = AtomicBool::new(false);
static RESTART: AtomicBool = AtomicBool::new(false);
static RECONFIGURE: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(signo: libc::c_int) {
    match signo {
        libc::SIGINT | libc::SIGTERM => TERMINATE.store(true, Ordering::Relaxed),
        libc::SIGQUIT => QUIT_SOFTLY.store(true, Ordering::Relaxed),
        libc::SIGCHLD => {
            CHILD_EXITED.store(true, Ordering::Relaxed);
            // Reap one terminated child so zombies don't accumulate while the
            // loop is busy; full reconciliation happens in the pool.
            let _ = waitpid(None::<Pid>, Some(WaitPidFlag::WNOHANG));
        }
        libc::SIGUSR1 => RESTART.store(true, Ordering::Relaxed),
        libc::SIGUSR2 | libc::SIGHUP => RECONFIGURE.store(true, Ordering::Relaxed),
        _ => {}
    }
}

/// Snapshot of the process-wide lifecycle flags.
///
/// Terminate, quit-softly and child-exited represent irreversible decisions
/// and persist until the process exits; restart and reconfigure are cleared
/// by the orchestration loop after acting on them (see [`clear_transient`]).
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct Lifecycle {
    pub terminate: bool,
    pub quit_softly: bool,
    pub child_exited: bool,
    pub restart: bool,
    pub reconfigure: bool,
}

impl Lifecycle {
    /// Whether the process must stop orchestrating and tear down.
    pub fn shutdown(&self) -> bool {
        self.terminate || self.quit_softly || self.child_exited
    }

    /// Whether any lifecycle decision is pending at all.
    pub fn pending(&self) -> bool {
        self.shutdown() || self.restart || self.reconfigure
    }
}

/// Reads the current lifecycle flags. Called once per reactor iteration.
pub fn state() -> Lifecycle {
    Lifecycle {
        terminate: TERMINATE.load(Ordering::Relaxed),
        quit_softly: QUIT_SOFTLY.load(Ordering::Relaxed),
        child_exited: CHILD_EXITED.load(Ordering::Relaxed),
        restart: RESTART.load(Ordering::Relaxed),
        reconfigure: RECONFIGURE.load(Ordering::Relaxed),
    }
}

/// Acknowledges restart/reconfigure requests. The other flags are sticky for
/// the lifetime of the process.
pub fn clear_transient() {
    RESTART.store(false, Ordering::Relaxed);
    RECONFIGURE.store(false, Ordering::Relaxed);
}

fn install(signal: Signal, handler: SigHandler) -> Result<(), Error> {
    // No SA_RESTART: a delivered signal must interrupt the multiplexer wait
    // so the loop observes the flags without waiting out its full timeout.
    let action = SigAction::new(handler, SaFlags::empty(), SigSet::empty());
    unsafe { sigaction(signal, &action) }?;
    Ok(())
}

/// Installs the master-side signal bridge: termination, soft quit, child
/// exit, restart and reconfigure requests. `SIGPIPE` is ignored so writing
/// to a worker which already closed its channel surfaces as `EPIPE` instead
/// of killing the master.
pub fn install_master() -> Result<(), Error> {
    for signal in [
        Signal::SIGINT,
        Signal::SIGTERM,
        Signal::SIGQUIT,
        Signal::SIGCHLD,
        Signal::SIGUSR1,
        Signal::SIGUSR2,
        Signal::SIGHUP,
    ] {
        install(signal, SigHandler::Handler(on_signal))?;
    }
    install(Signal::SIGPIPE, SigHandler::SigIgn)
}

/// Installs the worker-side signal bridge. A worker has no children and no
/// reconfiguration duties, so it only listens for terminate and quit-softly.
///
/// The master's bridge is inherited across fork, so the master-only signals
/// are explicitly dropped here: restart/reconfigure requests are ignored and
/// `SIGCHLD` reverts to its default disposition (a connection callback may
/// well spawn subprocesses, and their exit must not stop the worker's loop).
/// The flags those signals would have fed are cleared for the same reason.
pub fn install_worker() -> Result<(), Error> {
    for signal in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGQUIT] {
        install(signal, SigHandler::Handler(on_signal))?;
    }
    for signal in [Signal::SIGUSR1, Signal::SIGUSR2, Signal::SIGHUP] {
        install(signal, SigHandler::SigIgn)?;
    }
    install(Signal::SIGCHLD, SigHandler::SigDfl)?;
    CHILD_EXITED.store(false, Ordering::Relaxed);
    clear_transient();
    install(Signal::SIGPIPE, SigHandler::SigIgn)
}

#[cfg(test)]
pub(crate) fn reset() {
    TERMINATE.store(false, Ordering::Relaxed);
    QUIT_SOFTLY.store(false, Ordering::Relaxed);
    CHILD_EXITED.store(false, Ordering::Relaxed);
    clear_transient();
}
