//! Concurrency core of a pre-fork network server.
//!
//! Each OS process runs exactly one single-threaded [`Reactor`] which blocks
//! on a readiness multiplexer (see [`poller`]) and dispatches events to a
//! [`Handler`]. A master process owns a [`ProcessPool`] of forked worker
//! processes and hands freshly accepted connection descriptors to them over
//! per-worker [`SocketPair`] channels using SCM_RIGHTS descriptor passing.
//! Termination, draining, restart and reconfiguration are coordinated through
//! asynchronous OS signals converted by the [`signals`] bridge into sticky
//! flags which every reactor inspects once per iteration.
//!
//! There is no in-process threading anywhere in this crate: concurrency comes
//! from OS-level process parallelism, and the only state mutated outside the
//! owning thread's normal control flow are the lock-free lifecycle flags
//! written from signal-handler context.

#[macro_use]
extern crate amplify;

mod error;
mod pair;
pub mod poller;
mod pool;
mod reactor;
mod resource;
pub mod signals;
mod timeouts;
mod worker;

pub use error::Error;
pub use pair::{PairEvent, SocketPair};
pub use pool::{Branch, MasterService, PoolDelegate, ProcessPool};
pub use reactor::{Controller, Handler, Reactor, WAIT_TIMEOUT};
pub use resource::{NoResource, Resource};
pub use timeouts::{TimerHandle, TimerQueue};
pub use worker::{Worker, WorkerEvent, WorkerResource};
