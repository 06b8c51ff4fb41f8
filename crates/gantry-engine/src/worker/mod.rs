//! Isolated workers
//!
//! A worker serves exactly one partition assignment. It speaks a JSON-lines
//! protocol: the supervisor sends `assign`, then one `run` per unit, then
//! `shutdown`; the worker answers `ready` and one `finished` per unit.
//!
//! The same [`serve`] loop backs both worker kinds: the `gantry-worker`
//! binary runs it over stdin/stdout, and in-process workers run it as a tokio
//! task over an in-memory pipe.

mod launcher;
pub mod protocol;
mod runtime;

pub use launcher::{
    resolve_worker_program, WorkerHandle, WorkerLauncher, WORKER_BIN_ENV, WORKER_PROGRAM,
};
pub use protocol::{Command, Outcome, Reply};
pub use runtime::{serve, ENV_ASSIGNMENT, ENV_PARTITION, ENV_UNIT_ID, ENV_WORKER_ID};
