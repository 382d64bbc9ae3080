//! Coordinator/worker plumbing for the forked run mode
//!
//! `channel` is the framed transport, `master` the coordinator side,
//! `child` the worker side. All three speak the same line protocol as the
//! client-facing socket.

pub mod channel;
pub mod child;
pub mod master;

pub use channel::{IpcChannel, ReadOutcome};
