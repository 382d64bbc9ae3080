//! Gatewire - an IRC-server-emulating chat gateway
//!
//! Gatewire presents a standard IRC server to ordinary chat clients while
//! the actual message delivery belongs to pluggable back-end networks.
//! This crate is the gateway core: the per-connection session state
//! machine and command protocol, plus the multi-process coordination layer
//! (one coordinator, one forked worker per connection) including live
//! session takeover by descriptor passing.
//!
//! # Example
//!
//! ```rust,ignore
//! use gatewire::{daemon, Config, RunOptions};
//!
//! fn main() -> gatewire::Result<()> {
//!     let cfg = Config::load(Some("/etc/gatewire.toml".as_ref()))?;
//!     daemon::run(cfg, RunOptions::default())
//! }
//! ```
//!
//! # Run modes
//!
//! - `daemon` - one process serving every connection
//! - `fork-daemon` - a coordinator forking one worker per connection,
//!   with takeover and zero-downtime restart over the IPC layer
//! - `inetd` - one process per invocation, client socket on stdin

pub mod auth;
pub mod command;
pub mod config;
pub mod daemon;
pub mod error;
pub mod ipc;
pub mod line;
pub mod numeric;
pub mod registry;
pub mod root;
pub mod session;
pub mod takeover;

pub use auth::{CredentialStore, MemoryStore};
pub use config::{Config, RunMode};
pub use daemon::RunOptions;
pub use error::{GatewayError, Result};
pub use ipc::{IpcChannel, ReadOutcome};
pub use registry::Registry;
pub use session::Session;
