#![allow(clippy::doc_markdown)]

//! chainfleet-core - node fleet supervision library
//!
//! This crate owns the lifecycle of the blockchain-client node processes the
//! daemon operates (one shared publisher node plus one node per tenant) and
//! the remote call primitive used to talk to them.
//!
//! # Modules
//!
//! - [`config`]: TOML configuration for the whole fleet
//! - [`restart`]: Backoff strategies and restart policies
//! - [`process`]: Process specifications, spawning and the OS launcher
//! - [`probe`]: Liveness probes (pid and TCP)
//! - [`gate`]: Debounced stability detection and tagged readiness
//! - [`supervisor`]: Per-process watchdog with a cancellable monitor loop
//! - [`registry`]: Explicit registry of the publisher and tenant supervisors
//! - [`executor`]: Gate-aware HTTP execution with transient retry

pub mod config;
pub mod executor;
pub mod gate;
pub mod probe;
pub mod process;
pub mod registry;
pub mod restart;
pub mod supervisor;
