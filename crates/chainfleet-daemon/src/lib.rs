#![allow(clippy::doc_markdown)]

//! chainfleet-daemon - node fleet orchestrator library
//!
//! Runtime pieces of the daemon: the two-phase queue that keeps chain opens
//! and score submits ordered, the durable backlog behind it, the chain
//! operations themselves and the operator HTTP surface.
//!
//! # Modules
//!
//! - [`chain`]: Open and submit operations against the publisher node
//! - [`fs_safe`]: Atomic writes, symlink refusal and bounded JSON reads
//! - [`handlers`]: axum router for the operator HTTP surface
//! - [`metrics`]: Prometheus metrics
//! - [`queue`]: Two-phase queue with the open-before-submit guarantee
//! - [`state`]: Shared daemon state and the persisted orchestrator state
//! - [`store`]: Durable backlog of deferred submits

pub mod chain;
pub mod fs_safe;
pub mod handlers;
pub mod metrics;
pub mod queue;
pub mod state;
pub mod store;
