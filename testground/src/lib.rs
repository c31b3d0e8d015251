//! Testground — a platform for testing distributed systems at scale.
//!
//! A controller daemon orchestrates tens to thousands of test-plan
//! instances across heterogeneous back-ends, provides the coordination
//! substrate the instances use to choreograph themselves, shapes the
//! network between them, and collects their outputs.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────── Daemon ─────────────┐
//! │  HTTP surface ─► task engine    │
//! │        │        (durable queue) │
//! │        ▼                        │
//! │  orchestrator ─► runner         │
//! │  (build, run)    exec | docker  │
//! │                  | k8s          │
//! └───────┬─────────────────────────┘
//!         ▼
//!  instances ◄──► coordination service
//!      ▲              (counters, barriers,
//!      └── sidecar     streams)
//!          (network shaping)
//! ```
//!
//! The [`engine`] module ties the pieces together; [`daemon`] exposes
//! them over HTTP; [`sidecar`] runs on every host that executes plan
//! containers.

pub mod builder;
pub mod composition;
pub mod config;
pub mod daemon;
pub mod docker;
pub mod engine;
pub mod healthcheck;
pub mod k8s;
pub mod logging;
pub mod outputs;
pub mod rpc;
pub mod runner;
pub mod sidecar;
pub mod sync;
pub mod task;

/// Version of the testground library and daemon.
///
/// Synchronized across the workspace; injected from `Cargo.toml` at
/// compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
