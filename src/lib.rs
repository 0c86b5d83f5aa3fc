//! Fetchgate - a capacity-limited HTTP fan-out fetch service.
//!
//! Fetchgate accepts a JSON list of URLs over HTTP, fetches them concurrently
//! with fail-fast semantics, and answers with a URL to body map. Inbound
//! connections pass through an admission gate that bounds how many are open at
//! once, and the whole process shuts down gracefully on SIGINT or SIGTERM.
//!
//! # Features
//! - Connection admission with a hard capacity limit and optional accept timeout
//! - Bounded fan-out of outbound GETs with per-fetch timeouts
//! - Fail-fast batch cancellation on the first failed fetch
//! - Per-request deadline with partial results
//! - Graceful, time-bounded shutdown with connection draining
//! - Layered configuration (file + `FETCHGATE__*` environment) and validation
//! - Structured tracing via `tracing`
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use fetchgate::{
//!     AdmissionGate, GatewayServer, HttpClientAdapter, ShutdownCoordinator,
//!     config::ServerConfig, os_stop_signal,
//! };
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let config = ServerConfig::default();
//! let gate = Arc::new(
//!     AdmissionGate::bind(&config.listen_addr, config.admission.gate_config().map_err(|e| eyre::eyre!(e))?)
//!         .await?,
//! );
//! let server = GatewayServer::from_config(&config, Arc::new(HttpClientAdapter::new()?))?;
//! let coordinator = ShutdownCoordinator::new();
//! let report = server.run(gate.clone(), &coordinator, os_stop_signal()).await;
//! gate.wait().await;
//! # let _ = report;
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! The crate separates **ports** (traits) from **adapters** (implementations) while keeping
//! the fan-out logic inside `core`. The admission gate and the shutdown coordinator live in
//! `utils` since they only deal with process plumbing.
//!
//! # Error Handling
//! Library components return domain specific error types built with `thiserror`. The binary
//! and the composition root use `eyre::Result<T>` with `WrapErr` context.
pub mod config;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

// Re-export the specific types needed by the binary crate
pub use crate::{
    adapters::{GatewayServer, HttpClientAdapter, HttpHandler},
    core::{FetchEngine, FetchLimits},
    ports::http_client::HttpClient,
    utils::{AdmissionGate, AdmissionGateConfig, ShutdownCoordinator, os_stop_signal},
};
