//! Server-side components of the echo service.
//!
//! ## Submodules
//!
//! - [`config`] - CLI flags, JSON config file and the merged
//!   [`config::ServerConfig`].
//! - [`bootstrap`] - Listener setup and the `tonic` server for one process.
//! - [`pool`] - Multi-process serving over a shared `SO_REUSEPORT` port.
//! - [`service`] - The `Echo` service handlers.
//! - [`streaming`] - Response producers and request consumers for the
//!   streaming handlers.
//! - [`limit`] - Server-wide cap on calls in flight.
//! - [`trailers`] - Tower layer writing handler trailing metadata.
//! - [`telemetry`] - Tracing subscriber and optional OpenTelemetry export.

pub mod bootstrap;
pub mod config;
pub mod limit;
pub mod pool;
pub mod service;
pub mod streaming;
pub mod telemetry;
pub mod trailers;
