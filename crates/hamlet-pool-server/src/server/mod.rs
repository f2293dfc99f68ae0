//! Server-side components of the `hamlet-pool-server` dispatch front.
//!
//! ## Submodules
//!
//! - [`config`] - CLI / environment configuration and the endpoint map.
//! - [`handlers`] - Built-in endpoint handlers and their factory.
//! - [`service`] - HTTP routes and error rendering.
//! - [`telemetry`] - Tracing-based structured logging and OpenTelemetry
//!   initialization (optional).

pub mod config;
pub mod handlers;
pub mod service;
pub mod telemetry;
