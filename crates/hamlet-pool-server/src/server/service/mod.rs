//! HTTP dispatch front.
//!
//! This module maps incoming HTTP requests onto the handler pool: it builds
//! the per-request context from headers, forwards the JSON body to the named
//! endpoint and turns pool errors into HTTP statuses.
//!
//! ## Structure
//!
//! - [`handler`] - routes and the shared [`handler::AppState`].
//! - [`error`] - `ApiError`, the HTTP rendering of pool errors.

pub mod error;
pub mod handler;
