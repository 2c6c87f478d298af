//! HTTP API for the courier message delivery service.
//!
//! Exposes message management and scheduler control over JSON, each group
//! guarded by its own API key, plus an unauthenticated health probe.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod handlers;
pub mod middleware;
pub mod response;
pub mod server;

pub use config::Config;
pub use server::{create_router, shutdown_signal, start_server, AppState};
