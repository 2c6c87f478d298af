//! HTTP middleware.
//!
//! Each route group is guarded by its own API key carried in the
//! `x-ins-auth-key` header.
pub mod auth;
