//! Deletion gate: approval-gated deletion of environments.
//!
//! Library crate shared by the `delgate` binary and the integration tests.

pub mod api;
pub mod config;
pub mod deletion;
pub mod errors;
pub mod jobs;
pub mod middleware;
pub mod models;
pub mod notification;
pub mod store;
