//! # garden-server
//!
//! HTTP API for the Garden container manager, built on axum.
//!
//! The router exposes every engine operation as a JSON route. Failures
//! are returned as a [`WireError`](garden_common::error::WireError) body
//! with a matching status code, and process output is streamed as
//! newline-delimited JSON.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod api;
pub mod error;
pub mod handlers;
pub mod server;

pub use api::create_router;
pub use handlers::AppState;
pub use server::{serve, spawn_reaper};
