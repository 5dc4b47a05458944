//! Container lifecycle management for the Garden server.
//!
//! [`engine::Garden`] owns the container registry and the shared address
//! and port pools. Each [`container::Container`] owns its working tree,
//! processes, limits, and network plumbing.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod container;
pub mod engine;
pub mod metrics;
pub mod output;
pub mod process;
pub mod rootfs;
pub mod state;
pub mod stream;
pub mod user;
