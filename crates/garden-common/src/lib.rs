//! # garden-common
//!
//! Shared types, error definitions, configuration models, and constants
//! used across the entire Garden workspace.
//!
//! This crate is the leaf of the dependency graph. It depends on no other
//! internal crate and provides the domain model, the wire shapes exchanged
//! between `gardend` and its clients, and the error taxonomy both sides
//! agree on.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod config;
pub mod constants;
pub mod error;
pub mod types;
