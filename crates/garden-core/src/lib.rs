//! # garden-core
//!
//! Host-level primitives the Garden runtime composes into containers.
//!
//! This crate provides safe abstractions over:
//! - **Cgroups v2**: memory and CPU limiting plus usage accounting.
//! - **Network**: subnet and host-port pools, egress rule validation, and
//!   user-space `NetIn` forwarding.
//! - **Filesystem**: bind-mount materialization and disk accounting.
//! - **Processes**: rlimits, capability dropping, and pseudo-terminals for
//!   spawned commands.
//!
//! All unsafe system calls are encapsulated in safe wrappers with
//! proper error handling and `// SAFETY:` documentation.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod capabilities;
pub mod cgroup;
pub mod filesystem;
pub mod network;
pub mod pty;
pub mod rlimit;
pub mod usage;
