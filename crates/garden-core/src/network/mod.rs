//! Container networking primitives.
//!
//! Containers share the host network stack. Each one still owns an address
//! in a subnet (for `Info`), a set of host ports forwarded to it, and the
//! egress rules it has been granted.

pub mod forward;
pub mod ports;
pub mod rules;
pub mod subnet;
